//! ICY (Shoutcast/Icecast) metadata injection for listener streams.
//!
//! Listeners that send `Icy-MetaData: 1` get the mount's now-playing title
//! embedded every `ICY_METAINT` bytes. Formatting is stateless; the
//! injector tracks byte position per connection and caches the formatted
//! block so unchanged titles cost nothing on the hot path.

use bytes::{Bytes, BytesMut};

pub use crate::protocol_constants::ICY_METAINT;

/// Formats a now-playing title into an ICY metadata block.
///
/// Per ICY spec, a single zero byte means "no metadata change". Otherwise
/// the first byte is the number of 16-byte blocks, followed by the metadata
/// string padded to that length.
#[must_use]
pub fn format_metadata(title: Option<&str>) -> Vec<u8> {
    let Some(title) = title.filter(|t| !t.is_empty()) else {
        return vec![0];
    };

    // ICY delimits with single quotes; escape by swapping to the Unicode
    // right single quotation mark, which renders identically.
    let title = title.replace('\'', "\u{2019}");
    let meta = format!("StreamTitle='{title}';");
    let meta_bytes = meta.as_bytes();

    let num_blocks = meta_bytes.len().div_ceil(16);
    let padded_len = num_blocks * 16;

    let mut block = Vec::with_capacity(padded_len + 1);
    block.push(num_blocks as u8);
    block.extend_from_slice(meta_bytes);
    block.resize(padded_len + 1, 0);
    block
}

/// Stateful per-connection injector.
///
/// Uses a reusable scratch buffer so steady-state injection does not
/// allocate per chunk.
pub struct IcyInjector {
    bytes_since_meta: usize,
    cached_block: Vec<u8>,
    cached_title: Option<String>,
    scratch: BytesMut,
}

impl IcyInjector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes_since_meta: 0,
            cached_block: vec![0],
            cached_title: None,
            scratch: BytesMut::new(),
        }
    }

    fn refresh_cache(&mut self, title: Option<&str>) -> usize {
        if self.cached_title.as_deref() != title {
            self.cached_block = format_metadata(title);
            self.cached_title = title.map(str::to_owned);
        }
        self.cached_block.len()
    }

    /// Splices metadata blocks into `chunk` at `ICY_METAINT` boundaries.
    pub fn inject(&mut self, chunk: &[u8], title: Option<&str>) -> Bytes {
        let block_len = self.refresh_cache(title);

        let total = self.bytes_since_meta + chunk.len();
        let insertions = total / ICY_METAINT;
        self.scratch.reserve(chunk.len() + insertions * block_len);

        let mut remaining = chunk;
        while !remaining.is_empty() {
            let to_boundary = ICY_METAINT - self.bytes_since_meta;
            if remaining.len() < to_boundary {
                self.scratch.extend_from_slice(remaining);
                self.bytes_since_meta += remaining.len();
                break;
            }
            self.scratch.extend_from_slice(&remaining[..to_boundary]);
            self.scratch.extend_from_slice(&self.cached_block);
            remaining = &remaining[to_boundary..];
            self.bytes_since_meta = 0;
        }

        self.scratch.split().freeze()
    }
}

impl Default for IcyInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_title_is_a_single_zero_byte() {
        assert_eq!(format_metadata(None), vec![0]);
        assert_eq!(format_metadata(Some("")), vec![0]);
    }

    #[test]
    fn title_is_padded_to_sixteen_byte_blocks() {
        let block = format_metadata(Some("Test Song"));
        // "StreamTitle='Test Song';" is 24 bytes -> two 16-byte blocks.
        assert_eq!(block[0], 2);
        assert_eq!(block.len(), 33);
        let content = String::from_utf8_lossy(&block[1..]);
        assert!(content.starts_with("StreamTitle='Test Song';"));
    }

    #[test]
    fn single_quotes_are_replaced() {
        let block = format_metadata(Some("It's Alive"));
        let content = String::from_utf8_lossy(&block[1..]);
        assert!(content.contains("It\u{2019}s Alive"));
        assert!(!content.contains("It's"));
    }

    #[test]
    fn injector_waits_for_the_boundary() {
        let mut injector = IcyInjector::new();
        let out = injector.inject(&vec![0u8; 1000], None);
        assert_eq!(out.len(), 1000);
    }

    #[test]
    fn injector_inserts_at_the_boundary() {
        let mut injector = IcyInjector::new();
        let out = injector.inject(&vec![0u8; ICY_METAINT], None);
        assert_eq!(out.len(), ICY_METAINT + 1);
        assert_eq!(out[ICY_METAINT], 0);
    }

    #[test]
    fn injector_handles_multiple_boundaries_in_one_chunk() {
        let mut injector = IcyInjector::new();
        let out = injector.inject(&vec![0u8; ICY_METAINT * 2 + 100], None);
        assert_eq!(out.len(), ICY_METAINT * 2 + 100 + 2);
    }

    #[test]
    fn injector_tracks_position_across_chunks() {
        let mut injector = IcyInjector::new();
        let first = injector.inject(&vec![0u8; ICY_METAINT - 10], None);
        assert_eq!(first.len(), ICY_METAINT - 10);

        let second = injector.inject(&vec![0u8; 20], None);
        // Boundary falls 10 bytes in: 20 audio bytes + 1 metadata byte.
        assert_eq!(second.len(), 21);
        assert_eq!(second[10], 0);
    }

    #[test]
    fn title_change_invalidates_cache() {
        let mut injector = IcyInjector::new();
        let a = injector.inject(&vec![0u8; ICY_METAINT], Some("Song A"));
        let b = injector.inject(&vec![0u8; ICY_METAINT], Some("Song B"));
        assert_ne!(&a[ICY_METAINT..], &b[ICY_METAINT..]);
        let content = String::from_utf8_lossy(&b[ICY_METAINT + 1..]);
        assert!(content.contains("Song B"));
    }
}
