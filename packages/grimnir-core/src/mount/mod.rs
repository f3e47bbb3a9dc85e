//! Per-mount producer→listener broadcast.
//!
//! A mount accepts bytes from (at most) one producer feed, appends them to a
//! rolling recent-audio ring, and fans each chunk out to every attached
//! listener over a bounded per-listener queue. A slow listener never slows
//! the feed or its peers: when its queue is full the chunk is dropped for
//! that listener only. New listeners are primed with recent audio so
//! playback starts before the next live chunk lands.

pub mod icy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer::RingBuffer;
use crate::bus::{BusEvent, EventBus, ListenerChange};
use crate::error::GrimnirResult;
use crate::protocol_constants::{
    FEED_CHUNK_SIZE, LISTENER_QUEUE_CHUNKS, PRIME_MAX_BYTES, PRIME_MIN_BYTES,
    PRIME_NOBUFFER_MIN_BYTES,
};
use crate::store::Store;

/// Output endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    pub id: String,
    pub station_id: String,
    /// Short name used in the URL path (`/live` → name `live`).
    pub name: String,
    pub content_type: String,
    pub bitrate_kbps: u32,
    pub channels: u8,
    pub sample_rate: u32,
    /// Encoder format tag (mp3, aac, ogg …); informational to the core.
    pub format: String,
}

struct ListenerSlot {
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

/// Listener side returned by [`Mount::attach_listener`].
pub struct AttachedListener {
    pub id: Uuid,
    /// Recent audio to send before the live chunks.
    pub prime: Bytes,
    pub rx: mpsc::Receiver<Bytes>,
    /// Fired when the mount closes this listener.
    pub cancel: CancellationToken,
}

/// A mount at runtime: config plus ring buffer, listener set and feed state.
pub struct Mount {
    config: MountConfig,
    ring: Mutex<RingBuffer>,
    listeners: RwLock<HashMap<Uuid, ListenerSlot>>,
    /// Concurrent producer feeds. More than one is a misconfiguration, but
    /// the count is what detects the EOF of the *last* producer.
    feeds: AtomicUsize,
    feed_active: watch::Sender<bool>,
    now_playing: RwLock<Option<String>>,
    dropped_chunks: AtomicU64,
    bus: Arc<EventBus>,
}

impl Mount {
    pub fn new(config: MountConfig, bus: Arc<EventBus>) -> Arc<Self> {
        let ring = RingBuffer::for_bitrate(config.bitrate_kbps);
        let (feed_active, _) = watch::channel(false);
        Arc::new(Self {
            config,
            ring: Mutex::new(ring),
            listeners: RwLock::new(HashMap::new()),
            feeds: AtomicUsize::new(0),
            feed_active,
            now_playing: RwLock::new(None),
            dropped_chunks: AtomicU64::new(0),
            bus,
        })
    }

    #[must_use]
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Bytes of encoded audio per second at the mount bitrate.
    fn bytes_per_second(&self) -> usize {
        self.config.bitrate_kbps as usize * 1000 / 8
    }

    /// Consumes the producer byte-stream until EOF or read error.
    ///
    /// Each chunk lands in the ring buffer and is fanned out to all
    /// listeners without blocking. Returns the number of bytes fed.
    pub async fn feed_from<R>(&self, mut reader: R) -> GrimnirResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        if self.feeds.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = self.feed_active.send(true);
        }

        let mut total: u64 = 0;
        let mut buf = BytesMut::with_capacity(FEED_CHUNK_SIZE);
        let result = loop {
            buf.clear();
            match reader.read_buf(&mut buf).await {
                Ok(0) => break Ok(total),
                Ok(n) => {
                    total += n as u64;
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    self.ring.lock().write(&chunk);
                    self.fan_out(chunk);
                }
                Err(e) => {
                    tracing::warn!(mount = self.config.name, error = %e, "producer feed read error");
                    break Err(e.into());
                }
            }
        };

        // Only the last exiting feed closes the input-done signal.
        if self.feeds.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.feed_active.send(false);
        }
        result
    }

    fn fan_out(&self, chunk: Bytes) {
        let mut closed: Vec<Uuid> = Vec::new();
        {
            let listeners = self.listeners.read();
            for (id, slot) in listeners.iter() {
                match slot.tx.try_send(chunk.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped_chunks.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        for id in closed {
            self.detach_listener(id);
        }
    }

    /// Registers a new listener and snapshots its prime bytes.
    ///
    /// With `skip_buffer` (quality switch) the prime is ≈200 ms of audio but
    /// at least 1 000 bytes; otherwise two seconds clamped to [8 KiB, 64 KiB].
    /// An empty ring primes nothing; the listener still attaches.
    pub fn attach_listener(&self, skip_buffer: bool) -> AttachedListener {
        let prime_bytes = if skip_buffer {
            (self.bytes_per_second() / 5).max(PRIME_NOBUFFER_MIN_BYTES)
        } else {
            (self.bytes_per_second() * 2).clamp(PRIME_MIN_BYTES, PRIME_MAX_BYTES)
        };
        // Snapshot atomically with respect to the writer.
        let prime = Bytes::from(self.ring.lock().recent(prime_bytes));

        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_CHUNKS);
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();

        let count = {
            let mut listeners = self.listeners.write();
            listeners.insert(
                id,
                ListenerSlot {
                    tx,
                    cancel: cancel.clone(),
                },
            );
            listeners.len()
        };
        self.publish_stats(ListenerChange::Connect, count);

        AttachedListener {
            id,
            prime,
            rx,
            cancel,
        }
    }

    /// Removes a listener; idempotent.
    pub fn detach_listener(&self, id: Uuid) {
        let removed = {
            let mut listeners = self.listeners.write();
            let removed = listeners.remove(&id);
            (removed, listeners.len())
        };
        if let (Some(slot), count) = removed {
            slot.cancel.cancel();
            self.publish_stats(ListenerChange::Disconnect, count);
        }
    }

    fn publish_stats(&self, change: ListenerChange, listeners: usize) {
        self.bus.publish(&BusEvent::ListenerStats {
            change,
            mount: self.config.name.clone(),
            bitrate: self.config.bitrate_kbps,
            listeners,
            content_type: self.config.content_type.clone(),
        });
    }

    /// Zeros the recent-audio ring. Call across sibling mounts before
    /// starting new producer feeds so they stay mutually in sync.
    pub fn clear_buffer(&self) {
        self.ring.lock().clear();
    }

    /// Marks every listener closed and clears the set.
    pub fn close(&self) {
        let drained: Vec<ListenerSlot> = {
            let mut listeners = self.listeners.write();
            listeners.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &drained {
            slot.cancel.cancel();
        }
        for i in 0..drained.len() {
            self.publish_stats(ListenerChange::Disconnect, drained.len() - i - 1);
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Chunks dropped on full listener queues since boot.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped_chunks.load(Ordering::Relaxed)
    }

    /// Whether a producer feed is currently running.
    #[must_use]
    pub fn feeding(&self) -> bool {
        self.feeds.load(Ordering::SeqCst) > 0
    }

    /// Watch handle over the feed-running flag (the "input done" signal
    /// flips it to false when the last producer exits).
    #[must_use]
    pub fn feed_signal(&self) -> watch::Receiver<bool> {
        self.feed_active.subscribe()
    }

    pub fn set_now_playing(&self, title: Option<String>) {
        *self.now_playing.write() = title;
    }

    #[must_use]
    pub fn now_playing(&self) -> Option<String> {
        self.now_playing.read().clone()
    }
}

/// Normalizes an HTTP path to a mount short name.
///
/// Strips the configured prefix, the leading slash and an optional file
/// extension (`/harbor/live.mp3` → `live`). Returns `None` for an empty
/// result.
#[must_use]
pub fn mount_name_from_path(path: &str, prefix: Option<&str>) -> Option<String> {
    let mut path = path;
    if let Some(prefix) = prefix {
        path = path.strip_prefix(prefix).unwrap_or(path);
    }
    let path = path.trim_start_matches('/');
    let name = match path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => stem,
        _ => path,
    };
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// All live mounts, indexed by id with name lookups for the HTTP surfaces.
pub struct MountRegistry {
    mounts: DashMap<String, Arc<Mount>>,
    bus: Arc<EventBus>,
}

impl MountRegistry {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            mounts: DashMap::new(),
            bus,
        })
    }

    /// Builds the registry from every configured mount in the store.
    pub async fn load(bus: Arc<EventBus>, store: &dyn Store) -> GrimnirResult<Arc<Self>> {
        let registry = Self::new(bus);
        for config in store.all_mounts().await? {
            registry.insert(config);
        }
        Ok(registry)
    }

    pub fn insert(&self, config: MountConfig) -> Arc<Mount> {
        let mount = Mount::new(config.clone(), self.bus.clone());
        self.mounts.insert(config.id, mount.clone());
        mount
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mount>> {
        self.mounts.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Mounts with the given short name; may span stations.
    pub fn by_name(&self, name: &str) -> Vec<Arc<Mount>> {
        self.mounts
            .iter()
            .filter(|r| r.value().config().name == name)
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    pub fn for_station(&self, station_id: &str) -> Vec<Arc<Mount>> {
        self.mounts
            .iter()
            .filter(|r| r.value().config().station_id == station_id)
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Mount>> {
        self.mounts.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// Clears the recent-audio ring across all of a station's mounts (HQ/LQ
    /// siblings stay in sync when a new feed starts).
    pub fn clear_station_buffers(&self, station_id: &str) {
        for mount in self.for_station(station_id) {
            mount.clear_buffer();
        }
    }

    /// Closes every mount's listeners.
    pub fn close_all(&self) {
        for mount in self.all() {
            mount.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventType;
    use tokio::io::AsyncWriteExt;

    fn config(name: &str) -> MountConfig {
        MountConfig {
            id: format!("mount-{name}"),
            station_id: "st1".into(),
            name: name.into(),
            content_type: "audio/mpeg".into(),
            bitrate_kbps: 128,
            channels: 2,
            sample_rate: 44_100,
            format: "mp3".into(),
        }
    }

    #[test]
    fn path_normalization() {
        assert_eq!(mount_name_from_path("/live", None), Some("live".into()));
        assert_eq!(mount_name_from_path("/live.mp3", None), Some("live".into()));
        assert_eq!(
            mount_name_from_path("/harbor/live.mp3", Some("/harbor")),
            Some("live".into())
        );
        assert_eq!(mount_name_from_path("/", None), None);
        assert_eq!(mount_name_from_path("", None), None);
        // Prefix absent from the path is tolerated.
        assert_eq!(
            mount_name_from_path("/live", Some("/harbor")),
            Some("live".into())
        );
    }

    /// Test reader yielding one fixed chunk per read, with a scheduler
    /// yield between chunks so concurrently-draining listeners keep up.
    struct StutterReader {
        chunks: std::collections::VecDeque<Vec<u8>>,
        yielded: bool,
    }

    impl StutterReader {
        fn new(chunks: impl IntoIterator<Item = Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into_iter().collect(),
                yielded: false,
            }
        }
    }

    impl AsyncRead for StutterReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if !self.yielded {
                self.yielded = true;
                cx.waker().wake_by_ref();
                return std::task::Poll::Pending;
            }
            self.yielded = false;
            if let Some(chunk) = self.chunks.pop_front() {
                buf.put_slice(&chunk);
            }
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn feed_lands_in_ring_and_listeners() {
        let bus = EventBus::arc();
        let mount = Mount::new(config("live"), bus);
        let mut listener = mount.attach_listener(false);
        assert!(listener.prime.is_empty(), "empty ring primes nothing");

        let reader = StutterReader::new([b"hello radio".to_vec()]);
        let fed = mount.feed_from(reader).await.unwrap();
        assert_eq!(fed, 11);

        let chunk = listener.rx.recv().await.unwrap();
        assert_eq!(&chunk[..], b"hello radio");
    }

    #[tokio::test]
    async fn slow_listener_drops_without_stalling_the_fast_one() {
        let bus = EventBus::arc();
        let mount = Mount::new(config("live"), bus);

        let mut fast = mount.attach_listener(false);
        let mut slow = mount.attach_listener(false);
        let fast_id = fast.id;

        const CHUNKS: usize = 600;
        let drain = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(chunk) = fast.rx.recv().await {
                seen.extend_from_slice(&chunk);
            }
            seen
        });

        // Sequence-stamped one-byte chunks; `slow` never reads.
        let reader = StutterReader::new((0..CHUNKS).map(|i| vec![(i % 251) as u8]));
        mount.feed_from(reader).await.unwrap();

        // Close the fast listener's queue so the drain task finishes.
        mount.detach_listener(fast_id);
        let seen = drain.await.unwrap();

        // The fast listener saw every byte, in order.
        let expected: Vec<u8> = (0..CHUNKS).map(|i| (i % 251) as u8).collect();
        assert_eq!(seen, expected);

        // The stalled listener kept at most its queue capacity; the rest
        // were dropped and counted.
        let mut kept = 0;
        while slow.rx.try_recv().is_ok() {
            kept += 1;
        }
        assert_eq!(kept, LISTENER_QUEUE_CHUNKS);
        assert_eq!(
            mount.dropped_count(),
            (CHUNKS - LISTENER_QUEUE_CHUNKS) as u64
        );
    }

    #[tokio::test]
    async fn prime_sizes_follow_the_switch() {
        let bus = EventBus::arc();
        let mount = Mount::new(config("live"), bus);

        // Fill the ring with 80 kB (the full 5 s window at 128 kbps).
        let (mut writer, reader) = tokio::io::duplex(256 * 1024);
        let feeder = {
            let mount = Arc::clone(&mount);
            tokio::spawn(async move { mount.feed_from(reader).await })
        };
        writer.write_all(&vec![7u8; 80_000]).await.unwrap();
        drop(writer);
        feeder.await.unwrap().unwrap();

        // Normal attach: 2 s at 16 kB/s = 32 kB, inside [8k, 64k].
        let normal = mount.attach_listener(false);
        assert_eq!(normal.prime.len(), 32_000);

        // Quality switch: 200 ms = 3.2 kB.
        let nobuffer = mount.attach_listener(true);
        assert_eq!(nobuffer.prime.len(), 3_200);
    }

    #[tokio::test]
    async fn short_ring_primes_what_it_has() {
        let bus = EventBus::arc();
        let mount = Mount::new(config("live"), bus);

        let (mut writer, reader) = tokio::io::duplex(8 * 1024);
        let feeder = {
            let mount = Arc::clone(&mount);
            tokio::spawn(async move { mount.feed_from(reader).await })
        };
        writer.write_all(&vec![1u8; 500]).await.unwrap();
        drop(writer);
        feeder.await.unwrap().unwrap();

        let listener = mount.attach_listener(true);
        assert_eq!(listener.prime.len(), 500);
    }

    #[tokio::test]
    async fn attach_detach_publish_stats() {
        let bus = EventBus::arc();
        let mut stats = bus.subscribe(EventType::ListenerStats);
        let mount = Mount::new(config("live"), bus);

        let listener = mount.attach_listener(false);
        match stats.try_recv().unwrap() {
            BusEvent::ListenerStats {
                change, listeners, mount: name, ..
            } => {
                assert_eq!(change, ListenerChange::Connect);
                assert_eq!(listeners, 1);
                assert_eq!(name, "live");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        mount.detach_listener(listener.id);
        match stats.try_recv().unwrap() {
            BusEvent::ListenerStats { change, listeners, .. } => {
                assert_eq!(change, ListenerChange::Disconnect);
                assert_eq!(listeners, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(listener.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn last_feed_exit_flips_the_input_signal() {
        let bus = EventBus::arc();
        let mount = Mount::new(config("live"), bus);
        let mut signal = mount.feed_signal();
        assert!(!*signal.borrow());

        let (mut writer, reader) = tokio::io::duplex(1024);
        let feeder = {
            let mount = Arc::clone(&mount);
            tokio::spawn(async move { mount.feed_from(reader).await })
        };
        writer.write_all(b"x").await.unwrap();
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
        assert!(mount.feeding());

        drop(writer);
        feeder.await.unwrap().unwrap();
        signal.changed().await.unwrap();
        assert!(!*signal.borrow());
    }

    #[tokio::test]
    async fn close_cancels_all_listeners() {
        let bus = EventBus::arc();
        let mount = Mount::new(config("live"), bus);
        let a = mount.attach_listener(false);
        let b = mount.attach_listener(false);

        mount.close();
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert_eq!(mount.listener_count(), 0);
    }

    #[tokio::test]
    async fn registry_resolves_names_and_sibling_buffers() {
        let bus = EventBus::arc();
        let registry = MountRegistry::new(bus);
        registry.insert(config("live"));
        let mut hq = config("main-hq");
        hq.id = "mount-hq".into();
        let mut lq = config("main-lq");
        lq.id = "mount-lq".into();
        registry.insert(hq);
        registry.insert(lq);

        assert_eq!(registry.by_name("live").len(), 1);
        assert!(registry.by_name("nope").is_empty());
        assert_eq!(registry.for_station("st1").len(), 3);

        // Sibling clear touches every mount of the station.
        let mount = registry.get("mount-hq").unwrap();
        let (mut writer, reader) = tokio::io::duplex(1024);
        let feeder = {
            let mount = Arc::clone(&mount);
            tokio::spawn(async move { mount.feed_from(reader).await })
        };
        writer.write_all(&vec![9u8; 2000]).await.unwrap();
        drop(writer);
        feeder.await.unwrap().unwrap();

        registry.clear_station_buffers("st1");
        let listener = mount.attach_listener(true);
        assert!(listener.prime.is_empty());
    }
}
