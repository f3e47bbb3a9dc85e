//! Minimal HTTP/1.1 request-head handling for the harbor ingest.
//!
//! The harbor cannot sit behind a full HTTP framework: legacy Icecast
//! clients open with a non-standard `SOURCE` method that must be rewritten
//! at the connection layer, and the socket is hijacked right after the
//! headers for the audio stream. So the head is parsed by hand: request
//! line and headers, nothing else; everything past the blank line is
//! body bytes owned by the session.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{GrimnirError, GrimnirResult};
use crate::protocol_constants::HARBOR_MAX_HEAD_BYTES;

/// Parsed request line + headers.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    /// Raw request target (path plus optional query).
    pub target: String,
    pub version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup; returns the first match.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path component of the target.
    #[must_use]
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("")
    }

    /// Query component of the target, if any.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    /// All `Ice-*` headers plus content-type and user-agent, as the
    /// session's source metadata.
    #[must_use]
    pub fn source_metadata(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.headers {
            let lower = name.to_ascii_lowercase();
            if lower.starts_with("ice-") || lower == "content-type" || lower == "user-agent" {
                map.insert(lower, serde_json::Value::String(value.clone()));
            }
        }
        serde_json::Value::Object(map)
    }
}

/// Reads and parses the request head, rewriting the legacy `SOURCE` method
/// to `PUT` before parsing.
///
/// Fails on oversized heads and malformed request lines. Body bytes stay in
/// the reader's buffer for the caller.
pub async fn read_request_head<R>(reader: &mut R) -> GrimnirResult<RequestHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut total = 0usize;

    read_head_line(reader, &mut line, &mut total).await?;
    // Legacy Icecast source clients speak `SOURCE /mount`; the rewrite keeps
    // the rest of the parser standard.
    let request_line = match line.strip_prefix("SOURCE ") {
        Some(rest) => format!("PUT {rest}"),
        None => line.clone(),
    };

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => {
            return Err(GrimnirError::InvalidRequest(format!(
                "malformed request line {request_line:?}"
            )))
        }
    };

    let mut headers = Vec::new();
    loop {
        read_head_line(reader, &mut line, &mut total).await?;
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(GrimnirError::InvalidRequest(format!(
                "malformed header line {line:?}"
            )));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

async fn read_head_line<R>(
    reader: &mut R,
    line: &mut String,
    total: &mut usize,
) -> GrimnirResult<()>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = reader.read_line(line).await?;
    if read == 0 {
        return Err(GrimnirError::InvalidRequest(
            "connection closed mid-head".into(),
        ));
    }
    *total += read;
    if *total > HARBOR_MAX_HEAD_BYTES {
        return Err(GrimnirError::InvalidRequest("request head too large".into()));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(())
}

/// Decodes an HTTP Basic `Authorization` value into (username, password).
#[must_use]
pub fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?.trim();
    let decoded = STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Parses a query string into a map, percent-decoding values.
#[must_use]
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

/// Minimal percent-decoder; `+` decodes to space per form encoding.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => match (hex_val(bytes.get(i + 1)), hex_val(bytes.get(i + 2))) {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(byte: Option<&u8>) -> Option<u8> {
    match byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Renders a response head. An empty `headers` slice still terminates the
/// head properly.
#[must_use]
pub fn response_head(status: u16, reason: &str, headers: &[(&str, &str)]) -> String {
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    async fn parse(raw: &str) -> GrimnirResult<RequestHead> {
        let mut reader = BufReader::new(Cursor::new(raw.as_bytes().to_vec()));
        read_request_head(&mut reader).await
    }

    #[tokio::test]
    async fn parses_put_request() {
        let head = parse("PUT /live.mp3 HTTP/1.1\r\nHost: radio\r\nContent-Type: audio/mpeg\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(head.method, "PUT");
        assert_eq!(head.path(), "/live.mp3");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("content-type"), Some("audio/mpeg"));
        assert_eq!(head.header("HOST"), Some("radio"));
    }

    #[tokio::test]
    async fn source_method_is_rewritten_to_put() {
        let head = parse("SOURCE /live HTTP/1.0\r\n\r\n").await.unwrap();
        assert_eq!(head.method, "PUT");
        assert_eq!(head.path(), "/live");
    }

    #[tokio::test]
    async fn body_bytes_stay_in_the_reader() {
        let raw = b"PUT /live HTTP/1.1\r\n\r\nAUDIO".to_vec();
        let mut reader = BufReader::new(Cursor::new(raw));
        read_request_head(&mut reader).await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"AUDIO");
    }

    #[tokio::test]
    async fn malformed_request_line_is_rejected() {
        assert!(parse("NONSENSE\r\n\r\n").await.is_err());
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut raw = String::from("PUT /live HTTP/1.1\r\n");
        for i in 0..200 {
            raw.push_str(&format!("X-Pad-{i}: {}\r\n", "y".repeat(64)));
        }
        raw.push_str("\r\n");
        assert!(parse(&raw).await.is_err());
    }

    #[tokio::test]
    async fn ice_headers_become_metadata() {
        let head = parse(
            "PUT /live HTTP/1.1\r\nIce-Name: Night Shift\r\nIce-Genre: jazz\r\nUser-Agent: butt/0.1\r\nX-Other: skip\r\n\r\n",
        )
        .await
        .unwrap();
        let meta = head.source_metadata();
        assert_eq!(meta["ice-name"], "Night Shift");
        assert_eq!(meta["ice-genre"], "jazz");
        assert_eq!(meta["user-agent"], "butt/0.1");
        assert!(meta.get("x-other").is_none());
    }

    #[test]
    fn basic_auth_round_trip() {
        let encoded = STANDARD.encode("source:secret-token");
        let (user, password) = parse_basic_auth(&format!("Basic {encoded}")).unwrap();
        assert_eq!(user, "source");
        assert_eq!(password, "secret-token");

        assert!(parse_basic_auth("Bearer xyz").is_none());
        assert!(parse_basic_auth("Basic !!!notb64!!!").is_none());
    }

    #[test]
    fn query_parsing_percent_decodes() {
        let params = parse_query("mode=updinfo&song=Artist%20-%20Title+Two%21");
        assert_eq!(params["mode"], "updinfo");
        assert_eq!(params["song"], "Artist - Title Two!");

        let empty = parse_query("");
        assert!(empty.is_empty());
    }

    #[test]
    fn response_head_renders() {
        let head = response_head(200, "OK", &[("Connection", "close")]);
        assert_eq!(head, "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n");
        assert_eq!(response_head(404, "Not Found", &[]), "HTTP/1.1 404 Not Found\r\n\r\n");
    }
}
