//! Icecast-compatible live ingest.
//!
//! DJs point their streaming client at `PUT /<mount>` (or the legacy
//! `SOURCE /<mount>`, rewritten at the connection layer) with HTTP Basic
//! auth where the password is a one-time session token. After
//! authorization the TCP connection is hijacked: a minimal `200 OK` goes
//! out, the first audio bytes must arrive within ten seconds, and from
//! then on the socket is piped through an optional decoder subprocess into
//! the media engine's encoder sink. Either pipe ending closes the session,
//! which releases the priority claim and lets automation resume.

pub mod protocol;

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::HarborConfig;
use crate::error::{GrimnirError, GrimnirResult};
use crate::live::{ConnectInfo, LiveSessionRegistry};
use crate::media::MediaEngine;
use crate::mount::{mount_name_from_path, MountConfig, MountRegistry};
use crate::protocol_constants::{HARBOR_DEFAULT_CONTENT_TYPE, HARBOR_FIRST_READ_TIMEOUT};
use crate::store::Store;
use protocol::{parse_basic_auth, parse_query, read_request_head, response_head, RequestHead};

/// A currently-connected source, for the admin metadata surface.
#[derive(Debug, Clone)]
struct ActiveSource {
    session_id: String,
    mount_id: String,
    token: String,
}

/// The harbor TCP server.
pub struct HarborServer {
    config: HarborConfig,
    decoder_command: Vec<String>,
    store: Arc<dyn Store>,
    registry: Arc<LiveSessionRegistry>,
    mounts: Arc<MountRegistry>,
    engine: Arc<dyn MediaEngine>,
    active: DashMap<String, ActiveSource>,
    source_count: AtomicUsize,
}

impl HarborServer {
    pub fn new(
        config: HarborConfig,
        decoder_command: Vec<String>,
        store: Arc<dyn Store>,
        registry: Arc<LiveSessionRegistry>,
        mounts: Arc<MountRegistry>,
        engine: Arc<dyn MediaEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            decoder_command,
            store,
            registry,
            mounts,
            engine,
            active: DashMap::new(),
            source_count: AtomicUsize::new(0),
        })
    }

    /// Binds and serves until cancelled. One task per accepted connection.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> GrimnirResult<()> {
        let listener = TcpListener::bind((self.config.bind, self.config.port)).await?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "harbor listening");
        self.accept_loop(listener, cancel).await
    }

    /// Accept loop over an already-bound listener (tests bind port 0).
    pub async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> GrimnirResult<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "harbor accept failed");
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(socket, peer.to_string(), cancel).await {
                            tracing::debug!(peer = %peer, error = %e, "harbor connection ended with error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        socket: TcpStream,
        peer: String,
        cancel: CancellationToken,
    ) -> GrimnirResult<()> {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        let head = match tokio::time::timeout(
            HARBOR_FIRST_READ_TIMEOUT,
            read_request_head(&mut reader),
        )
        .await
        {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                respond(&mut write_half, 400, "Bad Request", &[]).await;
                return Err(e);
            }
            Err(_) => {
                respond(&mut write_half, 408, "Request Timeout", &[]).await;
                return Err(GrimnirError::InvalidRequest("request head timed out".into()));
            }
        };

        match head.method.as_str() {
            "PUT" => {
                self.handle_source(head, reader, write_half, peer, cancel)
                    .await
            }
            "GET" if head.path() == "/admin/metadata" => {
                self.handle_metadata(&head, &mut write_half).await
            }
            _ => {
                respond(&mut write_half, 405, "Method Not Allowed", &[]).await;
                Ok(())
            }
        }
    }

    /// Resolves the target mount: strips the configured prefix and an
    /// optional extension, then disambiguates name collisions by the
    /// token-bound station.
    async fn resolve_mount(
        &self,
        head: &RequestHead,
        bound_station: Option<&str>,
    ) -> GrimnirResult<MountConfig> {
        let name = mount_name_from_path(head.path(), self.config.mount_prefix.as_deref())
            .ok_or_else(|| GrimnirError::InvalidRequest("empty mount path".into()))?;

        let candidates = self.store.mounts_by_name(&name).await?;
        let chosen = match bound_station {
            Some(station) => candidates
                .into_iter()
                .find(|m| m.station_id == station),
            None => candidates.into_iter().next(),
        };
        chosen.ok_or(GrimnirError::MountNotFound(name))
    }

    async fn handle_source(
        self: Arc<Self>,
        head: RequestHead,
        reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        peer: String,
        cancel: CancellationToken,
    ) -> GrimnirResult<()> {
        // Path sanity before anything else.
        if mount_name_from_path(head.path(), self.config.mount_prefix.as_deref()).is_none() {
            respond(&mut writer, 400, "Bad Request", &[]).await;
            return Ok(());
        }

        // Basic auth: username is conventional, the password is the token.
        let Some((_, token)) = head
            .header("Authorization")
            .and_then(parse_basic_auth)
        else {
            respond(
                &mut writer,
                401,
                "Unauthorized",
                &[("WWW-Authenticate", "Basic realm=\"Grimnir Harbor\"")],
            )
            .await;
            return Ok(());
        };

        // The token binds a station/mount; use it to resolve collisions.
        let Some(session) = self.store.live_session_by_token(&token).await? else {
            respond(
                &mut writer,
                401,
                "Unauthorized",
                &[("WWW-Authenticate", "Basic realm=\"Grimnir Harbor\"")],
            )
            .await;
            return Ok(());
        };

        let mount = match self.resolve_mount(&head, Some(&session.station_id)).await {
            Ok(mount) => mount,
            Err(GrimnirError::MountNotFound(name)) => {
                respond(&mut writer, 404, "Not Found", &[]).await;
                return Err(GrimnirError::MountNotFound(name));
            }
            Err(e) => {
                respond(&mut writer, 400, "Bad Request", &[]).await;
                return Err(e);
            }
        };

        // Source cap.
        let previous = self.source_count.fetch_add(1, Ordering::SeqCst);
        let _count_guard = SourceCountGuard(&self.source_count);
        if previous >= self.config.max_sources {
            respond(&mut writer, 503, "Service Unavailable", &[]).await;
            return Err(GrimnirError::MaxSourcesExceeded);
        }

        // One-shot token consumption + session activation (this is the
        // priority handover; automation is preempted here).
        let session = match self
            .registry
            .authorize_source(&session.station_id, &mount.id, &token)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                respond(
                    &mut writer,
                    401,
                    "Unauthorized",
                    &[("WWW-Authenticate", "Basic realm=\"Grimnir Harbor\"")],
                )
                .await;
                return Err(e);
            }
        };

        let mut metadata = head.source_metadata();
        if metadata.get("content-type").is_none() {
            metadata["content-type"] =
                serde_json::Value::String(HARBOR_DEFAULT_CONTENT_TYPE.to_string());
        }
        let session = self
            .registry
            .handle_connect(
                &session.id,
                ConnectInfo {
                    source_ip: Some(peer.clone()),
                    user_agent: head.header("User-Agent").map(str::to_owned),
                    metadata,
                },
            )
            .await?;
        self.registry.note_activity(&session.id);

        tracing::info!(
            session = session.id,
            mount = mount.name,
            peer = peer,
            username = session.username,
            "live source connected"
        );

        // Hijack acknowledged: minimal 200 before any body handling, since
        // reverse proxies may have sent Content-Length: 0 on streaming PUT.
        writer
            .write_all(response_head(200, "OK", &[("Connection", "close")]).as_bytes())
            .await?;
        writer.flush().await?;

        self.active.insert(
            session.id.clone(),
            ActiveSource {
                session_id: session.id.clone(),
                mount_id: mount.id.clone(),
                token: token.clone(),
            },
        );

        let result = self
            .stream_session(&session.id, &mount, reader, cancel)
            .await;

        self.active.remove(&session.id);
        if let Err(e) = self.registry.handle_disconnect(&session.id).await {
            tracing::warn!(session = session.id, error = %e, "session close failed");
        }
        if let Some(mount) = self.mounts.get(&mount.id) {
            mount.set_now_playing(None);
        }
        tracing::info!(session = session.id, "live source disconnected");
        result
    }

    /// Pumps DJ bytes into the encoder until either side ends.
    async fn stream_session(
        &self,
        session_id: &str,
        mount: &MountConfig,
        mut reader: BufReader<OwnedReadHalf>,
        cancel: CancellationToken,
    ) -> GrimnirResult<()> {
        use tokio::io::AsyncBufReadExt;

        // The source must prove data flows before we commit a decoder and
        // an encoder slot. After this the read side has no deadline.
        let first = tokio::time::timeout(HARBOR_FIRST_READ_TIMEOUT, reader.fill_buf()).await;
        match first {
            Ok(Ok(buf)) if !buf.is_empty() => {}
            Ok(Ok(_)) | Err(_) => {
                return Err(GrimnirError::InvalidRequest(
                    "source sent no audio within the initial deadline".into(),
                ));
            }
            Ok(Err(e)) => return Err(e.into()),
        }

        let sink = self
            .engine
            .inject_live_source(&mount.station_id, &mount.id)
            .await?;

        let result = if self.decoder_command.is_empty() {
            // Passthrough: the engine takes the stream as-is.
            pump_direct(reader, sink, &cancel).await
        } else {
            self.pump_through_decoder(mount, reader, sink, &cancel).await
        };

        tracing::debug!(session = session_id, "live stream ended");
        result
    }

    /// socket → decoder stdin, decoder stdout → encoder sink. Either pipe
    /// finishing (EOF or error) ends the session.
    async fn pump_through_decoder(
        &self,
        mount: &MountConfig,
        mut reader: BufReader<OwnedReadHalf>,
        mut sink: crate::media::LiveSink,
        cancel: &CancellationToken,
    ) -> GrimnirResult<()> {
        let argv: Vec<String> = self
            .decoder_command
            .iter()
            .map(|arg| {
                arg.replace("{rate}", &mount.sample_rate.to_string())
                    .replace("{channels}", &mount.channels.to_string())
            })
            .collect();

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdin = child.stdin.take().expect("piped stdin");
        let mut stdout = child.stdout.take().expect("piped stdout");

        let inbound = async {
            let result = tokio::io::copy_buf(&mut reader, &mut stdin).await;
            let _ = stdin.shutdown().await;
            result
        };
        let outbound = tokio::io::copy(&mut stdout, &mut sink);

        tokio::select! {
            _ = cancel.cancelled() => {}
            result = inbound => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "source read ended");
                }
            }
            result = outbound => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "decoder pipe ended");
                }
            }
        }

        let _ = child.kill().await;
        Ok(())
    }

    /// `GET /admin/metadata?mode=updinfo&song=…`: now-playing update for
    /// the connected source. Credentials must match the active session's
    /// token.
    async fn handle_metadata(
        &self,
        head: &RequestHead,
        writer: &mut OwnedWriteHalf,
    ) -> GrimnirResult<()> {
        let params = parse_query(head.query().unwrap_or(""));
        if params.get("mode").map(String::as_str) != Some("updinfo") {
            respond(writer, 400, "Bad Request", &[]).await;
            return Ok(());
        }
        let Some(song) = params.get("song") else {
            respond(writer, 400, "Bad Request", &[]).await;
            return Ok(());
        };

        let Some((_, token)) = head.header("Authorization").and_then(parse_basic_auth) else {
            respond(
                writer,
                401,
                "Unauthorized",
                &[("WWW-Authenticate", "Basic realm=\"Grimnir Harbor\"")],
            )
            .await;
            return Ok(());
        };

        let Some(active) = self
            .active
            .iter()
            .find(|entry| entry.value().token == token)
            .map(|entry| entry.value().clone())
        else {
            // Wrong credentials and no connection are indistinguishable by
            // token; no active source at all is the 404 case.
            if self.active.is_empty() {
                respond(writer, 404, "Not Found", &[]).await;
            } else {
                respond(writer, 401, "Unauthorized", &[]).await;
            }
            return Ok(());
        };

        if let Some(mount) = self.mounts.get(&active.mount_id) {
            mount.set_now_playing(Some(song.clone()));
        }
        self.registry.note_activity(&active.session_id);
        tracing::debug!(session = active.session_id, song = song, "now-playing updated");

        respond(writer, 200, "OK", &[("Content-Type", "text/plain")]).await;
        Ok(())
    }

    /// Currently connected source count.
    #[must_use]
    pub fn active_sources(&self) -> usize {
        self.active.len()
    }
}

/// Decrements the source counter when a connection path exits.
struct SourceCountGuard<'a>(&'a AtomicUsize);

impl Drop for SourceCountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Raw passthrough pump for engines that ingest the compressed stream.
async fn pump_direct(
    mut reader: BufReader<OwnedReadHalf>,
    mut sink: crate::media::LiveSink,
    cancel: &CancellationToken,
) -> GrimnirResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_buf(&mut reader, &mut sink) => {
            if let Err(e) = result {
                tracing::debug!(error = %e, "source pipe ended");
            }
        }
    }
    let _ = sink.shutdown().await;
    Ok(())
}

async fn respond(writer: &mut OwnedWriteHalf, status: u16, reason: &str, headers: &[(&str, &str)]) {
    let head = response_head(status, reason, headers);
    if let Err(e) = writer.write_all(head.as_bytes()).await {
        tracing::debug!(error = %e, "harbor response write failed");
    }
    let _ = writer.flush().await;
}
