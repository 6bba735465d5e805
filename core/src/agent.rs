//! Sync agent (component I): the state machine and dispatch tables that wire
//! every other component together into the four long-lived workers of the
//! concurrency model (listener, connector, connection handler, watcher), plus
//! the ephemeral per-transfer sender tasks.

use crate::chunked::{ChunkedReader, ChunkedWriter};
use crate::clipboard::{ClipboardAdapter, ClipboardContent};
use crate::config::Config;
use crate::discovery::{Discovery, PeerInfo, DEFAULT_DISCOVERY_TIMEOUT};
use crate::error::{Error, Result};
use crate::ignore::IgnoreFilter;
use crate::image_norm::{self, Normalized};
use crate::pairing::{PairingRecord, PairingStore};
use crate::protocol::Message;
use crate::status::{AgentEvents, AgentState, ErrorKind, SpeedEstimator};
use crate::transfer::{FileMetadata, TransferRecord, TransferRegistry, TransferStatus};
use crate::transport::{Connection, Listener, Transport};
use crate::watcher::{self, EchoSuppressor, DEFAULT_ECHO_RETENTION};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);
const CLIPBOARD_WRITE_ATTEMPTS: u32 = 3;
const CLIPBOARD_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Retries a synchronous clipboard write up to [`CLIPBOARD_WRITE_ATTEMPTS`]
/// times, 200ms apart, before giving up: a locked or busy system clipboard is
/// often transient, per spec.md §7.
async fn retry_clipboard_write(mut op: impl FnMut() -> Result<()>) -> Result<()> {
    for attempt in 1..=CLIPBOARD_WRITE_ATTEMPTS {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) if attempt < CLIPBOARD_WRITE_ATTEMPTS => {
                warn!(attempt, error = %e, "clipboard write failed, retrying");
                tokio::time::sleep(CLIPBOARD_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns within CLIPBOARD_WRITE_ATTEMPTS iterations")
}

/// Reconnection backoff: 1, 2, 4, 8, 15, 30s, then steady at 30s.
pub struct Backoff {
    steps: &'static [u64],
    idx: usize,
}

impl Backoff {
    pub fn new() -> Self {
        Self { steps: &[1, 2, 4, 8, 15, 30], idx: 0 }
    }

    pub fn reset(&mut self) {
        self.idx = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let secs = self.steps[self.idx.min(self.steps.len() - 1)];
        if self.idx < self.steps.len() - 1 {
            self.idx += 1;
        }
        Duration::from_secs(secs)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erasing adapters so `Agent` doesn't need to carry `Transport`'s and
/// `Listener`'s associated `Conn` types as generic parameters throughout —
/// every concrete connection is immediately boxed as `Arc<dyn Connection>`.
#[async_trait]
trait DynTransport: Send + Sync {
    async fn connect(&self, addr: SocketAddr, device_id: &str, pairing: &PairingRecord) -> Result<Arc<dyn Connection>>;
}

#[async_trait]
impl<T: Transport + 'static> DynTransport for T {
    async fn connect(&self, addr: SocketAddr, device_id: &str, pairing: &PairingRecord) -> Result<Arc<dyn Connection>> {
        let conn = Transport::connect(self, addr, device_id, pairing).await?;
        Ok(Arc::new(conn))
    }
}

#[async_trait]
trait DynListener: Send + Sync {
    async fn accept(&self, device_id: &str, pairing: &PairingRecord) -> Result<Arc<dyn Connection>>;
}

#[async_trait]
impl<L: Listener + 'static> DynListener for L {
    async fn accept(&self, device_id: &str, pairing: &PairingRecord) -> Result<Arc<dyn Connection>> {
        let conn = Listener::accept(self, device_id, pairing).await?;
        Ok(Arc::new(conn))
    }
}

fn classify_error(err: &Error) -> ErrorKind {
    match err {
        Error::ProtocolError(_) => ErrorKind::Protocol,
        Error::AuthError(_) => ErrorKind::Auth,
        Error::ConnectionLost => ErrorKind::ConnectionLost,
        Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
        Error::ExpiredOrUnknownTransfer(_) => ErrorKind::ExpiredOrUnknownTransfer,
        Error::ClipboardUnavailable(_) => ErrorKind::ClipboardUnavailable,
        _ => ErrorKind::Internal,
    }
}

/// Per-connection state the agent needs beyond what `TransferRegistry`
/// tracks: in-progress receiver-side writers and speed estimators, keyed by
/// `transfer_id`.
#[derive(Default)]
struct ConnState {
    writers: HashMap<(String, u32), ChunkedWriter>,
    progress: HashMap<String, u64>,
    speed: HashMap<String, SpeedEstimator>,
    cancel_flags: HashMap<String, Arc<AtomicBool>>,
}

/// Owns every long-lived worker and piece of shared state described in
/// spec.md §5: listener, connector, connection handler, watcher, plus the
/// transfer registry's sweep janitor and the discovery refresh loop.
pub struct Agent<Cb: ClipboardAdapter + 'static> {
    device_id: String,
    pairing_store: Arc<dyn PairingStore>,
    config: Config,
    transport: Arc<dyn DynTransport>,
    listener: Arc<dyn DynListener>,
    discovery: Arc<dyn Discovery>,
    clipboard: Arc<Cb>,
    events: Arc<dyn AgentEvents>,
    ignore: Arc<IgnoreFilter>,
    download_dir: PathBuf,

    registry: TransferRegistry,
    suppressor: Arc<Mutex<EchoSuppressor>>,
    conn_state: Arc<Mutex<ConnState>>,

    best_addr: Arc<Mutex<Option<SocketAddr>>>,
    active_conn: Arc<Mutex<Option<Arc<dyn Connection>>>>,
    state: Arc<Mutex<AgentState>>,
    current_outbound: Arc<Mutex<Option<String>>>,

    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Lets `&self` methods that must hand a `'static` handle to
    /// `tokio::spawn` (outbound transfer senders) recover an owned `Arc`
    /// without requiring every caller to thread one through.
    self_weak: Weak<Agent<Cb>>,
}

impl<Cb: ClipboardAdapter + 'static> Agent<Cb> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: String,
        pairing_store: Arc<dyn PairingStore>,
        config: Config,
        transport: impl Transport + 'static,
        listener: impl Listener + 'static,
        discovery: Arc<dyn Discovery>,
        clipboard: Arc<Cb>,
        events: Arc<dyn AgentEvents>,
        ignore: IgnoreFilter,
        download_dir: PathBuf,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            device_id,
            pairing_store,
            config,
            transport: Arc::new(transport),
            listener: Arc::new(listener),
            discovery,
            clipboard,
            events,
            ignore: Arc::new(ignore),
            download_dir,
            registry: TransferRegistry::new(),
            suppressor: Arc::new(Mutex::new(EchoSuppressor::new(DEFAULT_ECHO_RETENTION))),
            conn_state: Arc::new(Mutex::new(ConnState::default())),
            best_addr: Arc::new(Mutex::new(None)),
            active_conn: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(AgentState::Idle)),
            current_outbound: Arc::new(Mutex::new(None)),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
            self_weak: weak.clone(),
        })
    }

    fn pairing(&self) -> Result<PairingRecord> {
        self.pairing_store.load()?.ok_or(Error::NotPaired)
    }

    async fn set_state(&self, state: AgentState) {
        *self.state.lock().await = state;
        self.events.on_state(state);
    }

    pub async fn current_state(&self) -> AgentState {
        *self.state.lock().await
    }

    /// Snapshot of every announced/pending transfer, for the `status` CLI
    /// surface.
    pub async fn active_transfers(&self) -> Vec<TransferRecord> {
        self.registry.all().await
    }

    /// Sets the fallback address used when discovery hasn't resolved a peer
    /// within `DEFAULT_DISCOVERY_TIMEOUT`.
    pub async fn set_fallback_peer(&self, addr: SocketAddr) {
        let mut slot = self.best_addr.lock().await;
        if slot.is_none() {
            *slot = Some(addr);
        }
    }

    async fn has_active_connection(&self) -> bool {
        self.active_conn.lock().await.is_some()
    }

    /// Sends a message on the current connection, if any. Returns
    /// `ConnectionLost` when disconnected, per spec.md's "no resume across
    /// reconnects" non-goal — the caller re-copies.
    async fn send(&self, msg: &Message, payload: &[u8]) -> Result<()> {
        let conn = self.active_conn.lock().await.clone();
        match conn {
            Some(conn) => conn.send(msg, payload).await,
            None => {
                debug!(?msg, "dropped outbound message: no active connection");
                Err(Error::ConnectionLost)
            }
        }
    }

    /// Starts every long-lived worker and returns once they are spawned
    /// (they keep running in the background until `shutdown` is called).
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.pairing_store.load()?.is_none() {
            return Err(Error::NotPaired);
        }

        let tasks = vec![
            self.clone().spawn_watcher(),
            self.clone().spawn_listener(),
            self.clone().spawn_connector(),
            self.clone().spawn_discovery(),
            self.clone().spawn_sweep(),
        ];
        *self.tasks.lock().await = tasks;
        Ok(())
    }

    /// Sets the global "stopping" flag, closes the active connection, and
    /// joins workers with a grace period before giving up.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(conn) = self.active_conn.lock().await.take() {
            conn.close();
        }
        self.set_state(AgentState::Closed).await;

        let mut tasks = self.tasks.lock().await;
        let handles = std::mem::take(&mut *tasks);
        if tokio::time::timeout(Duration::from_secs(5), join_all(handles)).await.is_err() {
            warn!("workers did not shut down within grace period");
        }
    }

    // --- Workers -----------------------------------------------------

    fn spawn_watcher(self: Arc<Self>) -> JoinHandle<()> {
        let clipboard: Arc<dyn ClipboardAdapter> = self.clipboard.clone();
        let suppressor = self.suppressor.clone();
        let stop_rx = self.stop_tx.subscribe();
        let poll_interval = Duration::from_millis(crate::config::DEFAULT_POLL_INTERVAL_MS);
        let this = self.clone();
        watcher::start_clipboard_watcher(clipboard, suppressor, poll_interval, stop_rx, move |content| {
            let this = this.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_clipboard_change(content).await {
                    match e {
                        Error::IgnoredByFilter(detail) | Error::SizeLimitExceeded(detail) => {
                            info!(detail, "outbound send dropped");
                        }
                        e => this.events.on_error(classify_error(&e), &e.to_string()),
                    }
                }
            });
        })
    }

    fn spawn_listener(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stop_rx = self.stop_tx.subscribe();
            loop {
                let Ok(pairing) = self.pairing() else { break };
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    accepted = self.listener.accept(&self.device_id, &pairing) => {
                        match accepted {
                            Ok(conn) => {
                                if self.has_active_connection().await {
                                    warn!("rejecting second inbound connection while already connected");
                                    conn.close();
                                    self.events.on_error(ErrorKind::Auth, "rejected concurrent connection");
                                    continue;
                                }
                                let this = self.clone();
                                tokio::spawn(async move { this.run_connection(conn).await; });
                            }
                            Err(e) => warn!(error = %e, "listener accept failed"),
                        }
                    }
                }
            }
        })
    }

    fn spawn_connector(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Backoff::new();
            let mut stop_rx = self.stop_tx.subscribe();
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                if self.has_active_connection().await {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    }
                    continue;
                }
                let addr = *self.best_addr.lock().await;
                let Some(addr) = addr else {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                };
                let Ok(pairing) = self.pairing() else { break };
                self.set_state(AgentState::Connecting).await;
                match self.transport.connect(addr, &self.device_id, &pairing).await {
                    Ok(conn) => {
                        backoff.reset();
                        self.run_connection(conn).await;
                    }
                    Err(e) => {
                        self.events.on_error(classify_error(&e), &e.to_string());
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = stop_rx.changed() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        })
    }

    fn spawn_discovery(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stop_rx = self.stop_tx.subscribe();
            let _ = self.discovery.announce(&self.device_id, 9876).await;
            loop {
                let peers: Vec<PeerInfo> = self.discovery.discover(DEFAULT_DISCOVERY_TIMEOUT).await;
                if let Ok(Some(pairing)) = self.pairing_store.load() {
                    if let Some(peer) = peers.into_iter().find(|p| p.device_id == pairing.peer_device_id) {
                        *self.best_addr.lock().await = Some(peer.address);
                    }
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(DISCOVERY_INTERVAL) => {}
                }
            }
        })
    }

    fn spawn_sweep(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stop_rx = self.stop_tx.subscribe();
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
                self.registry.sweep_expired().await;
            }
        })
    }

    // --- Connection handler -------------------------------------------

    #[instrument(skip(self, conn))]
    async fn run_connection(&self, conn: Arc<dyn Connection>) {
        *self.active_conn.lock().await = Some(conn.clone());
        self.set_state(AgentState::Connected).await;
        info!("connection established");

        let heartbeat_conn = conn.clone();
        let mut hb_stop = self.stop_tx.subscribe();
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = hb_stop.changed() => break,
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                        if heartbeat_conn.send(&Message::Heartbeat, b"").await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let result = loop {
            match tokio::time::timeout(HEARTBEAT_TIMEOUT, conn.recv()).await {
                Ok(Ok((msg, payload))) => {
                    if let Err(e) = self.handle_message(&conn, msg, payload).await {
                        warn!(error = %e, "error handling inbound message");
                    }
                }
                Ok(Err(e)) => break Err(e),
                Err(_elapsed) => break Err(Error::ConnectionLost),
            }
        };

        heartbeat.abort();
        conn.close();
        *self.active_conn.lock().await = None;
        self.conn_state.lock().await.writers.clear();
        self.registry.fail_all_in_flight().await;
        self.set_state(AgentState::Degraded).await;
        if let Err(e) = result {
            info!(error = %e, "connection ended");
            self.events.on_error(classify_error(&e), &e.to_string());
        }
    }

    // --- Outbound dispatch ---------------------------------------------

    async fn handle_clipboard_change(&self, content: ClipboardContent) -> Result<()> {
        match content {
            ClipboardContent::Empty => Ok(()),
            ClipboardContent::Text(text) => {
                if !self.config.sync_text {
                    return Ok(());
                }
                self.send(&Message::Text { content: text }, b"").await
            }
            ClipboardContent::Image { mime, width, height, bytes } => {
                if !self.config.sync_images {
                    return Ok(());
                }
                match image_norm::normalize_to_png(&bytes, &mime) {
                    Normalized::Png { width, height, bytes } => {
                        self.send(&Message::Image { width, height, format: "png".into() }, &bytes).await
                    }
                    Normalized::Original { format, bytes } => self.send(&Message::Image { width, height, format }, &bytes).await,
                }
            }
            ClipboardContent::Files(paths) => self.handle_outbound_files(paths).await,
        }
    }

    async fn handle_outbound_files(&self, paths: Vec<PathBuf>) -> Result<()> {
        if !self.config.sync_files {
            return Ok(());
        }

        let named: Vec<(PathBuf, String)> = paths
            .into_iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()).map(|n| (p, n)))
            .collect();
        let names: Vec<&str> = named.iter().map(|(_, n)| n.as_str()).collect();
        let kept: std::collections::HashSet<&str> = self.ignore.filter(names).into_iter().collect();
        let selected: Vec<PathBuf> = named.into_iter().filter(|(_, n)| kept.contains(n.as_str())).map(|(p, _)| p).collect();
        if selected.is_empty() {
            return Err(Error::IgnoredByFilter("all files matched an ignore pattern".into()));
        }

        let mut total: u64 = 0;
        for path in &selected {
            let len = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
            if len > self.config.max_file_size {
                return Err(Error::SizeLimitExceeded(format!("{} exceeds max_file_size", path.display())));
            }
            total += len;
        }
        if total > self.config.max_total_size {
            return Err(Error::SizeLimitExceeded("total size exceeds max_total_size".into()));
        }

        if total >= self.config.lazy_threshold {
            self.announce_large_files(selected).await
        } else {
            self.send_inline_files(selected).await
        }
    }

    async fn announce_large_files(&self, paths: Vec<PathBuf>) -> Result<()> {
        let mut files = Vec::with_capacity(paths.len());
        for path in &paths {
            files.push(file_metadata_streamed(path, self.config.chunk_size as usize).await?);
        }
        let record = TransferRecord::new_announced(files.clone(), paths);
        let transfer_id = record.transfer_id.clone();

        let previous = self.current_outbound.lock().await.replace(transfer_id.clone());
        if let Some(previous_id) = previous {
            if previous_id != transfer_id {
                self.registry.mark(&previous_id, false, TransferStatus::Canceled).await;
                self.registry.remove_announced(&previous_id).await;
                let _ = self.send(&Message::TransferCancel { transfer_id: previous_id }, b"").await;
            }
        }

        self.registry.register_announced(record).await;
        self.send(&Message::FileAnnounce { transfer_id, files }, b"").await
    }

    async fn send_inline_files(&self, paths: Vec<PathBuf>) -> Result<()> {
        let mut files = Vec::with_capacity(paths.len());
        let mut payload = Vec::new();
        for path in &paths {
            let bytes = tokio::fs::read(path).await?;
            let checksum = hex::encode(Sha256::digest(&bytes));
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            files.push(FileMetadata { name, size: bytes.len() as u64, checksum, mime_hint: None });
            payload.extend_from_slice(&bytes);
        }
        self.send(&Message::FilesInline { files, layout: "concat".into() }, &payload).await
    }

    // --- Inbound dispatch -----------------------------------------------

    async fn handle_message(&self, conn: &Arc<dyn Connection>, msg: Message, payload: Vec<u8>) -> Result<()> {
        match msg {
            Message::Heartbeat => Ok(()),
            Message::Text { content } => self.install_text(content).await,
            Message::Image { width, height, format } => self.install_image(format, width, height, payload).await,
            Message::FilesInline { files, .. } => self.install_inline_files(files, payload).await,
            Message::FileAnnounce { transfer_id, files } => self.handle_file_announce(transfer_id, files).await,
            Message::FileRequest { transfer_id } => self.handle_file_request(conn, transfer_id).await,
            Message::FileChunk { transfer_id, file_index, offset, length, chunk_checksum } => {
                self.handle_file_chunk(transfer_id, file_index, offset, length, chunk_checksum, payload).await
            }
            Message::FileComplete { transfer_id } => self.handle_file_complete(transfer_id).await,
            Message::TransferCancel { transfer_id } => self.handle_transfer_cancel(transfer_id).await,
            Message::TransferError { transfer_id, code, detail } => self.handle_transfer_error(transfer_id, code, detail).await,
            Message::HandshakeHello { .. } | Message::HandshakeChallenge { .. } | Message::HandshakeResponse { .. } | Message::HandshakeOk => {
                Err(Error::ProtocolError("handshake message received after handshake completed".into()))
            }
        }
    }

    async fn install_text(&self, content: String) -> Result<()> {
        retry_clipboard_write(|| self.clipboard.write_text(&content).map_err(|e| Error::ClipboardUnavailable(e.to_string()))).await?;
        self.note_echo(ClipboardContent::Text(content)).await;
        Ok(())
    }

    async fn install_image(&self, format: String, width: u32, height: u32, bytes: Vec<u8>) -> Result<()> {
        let mime = format!("image/{format}");
        retry_clipboard_write(|| {
            self.clipboard.write_image(&mime, width, height, &bytes).map_err(|e| Error::ClipboardUnavailable(e.to_string()))
        })
        .await?;
        self.note_echo(ClipboardContent::Image { mime, width, height, bytes }).await;
        Ok(())
    }

    async fn install_inline_files(&self, files: Vec<FileMetadata>, payload: Vec<u8>) -> Result<()> {
        let mut cursor = 0usize;
        let mut paths = Vec::with_capacity(files.len());
        tokio::fs::create_dir_all(&self.download_dir).await?;
        for file in &files {
            let end = cursor + file.size as usize;
            let bytes = payload
                .get(cursor..end)
                .ok_or_else(|| Error::ProtocolError("inline payload shorter than declared sizes".into()))?;
            let dest = unique_path(&self.download_dir, &file.name).await;
            tokio::fs::write(&dest, bytes).await?;
            paths.push(dest);
            cursor = end;
        }
        retry_clipboard_write(|| self.clipboard.write_files(&paths).map_err(|e| Error::ClipboardUnavailable(e.to_string()))).await?;
        self.note_echo(ClipboardContent::Files(paths)).await;
        Ok(())
    }

    async fn note_echo(&self, installed: ClipboardContent) {
        if let Some(snapshot) = watcher::snapshot_of(&installed) {
            self.suppressor.lock().await.note_remote_write(snapshot.content_hash);
        }
    }

    async fn handle_file_announce(&self, transfer_id: String, files: Vec<FileMetadata>) -> Result<()> {
        let record = TransferRecord::new_pending(transfer_id.clone(), files.clone());
        self.registry.register_pending(record).await;
        self.events.on_announced(&transfer_id, &files);
        // Eager policy (spec.md §9 Open Question): request immediately since
        // this crate's `ClipboardAdapter` has no way to defer until pasted.
        self.send(&Message::FileRequest { transfer_id }, b"").await
    }

    async fn handle_file_request(&self, conn: &Arc<dyn Connection>, transfer_id: String) -> Result<()> {
        let record = match self.registry.lookup_for_request(&transfer_id).await {
            Ok(r) => r,
            Err(e @ Error::ExpiredOrUnknownTransfer(_)) => {
                return conn
                    .send(
                        &Message::TransferError { transfer_id: Some(transfer_id), code: "EXPIRED_OR_UNKNOWN".into(), detail: e.to_string() },
                        b"",
                    )
                    .await;
            }
            Err(e) => return Err(e),
        };

        self.registry.mark(&transfer_id, false, TransferStatus::Transferring).await;
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.conn_state.lock().await.cancel_flags.insert(transfer_id.clone(), cancel_flag.clone());

        let this = self.self_weak.upgrade().ok_or_else(|| Error::InternalError("agent already shut down".into()))?;
        let conn = conn.clone();
        tokio::spawn(async move {
            if let Err(e) = this.stream_transfer(&conn, &record, cancel_flag).await {
                warn!(error = %e, transfer_id = %record.transfer_id, "outbound transfer failed");
                this.events.on_error(classify_error(&e), &e.to_string());
                this.registry.mark(&record.transfer_id, false, TransferStatus::Failed).await;
            }
        });
        Ok(())
    }

    async fn stream_transfer(&self, conn: &Arc<dyn Connection>, record: &TransferRecord, cancel_flag: Arc<AtomicBool>) -> Result<()> {
        let chunk_size = self.config.chunk_size as usize;
        let mut bytes_done = 0u64;
        for (index, path) in record.source_paths.iter().enumerate() {
            let mut reader = ChunkedReader::open(path, chunk_size).await?;
            while let Some(chunk) = reader.next_chunk().await? {
                if cancel_flag.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let length = chunk.bytes.len() as u32;
                conn.send(
                    &Message::FileChunk {
                        transfer_id: record.transfer_id.clone(),
                        file_index: index as u32,
                        offset: chunk.offset,
                        length,
                        chunk_checksum: chunk.chunk_checksum,
                    },
                    &chunk.bytes,
                )
                .await?;
                bytes_done += length as u64;
                self.registry.update_progress(&record.transfer_id, false, bytes_done).await;
            }
        }
        conn.send(&Message::FileComplete { transfer_id: record.transfer_id.clone() }, b"").await?;
        self.registry.mark(&record.transfer_id, false, TransferStatus::Complete).await;
        self.registry.remove_announced(&record.transfer_id).await;
        let mut current = self.current_outbound.lock().await;
        if current.as_deref() == Some(record.transfer_id.as_str()) {
            *current = None;
        }
        Ok(())
    }

    async fn handle_file_chunk(
        &self,
        transfer_id: String,
        file_index: u32,
        offset: u64,
        _length: u32,
        chunk_checksum: String,
        payload: Vec<u8>,
    ) -> Result<()> {
        let Some(record) = self.registry.get_pending(&transfer_id).await else {
            return Err(Error::ExpiredOrUnknownTransfer(transfer_id));
        };
        let Some(meta) = record.files.get(file_index as usize) else {
            return Err(Error::ProtocolError("file_index out of range".into()));
        };

        let mut state = self.conn_state.lock().await;
        let key = (transfer_id.clone(), file_index);
        if !state.writers.contains_key(&key) {
            tokio::fs::create_dir_all(&self.download_dir).await?;
            let dest = self.download_dir.join(&meta.name);
            let writer = ChunkedWriter::create(&dest, &format!("{transfer_id}-{file_index}")).await?;
            state.writers.insert(key.clone(), writer);
        }
        let writer = state.writers.get_mut(&key).unwrap();
        if let Err(e) = writer.write_chunk(offset, &payload, &chunk_checksum).await {
            state.writers.remove(&key);
            drop(state);
            self.events.on_error(ErrorKind::ChecksumMismatch, &e.to_string());
            self.registry.mark(&transfer_id, true, TransferStatus::Failed).await;
            self.registry.remove_pending(&transfer_id).await;
            return Err(e);
        }

        let entry = state.progress.entry(transfer_id.clone()).or_insert(0);
        *entry += payload.len() as u64;
        let bytes_done = *entry;
        let speed = state.speed.entry(transfer_id.clone()).or_default().sample(bytes_done);
        drop(state);

        self.registry.update_progress(&transfer_id, true, bytes_done).await;
        let eta = SpeedEstimator::eta_seconds(record.bytes_total, bytes_done, speed);
        self.events.on_progress(&transfer_id, bytes_done, record.bytes_total, speed, eta);
        Ok(())
    }

    async fn handle_file_complete(&self, transfer_id: String) -> Result<()> {
        let Some(record) = self.registry.get_pending(&transfer_id).await else {
            return Err(Error::ExpiredOrUnknownTransfer(transfer_id));
        };

        let mut finalized = Vec::with_capacity(record.files.len());
        let mut state = self.conn_state.lock().await;
        for (index, meta) in record.files.iter().enumerate() {
            let key = (transfer_id.clone(), index as u32);
            let Some(writer) = state.writers.remove(&key) else {
                return Err(Error::ProtocolError(format!("FILE_COMPLETE with no chunks for file {index}")));
            };
            drop(state);
            let path = writer.finalize(&meta.checksum).await?;
            finalized.push(path);
            state = self.conn_state.lock().await;
        }
        state.progress.remove(&transfer_id);
        state.speed.remove(&transfer_id);
        drop(state);

        self.clipboard.write_files(&finalized).map_err(|e| Error::ClipboardUnavailable(e.to_string()))?;
        self.note_echo(ClipboardContent::Files(finalized.clone())).await;
        self.events.on_complete(&transfer_id, &finalized);
        self.registry.mark(&transfer_id, true, TransferStatus::Complete).await;
        self.registry.remove_pending(&transfer_id).await;
        Ok(())
    }

    async fn handle_transfer_cancel(&self, transfer_id: String) -> Result<()> {
        let mut state = self.conn_state.lock().await;
        if let Some(flag) = state.cancel_flags.remove(&transfer_id) {
            flag.store(true, Ordering::SeqCst);
        }
        let keys: Vec<(String, u32)> = state.writers.keys().filter(|(id, _)| id == &transfer_id).cloned().collect();
        for key in keys {
            if let Some(writer) = state.writers.remove(&key) {
                writer.abort().await;
            }
        }
        drop(state);
        self.registry.remove_pending(&transfer_id).await;
        self.registry.remove_announced(&transfer_id).await;
        Ok(())
    }

    async fn handle_transfer_error(&self, transfer_id: Option<String>, code: String, detail: String) -> Result<()> {
        self.events.on_error(ErrorKind::ExpiredOrUnknownTransfer, &format!("{code}: {detail}"));
        if let Some(id) = transfer_id {
            self.registry.remove_pending(&id).await;
        }
        Ok(())
    }
}

async fn file_metadata_streamed(path: &PathBuf, chunk_size: usize) -> Result<FileMetadata> {
    let mut reader = ChunkedReader::open(path, chunk_size).await?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    while let Some(chunk) = reader.next_chunk().await? {
        hasher.update(&chunk.bytes);
        size += chunk.bytes.len() as u64;
    }
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    Ok(FileMetadata { name, size, checksum: hex::encode(hasher.finalize()), mime_hint: None })
}

async fn unique_path(dir: &std::path::Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if tokio::fs::metadata(&candidate).await.is_err() {
        return candidate;
    }
    let path = std::path::Path::new(name);
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    for n in 2.. {
        let candidate_name = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(candidate_name);
        if tokio::fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
    }
    unreachable!("collision loop is unbounded")
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
