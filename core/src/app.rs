//! `App`: the single owning root constructed at startup (spec.md §9's
//! "global mutable state" redesign note). Holds the pairing store, user
//! config, and the running agent handle, if any — no process singletons, no
//! hidden globals. The CLI layer is a thin wrapper over these methods.

use crate::agent::Agent;
use crate::clipboard::ClipboardAdapter;
use crate::config::{self, Config};
use crate::crypto;
use crate::discovery::{Discovery, MdnsDiscovery};
use crate::error::{Error, Result};
use crate::ignore::IgnoreFilter;
use crate::pairing::{self, FilePairingStore, PairingRecord, PairingStore};
use crate::status::{AgentEvents, AgentState};
use crate::transfer::TransferRecord;
use crate::transport::{TcpListener, TcpTransport};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener as RawTcpListener, TcpStream};
use tokio::sync::Mutex;

/// The service's well-known TCP port, per spec.md §6.
pub const DEFAULT_PORT: u16 = 9876;
/// How long `pair` waits for a joiner before giving up.
pub const DEFAULT_PAIR_TIMEOUT: Duration = Duration::from_secs(120);
/// How long `join` waits for the host to complete the exchange. A wrong PIN
/// must fail within this window per spec.md §8 scenario 4.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time view of pairing/connection state for the `status` CLI verb.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub paired: bool,
    pub peer_device_id: Option<String>,
    pub peer_name: Option<String>,
    pub agent_state: Option<AgentState>,
    pub active_transfers: Vec<TransferRecord>,
}

pub struct App<Cb: ClipboardAdapter + 'static> {
    device_id: String,
    pairing_store: Arc<dyn PairingStore>,
    config: Mutex<Config>,
    config_path: PathBuf,
    ignore_path: PathBuf,
    clipboard: Arc<Cb>,
    events: Arc<dyn AgentEvents>,
    agent: Mutex<Option<Arc<Agent<Cb>>>>,
}

impl<Cb: ClipboardAdapter + 'static> App<Cb> {
    /// Builds the app against the real `~/.yank` paths (or `$YANK_HOME` when
    /// set, per `config::home_dir`).
    pub fn new(clipboard: Arc<Cb>, events: Arc<dyn AgentEvents>) -> Result<Self> {
        let home = config::yank_home();
        std::fs::create_dir_all(&home)?;
        let device_id = load_or_create_device_id(&home.join("device_id"))?;
        let pairing_store: Arc<dyn PairingStore> = Arc::new(FilePairingStore::new(pairing::default_pairing_path()));
        let config_path = config::default_config_path();
        let config = Config::load_or_default(&config_path)?;
        Ok(Self {
            device_id,
            pairing_store,
            config: Mutex::new(config),
            config_path,
            ignore_path: config::default_ignore_path(),
            clipboard,
            events,
            agent: Mutex::new(None),
        })
    }

    /// Builds the app from already-constructed collaborators, for tests and
    /// embedders that don't want to touch the real filesystem paths.
    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        device_id: String,
        pairing_store: Arc<dyn PairingStore>,
        config: Config,
        config_path: PathBuf,
        ignore_path: PathBuf,
        clipboard: Arc<Cb>,
        events: Arc<dyn AgentEvents>,
    ) -> Self {
        Self { device_id, pairing_store, config: Mutex::new(config), config_path, ignore_path, clipboard, events, agent: Mutex::new(None) }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_paired(&self) -> Result<bool> {
        self.pairing_store.is_paired()
    }

    // --- Pairing -------------------------------------------------------

    /// Runs the `pair` (host) side: binds `bind_addr`, generates a PIN,
    /// invokes `on_ready(pin, local_addr)` once listening, then waits up to
    /// `timeout` for one joiner. Persists the resulting record on success;
    /// writes nothing on failure or timeout.
    pub async fn pair(&self, bind_addr: SocketAddr, timeout: Duration, on_ready: impl FnOnce(&str, SocketAddr)) -> Result<PairingRecord> {
        let listener = RawTcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let pin = crypto::generate_pin();
        on_ready(&pin, local_addr);

        let accept_and_pair = async {
            let (mut stream, _peer_addr) = listener.accept().await?;
            pairing::run_pairing_host(&mut stream, &self.device_id, &pin).await
        };
        let record = tokio::time::timeout(timeout, accept_and_pair)
            .await
            .map_err(|_| Error::AuthError("pairing timed out waiting for a joiner".into()))??;

        self.pairing_store.save(&record)?;
        Ok(record)
    }

    /// Runs the `join` side: connects to `addr` and runs the PIN-authenticated
    /// exchange. Per spec.md §8 scenario 4, a wrong PIN must fail (and leave
    /// no pairing file) within `DEFAULT_JOIN_TIMEOUT`.
    pub async fn join(&self, addr: SocketAddr, pin: &str) -> Result<PairingRecord> {
        let connect_and_pair = async {
            let mut stream = TcpStream::connect(addr).await?;
            pairing::run_pairing_joiner(&mut stream, &self.device_id, pin).await
        };
        let record = tokio::time::timeout(DEFAULT_JOIN_TIMEOUT, connect_and_pair)
            .await
            .map_err(|_| Error::AuthError("pairing timed out".into()))??;

        self.pairing_store.save(&record)?;
        Ok(record)
    }

    /// Erases the pairing record. Idempotent: unpairing an already-unpaired
    /// device is not an error.
    pub fn unpair(&self) -> Result<()> {
        self.pairing_store.clear()
    }

    // --- Status ----------------------------------------------------------

    pub async fn status(&self) -> Result<StatusSnapshot> {
        let pairing = self.pairing_store.load()?;
        let agent = self.agent.lock().await;
        let (agent_state, active_transfers) = match agent.as_ref() {
            Some(agent) => (Some(agent.current_state().await), agent.active_transfers().await),
            None => (None, Vec::new()),
        };
        Ok(StatusSnapshot {
            paired: pairing.is_some(),
            peer_device_id: pairing.as_ref().map(|p| p.peer_device_id.clone()),
            peer_name: pairing.as_ref().map(|p| p.peer_name.clone()),
            agent_state,
            active_transfers,
        })
    }

    // --- Agent lifecycle ---------------------------------------------------

    /// Starts the agent on `port`, optionally seeding `peer_override` as the
    /// fallback address discovery falls back to (spec.md §4.D). Returns
    /// `NotPaired` without touching the network if there is no pairing
    /// record yet.
    pub async fn start(&self, port: u16, peer_override: Option<SocketAddr>) -> Result<Arc<Agent<Cb>>> {
        if self.pairing_store.load()?.is_none() {
            return Err(Error::NotPaired);
        }
        if self.agent.lock().await.is_some() {
            return Err(Error::InternalError("agent already running".into()));
        }

        let config = self.config.lock().await.clone();
        let listener = TcpListener::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)).await?;
        let discovery: Arc<dyn Discovery> = Arc::new(MdnsDiscovery::new()?);
        let ignore = IgnoreFilter::load(&self.ignore_path);

        let agent = Agent::new(
            self.device_id.clone(),
            self.pairing_store.clone(),
            config,
            TcpTransport,
            listener,
            discovery,
            self.clipboard.clone(),
            self.events.clone(),
            ignore,
            default_download_dir(),
        );
        if let Some(addr) = peer_override {
            agent.set_fallback_peer(addr).await;
        }
        agent.clone().start().await?;
        *self.agent.lock().await = Some(agent.clone());
        Ok(agent)
    }

    /// Shuts the agent down, if one is running.
    pub async fn stop(&self) {
        if let Some(agent) = self.agent.lock().await.take() {
            agent.shutdown().await;
        }
    }

    pub async fn agent_handle(&self) -> Option<Arc<Agent<Cb>>> {
        self.agent.lock().await.clone()
    }

    // --- Config ------------------------------------------------------------

    pub async fn config(&self) -> Config {
        self.config.lock().await.clone()
    }

    pub async fn set_config_field(&self, key: &str, value: &str) -> Result<()> {
        let mut guard = self.config.lock().await;
        guard.set_field(key, value)?;
        guard.save(&self.config_path)?;
        Ok(())
    }

    pub async fn reset_config(&self) -> Result<()> {
        let mut guard = self.config.lock().await;
        *guard = Config::default();
        guard.save(&self.config_path)?;
        Ok(())
    }
}

/// Reads the persisted per-install device id, or generates and persists a
/// fresh one. Stable across `pair`/`join`/`start` invocations; distinct from
/// `PairingRecord::device_id`, which is only known once paired.
fn load_or_create_device_id(path: &std::path::Path) -> Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    let id = hex::encode(crypto::random_bytes::<8>());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &id)?;
    Ok(id)
}

/// Where received files land absent a clipboard-adapter-provided target:
/// `~/Downloads` if present, else the OS temp directory.
fn default_download_dir() -> PathBuf {
    let downloads = config::home_dir().join("Downloads");
    if downloads.is_dir() {
        downloads
    } else {
        std::env::temp_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MockClipboard;
    use crate::pairing::MemoryPairingStore;
    use crate::status::NoopEvents;

    fn test_app(dir: &std::path::Path) -> App<MockClipboard> {
        App::with_parts(
            "test-device".into(),
            Arc::new(MemoryPairingStore::new()),
            Config::default(),
            dir.join("config.json"),
            dir.join(".syncignore"),
            Arc::new(MockClipboard::new()),
            Arc::new(NoopEvents),
        )
    }

    #[tokio::test]
    async fn status_reports_unpaired_with_no_agent() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let status = app.status().await.unwrap();
        assert!(!status.paired);
        assert!(status.agent_state.is_none());
        assert!(status.active_transfers.is_empty());
    }

    #[tokio::test]
    async fn start_without_pairing_record_fails_not_paired() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let err = app.start(0, None).await.unwrap_err();
        assert!(matches!(err, Error::NotPaired));
    }

    #[tokio::test]
    async fn unpair_is_idempotent_when_already_unpaired() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        app.unpair().unwrap();
        app.unpair().unwrap();
        assert!(!app.is_paired().unwrap());
    }

    #[tokio::test]
    async fn set_config_field_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        app.set_config_field("chunk_size", "2048").await.unwrap();
        assert_eq!(app.config().await.chunk_size, 2048);
        let reloaded = Config::load_or_default(&dir.path().join("config.json")).unwrap();
        assert_eq!(reloaded.chunk_size, 2048);
    }

    #[tokio::test]
    async fn reset_config_restores_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        app.set_config_field("sync_text", "false").await.unwrap();
        app.reset_config().await.unwrap();
        assert!(app.config().await.sync_text);
    }

    #[tokio::test]
    async fn pair_then_join_over_loopback_agree_on_shared_secret() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let host = Arc::new(test_app(dir_a.path()));
        let joiner = test_app(dir_b.path());

        let host_for_task = host.clone();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let pair_task = tokio::spawn(async move {
            host_for_task
                .pair("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5), |pin, addr| {
                    let _ = ready_tx.send((pin.to_string(), addr));
                })
                .await
        });

        let (pin, addr) = ready_rx.await.unwrap();
        let joined = joiner.join(addr, &pin).await.unwrap();
        let hosted = pair_task.await.unwrap().unwrap();

        assert_eq!(hosted.shared_secret, joined.shared_secret);
        assert!(host.is_paired().unwrap());
        assert!(joiner.is_paired().unwrap());
    }

    #[tokio::test]
    async fn join_with_wrong_pin_fails_and_writes_nothing() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let host = Arc::new(test_app(dir_a.path()));
        let joiner = test_app(dir_b.path());

        let host_for_task = host.clone();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let pair_task = tokio::spawn(async move {
            host_for_task
                .pair("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5), |pin, addr| {
                    let _ = ready_tx.send((pin.to_string(), addr));
                })
                .await
        });

        let (_correct_pin, addr): (String, SocketAddr) = ready_rx.await.unwrap();
        let result = joiner.join(addr, "000000").await;
        assert!(result.is_err());
        assert!(pair_task.await.unwrap().is_err());
        assert!(!host.is_paired().unwrap());
        assert!(!joiner.is_paired().unwrap());
    }

    #[test]
    fn load_or_create_device_id_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device_id");
        let first = load_or_create_device_id(&path).unwrap();
        let second = load_or_create_device_id(&path).unwrap();
        assert_eq!(first, second);
    }
}
