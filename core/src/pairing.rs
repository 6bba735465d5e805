//! Pairing store persistence and the PIN-authenticated key exchange that
//! produces a [`PairingRecord`] (component B).

use crate::crypto;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Identity of the paired peer. Exactly one exists when paired; its absence
/// means "unpaired".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingRecord {
    pub device_id: String,
    pub peer_device_id: String,
    pub peer_name: String,
    #[serde(with = "secret_b64")]
    pub shared_secret: [u8; 32],
    pub created_at: DateTime<Utc>,
}

mod secret_b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("shared_secret must be 32 bytes"))
    }
}

/// Persistent storage for the single `PairingRecord`. Writes are serialized
/// through the store's own locking; there is at most one record.
pub trait PairingStore: Send + Sync {
    fn load(&self) -> Result<Option<PairingRecord>>;
    fn save(&self, record: &PairingRecord) -> Result<()>;
    fn clear(&self) -> Result<()>;

    fn is_paired(&self) -> Result<bool> {
        Ok(self.load()?.is_some())
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryPairingStore {
    record: Mutex<Option<PairingRecord>>,
}

impl MemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PairingStore for MemoryPairingStore {
    fn load(&self) -> Result<Option<PairingRecord>> {
        Ok(self.record.lock().unwrap().clone())
    }

    fn save(&self, record: &PairingRecord) -> Result<()> {
        *self.record.lock().unwrap() = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.record.lock().unwrap() = None;
        Ok(())
    }
}

/// File-backed store at `~/.yank/pairing.json`, mode 0600, guarded by an
/// advisory file lock so the CLI (read-only consumer) and the running agent
/// never race on a write.
pub struct FilePairingStore {
    path: PathBuf,
}

impl FilePairingStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn with_lock<T>(&self, f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = self.path.with_extension("lock");
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = lock.write().map_err(Error::Io)?;
        f(&self.path)
    }
}

impl PairingStore for FilePairingStore {
    fn load(&self) -> Result<Option<PairingRecord>> {
        self.with_lock(|path| {
            if !path.exists() {
                return Ok(None);
            }
            let data = std::fs::read_to_string(path)?;
            Ok(Some(serde_json::from_str(&data)?))
        })
    }

    fn save(&self, record: &PairingRecord) -> Result<()> {
        self.with_lock(|path| {
            let data = serde_json::to_string_pretty(record)?;
            std::fs::write(path, &data)?;
            set_owner_only_permissions(path)?;
            Ok(())
        })
    }

    fn clear(&self) -> Result<()> {
        self.with_lock(|path| {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            Ok(())
        })
    }
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Default location of the pairing file: `~/.yank/pairing.json`.
pub fn default_pairing_path() -> PathBuf {
    crate::config::yank_home().join("pairing.json")
}

// --- PIN-authenticated key exchange -----------------------------------

/// Messages of the pairing exchange, sent over a plain (pre-shared-secret)
/// TCP stream as length-prefixed JSON.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "step")]
enum PairWire {
    Hello { device_id: String, random: String },
    Confirm { mac: String },
    Result { ok: bool, peer_name: Option<String>, reason: Option<String> },
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &PairWire) -> Result<()> {
    let body = serde_json::to_vec(msg)?;
    w.write_u32(body.len() as u32).await?;
    w.write_all(&body).await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<PairWire> {
    let len = r.read_u32().await? as usize;
    if len > 4096 {
        return Err(Error::ProtocolError("pairing frame too large".into()));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

fn encode_random(bytes: &[u8; 32]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_random(s: &str) -> Result<[u8; 32]> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| Error::ProtocolError(format!("bad pairing random: {e}")))?;
    bytes.try_into().map_err(|_| Error::ProtocolError("pairing random must be 32 bytes".into()))
}

/// Runs the host (`pair`) side of the exchange: accept one joiner,
/// authenticate it with `pin`, and return the resulting record.
pub async fn run_pairing_host<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    my_device_id: &str,
    pin: &str,
) -> Result<PairingRecord> {
    let PairWire::Hello { device_id: peer_device_id, random: random_a_s } = read_frame(stream).await? else {
        return Err(Error::ProtocolError("expected pairing Hello".into()));
    };
    let random_a = decode_random(&random_a_s)?;
    let random_b = crypto::random_bytes::<32>();
    write_frame(stream, &PairWire::Hello { device_id: my_device_id.to_string(), random: encode_random(&random_b) }).await?;

    let PairWire::Confirm { mac: mac_s } = read_frame(stream).await? else {
        return Err(Error::ProtocolError("expected pairing Confirm".into()));
    };
    let mac = base64_decode(&mac_s)?;
    let candidate = crypto::derive_shared_secret(pin, &random_a, &random_b);
    let expected = crypto::challenge_mac(&candidate, b"yank/pair/confirm", &random_a, &random_b);
    if mac != expected {
        write_frame(stream, &PairWire::Result { ok: false, peer_name: None, reason: Some("pin mismatch".into()) }).await?;
        return Err(Error::AuthError("pairing PIN mismatch".into()));
    }

    write_frame(stream, &PairWire::Result { ok: true, peer_name: Some(my_device_id.to_string()), reason: None }).await?;

    Ok(PairingRecord {
        device_id: my_device_id.to_string(),
        peer_device_id,
        peer_name: String::new(),
        shared_secret: candidate,
        created_at: Utc::now(),
    })
}

/// Runs the joiner (`join`) side of the exchange.
pub async fn run_pairing_joiner<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    my_device_id: &str,
    pin: &str,
) -> Result<PairingRecord> {
    let random_a = crypto::random_bytes::<32>();
    write_frame(stream, &PairWire::Hello { device_id: my_device_id.to_string(), random: encode_random(&random_a) }).await?;

    let PairWire::Hello { device_id: peer_device_id, random: random_b_s } = read_frame(stream).await? else {
        return Err(Error::ProtocolError("expected pairing Hello".into()));
    };
    let random_b = decode_random(&random_b_s)?;
    let candidate = crypto::derive_shared_secret(pin, &random_a, &random_b);
    let mac = crypto::challenge_mac(&candidate, b"yank/pair/confirm", &random_a, &random_b);
    write_frame(stream, &PairWire::Confirm { mac: base64_encode(&mac) }).await?;

    let PairWire::Result { ok, peer_name, reason } = read_frame(stream).await? else {
        return Err(Error::ProtocolError("expected pairing Result".into()));
    };
    if !ok {
        return Err(Error::AuthError(reason.unwrap_or_else(|| "pairing rejected".into())));
    }

    Ok(PairingRecord {
        device_id: my_device_id.to_string(),
        peer_device_id,
        peer_name: peer_name.unwrap_or_default(),
        shared_secret: candidate,
        created_at: Utc::now(),
    })
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| Error::ProtocolError(format!("bad base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pairing_with_matching_pin_succeeds_both_sides() {
        let (mut host_stream, mut joiner_stream) = duplex(4096);
        let host = tokio::spawn(async move { run_pairing_host(&mut host_stream, "host-1", "123456").await });
        let joiner = run_pairing_joiner(&mut joiner_stream, "joiner-1", "123456").await.unwrap();
        let host = host.await.unwrap().unwrap();
        assert_eq!(host.shared_secret, joiner.shared_secret);
        assert_eq!(host.peer_device_id, "joiner-1");
        assert_eq!(joiner.peer_device_id, "host-1");
    }

    #[tokio::test]
    async fn pairing_with_wrong_pin_fails_both_sides() {
        let (mut host_stream, mut joiner_stream) = duplex(4096);
        let host = tokio::spawn(async move { run_pairing_host(&mut host_stream, "host-1", "123456").await });
        let joiner = run_pairing_joiner(&mut joiner_stream, "joiner-1", "000000").await;
        assert!(joiner.is_err());
        assert!(host.await.unwrap().is_err());
    }

    #[test]
    fn memory_store_is_unpaired_until_saved() {
        let store = MemoryPairingStore::new();
        assert!(!store.is_paired().unwrap());
        store
            .save(&PairingRecord {
                device_id: "a".into(),
                peer_device_id: "b".into(),
                peer_name: "Bob".into(),
                shared_secret: [0u8; 32],
                created_at: Utc::now(),
            })
            .unwrap();
        assert!(store.is_paired().unwrap());
        store.clear().unwrap();
        assert!(!store.is_paired().unwrap());
    }

    #[test]
    fn file_store_persists_with_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairing.json");
        let store = FilePairingStore::new(path.clone());
        store
            .save(&PairingRecord {
                device_id: "a".into(),
                peer_device_id: "b".into(),
                peer_name: "Bob".into(),
                shared_secret: [7u8; 32],
                created_at: Utc::now(),
            })
            .unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.shared_secret, [7u8; 32]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
