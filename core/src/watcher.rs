//! Clipboard watcher (component F): polls a `ClipboardAdapter`, classifies
//! changes, and suppresses echoes of content this process just wrote back
//! from a remote peer.

use crate::clipboard::{ClipboardAdapter, ClipboardContent};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// A snapshot taken at one poll tick, reduced to a content-addressed hash so
/// the watcher never needs to keep large payloads around to detect "same as
/// last time" or "this is an echo of what we just wrote".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardSnapshot {
    pub kind: SnapshotKind,
    pub content_hash: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Text,
    Image,
    Files,
}

/// Reduces a `ClipboardContent` to its `ClipboardSnapshot`, or `None` for
/// `Empty`. Shared with `agent.rs` so an inbound remote write can be noted in
/// the echo suppressor under exactly the hash the watcher will see on its
/// next poll.
pub fn snapshot_of(content: &ClipboardContent) -> Option<ClipboardSnapshot> {
    match content {
        ClipboardContent::Empty => None,
        ClipboardContent::Text(text) => Some(ClipboardSnapshot { kind: SnapshotKind::Text, content_hash: Sha256::digest(text.as_bytes()).into() }),
        ClipboardContent::Image { bytes, .. } => Some(ClipboardSnapshot { kind: SnapshotKind::Image, content_hash: Sha256::digest(bytes).into() }),
        ClipboardContent::Files(paths) => {
            let joined = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect::<Vec<_>>().join("\0");
            Some(ClipboardSnapshot { kind: SnapshotKind::Files, content_hash: Sha256::digest(joined.as_bytes()).into() })
        }
    }
}

/// Remembers hashes this process wrote to the clipboard on a remote peer's
/// behalf, for a bounded retention window, so the watcher's own poll doesn't
/// re-announce content it just received.
#[derive(Debug, Default)]
pub struct EchoSuppressor {
    retention: Duration,
    recent: VecDeque<(std::time::Instant, [u8; 32])>,
}

impl EchoSuppressor {
    pub fn new(retention: Duration) -> Self {
        Self { retention, recent: VecDeque::new() }
    }

    pub fn note_remote_write(&mut self, hash: [u8; 32]) {
        self.prune();
        self.recent.push_back((std::time::Instant::now(), hash));
    }

    pub fn should_ignore(&mut self, hash: &[u8; 32]) -> bool {
        self.prune();
        self.recent.iter().any(|(_, h)| h == hash)
    }

    fn prune(&mut self) {
        let cutoff = std::time::Instant::now();
        while let Some((seen_at, _)) = self.recent.front() {
            if cutoff.duration_since(*seen_at) > self.retention {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

pub const DEFAULT_ECHO_RETENTION: Duration = Duration::from_secs(3);

/// Spawns the polling loop. `on_change` fires for every non-echoed,
/// non-duplicate clipboard change; callers classify `ClipboardContent`
/// further (lazy vs. inline files, image normalization) at the agent layer.
pub fn start_clipboard_watcher<F>(
    adapter: Arc<dyn ClipboardAdapter>,
    suppressor: Arc<Mutex<EchoSuppressor>>,
    poll_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
    on_change: F,
) -> JoinHandle<()>
where
    F: Fn(ClipboardContent) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut last: Option<ClipboardSnapshot> = None;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }

            let current = match adapter.read() {
                Ok(c) => c,
                Err(_) => continue,
            };

            let Some(snapshot) = snapshot_of(&current) else { continue };
            if last.as_ref() == Some(&snapshot) {
                continue;
            }

            if suppressor.lock().await.should_ignore(&snapshot.content_hash) {
                last = Some(snapshot);
                continue;
            }

            last = Some(snapshot);
            on_change(current);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MockClipboard;

    #[tokio::test]
    async fn watcher_detects_text_change() {
        let clip = Arc::new(MockClipboard::new());
        let suppressor = Arc::new(Mutex::new(EchoSuppressor::new(DEFAULT_ECHO_RETENTION)));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = start_clipboard_watcher(clip.clone(), suppressor, Duration::from_millis(20), stop_rx, move |c| {
            let _ = tx.send(c);
        });

        clip.simulate_copy(ClipboardContent::Text("hello".into()));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, ClipboardContent::Text("hello".into()));

        let _ = stop_tx.send(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn watcher_suppresses_noted_echo() {
        let clip = Arc::new(MockClipboard::new());
        let suppressor = Arc::new(Mutex::new(EchoSuppressor::new(DEFAULT_ECHO_RETENTION)));
        let hash: [u8; 32] = Sha256::digest(b"remote-text").into();
        suppressor.lock().await.note_remote_write(hash);

        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ClipboardContent>();
        let _handle = start_clipboard_watcher(clip.clone(), suppressor, Duration::from_millis(20), stop_rx, move |c| {
            let _ = tx.send(c);
        });

        clip.simulate_copy(ClipboardContent::Text("remote-text".into()));
        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "echoed content should have been suppressed");

        let _ = stop_tx.send(true);
    }

    #[test]
    fn echo_suppressor_expires_after_retention() {
        let mut s = EchoSuppressor::new(Duration::from_millis(1));
        let hash = [7u8; 32];
        s.note_remote_write(hash);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!s.should_ignore(&hash));
    }
}
