//! Shared helpers for the `yank` binary: the platform clipboard adapter,
//! event sink wired to `tracing`, and small formatting helpers used by
//! `main.rs`'s subcommands.

pub mod clipboard;

use yank_core::status::{AgentEvents, AgentState, ErrorKind};
use yank_core::transfer::TransferRecord;
use yank_core::Error;

/// `AgentEvents` that logs every callback at an appropriate level instead of
/// capturing them for assertions.
#[derive(Default)]
pub struct TracingEvents;

impl AgentEvents for TracingEvents {
    fn on_state(&self, state: AgentState) {
        tracing::info!(state = %display_state(state), "agent state changed");
    }

    fn on_announced(&self, transfer_id: &str, files: &[yank_core::transfer::FileMetadata]) {
        tracing::info!(transfer_id, file_count = files.len(), "incoming transfer announced");
    }

    fn on_progress(&self, transfer_id: &str, bytes_done: u64, bytes_total: u64, speed_bps: f64, eta_s: f64) {
        tracing::debug!(transfer_id, bytes_done, bytes_total, speed_bps, eta_s, "transfer progress");
    }

    fn on_complete(&self, transfer_id: &str, paths: &[std::path::PathBuf]) {
        tracing::info!(transfer_id, count = paths.len(), "transfer complete");
    }

    fn on_error(&self, kind: ErrorKind, detail: &str) {
        tracing::warn!(?kind, detail, "agent reported an error");
    }
}

pub fn display_state(state: AgentState) -> &'static str {
    match state {
        AgentState::Unpaired => "unpaired",
        AgentState::Idle => "idle",
        AgentState::Connecting => "connecting",
        AgentState::Authenticating => "authenticating",
        AgentState::Connected => "connected",
        AgentState::Degraded => "degraded",
        AgentState::Closed => "closed",
    }
}

/// Every non-loopback IPv4 address on this host, for `pair`'s "device list"
/// printout — the joiner needs an address to dial, and discovery hasn't run
/// yet at that point.
pub fn local_addresses() -> Vec<std::net::IpAddr> {
    local_ip_address::list_afinet_netifas()
        .unwrap_or_default()
        .into_iter()
        .map(|(_, addr)| addr)
        .filter(|addr| addr.is_ipv4() && !addr.is_loopback())
        .collect()
}

pub fn print_transfer(record: &TransferRecord) {
    println!(
        "  {}  {:?}  {}/{} bytes  ({} file{})",
        record.transfer_id,
        record.status,
        record.bytes_done,
        record.bytes_total,
        record.files.len(),
        if record.files.len() == 1 { "" } else { "s" }
    );
}

/// Exit code for a top-level command failure. `yank_core::Error` carries its
/// own code per spec.md §6; anything else (arg validation we do ourselves,
/// I/O from helpers) is treated as a usage error.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(e) => e.exit_code(),
        None => 2,
    }
}
