use std::io::{self, Write as _};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use yank::clipboard::{NativeClipboard, NullClipboard};
use yank::{display_state, exit_code_for, local_addresses, print_transfer, TracingEvents};
use yank_core::app::{App, DEFAULT_PORT};
use yank_core::clipboard::ClipboardAdapter;

#[derive(Parser, Debug)]
#[command(name = "yank", version, about = "LAN clipboard sync between two paired devices")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a pairing session: prints a PIN, waits for a joiner.
    Pair {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Join a pairing session hosted by another device.
    Join {
        /// Host address, `ip` or `ip:port` (default port 9876).
        addr: String,
        /// The 6-digit PIN printed by `pair` on the host.
        pin: String,
    },
    /// Erase the local pairing record.
    Unpair {
        #[arg(long)]
        yes: bool,
    },
    /// Print pairing and transfer state.
    Status,
    /// Run the sync agent until interrupted.
    Start {
        /// Fallback peer address used if discovery finds nothing within 10s.
        #[arg(long)]
        peer: Option<String>,
        #[arg(long)]
        verbose: bool,
        #[arg(long = "no-security")]
        no_security: bool,
    },
    /// Read or modify `~/.yank/config.json`.
    Config {
        #[arg(long, num_args = 2, value_names = ["KEY", "VALUE"])]
        set: Option<Vec<String>>,
        #[arg(long)]
        reset: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let verbose = matches!(cli.cmd, Command::Start { verbose: true, .. });
    init_tracing(verbose);

    if let Err(err) = run(cli.cmd).await {
        eprintln!("error: {err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "yank=debug,yank_core=debug" } else { "yank=info,yank_core=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();
}

async fn run(cmd: Command) -> Result<()> {
    match cmd {
        Command::Pair { port } => cmd_pair(port).await,
        Command::Join { addr, pin } => cmd_join(&addr, &pin).await,
        Command::Unpair { yes } => cmd_unpair(yes).await,
        Command::Status => cmd_status().await,
        Command::Start { peer, verbose: _, no_security } => cmd_start(peer, no_security).await,
        Command::Config { set, reset } => cmd_config(set, reset).await,
    }
}

/// Commands that never touch the clipboard build against this no-op adapter
/// so they never require a display server. Only `start` opens a real one.
fn build_app<Cb: ClipboardAdapter + 'static>(clipboard: Arc<Cb>) -> Result<App<Cb>> {
    Ok(App::new(clipboard, Arc::new(TracingEvents))?)
}

async fn cmd_pair(port: u16) -> Result<()> {
    let app = build_app(Arc::new(NullClipboard))?;
    let bind_addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    println!("waiting for a joiner (timeout 120s)...");
    for addr in local_addresses() {
        println!("  this device is reachable at {addr}:{port}");
    }

    let record = app
        .pair(bind_addr, yank_core::app::DEFAULT_PAIR_TIMEOUT, |pin, local_addr| {
            println!("PIN: {pin}");
            println!("listening on {local_addr}");
        })
        .await
        .context("pairing failed")?;

    println!("paired with {} ({})", record.peer_name, record.peer_device_id);
    Ok(())
}

async fn cmd_join(addr: &str, pin: &str) -> Result<()> {
    let addr = parse_peer_addr(addr, DEFAULT_PORT)?;
    let app = build_app(Arc::new(NullClipboard))?;
    let record = app.join(addr, pin).await.context("pairing failed")?;
    println!("paired with {} ({})", record.peer_name, record.peer_device_id);
    Ok(())
}

async fn cmd_unpair(yes: bool) -> Result<()> {
    let app = build_app(Arc::new(NullClipboard))?;
    if !app.is_paired()? {
        println!("not paired");
        return Ok(());
    }
    if !yes {
        eprint!("unpair and erase the saved pairing record? [y/N]: ");
        io::stderr().flush().ok();
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        if line.trim().to_lowercase() != "y" {
            println!("aborted");
            return Ok(());
        }
    }
    app.unpair()?;
    println!("unpaired");
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let app = build_app(Arc::new(NullClipboard))?;
    let status = app.status().await?;

    println!("paired: {}", status.paired);
    if let (Some(id), Some(name)) = (&status.peer_device_id, &status.peer_name) {
        println!("peer: {name} ({id})");
    }
    match status.agent_state {
        Some(state) => println!("agent: {}", display_state(state)),
        None => println!("agent: not running in this process"),
    }
    if status.active_transfers.is_empty() {
        println!("transfers: none");
    } else {
        println!("transfers:");
        for transfer in &status.active_transfers {
            print_transfer(transfer);
        }
    }
    Ok(())
}

async fn cmd_start(peer: Option<String>, no_security: bool) -> Result<()> {
    if no_security {
        tracing::warn!("--no-security was passed but yank always authenticates and encrypts its transport; ignoring");
    }
    let app = build_app(Arc::new(NativeClipboard::new().context("opening platform clipboard")?))?;
    let peer_override = peer.map(|p| parse_peer_addr(&p, DEFAULT_PORT)).transpose()?;

    let agent = app.start(DEFAULT_PORT, peer_override).await.context("starting agent")?;
    println!("yank running on port {DEFAULT_PORT}, Ctrl-C to stop");

    tokio::signal::ctrl_c().await.ok();
    println!("shutting down...");
    agent.shutdown().await;
    Ok(())
}

async fn cmd_config(set: Option<Vec<String>>, reset: bool) -> Result<()> {
    let app = build_app(Arc::new(NullClipboard))?;
    if reset {
        app.reset_config().await?;
        println!("config reset to defaults");
        return Ok(());
    }
    if let Some(pair) = set {
        let [key, value] = <[String; 2]>::try_from(pair).expect("clap guarantees exactly 2 values");
        app.set_config_field(&key, &value).await?;
        println!("{key} = {value}");
        return Ok(());
    }
    let config = app.config().await;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn parse_peer_addr(input: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = input.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    bail!("'{input}' is not a valid IP address or IP:port")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_peer_addr_accepts_bare_ip() {
        let addr = parse_peer_addr("192.168.1.5", 9876).unwrap();
        assert_eq!(addr, "192.168.1.5:9876".parse().unwrap());
    }

    #[test]
    fn parse_peer_addr_accepts_ip_and_port() {
        let addr = parse_peer_addr("192.168.1.5:7000", 9876).unwrap();
        assert_eq!(addr.port(), 7000);
    }

    #[test]
    fn parse_peer_addr_rejects_garbage() {
        assert!(parse_peer_addr("not-an-ip", 9876).is_err());
    }
}
