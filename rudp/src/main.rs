//! Entry point for the `rudp` command-line tool.
//!
//! Parses CLI arguments and dispatches into either **listen** or **send**
//! mode.  All protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, argument parsing, exit status).

use std::cell::Cell;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use rudp::{Dispatcher, LifecycleEvent, RudpConfig};

/// Reliable datagram delivery over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    tuning: Tuning,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args)]
struct Tuning {
    /// Segments in flight per connection.
    #[arg(long, global = true, default_value_t = 3)]
    window: usize,
    /// Retransmission interval in milliseconds.
    #[arg(long, global = true, default_value_t = 2000)]
    timeout_ms: u64,
    /// Retransmissions per segment before giving up.
    #[arg(long, global = true, default_value_t = 5)]
    retries: u32,
}

impl Tuning {
    fn config(&self) -> RudpConfig {
        RudpConfig::default()
            .with_window_size(self.window)
            .with_retransmit_interval(Duration::from_millis(self.timeout_ms))
            .with_max_retries(self.retries)
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Print every payload received on a port.
    Listen {
        /// Local port to bind on all interfaces.
        #[arg(short, long, default_value_t = 6000)]
        port: u16,
    },
    /// Reliably deliver messages (or a file) to a listener, then close.
    Send {
        /// Local port to bind (0 = ephemeral).
        #[arg(short, long, default_value_t = 0)]
        port: u16,
        /// Destination address (e.g. 127.0.0.1:6000).
        #[arg(short, long)]
        to: SocketAddr,
        /// Send the contents of this file instead of MESSAGE arguments.
        #[arg(short, long, conflicts_with = "message")]
        file: Option<PathBuf>,
        /// Messages to send, one payload each.
        message: Vec<String>,
    },
}

/// Events after which the payloads cannot all have reached the peer.
fn is_delivery_failure(event: LifecycleEvent) -> bool {
    matches!(event, LifecycleEvent::TimedOut | LifecycleEvent::Abandoned)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let mut dispatcher = Dispatcher::new(cli.tuning.config())?;

    match cli.mode {
        Mode::Listen { port } => {
            let endpoint = dispatcher.open(port).await?;
            log::info!("listening on {:?}", dispatcher.local_addr(endpoint));
            dispatcher.register_data_handler(endpoint, |_, from, payload| {
                println!("[{from}] {}", String::from_utf8_lossy(payload));
            })?;
            dispatcher.register_event_handler(endpoint, |_, peer, event| {
                eprintln!("[{peer}] {event}");
            })?;
            dispatcher.run().await?;
        }
        Mode::Send {
            port,
            to,
            file,
            message,
        } => {
            let payloads = match file {
                Some(path) => vec![std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?],
                None if message.is_empty() => bail!("nothing to send: give MESSAGE or --file"),
                None => message.into_iter().map(String::into_bytes).collect(),
            };

            let endpoint = dispatcher.open(port).await?;
            let failure = Rc::new(Cell::new(None));
            let outcome = Rc::clone(&failure);
            dispatcher.register_event_handler(endpoint, move |_, peer, event| {
                eprintln!("[{peer}] {event}");
                if is_delivery_failure(event) && outcome.get().is_none() {
                    outcome.set(Some(event));
                }
            })?;

            for payload in &payloads {
                dispatcher.send(endpoint, payload, to)?;
            }
            dispatcher.close(endpoint)?;
            dispatcher.run().await?;

            if let Some(event) = failure.get() {
                bail!("delivery to {to} incomplete: {event}");
            }
            let total: usize = payloads.iter().map(Vec::len).sum();
            log::info!("delivered {} payload(s), {} byte(s), to {}", payloads.len(), total, to);
        }
    }
    Ok(())
}
