//! Interactive console for the IR module
//!
//! Usage:
//!   remote-ir-console --list
//!   remote-ir-console <port> [baud]
//!
//! Commands read from stdin: `ping`, `idle`, `button`, `record`,
//! `send <payload>`, `quit`.

use anyhow::{bail, Context, Result};
use remote_ir_core::protocol::{
    list_ports, DeviceSession, DeviceState, Event, SerialConfig, SerialTransport, SessionConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(port) = args.next() else {
        bail!("usage: remote-ir-console --list | <port> [baud]");
    };

    if port == "--list" {
        for info in list_ports() {
            println!("{}", serde_json::to_string(&info)?);
        }
        return Ok(());
    }

    let mut config = SerialConfig::new(port);
    if let Some(baud) = args.next() {
        config.baud_rate = baud
            .parse()
            .with_context(|| format!("invalid baud rate '{baud}'"))?;
    }

    let session =
        DeviceSession::new(SessionConfig::default()).context("failed to start device session")?;
    let (events_tx, mut events) = mpsc::unbounded_channel::<Event>();

    // Grab the listener slot whenever the module (re)connects
    let mut connection = session.subscribe();
    let watcher = {
        let session = session.clone();
        tokio::spawn(async move {
            while let Some(connected) = connection.changed().await {
                println!("connected: {connected}");
                if connected {
                    session.register_listener(events_tx.clone());
                }
            }
        })
    };

    let link = SerialTransport::connect(&session, &config)
        .with_context(|| format!("failed to open {}", config.port_name))?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
                let sent = match verb {
                    "" => continue,
                    "ping" => session.ping(),
                    "idle" => session.send_set_state(DeviceState::Idle),
                    "button" => session.send_set_state(DeviceState::Button),
                    "record" => session.send_set_state(DeviceState::Record),
                    "send" => session.send_ir(rest.trim()),
                    "quit" | "exit" => break,
                    other => {
                        eprintln!("unknown command '{other}'");
                        continue;
                    }
                };
                if let Err(e) = sent {
                    eprintln!("{e}");
                }
            }
            Some(event) = events.recv() => {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    drop(link);
    watcher.abort();
    Ok(())
}
