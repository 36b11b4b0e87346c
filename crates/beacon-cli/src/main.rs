//! LoRa Beacon CLI
//!
//! Client mode links to Incident Command (and optionally a Team Lead) and
//! sends every line typed on stdin to Incident Command. Server mode hosts
//! the uplink endpoint and answers each message on the latest inbound link.

mod logging;

use anyhow::Context;
use beacon_core::{
    BeaconConfig, BeaconError, BeaconNode, INCIDENT_COMMAND, SessionEvent, StoragePaths,
    TEAM_LEAD, Target, server_reply,
};
use beacon_crypto::Fingerprint;
use beacon_transport::{MeshConfig, MeshTransport, UdpMedium, UdpMediumConfig};
use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// LoRa Beacon - check in with Incident Command over the mesh
#[derive(Parser)]
#[command(name = "beacon")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Incident Command uplink address (hex)
    #[arg(required_unless_present = "server")]
    destination: Option<String>,

    /// Run as a server hosting the uplink endpoint
    #[arg(short, long)]
    server: bool,

    /// Team Lead uplink address (hex)
    #[arg(long)]
    team_lead: Option<String>,

    /// Storage directory (defaults to the user config directory)
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Multicast group of the shared medium
    #[arg(long, default_value = "239.66.67.1")]
    group: Ipv4Addr,

    /// Multicast port of the shared medium
    #[arg(long, default_value_t = 4242)]
    port: u16,

    /// Seconds to wait for a path before giving up
    #[arg(long, default_value_t = 30)]
    path_timeout: u64,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = cli.storage.clone().map(StoragePaths::new).unwrap_or_default();
    paths.ensure()?;
    let config = BeaconConfig::load_or_default(paths.config())?;
    let log_file = config.use_log_file.then(|| paths.log());
    logging::init(cli.verbose, log_file.as_deref())?;

    let medium = UdpMedium::bind(UdpMediumConfig {
        group: cli.group,
        port: cli.port,
        ..UdpMediumConfig::default()
    })?;
    let transport = Arc::new(MeshTransport::start(Arc::new(medium), MeshConfig::default()));
    let node = BeaconNode::start(config, paths, transport)?;

    if cli.server {
        run_server(node).await
    } else {
        let destination = cli
            .destination
            .as_deref()
            .context("an Incident Command destination is required")?;
        let incident_command: Fingerprint = destination
            .parse()
            .context("invalid Incident Command destination")?;
        let team_lead = cli
            .team_lead
            .as_deref()
            .map(str::parse::<Fingerprint>)
            .transpose()
            .context("invalid Team Lead destination")?;
        run_client(
            node,
            incident_command,
            team_lead,
            Duration::from_secs(cli.path_timeout),
        )
        .await
    }
}

async fn run_server(mut node: BeaconNode) -> anyhow::Result<()> {
    let address = node.serve()?;
    let mut events = node
        .sessions()
        .take_events()
        .context("session events already taken")?;

    println!("{} serving at {}", node.config().name, address);
    if let Err(e) = node.announce().await {
        tracing::warn!("Initial announce failed: {}", e);
    }
    println!("Press Enter to announce, Ctrl-C to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(_)) => match node.announce().await {
                    Ok(()) => println!("Sent announce for {address}"),
                    Err(e) => eprintln!("Announce failed: {e}"),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!("stdin unreadable: {}", e);
                    stdin_open = false;
                }
            },
            Some(event) = events.recv() => on_server_event(&node, event).await,
        }
    }

    println!("\nShutting down...");
    node.shutdown().await;
    Ok(())
}

async fn on_server_event(node: &BeaconNode, event: SessionEvent) {
    match event {
        SessionEvent::Established { link, .. } => println!("Client connected on {link}"),
        SessionEvent::RemoteIdentified { identity, .. } => {
            println!("Client identified as {}", identity.fingerprint());
        }
        SessionEvent::Message {
            text, provenance, ..
        } => {
            println!("> {text}");
            let reply = server_reply(&text, &provenance);
            if let Err(e) = node.sessions().send(&Target::LatestInbound, reply).await {
                eprintln!("Reply failed: {e}");
            }
        }
        SessionEvent::Closed { reason, .. } => println!("Client disconnected ({reason:?})"),
    }
}

async fn run_client(
    node: BeaconNode,
    incident_command: Fingerprint,
    team_lead: Option<Fingerprint>,
    path_timeout: Duration,
) -> anyhow::Result<()> {
    let events = node
        .sessions()
        .take_events()
        .context("session events already taken")?;
    let printer = tokio::spawn(print_client_events(events));

    let sessions = node.sessions();
    println!("Linking to {INCIDENT_COMMAND} at {incident_command}...");
    let ic = sessions.connect_role(INCIDENT_COMMAND, incident_command, path_timeout);
    let tl = async {
        match team_lead {
            Some(address) => Some(sessions.connect_role(TEAM_LEAD, address, path_timeout).await),
            None => None,
        }
    };
    let (ic, tl) = tokio::join!(ic, tl);

    if let Err(e) = ic {
        eprintln!("{INCIDENT_COMMAND} unreachable: {e}");
        node.shutdown().await;
        printer.abort();
        return Ok(());
    }
    if let Some(Err(e)) = tl {
        eprintln!("{TEAM_LEAD} unreachable: {e}");
    }

    let reporter_cancel = CancellationToken::new();
    let reporter = node.spawn_reporter(reporter_cancel.clone());

    println!("Type a message for {INCIDENT_COMMAND}, or quit/q/exit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("stdin unreadable: {}", e);
                        break;
                    }
                };
                let text = line.trim();
                if matches!(text, "quit" | "q" | "exit") {
                    node.recorder().record("Application quitting due to user request.");
                    break;
                }
                if text.is_empty() {
                    continue;
                }
                match sessions.send(&Target::from(INCIDENT_COMMAND), text).await {
                    Ok(()) => {}
                    Err(BeaconError::PayloadTooLarge { size, mdu }) => {
                        eprintln!("Message is {size} bytes, the link carries at most {mdu}");
                    }
                    Err(e) => eprintln!("Not sent: {e}"),
                }
            }
        }
    }

    reporter_cancel.cancel();
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }
    node.shutdown().await;
    printer.abort();
    Ok(())
}

async fn print_client_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Established { name, .. } => println!("Uplink to {name} established"),
            SessionEvent::RemoteIdentified { name, identity, .. } => {
                println!("{name} is {}", identity.fingerprint());
            }
            SessionEvent::Message { name, text, .. } => println!("{name}: {text}"),
            SessionEvent::Closed { name, reason, .. } => {
                println!("{name} link closed ({reason:?})");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_requires_destination() {
        assert!(Cli::try_parse_from(["beacon"]).is_err());
        assert!(Cli::try_parse_from(["beacon", "--server"]).is_ok());
    }

    #[test]
    fn test_client_flags() {
        let incident_command = "ab".repeat(16);
        let team_lead = "cd".repeat(16);
        let cli = Cli::try_parse_from([
            "beacon",
            incident_command.as_str(),
            "--team-lead",
            team_lead.as_str(),
            "--port",
            "5000",
        ])
        .unwrap();
        assert!(!cli.server);
        assert_eq!(cli.port, 5000);
        assert_eq!(cli.group, Ipv4Addr::new(239, 66, 67, 1));
        assert!(cli.destination.unwrap().parse::<Fingerprint>().is_ok());
        assert!(cli.team_lead.unwrap().parse::<Fingerprint>().is_ok());
    }
}
