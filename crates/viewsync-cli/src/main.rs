//! Viewsync CLI
//!
//! Headless viewer instance around viewsync-core, for demos and for
//! debugging the protocol against real viewers.
//!
//! ## Usage
//!
//! ```bash
//! # Run a local instance and join everything on this machine
//! viewsync serve --sync-all
//!
//! # Run a LAN instance with a server other instances can find
//! viewsync serve --mode lan --server --title "wall display"
//!
//! # Connect straight to a known instance
//! viewsync serve --mode lan --connect 192.168.1.20:28500
//!
//! # Run the controlled end of a remote-control setup
//! viewsync serve --mode remote-control --server
//!
//! # List the instances reachable right now, as JSON
//! viewsync probe
//! ```
//!
//! Inside `serve`, commands are read line by line from stdin; type
//! `help` for the list.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use viewsync_core::{
    file_op, ControlMode, PointF, SyncConfig, SyncEvent, SyncHost, SyncMode, Transform,
    WindowRect,
};

/// Viewsync - Multi-Instance Viewer Synchronization
#[derive(Parser)]
#[command(name = "viewsync")]
#[command(version = "0.1.0")]
#[command(about = "Viewsync - Multi-Instance Viewer Synchronization")]
#[command(
    long_about = "A headless peer of the viewer synchronization protocol: discovers other \
instances on this machine or the LAN, joins synchronized sessions, and mirrors \
transforms, file steps, and images between them."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an instance and drive it interactively from stdin
    Serve {
        /// Sync mode: local, lan, or remote-control
        #[arg(short, long, default_value = "local")]
        mode: String,

        /// Window title announced to peers
        #[arg(short, long, default_value = "viewsync")]
        title: String,

        /// Connect to a specific instance (ADDR:PORT) at startup
        #[arg(short, long)]
        connect: Option<String>,

        /// Start the LAN server immediately
        #[arg(short, long)]
        server: bool,

        /// Synchronize with every peer as soon as it appears
        #[arg(long)]
        sync_all: bool,
    },

    /// Discover reachable instances and print them as JSON
    Probe {
        /// Sync mode: local, lan, or remote-control
        #[arg(short, long, default_value = "local")]
        mode: String,

        /// How long to wait for answers, in milliseconds
        #[arg(short, long, default_value = "1500")]
        wait: u64,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Parse a sync mode name
fn parse_mode(s: &str) -> Result<SyncMode> {
    match s.to_lowercase().as_str() {
        "local" => Ok(SyncMode::Local),
        "lan" => Ok(SyncMode::Lan),
        "remote-control" | "rc" => Ok(SyncMode::RemoteControl),
        _ => anyhow::bail!(
            "Invalid mode '{}'. Must be one of: local, lan, remote-control",
            s
        ),
    }
}

/// Parse an ADDR:PORT endpoint
fn parse_endpoint(s: &str) -> Result<(IpAddr, u16)> {
    let addr: SocketAddr = s
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid endpoint '{}': {}", s, e))?;
    Ok((addr.ip(), addr.port()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            mode,
            title,
            connect,
            server,
            sync_all,
        } => {
            let mode = parse_mode(&mode)?;
            let host = SyncHost::start(mode, SyncConfig::with_title(&title))?;

            println!("Viewsync v0.1.0");
            println!();
            println!("Instance:");
            println!("  Title: {}", title);
            println!("  Mode: {}", mode);
            if host.server_port() != 0 {
                println!("  Server port: {}", host.server_port());
            }
            println!();

            if server {
                host.start_server(true);
            }
            if let Some(endpoint) = connect {
                let (address, port) = parse_endpoint(&endpoint)?;
                host.connect_to_host(address, port);
            }

            println!("Instance is running. Type 'help' for commands, Ctrl+C to stop.");
            println!();

            let mut events = host.subscribe();
            let stdin = tokio::io::stdin();
            let reader = tokio::io::BufReader::new(stdin);
            let mut lines = reader.lines();

            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Ok(SyncEvent::QuitReceived) => {
                                println!("A peer quit; closing with it.");
                                break;
                            }
                            Ok(event) => {
                                print_event(&event);
                                if sync_all {
                                    if let SyncEvent::PeerListChanged { peers } = &event {
                                        for peer in peers.iter().filter(|p| !p.synchronized) {
                                            host.synchronize_with(peer.id);
                                        }
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                eprintln!("Dropped {} events, output fell behind", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(text)) => {
                                match handle_line(&host, text.trim()) {
                                    Ok(true) => {}
                                    Ok(false) => break,
                                    Err(e) => eprintln!("Error: {}", e),
                                }
                            }
                            Ok(None) => {
                                println!();
                                println!("Input closed, exiting...");
                                break;
                            }
                            Err(e) => {
                                eprintln!("Read error: {}", e);
                            }
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                }
            }

            println!("Shutting down...");
            host.shutdown();
            println!("Goodbye.");
        }

        Commands::Probe { mode, wait } => {
            let mode = parse_mode(&mode)?;
            let host = SyncHost::start(mode, SyncConfig::with_title("viewsync probe"))?;

            tokio::time::sleep(Duration::from_millis(wait)).await;

            let peers = host.peer_list();
            println!("{}", serde_json::to_string_pretty(&peers)?);
            host.shutdown();
        }
    }

    Ok(())
}

/// Handle one interactive command. Returns false to exit.
fn handle_line(host: &SyncHost, line: &str) -> Result<bool> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(true);
    };
    let args: Vec<&str> = parts.collect();

    match (command, args.as_slice()) {
        ("help", _) => print_help(),

        ("peers", _) => {
            println!("{}", serde_json::to_string_pretty(&host.peer_list())?);
        }

        ("sync", [id]) => host.synchronize_with(id.parse()?),
        ("sync-port", [port]) => host.synchronize_with_port(port.parse()?),
        ("unsync", [id]) => host.stop_synchronize_with(id.parse()?),
        ("unsync-all", []) => host.stop_synchronize_all(),

        ("title", rest) if !rest.is_empty() => host.send_title(rest.join(" ")),

        ("zoom", [factor]) => {
            let factor: f64 = factor.parse()?;
            host.send_transform(
                Transform::scaling(factor, factor),
                Transform::IDENTITY,
                PointF::default(),
            );
        }
        ("pan", [dx, dy]) => {
            host.send_transform(
                Transform::translation(dx.parse()?, dy.parse()?),
                Transform::IDENTITY,
                PointF::default(),
            );
        }
        ("pos", [x, y, w, h]) => {
            host.send_position(
                WindowRect::new(x.parse()?, y.parse()?, w.parse()?, h.parse()?),
                true,
                false,
            );
        }

        ("next", []) => host.send_new_file(file_op::NEXT, ""),
        ("prev", []) => host.send_new_file(file_op::PREVIOUS, ""),
        ("open", [filename]) => host.send_new_file(file_op::OPEN, *filename),

        ("image", [path]) => {
            let data = std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read image file: {}", e))?;
            host.send_new_image(*path, Bytes::from(data));
            println!("Pushed {} to synchronized peers.", path);
        }

        ("connect", [endpoint]) => {
            let (address, port) = parse_endpoint(endpoint)?;
            host.connect_to_host(address, port);
        }
        ("server", ["on"]) => host.start_server(true),
        ("server", ["off"]) => host.start_server(false),

        ("allow", [id]) => host.set_permission(id.parse()?, true),
        ("deny", [id]) => host.set_permission(id.parse()?, false),
        ("mode", [code]) => {
            let code: i32 = code.parse()?;
            match ControlMode::from_code(code) {
                Some(mode) => host.set_mode(mode),
                None => println!("Unknown mode code {}; use 0, 1, or 2.", code),
            }
        }

        ("bye", []) => {
            host.send_goodbye();
            println!("Said goodbye to all peers.");
        }
        ("quit-all", []) => {
            host.send_quit();
            println!("Asked local peers to quit.");
            return Ok(false);
        }
        ("exit" | "quit", _) => return Ok(false),

        _ => println!("Unknown command. Type 'help' for the list."),
    }
    Ok(true)
}

fn print_help() {
    println!("Commands:");
    println!("  peers                     List connected peers as JSON");
    println!("  sync <id>                 Synchronize with a peer");
    println!("  sync-port <port>          Synchronize with the instance on a local port");
    println!("  unsync <id>               Leave the session with a peer");
    println!("  unsync-all                Leave all sessions");
    println!("  title <text>              Announce a new window title");
    println!("  zoom <factor>             Send a zoom transform");
    println!("  pan <dx> <dy>             Send a pan transform");
    println!("  pos <x> <y> <w> <h>       Send the window geometry");
    println!("  next | prev               Step through the synchronized folder");
    println!("  open <filename>           Open a file on synchronized peers");
    println!("  image <path>              Push an image file to synchronized peers");
    println!("  connect <addr:port>       Connect to a specific instance");
    println!("  server on|off             Start or stop the LAN server");
    println!("  allow <id> | deny <id>    Answer a permission request");
    println!("  mode <0|1|2>              Announce a remote-control mode change");
    println!("  bye                       Disconnect from all peers, keep running");
    println!("  quit-all                  Quit together with all local peers");
    println!("  exit                      Leave without telling peers to quit");
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::PeerListChanged { peers } => {
            println!("Peers ({}):", peers.len());
            for peer in peers {
                let synced = if peer.synchronized { " [synced]" } else { "" };
                println!(
                    "  {} - {} @ {}:{}{}",
                    peer.id, peer.title, peer.address, peer.server_port, synced
                );
            }
        }
        SyncEvent::SynchronizedPeersChanged { ports } => {
            if ports.is_empty() {
                println!("Session: (none)");
            } else {
                let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
                println!("Session: ports {}", ports.join(", "));
            }
        }
        SyncEvent::TransformReceived { view, .. } => {
            println!(
                "[sync] transform zoom={:.2} pan=({:.1}, {:.1})",
                view.m11, view.m31, view.m32
            );
        }
        SyncEvent::PositionReceived { rect, .. } => {
            println!(
                "[sync] position {}x{} at ({}, {})",
                rect.width, rect.height, rect.x, rect.y
            );
        }
        SyncEvent::NewFileReceived { op, filename } => {
            println!("[sync] file step {} -> {}", op, filename);
        }
        SyncEvent::UpcomingImageReceived { title } => {
            println!("[sync] incoming image: {}", title);
        }
        SyncEvent::ImageReceived { title, data } => {
            println!("[sync] image {} ({} bytes)", title, data.len());
        }
        SyncEvent::TitleReceived { peer_id, title } => {
            println!("[peer {}] title: {}", peer_id, title);
        }
        SyncEvent::PermissionRequested { peer_id, title } => {
            println!(
                "[peer {}] '{}' asks for control. Answer with: allow {} / deny {}",
                peer_id, title, peer_id, peer_id
            );
        }
        SyncEvent::ModeChanged { mode } => {
            println!("[peer] control mode is now {}", mode);
        }
        SyncEvent::ServerPortChanged { port } => {
            if *port == 0 {
                println!("Server stopped.");
            } else {
                println!("Server listening on port {}.", port);
            }
        }
        SyncEvent::Info { message, .. } => {
            println!("[info] {}", message);
        }
        // Handled in the serve loop.
        SyncEvent::QuitReceived => {}
    }
}
