//! CLI command implementations.

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use torchat_core::{
    ChannelMonitor, EngineConfig, EngineEvent, EventMonitor, OtherEventKind, Presence, TorChatEngine,
    TransferState,
};

/// Settings for `torchat run`, already mapped from the command line.
pub struct RunOptions {
    pub id: String,
    pub listen: SocketAddr,
    pub proxy: Option<SocketAddr>,
    pub peer_port: u16,
    pub downloads: String,
    pub auto_accept: bool,
    pub profile_name: String,
    pub connect: Vec<String>,
}

impl RunOptions {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            listen_addr: self.listen,
            tor_proxy: self.proxy,
            peer_port: self.peer_port,
            download_folder: self.downloads.clone(),
            auto_accept_files: self.auto_accept,
            profile_name: self.profile_name.clone(),
            ..EngineConfig::with_id(self.id.as_str())
        }
    }
}

/// One line typed by the user.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Message { buddy: String, text: String },
    File { buddy: String, path: String },
    Accept { buddy: String, transfer: String },
    Abort { buddy: String, transfer: String },
    Connect(String),
    Disconnect(String),
    Status(Presence),
    Buddies,
    Help,
    Quit,
}

const HELP: &str = "\
Commands:
  /msg <id> <text>            send a message
  /file <id> <path>           offer a file
  /accept <id> <transfer>     start a pending download
  /abort <id> <transfer>      cancel a transfer
  /connect <id>               connect to a buddy
  /disconnect <id>            close and forget a buddy
  /status available|away|xa   change presence
  /buddies                    list known buddies
  /quit                       shut down";

/// Parse a command line. Blank lines yield `Ok(None)`.
fn parse_input(line: &str) -> Result<Option<Input>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim_start();

    // "<id> <remainder>", remainder kept verbatim
    let buddy_and = |what: &str| -> Result<(String, String)> {
        match rest.split_once(' ') {
            Some((buddy, tail)) if !tail.is_empty() => Ok((buddy.to_string(), tail.to_string())),
            _ => bail!("usage: {} <id> <{}>", command, what),
        }
    };
    let buddy_only = || -> Result<String> {
        if rest.is_empty() || rest.contains(' ') {
            bail!("usage: {} <id>", command);
        }
        Ok(rest.to_string())
    };

    let input = match command {
        "/msg" => {
            let (buddy, text) = buddy_and("text")?;
            Input::Message { buddy, text }
        }
        "/file" => {
            let (buddy, path) = buddy_and("path")?;
            Input::File { buddy, path }
        }
        "/accept" => {
            let (buddy, transfer) = buddy_and("transfer")?;
            Input::Accept { buddy, transfer }
        }
        "/abort" => {
            let (buddy, transfer) = buddy_and("transfer")?;
            Input::Abort { buddy, transfer }
        }
        "/connect" => Input::Connect(buddy_only()?),
        "/disconnect" => Input::Disconnect(buddy_only()?),
        "/status" => Input::Status(rest.parse().context("usage: /status available|away|xa")?),
        "/buddies" => Input::Buddies,
        "/help" => Input::Help,
        "/quit" => Input::Quit,
        other => bail!("unknown command '{}', try /help", other),
    };
    Ok(Some(input))
}

/// Run a node until `/quit`, end of input or Ctrl+C.
pub async fn run_node(options: RunOptions) -> Result<()> {
    let engine = TorChatEngine::new(options.engine_config()).context("Invalid configuration")?;

    let (monitor, mut events) = ChannelMonitor::new();
    let monitor: Arc<dyn EventMonitor> = monitor;
    engine.add_monitor(&monitor);

    let addr = engine.start().await.context("Failed to start engine")?;
    println!("\nTorChat node {}.onion", options.id);
    println!("  Listening on {}", addr);
    match options.proxy {
        Some(proxy) => println!("  Tor proxy:    {}", proxy),
        None => println!("  Tor proxy:    none (direct)"),
    }
    println!("\nType /help for commands.");

    for buddy in &options.connect {
        if let Err(e) = engine.connect(buddy).await {
            eprintln!("[ERROR] {}: {}", buddy, e);
        }
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line) {
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(input)) => {
                        if let Err(e) = execute(&engine, input).await {
                            eprintln!("[ERROR] {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => eprintln!("[ERROR] {}", e),
                }
            }
            Some(event) = events.recv() => print_event(&event),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("\nShutting down...");
    engine.shutdown().await?;
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    Ok(())
}

async fn execute(engine: &TorChatEngine, input: Input) -> Result<()> {
    match input {
        Input::Message { buddy, text } => engine.send_message(&buddy, &text).await?,
        Input::File { buddy, path } => {
            let path = shellexpand::tilde(&path).to_string();
            let transfer = engine.send_file(&buddy, path).await?;
            println!("Offered file (transfer {})", transfer);
        }
        Input::Accept { buddy, transfer } => engine.accept_file_transfer(&buddy, &transfer).await?,
        Input::Abort { buddy, transfer } => engine.abort_file_transfer(&buddy, &transfer).await?,
        Input::Connect(buddy) => engine.connect(&buddy).await?,
        Input::Disconnect(buddy) => engine.disconnect(&buddy).await?,
        Input::Status(presence) => engine.set_presence(presence).await?,
        Input::Buddies => {
            let buddies = engine.buddies().await;
            if buddies.is_empty() {
                println!("No buddies.");
            }
            for (id, state) in buddies {
                println!("  {} {}", id, state);
            }
        }
        Input::Help => println!("{}", HELP),
        Input::Quit => {}
    }
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::Listening { .. } => {}
        EngineEvent::IncomingConnection { buddy_id } => println!("[INFO] Incoming connection from {}", buddy_id),
        EngineEvent::BuddyAdded { buddy_id } => println!("[INFO] New buddy {}", buddy_id),
        EngineEvent::BuddyStateUpdate(update) => {
            let presence = update.presence.map(|p| format!(" ({})", p)).unwrap_or_default();
            println!("[{}] {}{}", update.state, update.buddy_id, presence);
        }
        EngineEvent::IncomingMessage(msg) => println!("<{}> {}", msg.buddy_id, msg.message),
        EngineEvent::IncomingFileTransfer(info) => println!(
            "[FILE] {} offers {} ({} bytes), transfer {}",
            info.buddy_id, info.name, info.length, info.transfer_id
        ),
        EngineEvent::FileTransferUpdate(info) => match info.state {
            TransferState::Done => println!("[FILE] {} done", info.name),
            TransferState::Aborted => println!(
                "[FILE] {} aborted: {}",
                info.name,
                info.failure_reason.as_deref().unwrap_or("unknown reason")
            ),
            _ => {}
        },
        EngineEvent::Other(other) => {
            if other.kind == OtherEventKind::Info {
                println!("[INFO] {}", other.description);
            }
        }
        EngineEvent::ShutdownComplete => println!("[INFO] Shutdown complete"),
    }
}
