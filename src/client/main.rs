//! Keychat Terminal Client
//!
//! Line-oriented front end over [`ClientLink`]: prints what arrives, sends
//! what is typed.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use keychat::crypto::keystore;
use keychat::{ClientConfig, ClientLink, FileEnvelope, LinkEvent, LinkOptions, LinkState, ServerMessage};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "keychat-client")]
#[command(about = "Keychat Terminal Client")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/client.toml")]
    config: PathBuf,

    /// Key file handed out by the server
    #[arg(short, long)]
    key_file: Option<PathBuf>,

    /// Connect here instead of the address sealed in the key file
    #[arg(long)]
    host: Option<IpAddr>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Nickname
    #[arg(short, long)]
    nickname: Option<String>,

    /// Directory received files are written to
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        ClientConfig::from_file(&args.config)?
    } else {
        ClientConfig::default()
    };

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level))
        .init();

    let key_file = args.key_file.clone().unwrap_or_else(|| config.key_file.clone());
    let (key, sealed_address) = keystore::load(&key_file)
        .with_context(|| format!("cannot use key file {}", key_file.display()))?;
    info!("Key file {} loaded", key_file.display());

    let address = args.host.unwrap_or(sealed_address);
    let port = args.port.unwrap_or(config.port);

    // Spawn task to read user input
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(read_lines(line_tx));

    let nickname = match args.nickname.clone().or_else(|| config.nickname.clone()) {
        Some(nickname) => nickname,
        None => prompt_nickname(&mut line_rx).await?,
    };

    println!("Connecting to {}:{} as {}...", address, port, nickname);
    let (mut link, mut events) =
        ClientLink::connect(address, port, &key, nickname, LinkOptions::from(&config)).await?;

    println!("Commands: /file <path> sends a file, /quit exits");

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                let result = match line.strip_prefix("/file ") {
                    Some(path) => send_file(&mut link, Path::new(path.trim())).await,
                    None => link.send(line).await.map_err(Into::into),
                };
                if let Err(e) = result {
                    println!("! Could not send: {}", e);
                }
            }
            Some(event) = events.recv() => {
                show_event(event, args.save_dir.as_deref());
            }
        }
    }

    link.close().await;
    println!("Bye");
    Ok(())
}

async fn send_file(link: &mut ClientLink, path: &Path) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    link.send_file(&name, &bytes).await?;
    Ok(())
}

fn show_event(event: LinkEvent, save_dir: Option<&Path>) {
    match event {
        LinkEvent::Message(ServerMessage::Text(text)) => println!("{}", text),
        LinkEvent::Message(ServerMessage::History(lines)) => {
            println!("--- history ---");
            for line in lines {
                match ServerMessage::from_wire(&line) {
                    Ok(ServerMessage::File(envelope)) => println!("[file] {}", envelope.name),
                    _ => println!("{}", line),
                }
            }
            println!("---------------");
        }
        LinkEvent::Message(ServerMessage::File(envelope)) => receive_file(&envelope, save_dir),
        LinkEvent::StatusChanged(LinkState::Connected) => println!("* Connected"),
        LinkEvent::StatusChanged(LinkState::Reconnecting) => println!("* Reconnecting..."),
        LinkEvent::StatusChanged(LinkState::Failed) => println!("* Could not reconnect"),
        LinkEvent::StatusChanged(_) => {}
        LinkEvent::ConnectionLost => {
            println!("* Connection lost; the next message will try to reconnect")
        }
    }
}

fn receive_file(envelope: &FileEnvelope, save_dir: Option<&Path>) {
    let bytes = match envelope.bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            println!("[file] {} (unreadable: {})", envelope.name, e);
            return;
        }
    };
    let Some(dir) = save_dir else {
        println!("[file] {} ({} bytes, use --save-dir to keep it)", envelope.name, bytes.len());
        return;
    };

    // Only the final path component, never a path the sender chose
    let name = Path::new(&envelope.name)
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_else(|| "file".into());
    let target = dir.join(name);
    match std::fs::write(&target, &bytes) {
        Ok(()) => println!("[file] {} saved to {}", envelope.name, target.display()),
        Err(e) => println!("[file] {} could not be saved: {}", envelope.name, e),
    }
}

async fn prompt_nickname(lines: &mut mpsc::UnboundedReceiver<String>) -> Result<String> {
    loop {
        print!("Nickname: ");
        io::stdout().flush()?;
        let line = lines.recv().await.context("stdin closed")?;
        let nickname = line.trim();
        if !nickname.is_empty() {
            return Ok(nickname.to_string());
        }
    }
}

async fn read_lines(line_tx: mpsc::UnboundedSender<String>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line_tx.send(line).is_err() {
            break;
        }
    }
    Ok(())
}
