//! Protoo Room CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::Input;
use observer::ObserverEngine;
use protoo_room_core::config::{DEFAULT_HOST, DEFAULT_PORT};
use protoo_room_core::prelude::*;
use protoo_room_core::random_id;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

mod console;
mod observer;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Protoo server host
    #[arg(long, env = "PROTOO_ROOM_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Protoo server port
    #[arg(long, env = "PROTOO_ROOM_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and follow what happens in it
    Join {
        /// Room id; a random one is created when omitted
        #[arg(env = "PROTOO_ROOM_ID")]
        room: Option<String>,

        /// Peer id
        #[arg(long, env = "PROTOO_PEER_ID")]
        peer_id: Option<String>,

        /// Display name
        #[arg(long, env = "PROTOO_DISPLAY_NAME")]
        name: Option<String>,

        /// Ask for TCP only ICE candidates
        #[arg(long)]
        force_tcp: bool,

        /// Do not accept remote streams
        #[arg(long)]
        no_consume: bool,

        /// Open the chat data channel
        #[arg(long)]
        chat: bool,

        #[command(flatten)]
        codec: CodecArgs,

        /// Reconnect attempts after the signaling socket drops
        #[arg(long, default_value_t = 10)]
        retries: u32,

        /// Signaling request timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        request_timeout_ms: u64,
    },

    /// Print the signaling URL and invitation link of a room
    Url {
        /// Room id
        room: String,

        /// Peer id
        #[arg(long, env = "PROTOO_PEER_ID")]
        peer_id: Option<String>,

        #[command(flatten)]
        codec: CodecArgs,
    },
}

#[derive(clap::Args)]
struct CodecArgs {
    /// Ask the server for H264
    #[arg(long)]
    h264: bool,

    /// Ask the server for VP9
    #[arg(long, conflicts_with = "h264")]
    vp9: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "protoo_room_core=info,protoo_room=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Join {
            room,
            peer_id,
            name,
            force_tcp,
            no_consume,
            chat,
            codec,
            retries,
            request_timeout_ms,
        } => {
            let url = room_url(&cli.host, cli.port, room, peer_id, &codec);
            let options = RoomOptions {
                force_tcp,
                consume: !no_consume,
                // Only the chat channel needs a send transport
                produce: chat,
                use_data_channel: chat,
                enable_mic_on_join: false,
                enable_cam_on_join: false,
                request_timeout: Duration::from_millis(request_timeout_ms),
                retry: RetryPolicy {
                    retries,
                    ..RetryPolicy::default()
                },
                ..RoomOptions::default()
            };
            let name = name.unwrap_or_else(generate_display_name);
            handle_join(&url, &name, options).await?;
        }
        Commands::Url {
            room,
            peer_id,
            codec,
        } => {
            let url = room_url(&cli.host, cli.port, Some(room), peer_id, &codec);
            println!("🔗 Signaling:  {}", url.protoo_url()?);
            println!("📨 Invitation: {}", url.invitation_link()?);
        }
    }

    Ok(())
}

fn room_url(
    host: &str,
    port: u16,
    room: Option<String>,
    peer_id: Option<String>,
    codec: &CodecArgs,
) -> ProtooUrl {
    let room = room.unwrap_or_else(|| random_id(8));
    let peer_id = peer_id.unwrap_or_else(|| random_id(8));
    let mut url = ProtooUrl::new(room, peer_id).with_host(host, port);
    url.force_h264 = codec.h264;
    url.force_vp9 = codec.vp9;
    url
}

async fn handle_join(url: &ProtooUrl, name: &str, options: RoomOptions) -> Result<()> {
    println!("🚪 Joining room {} as {} ({})", url.room_id, name, url.peer_id);
    println!("📨 Invite others: {}", url.invitation_link()?);

    let engine = Arc::new(ObserverEngine::new());
    let room = RoomClient::new(url, name, options, engine).context("invalid room URL")?;
    let store = Arc::clone(room.store());

    let mut notifies = store.subscribe_notify();
    let mut info = store.room_info.observe();
    let mut peers = store.peers.observe();
    let mut consumers = store.consumers.observe();
    room.join()?;

    println!("{}", console::HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            notify = notifies.recv() => match notify {
                Ok(notify) => println!("{}", console::notify_line(&notify)),
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "notifies dropped"),
                Err(RecvError::Closed) => break,
            },
            changed = info.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = info.borrow_and_update().clone();
                println!("{}", console::state_line(&snapshot));
                if snapshot.state == ConnectionState::Closed {
                    break;
                }
            }
            changed = peers.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = peers.borrow_and_update().len();
                println!("👥 {count} peer(s) in the room");
            }
            changed = consumers.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = consumers.borrow_and_update().len();
                tracing::debug!(count, "consumers changed");
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match console::parse_input(&line) {
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(input)) => run_input(&room, input),
                    Ok(None) => {}
                    Err(message) => println!("⚠️  {message}"),
                },
                // stdin closed
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("stdin error: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("👋 Leaving room");
    room.close().await;
    Ok(())
}

fn run_input(room: &RoomClient, input: Input) {
    match input {
        Input::Name(name) => room.change_display_name(name),
        Input::Chat(text) => room.send_chat_message(text),
        Input::RestartIce => room.restart_ice(),
        Input::Peers => {
            let store = room.store();
            let speaker = store.room_info.with(|info| info.active_speaker_id.clone());
            let peers = store.peers.get();
            let consumers = store.consumers.get();
            for line in console::peers_lines(&peers, &consumers, speaker.as_deref()) {
                println!("{line}");
            }
        }
        Input::Help => println!("{}", console::HELP),
        Input::Quit => {}
    }
}

fn generate_display_name() -> String {
    const WORDS: &[&str] = &[
        "Alpha", "Bravo", "Charlie", "Delta", "Echo", "Foxtrot", "Golf", "Hotel", "India",
        "Juliet", "Kilo", "Lima", "Mike", "November", "Oscar", "Papa", "Quebec", "Romeo",
        "Sierra", "Tango", "Uniform", "Victor", "Whiskey", "Xray", "Yankee", "Zulu",
    ];

    let mut rng = rand::thread_rng();
    format!("{} Observer", WORDS[rng.gen_range(0..WORDS.len())])
}
