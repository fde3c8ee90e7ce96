use anyhow::Context;
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use roomcall::config::ClientConfig;
use roomcall::engine::{SignalingOnlyEngine, SyntheticSource};
use roomcall::events::{EventBus, RecoveryEvent};
use roomcall::session::RoomClient;
use roomcall::signaling::WebSocketFactory;
use roomcore::{MediaKind, RoomId};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

// Joins a room from the terminal and relays chat from stdin.
//
// Usage:
//   cargo run -- --room S1                          # default server, synthetic media
//   cargo run -- -r S1 -u ws://host:3000/mediasoup  # custom server
//   cargo run -- -c room.json --no-media            # config file, chat only
//
// Commands: /mic /cam /stop video|audio /recover /restart /diag /streams /quit. Anything else is sent as chat.

#[derive(Parser, Debug)]
#[command(name = "roomcall", about = "Join a room call from the terminal")]
struct Args {
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Signaling server URL
    #[arg(short, long)]
    url: Option<String>,
    /// Room to join
    #[arg(short, long)]
    room: Option<String>,
    /// Name shown to other participants in chat
    #[arg(short, long)]
    name: Option<String>,
    /// Join for chat only, without publishing media
    #[arg(long)]
    no_media: bool,
    /// Ask the server for TCP-only transports
    #[arg(long)]
    force_tcp: bool,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            return;
        }
    };

    rt.block_on(async {
        if let Err(e) = run(args).await {
            error!("{e:#}");
        }
    });
}

async fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(url) = &args.url {
        config.server_url = url.clone();
    }
    if let Some(room) = &args.room {
        config.room_id = Some(room.clone());
    }
    if let Some(name) = &args.name {
        config.display_name = name.clone();
    }
    if args.force_tcp {
        config.force_tcp = true;
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args).await?;
    let room = config
        .room_id
        .clone()
        .context("no room given (use --room or room_id in the config file)")?;

    let client = RoomClient::new(
        config,
        Arc::new(WebSocketFactory::new()),
        Arc::new(SignalingOnlyEngine::new()),
    );
    let diagnostics = client.attach_diagnostics();
    let printer = tokio::spawn(print_events(client.events().clone()));

    let joined = client.connect(RoomId::new(room)).await?;
    info!("In room {} (codecs: {:?})", joined.room_id, joined.codecs);

    if !args.no_media {
        let published = client.start_media(&SyntheticSource::new()).await?;
        for track in &published {
            info!("Publishing {} as {}", track.kind, track.producer_id());
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();
        match line {
            "" => {}
            "/quit" => break,
            "/mic" => match client.toggle_microphone().await {
                Some(enabled) => println!("microphone {}", if enabled { "on" } else { "off" }),
                None => println!("no microphone"),
            },
            "/cam" => match client.toggle_camera().await {
                Some(enabled) => println!("camera {}", if enabled { "on" } else { "off" }),
                None => println!("no camera"),
            },
            "/stop video" | "/stop audio" => {
                let kind = if line.ends_with("video") { MediaKind::Video } else { MediaKind::Audio };
                if !client.stop_track(kind).await {
                    println!("no {kind} track");
                }
            }
            "/recover" => match client.recover().await {
                Ok(report) => println!("recovered: {report:?}"),
                Err(e) => warn!("Recovery failed: {e}"),
            },
            "/restart" => match client.restart().await {
                Ok(report) => println!("restarted: {report:?}"),
                Err(e) => warn!("Restart failed: {e}"),
            },
            "/diag" => println!("{}", serde_json::to_string_pretty(&diagnostics.snapshot())?),
            "/streams" => {
                for stream in client.remote_streams() {
                    println!("{} -> {} ({})", stream.publisher_id, stream.consumer_id, stream.kind);
                }
            }
            body => {
                if let Err(e) = client.send_chat(body).await {
                    warn!("Chat not sent: {e}");
                }
            }
        }
    }

    client.leave().await;
    printer.abort();
    Ok(())
}

async fn print_events(events: Arc<EventBus>) {
    let mut chat = events.chat.subscribe();
    let mut added = events.remote_stream_added.subscribe();
    let mut removed = events.remote_stream_removed.subscribe();
    let mut recovery = events.recovery.subscribe();
    let mut restart = events.restart_required.subscribe();
    let mut notices = events.server_error.subscribe();

    loop {
        tokio::select! {
            Ok(message) = chat.recv() => {
                if !message.local {
                    println!("[{}] {}: {}", message.received_at.with_timezone(&Local).format("%H:%M"), message.author, message.body);
                }
            }
            Ok(stream) = added.recv() => println!("+ {} ({})", stream.publisher_id, stream.kind),
            Ok(gone) = removed.recv() => println!("- {}", gone.publisher_id),
            Ok(event) = recovery.recv() => match event.as_ref() {
                RecoveryEvent::Started(kind) => println!("{kind} started"),
                RecoveryEvent::Completed(report) => println!("{} complete", report.kind),
                RecoveryEvent::Failed { kind, error } => println!("{kind} failed: {error}"),
            },
            Ok(required) = restart.recv() => {
                println!("send transport {} failed; type /restart", required.transport_id);
            }
            Ok(notice) = notices.recv() => println!("server: {}", notice.message),
            else => break,
        }
    }
}
