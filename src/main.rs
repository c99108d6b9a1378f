use clap::Parser;
use dotenvy::dotenv;
use onion_chat::common::{ChatEvent, NetworkCommand};
use onion_chat::config;
use onion_chat::AppContext;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(
    name = "onion_chat",
    version,
    about = "Serverless P2P chat peer"
)]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    /// Override the listen port from the config file
    #[arg(long)]
    port: Option<u16>,
    /// Peer to connect to on startup, e.g. ws://xxxxxxxx.onion:2222 (repeatable)
    #[arg(long = "connect", value_name = "ADDR")]
    connect: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    // Khởi tạo Logger để debug
    env_logger::init();

    let cli = Cli::parse();
    let mut app_config = config::load_config(&cli.config);
    if let Some(port) = cli.port {
        app_config.listen_port = port;
    }

    // 1. Tạo các kênh giao tiếp (Channels)
    // Chat layer -> Network
    let (cmd_tx, cmd_rx) = mpsc::channel(100);
    // Network -> Chat layer
    let (event_tx, mut event_rx) = mpsc::channel(100);

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(&event);
        }
    });

    // 2. Khởi chạy mạng
    let app = AppContext::start(app_config, event_tx).await?;
    for address in cli.connect {
        if let Err(err) = cmd_tx
            .send(NetworkCommand::ConnectToPeer {
                address: address.clone(),
            })
            .await
        {
            log::warn!("Failed to queue connect to {address}: {err}");
        }
    }

    let client = app.client(cmd_rx).persist_peers_to(cli.config.clone());
    tokio::select! {
        _ = client.run() => {
            log::info!("Command channel closed");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                log::error!("Failed to listen for ctrl-c: {err}");
            }
            log::info!("Shutting down");
        }
    }

    app.shutdown().await;
    Ok(())
}

fn log_event(event: &ChatEvent) {
    match event {
        ChatEvent::MessageReceived {
            sender_id,
            chat_id,
            text,
        } => log::info!("[{chat_id}] {sender_id}: {text}"),
        ChatEvent::Invited {
            inviter_id,
            chat_id,
            chat_name,
            ..
        } => log::info!("{inviter_id} invited us to {chat_name} ({chat_id})"),
        ChatEvent::NetworkOnline(address) => log::info!("Network online at {address}"),
        ChatEvent::PeerOffline(address) => log::info!("Peer {address} went offline"),
        other => log::debug!("Chat event: {other:?}"),
    }
}
