//! Mesh voice demo
//!
//! Spins up several simulated members on one in-process signaling store,
//! each with real `webrtc` peer connections and a synthetic tone
//! microphone, joins them to one channel one after another and prints the
//! resulting views.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p meshcall-voice --bin meshcall-demo -- --members 3 --duration 10
//!
//! # With a config file and debug logging
//! RUST_LOG=meshcall_voice=debug cargo run -p meshcall-voice --bin meshcall-demo -- \
//!   --config ./voice.toml
//! ```

use clap::Parser;
use meshcall_voice::{
    ConnectionsView, SyntheticMediaDevices, VoiceClient, VoiceMeshConfig, VoiceUser,
    WebRtcConnector,
};
use signaling_store::InMemoryStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Meshcall voice channel demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of simulated members
    #[arg(short, long, default_value_t = 3, env = "MESHCALL_MEMBERS")]
    members: usize,

    /// Server id
    #[arg(long, default_value = "demo-server", env = "MESHCALL_SERVER")]
    server: String,

    /// Voice channel id
    #[arg(long, default_value = "lounge", env = "MESHCALL_CHANNEL")]
    channel: String,

    /// TOML configuration file
    #[arg(short, long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds to stay connected before leaving
    #[arg(short, long, default_value_t = 10)]
    duration: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info,webrtc=warn")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        if shutdown_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, exiting");
            std::process::exit(130);
        }
        eprintln!("Ctrl+C received, leaving channel...");
    })?;

    let config = match &args.config {
        Some(path) => VoiceMeshConfig::load(path)?,
        None => VoiceMeshConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args, config, shutdown))
}

async fn run(args: Args, config: VoiceMeshConfig, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let store = InMemoryStore::new();
    let connector = Arc::new(WebRtcConnector::new());

    let mut clients = Vec::with_capacity(args.members);
    for n in 0..args.members {
        let uid = format!("member{}", n + 1);
        let user = VoiceUser::new(&uid, &format!("Member {}", n + 1))?;
        let devices = Arc::new(SyntheticMediaDevices::tone(220.0 * (n + 1) as f32, 0.2));
        let client = VoiceClient::spawn(
            config.clone(),
            user,
            Arc::new(store.clone()),
            connector.clone(),
            devices,
        )?;

        client.join_voice_channel(&args.server, &args.channel).await?;
        info!("{} joined with {} sessions", uid, client.view().sessions.len());
        clients.push(client);
    }

    let mut remaining = args.duration;
    while remaining > 0 && !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(1)).await;
        remaining -= 1;
        for client in &clients {
            print_view(client.user(), &client.view());
        }
    }

    for client in clients.iter().rev() {
        if let Err(e) = client.leave_voice_channel().await {
            warn!("{} left with errors: {}", client.user().uid, e);
        }
        client.shutdown().await?;
    }

    info!("Demo finished");
    Ok(())
}

fn print_view(user: &VoiceUser, view: &ConnectionsView) {
    let sessions: Vec<String> = view
        .sessions
        .iter()
        .map(|s| format!("{}:{:?}", s.peer_uid, s.lifecycle))
        .collect();
    let speaking: Vec<&str> = view.speaking.iter().map(String::as_str).collect();
    println!(
        "{:<10} {:?} sessions=[{}] speaking=[{}]",
        user.uid,
        view.phase,
        sessions.join(", "),
        speaking.join(", ")
    );
}

fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    // RUST_LOG wins over the command line default
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}
