mod config;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use feedcast_core::text::format_timestamp;
use feedcast_crypto::keys::{decode_secret_input, encode_npub, encode_nsec, generate_secret};
use feedcast_crypto::{EventSigner, NostrSigner};
use feedcast_node::feed::{HttpFeedSource, SourceFeed};
use feedcast_node::filter::FilterEngine;
use feedcast_node::monitor::Monitor;
use feedcast_node::pipeline::publish_profile;
use feedcast_node::{
    run_cycle, Coordinator, PeerStatus, PipelineContext, Responder, Supervisor,
};
use feedcast_store::DedupStore;
use feedcast_transport::WebSocketConnector;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::{error, info, warn};

use crate::config::BotConfig;

const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broadcast loop (default)
    Run,
    /// Generate a new bot identity
    Keygen,
    /// Print deduplication store statistics
    Stats,
    /// Print the store contents as JSON
    Export,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("FEEDCAST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Some(Commands::Keygen) = cli.command {
        return keygen();
    }

    let cfg = BotConfig::new(cli.config).context("failed to load configuration")?;
    match cli.command {
        Some(Commands::Stats) => print_stats(&cfg),
        Some(Commands::Export) => export(&cfg),
        _ => run(cfg).await,
    }
}

fn keygen() -> Result<()> {
    let secret = generate_secret();
    let signer = NostrSigner::from_secret(secret).context("generated key rejected")?;
    println!("secret (hex):  {}", hex::encode(secret));
    println!(
        "secret (nsec): {}",
        encode_nsec(&secret).context("nsec encoding failed")?
    );
    println!("public (hex):  {}", signer.public_key_hex());
    println!(
        "public (npub): {}",
        encode_npub(&signer.public_key()).context("npub encoding failed")?
    );
    Ok(())
}

fn print_stats(cfg: &BotConfig) -> Result<()> {
    let store = DedupStore::open(&cfg.data_dir, cfg.store_options());
    let stats = store.get_stats();
    println!("total published: {}", stats.total_published);
    println!("total responded: {}", stats.total_responded);
    println!("stored items:    {}", stats.total_stored);
    println!("responded kept:  {}", stats.responded_events_stored);
    println!(
        "last run:        {}",
        stats
            .last_run
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_string())
    );
    for (feed, count) in &stats.feed_stats {
        println!("  {feed}: {count}");
    }
    print!("{}", Monitor::open(cfg.metrics_path()).summary());
    Ok(())
}

fn export(cfg: &BotConfig) -> Result<()> {
    let store = DedupStore::open(&cfg.data_dir, cfg.store_options());
    let json = serde_json::to_string_pretty(&store.export_data()).context("encode export")?;
    println!("{json}");
    Ok(())
}

fn load_signing_key(cfg: &BotConfig) -> Result<[u8; 32]> {
    if let Some(value) = cfg.private_key.as_deref().filter(|v| !v.trim().is_empty()) {
        return decode_secret_input(value)
            .context("private_key must be 64 hex characters or an nsec");
    }
    load_or_create_key(&cfg.private_key_path)
}

fn load_or_create_key(path: &Path) -> Result<[u8; 32]> {
    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("read bot key {}", path.display()))?;
        return decode_secret_input(&content)
            .with_context(|| format!("bot key in {} is not hex or nsec", path.display()));
    }

    let key = generate_secret();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("create bot key dir")?;
    }
    fs::write(path, hex::encode(key)).context("write bot key")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    info!("generated new bot key at {}", path.display());
    Ok(key)
}

fn log_pool_status(supervisor: &Supervisor) {
    let peers = supervisor.snapshot();
    let connected = peers
        .iter()
        .filter(|p| p.status() == PeerStatus::Connected)
        .count();
    info!("relays: {connected}/{} connected", peers.len());
    for peer in peers.iter().filter(|p| p.status() != PeerStatus::Connected) {
        warn!(
            relay = %peer.address(),
            status = %peer.status(),
            retries = peer.retry_count(),
            "relay unavailable: {}",
            peer.last_error().unwrap_or("-")
        );
    }
}

async fn run(cfg: BotConfig) -> Result<()> {
    if cfg.relays.is_empty() {
        bail!("no relays configured; set `relays` or FEEDCAST_RELAYS");
    }
    if cfg.feeds.is_empty() {
        warn!("no feeds configured; the bot will only answer commands");
    }

    let signer = Arc::new(
        NostrSigner::from_secret(load_signing_key(&cfg)?).context("invalid bot key")?,
    );
    let npub = encode_npub(&signer.public_key()).unwrap_or_else(|| signer.public_key_hex());
    info!(%npub, "starting {}", cfg.bot_name);

    let store = Arc::new(Mutex::new(DedupStore::open(
        &cfg.data_dir,
        cfg.store_options(),
    )));
    let monitor = Arc::new(Mutex::new(Monitor::open(cfg.metrics_path())));

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = flag::register(SIGTERM, Arc::clone(&shutdown));
    let _ = flag::register(SIGINT, Arc::clone(&shutdown));

    let supervisor = Supervisor::with_peers(
        cfg.pool_config(),
        Arc::new(WebSocketConnector::new()),
        cfg.relays.iter().cloned(),
    );
    let coordinator = Coordinator::new(supervisor.clone());
    let summary = supervisor.connect_all().await;
    if summary.connected == 0 {
        warn!("no relay reachable at startup; reconnects are scheduled");
    }

    if let Err(err) = publish_profile(&cfg.profile(), signer.as_ref(), &coordinator).await {
        error!("{err}");
    }

    let responder = if cfg.responder_enabled {
        let responder = Arc::new(Responder::new(
            cfg.responder_config(),
            signer.clone(),
            coordinator.clone(),
            Arc::clone(&store),
        ));
        if let Some(inbound) = supervisor.take_inbound() {
            tokio::spawn(Arc::clone(&responder).run(inbound));
        }
        Some(responder)
    } else {
        None
    };

    let feeds: Vec<Arc<dyn SourceFeed>> = cfg
        .feeds
        .iter()
        .cloned()
        .map(|source| Arc::new(HttpFeedSource::new(source, cfg.fetch_timeout)) as Arc<dyn SourceFeed>)
        .collect();
    let ctx = PipelineContext {
        feeds,
        filter: Arc::new(FilterEngine::new(&cfg.filters)),
        store: Arc::clone(&store),
        signer: signer.clone(),
        coordinator,
        monitor: Arc::clone(&monitor),
        settings: cfg.cycle_settings(),
    };

    while !shutdown.load(Ordering::Relaxed) {
        // Reconnected relays lose their subscription; the same id replaces
        // the REQ on relays that kept it.
        if let Some(responder) = &responder {
            responder.subscribe_all(&supervisor).await;
        }
        run_cycle(&ctx).await;
        log_pool_status(&supervisor);

        let next = Instant::now() + cfg.cycle_interval;
        while !shutdown.load(Ordering::Relaxed) && Instant::now() < next {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
    }

    info!("shutting down");
    supervisor.close_all().await;
    Ok(())
}
