//! Ordbot - automated bidding agent for a Bitcoin ordinals marketplace.
//!
//! Watches configured collections over the marketplace push stream,
//! keeps competitive item and collection offers alive from a pool of
//! funding wallets, and never exceeds the per-wallet or global rate
//! budgets. See `config/collections.json` and `config/wallets.json`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ordbot_backend::api::{self, ApiState};
use ordbot_backend::config::{self, BotEnv};
use ordbot_backend::context::{BidContext, ReceivePolicy};
use ordbot_backend::counterbid::CounterBidHandler;
use ordbot_backend::events::{self, EventManager, WorkItem};
use ordbot_backend::history::BidHistoryStore;
use ordbot_backend::locks::{QuantityLockMap, TokenLockMap};
use ordbot_backend::marketplace::{HttpMarketplace, Marketplace};
use ordbot_backend::pacer::BidPacer;
use ordbot_backend::pidfile::PidFile;
use ordbot_backend::scheduler::{spawn_ticker, SchedulerSet};
use ordbot_backend::shutdown::Shutdown;
use ordbot_backend::stats::{BidStats, EventStats};
use ordbot_backend::stream::PushStreamClient;
use ordbot_backend::wallets::file::WalletsFile;
use ordbot_backend::wallets::WalletSelector;

/// Interval between bid-history maintenance passes.
const HISTORY_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser, Debug)]
#[command(name = "ordbot", about = "Ordinals marketplace bidding agent")]
struct Args {
    /// Collections configuration file.
    #[arg(long, default_value = "config/collections.json")]
    collections: PathBuf,

    /// Marketplace REST base URL.
    #[arg(
        long,
        env = "API_BASE_URL",
        default_value = "https://api-mainnet.magiceden.dev/v2/ord/btc"
    )]
    api_base_url: String,

    /// Marketplace activity stream URL.
    #[arg(
        long,
        env = "STREAM_WS_URL",
        default_value = "wss://wss-mainnet.magiceden.dev"
    )]
    stream_ws_url: String,

    /// Bid history snapshot location.
    #[arg(long, env = "BID_HISTORY_PATH", default_value = "data/bidHistory.json")]
    bid_history: PathBuf,

    /// Status API port (overrides API_PORT).
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// With rotation disabled the bot runs on a single funding wallet: the
/// first one the wallet file defines.
fn restrict_to_single_wallet(file: WalletsFile) -> WalletsFile {
    match file {
        WalletsFile::Flat {
            mut wallets,
            bids_per_minute,
        } => {
            wallets.truncate(1);
            WalletsFile::Flat {
                wallets,
                bids_per_minute,
            }
        }
        grouped => {
            warn!("wallet rotation disabled but config is grouped; using groups as-is");
            grouped
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    info!("🚀 ordbot starting");

    let env_cfg = BotEnv::from_env()?;
    let collections = config::load_collections(&args.collections, &env_cfg)?;
    let active: HashSet<String> = collections
        .iter()
        .map(|c| c.collection_symbol.clone())
        .collect();

    let shutdown = Shutdown::new();

    // Funding wallets.
    let wallets_file = WalletsFile::load(
        &env_cfg.wallet_config_path,
        env_cfg.wallet_passphrase.as_deref(),
    )?;
    let wallets_file = if env_cfg.enable_wallet_rotation {
        wallets_file
    } else {
        restrict_to_single_wallet(wallets_file)
    };
    let wallets = Arc::new(WalletSelector::from_file(
        wallets_file,
        env_cfg.bids_per_minute,
        shutdown.clone(),
    )?);
    info!(
        wallets = wallets.total_wallets(),
        capacity_per_minute = wallets.capacity_per_minute(),
        rotation = env_cfg.enable_wallet_rotation,
        "wallet pool ready"
    );

    // Prior state, loaded before the ready gate opens.
    let history = Arc::new(
        BidHistoryStore::load(&args.bid_history).context("failed to load bid history")?,
    );
    info!(
        active_bids = history.active_bid_count(),
        path = %args.bid_history.display(),
        "bid history loaded"
    );
    for cfg in &collections {
        history.init(&cfg.collection_symbol, cfg.offer_type);
    }

    let pacer = Arc::new(BidPacer::new(
        wallets.capacity_per_minute(),
        shutdown.clone(),
    ));
    let bid_stats = Arc::new(BidStats::default());
    let event_stats = Arc::new(EventStats::default());

    // Marketplace client. Template signing is an external backend; with
    // none wired in, placements run dry and are logged as such.
    let marketplace: Arc<dyn Marketplace> = Arc::new(HttpMarketplace::new(
        &args.api_base_url,
        &env_cfg.api_key,
        env_cfg.rate_limit,
        None,
    )?);

    let receive_policy = if env_cfg.centralize_receive_address {
        match env_cfg.token_receive_address.clone() {
            Some(address) => ReceivePolicy::Centralized(address),
            None => bail!("CENTRALIZE_RECEIVE_ADDRESS=1 requires TOKEN_RECEIVE_ADDRESS"),
        }
    } else {
        ReceivePolicy::WalletOwn
    };

    let ctx = BidContext {
        marketplace,
        pacer: pacer.clone(),
        wallets: wallets.clone(),
        history: history.clone(),
        token_locks: Arc::new(TokenLockMap::new()),
        quantity_locks: Arc::new(QuantityLockMap::new()),
        bid_stats: bid_stats.clone(),
        receive_policy,
        shutdown: shutdown.clone(),
    };

    let events = Arc::new(EventManager::new(
        active.clone(),
        wallets.clone(),
        event_stats.clone(),
    ));
    let schedulers = Arc::new(SchedulerSet::new(collections.clone(), ctx.clone()));
    let counterbid = Arc::new(CounterBidHandler::new(ctx.clone(), collections.clone()));

    // Dispatch workers.
    let worker_count = EventManager::worker_count(wallets.total_wallets());
    {
        let schedulers = schedulers.clone();
        let counterbid = counterbid.clone();
        events::spawn_workers(events.clone(), shutdown.clone(), worker_count, move |item| {
            let schedulers = schedulers.clone();
            let counterbid = counterbid.clone();
            async move {
                match item {
                    WorkItem::Event(event) => counterbid.handle(event).await,
                    WorkItem::ScheduledCycle(symbol) => schedulers.run_cycle(&symbol).await,
                }
            }
        });
    }

    // Persistence: debounced writer plus a periodic maintenance pass.
    tokio::spawn(history.clone().run_writer(shutdown.clone()));
    {
        let history = history.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HISTORY_CLEANUP_INTERVAL) => {}
                    _ = shutdown.wait() => return,
                }
                let (expired, trimmed) = history.cleanup();
                if expired > 0 || trimmed > 0 {
                    info!(expired, trimmed, "bid history maintenance");
                }
            }
        });
    }

    // Push stream.
    let stream_client = Arc::new(PushStreamClient::new(
        &args.stream_ws_url,
        env_cfg.api_key.clone(),
        active.iter().cloned().collect(),
        events.clone(),
        shutdown.clone(),
    ));
    let ws_connected = stream_client.connected_flag();
    {
        let stream_client = stream_client.clone();
        tokio::spawn(async move {
            if let Err(e) = stream_client.run().await {
                error!(error = %e, "push stream client stopped");
            }
        });
    }

    // Prior state is in memory; open the gate, then start the cycles.
    events.set_ready();
    for cfg in &collections {
        spawn_ticker(
            cfg.collection_symbol.clone(),
            cfg.scheduled_loop,
            events.clone(),
            shutdown.clone(),
        );
    }

    let api_port = args.port.unwrap_or(env_cfg.api_port);
    let pid_path = PathBuf::from(".bot.pid");
    if let Some(existing) = PidFile::read(&pid_path) {
        warn!(pid = existing.pid, "stale pid file found, replacing");
    }
    PidFile::current(Some(api_port)).write(&pid_path)?;

    // Ctrl-C flips the process-wide shutdown signal.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.trigger();
            }
        });
    }

    info!(
        collections = collections.len(),
        workers = worker_count,
        pacer_capacity = pacer.capacity(),
        "⚡ engine running"
    );

    // The status server runs until shutdown.
    let api_state = ApiState {
        started_at: Utc::now(),
        bid_stats,
        event_stats,
        pacer,
        wallets,
        history: history.clone(),
        events,
        ws_connected,
    };
    if let Err(e) = api::serve(api_state, api_port, shutdown.clone()).await {
        error!(error = %e, "status API failed");
    }

    // Final persistence, whatever stopped us.
    shutdown.trigger();
    history.force_write().context("final bid history write failed")?;
    PidFile::remove(&pid_path);
    info!("ordbot stopped");
    Ok(())
}
