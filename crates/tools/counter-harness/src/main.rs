//! CLI harness for exercising a counter session against a live node
//!
//! This tool allows testing:
//! - Value and activity synchronization (`watch`)
//! - Write submission and confirmation tracking (`increment`, `decrement`)
//! - One-shot activity reconstruction (`activity`)

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use counter_params::{short_address, Network, NetworkType, DEFAULT_BACKEND_URL};
use counter_sync::{
    init_logging, ActivityEntry, ActivityReconstructor, Address, AppConfig, CancelToken,
    ConfigLoader, CounterSession, DecrementOutcome, HttpConfigSource, JsonRpcLedger, Lifecycle,
    NodeWallet, PendingTransaction, RetryConfig, SessionLogger, SessionSnapshot, SyncConfig,
    ViewState,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "counter-harness")]
#[command(about = "Counter dApp synchronization harness", long_about = None)]
struct Cli {
    /// Emit JSON logs
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Endpoints {
    /// Network the contract is deployed on (localhost, base-sepolia)
    #[arg(short, long, default_value = "localhost")]
    network: NetworkType,

    /// JSON-RPC endpoint of the node; defaults to the network's public endpoint
    #[arg(short, long)]
    rpc: Option<String>,

    /// Backend serving /api/config
    #[arg(short, long, default_value = DEFAULT_BACKEND_URL)]
    backend: String,

    /// Seconds to wait for configuration and the first read
    #[arg(long, default_value = "30")]
    startup_timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the counter value and activity feed
    Watch {
        #[command(flatten)]
        endpoints: Endpoints,

        /// Stop after N seconds
        #[arg(short, long, default_value = "60")]
        seconds: u64,
    },

    /// Submit an increment and wait for confirmation
    Increment {
        #[command(flatten)]
        endpoints: Endpoints,
    },

    /// Submit a decrement and wait for confirmation
    Decrement {
        #[command(flatten)]
        endpoints: Endpoints,

        /// Submit even if the counter is at zero
        #[arg(short, long)]
        force: bool,
    },

    /// Reconstruct and print the activity feed once
    Activity {
        /// Network the contract is deployed on (localhost, base-sepolia)
        #[arg(short, long, default_value = "localhost")]
        network: NetworkType,

        /// JSON-RPC endpoint of the node; defaults to the network's public endpoint
        #[arg(short, long)]
        rpc: Option<String>,

        /// Contract address; read from the backend when omitted
        #[arg(short, long)]
        contract: Option<String>,

        /// Backend serving /api/config
        #[arg(short, long, default_value = DEFAULT_BACKEND_URL)]
        backend: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);

    match cli.command {
        Commands::Watch { endpoints, seconds } => run_watch(endpoints, seconds).await?,
        Commands::Increment { endpoints } => run_increment(endpoints).await?,
        Commands::Decrement { endpoints, force } => run_decrement(endpoints, force).await?,
        Commands::Activity {
            network,
            rpc,
            contract,
            backend,
        } => {
            let rpc = rpc_url(network, rpc);
            run_activity(rpc, contract, backend).await?
        }
    }

    Ok(())
}

struct Harness {
    session: CounterSession,
    cancel: CancelToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.session.shutdown();
    }
}

/// Explicit endpoint, or the selected network's default
fn rpc_url(network: NetworkType, rpc: Option<String>) -> String {
    rpc.unwrap_or_else(|| Network::from_type(network).rpc_url.to_string())
}

fn config_source(backend: &str) -> anyhow::Result<HttpConfigSource> {
    let fallback = AppConfig::from_env().context("invalid environment fallback")?;
    Ok(HttpConfigSource::new(backend).with_fallback(fallback))
}

/// Build a session, load configuration, connect the node wallet, and wait
/// until the first value is known
async fn connect(endpoints: &Endpoints) -> anyhow::Result<Harness> {
    let network = Network::from_type(endpoints.network);
    let rpc = rpc_url(endpoints.network, endpoints.rpc.clone());
    info!("Network: {} (chain {})", network.label, network.chain_id);
    info!("Node: {}", rpc);
    info!("Backend: {}", endpoints.backend);

    let config = SyncConfig::default();
    let ledger = Arc::new(JsonRpcLedger::new(rpc.as_str(), config.clone())?);
    let wallet = Arc::new(NodeWallet::new(&rpc)?);
    let logger = Arc::new(SessionLogger::new(config.log_history_cap));
    let session = CounterSession::with_logger(ledger, wallet, config, logger);

    let loader = Arc::new(ConfigLoader::new(
        Arc::new(config_source(&endpoints.backend)?),
        RetryConfig::default(),
    ));
    session.attach_config(loader.subscribe());
    let cancel = CancelToken::new();
    {
        let loader = loader.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { loader.run(&cancel).await });
    }
    let harness = Harness { session, cancel };

    harness
        .session
        .sync_wallet()
        .await
        .context("querying node accounts")?;

    let mut snapshots = harness.session.subscribe_snapshots();
    let wait = snapshots.wait_for(|s| match s.view() {
        ViewState::Ready => s.value.is_some(),
        ViewState::NotConfigured | ViewState::WrongNetwork { .. } => true,
        _ => false,
    });
    let snapshot = tokio::time::timeout(Duration::from_secs(endpoints.startup_timeout), wait)
        .await
        .map_err(|_| {
            anyhow!(
                "session not ready after {}s ({:?})",
                endpoints.startup_timeout,
                harness.session.snapshot().view()
            )
        })??
        .clone();

    match snapshot.view() {
        ViewState::NotConfigured => bail!("backend reports no deployed contract"),
        ViewState::WrongNetwork {
            active,
            expected,
            label,
        } => bail!(
            "node is on chain {}, contract expects chain {} ({})",
            active,
            expected,
            label
        ),
        _ => {}
    }
    if let Some(config) = snapshot.config.ready() {
        if config.chain_id != network.chain_id {
            warn!(
                "Backend reports chain {} but --network selects {} (chain {})",
                config.chain_id, network.label, network.chain_id
            );
        }
        if let (Some(contract), Ok(deployed)) = (
            config.contract_address,
            Network::from_chain_id(config.chain_id),
        ) {
            info!("Contract {} on {}", contract, deployed.label);
            if let Some(url) = deployed.explorer_address_url(&contract.to_string()) {
                info!("Explorer: {}", url);
            }
        }
    }
    Ok(harness)
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    let value = snapshot
        .value
        .map_or_else(|| "?".to_string(), |v| v.to_string());
    let busy = if snapshot.busy() { " (pending)" } else { "" };
    println!("count = {}{}", value, busy);
    print_feed(&snapshot.feed);
}

fn print_feed(feed: &[ActivityEntry]) {
    if feed.is_empty() {
        println!("  no recent activity");
        return;
    }
    for entry in feed {
        let account = entry
            .account
            .map_or_else(|| "unknown".to_string(), |a| short_address(&a.to_string()));
        let time = entry
            .timestamp
            .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
        println!(
            "  #{:<8} {:<9} -> {:<6} by {:<13} at {}",
            entry.block_number, entry.kind, entry.resulting_value, account, time
        );
    }
}

async fn run_watch(endpoints: Endpoints, seconds: u64) -> anyhow::Result<()> {
    let harness = connect(&endpoints).await?;
    let mut snapshots = harness.session.subscribe_snapshots();
    let mut last = snapshots.borrow_and_update().clone();
    print_snapshot(&last);

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot.value != last.value || snapshot.feed != last.feed || snapshot.busy() != last.busy() {
                    print_snapshot(&snapshot);
                }
                last = snapshot;
            }
        }
    }

    info!(
        "Watched for {}s, {} session events recorded",
        seconds,
        harness.session.logger().len()
    );
    Ok(())
}

async fn track(mut tx: PendingTransaction) -> anyhow::Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(format!("{} {} pending", tx.kind(), tx.id()));

    match tx.settled().await {
        Lifecycle::Confirmed { block_number } => {
            pb.finish_with_message(format!("{} confirmed in block {}", tx.kind(), block_number));
            Ok(())
        }
        Lifecycle::Failed { error, .. } => {
            pb.abandon_with_message(format!("{} failed", tx.kind()));
            Err(anyhow!(error))
        }
        other => Err(anyhow!("tracking ended in state {:?}", other)),
    }
}

async fn run_increment(endpoints: Endpoints) -> anyhow::Result<()> {
    let harness = connect(&endpoints).await?;
    let tx = harness.session.increment().await?;
    track(tx).await?;
    print_snapshot(&harness.session.snapshot());
    Ok(())
}

async fn run_decrement(endpoints: Endpoints, force: bool) -> anyhow::Result<()> {
    let harness = connect(&endpoints).await?;
    let tx = match harness.session.decrement().await? {
        DecrementOutcome::Submitted(tx) => tx,
        DecrementOutcome::Warned(warning) if force => {
            warn!("{}", warning.reason);
            harness
                .session
                .proceed_anyway()
                .await?
                .ok_or_else(|| anyhow!("warning cleared before submission"))?
        }
        DecrementOutcome::Warned(warning) => {
            harness.session.dismiss_warning();
            bail!("{} (use --force to submit anyway)", warning.reason);
        }
    };
    track(tx).await?;
    print_snapshot(&harness.session.snapshot());
    Ok(())
}

async fn run_activity(rpc: String, contract: Option<String>, backend: String) -> anyhow::Result<()> {
    let contract: Address = match contract {
        Some(raw) => raw.parse()?,
        None => {
            let loader = ConfigLoader::new(Arc::new(config_source(&backend)?), RetryConfig::default());
            let config = loader
                .run(&CancelToken::new())
                .await
                .ok_or_else(|| anyhow!("configuration unavailable"))?;
            config
                .contract_address
                .ok_or_else(|| anyhow!("backend reports no deployed contract"))?
        }
    };

    let config = SyncConfig::default();
    let ledger = Arc::new(JsonRpcLedger::new(rpc, config.clone())?);
    let activity = ActivityReconstructor::new(ledger, config, Arc::new(SessionLogger::default()));
    activity.rescan(contract).await?;

    println!("Recent activity for {}", contract);
    print_feed(&activity.feed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_defaults_to_selected_network() {
        let cli = Cli::parse_from(["counter-harness", "increment", "--network", "base-sepolia"]);
        let Commands::Increment { endpoints } = cli.command else {
            panic!("expected increment");
        };
        assert_eq!(endpoints.network, NetworkType::BaseSepolia);
        assert_eq!(
            rpc_url(endpoints.network, endpoints.rpc),
            "https://sepolia.base.org"
        );
    }

    #[test]
    fn test_explicit_rpc_wins() {
        let cli = Cli::parse_from([
            "counter-harness",
            "activity",
            "--rpc",
            "http://10.0.0.2:8545",
        ]);
        let Commands::Activity { network, rpc, .. } = cli.command else {
            panic!("expected activity");
        };
        assert_eq!(network, NetworkType::Localhost);
        assert_eq!(rpc_url(network, rpc), "http://10.0.0.2:8545");
    }

    #[test]
    fn test_unknown_network_rejected() {
        assert!(Cli::try_parse_from(["counter-harness", "watch", "--network", "mainnet"]).is_err());
    }
}
