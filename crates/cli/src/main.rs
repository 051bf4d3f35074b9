use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kmirror_core::{ListerWatcher, Resource, WatchConfig};
use kmirror_informer::{new_informer, HandlerFns};
use kmirror_kubehub::{ClientOptions, KubeListerWatcher, Reflector};
use kmirror_store::Store;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kmirrorctl", version, about = "kmirror CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Path to a kubeconfig file
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    /// API server URL, used when no kubeconfig is given
    #[arg(long = "master-url", global = true)]
    master_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// One-shot list of a GVK
    List {
        /// GVK key, e.g. "v1/Pod" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
    /// Mirror a GVK into a local store and print its keys periodically
    Reflect {
        gvk: String,
        #[command(flatten)]
        ticks: Ticks,
    },
    /// Run an informer and log add/update/delete notifications
    Inform {
        gvk: String,
        #[command(flatten)]
        ticks: Ticks,
        /// Forced re-list period in seconds (0 disables)
        #[arg(long = "resync", env = "KMIRROR_RESYNC_SECS")]
        resync: Option<u64>,
        /// Keep retrying failed deliveries instead of dropping after one retry
        #[arg(long = "retry-on-error", action = ArgAction::SetTrue)]
        retry_on_error: bool,
    },
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct Ticks {
    /// Seconds between store dumps
    #[arg(long = "interval", default_value_t = 5)]
    interval: u64,
    /// Stop after this many dumps (0 runs until Ctrl-C)
    #[arg(long = "rounds", default_value_t = 0)]
    rounds: u64,
}

fn init_tracing() {
    let env = std::env::var("KMIRROR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KMIRROR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KMIRROR_METRICS_ADDR; expected host:port");
        }
    }
}

fn text<'a>(obj: &'a Resource, path: &str) -> &'a str {
    obj.field(path).and_then(|v| v.as_str()).unwrap_or("-")
}

fn phase(obj: &Resource) -> &str {
    text(obj, "status.phase")
}

fn print_objects(output: Output, resource_version: &str, items: &[Resource]) -> Result<()> {
    match output {
        Output::Human => {
            println!("resourceVersion: {resource_version}");
            println!("count: {}", items.len());
            for obj in items {
                println!("{:<40} {:<10} {}", obj.key.to_string(), phase(obj), text(obj, "status.hostIP"));
            }
        }
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Listing<'a> {
                resource_version: &'a str,
                items: &'a [Resource],
            }
            println!("{}", serde_json::to_string_pretty(&Listing { resource_version, items })?);
        }
    }
    Ok(())
}

fn print_keys(output: Output, round: u64, store: &Store) -> Result<()> {
    let keys = store.list_keys();
    match output {
        Output::Human => {
            println!("--- round {round}: {} objects (rv {})", keys.len(), store.last_sync_resource_version());
            for k in &keys {
                println!("{k}");
            }
        }
        Output::Json => {
            let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
            println!("{}", serde_json::json!({ "round": round, "keys": keys }));
        }
    }
    Ok(())
}

/// Dump `store` every tick until Ctrl-C or `ticks.rounds` dumps, then cancel
/// `token`.
async fn tick_until_done(output: Output, ticks: Ticks, store: &Store, token: &CancellationToken) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(ticks.interval.max(1)));
    interval.tick().await;
    let mut round = 0u64;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                round += 1;
                print_keys(output, round, store)?;
                if ticks.rounds > 0 && round >= ticks.rounds {
                    info!(rounds = round, "round limit reached");
                    break;
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down");
                break;
            }
            _ = token.cancelled() => break,
        }
    }
    token.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let opts = ClientOptions { kubeconfig: cli.kubeconfig.clone(), master_url: cli.master_url.clone() };
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let client = kmirror_kubehub::client(&opts).await?;
            let resources = kmirror_kubehub::discover(client).await.context("discovery failed")?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {}", r.gvk_key(), scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::List { gvk } => {
            info!(gvk = %gvk, ns = ?ns, "list invoked");
            let config = WatchConfig::from_env();
            let client = kmirror_kubehub::client(&opts).await?;
            let source = KubeListerWatcher::new(client, &gvk, ns).await?;
            let list = source.list(&config.selector).await.with_context(|| format!("listing {gvk}"))?;
            print_objects(cli.output, &list.resource_version, &list.items)?;
        }
        Commands::Reflect { gvk, ticks } => {
            info!(gvk = %gvk, ns = ?ns, "reflect invoked");
            let config = WatchConfig::from_env();
            let client = kmirror_kubehub::client(&opts).await?;
            let source = Arc::new(KubeListerWatcher::new(client, &gvk, ns).await?);
            let kind = source.kind().to_string();
            let store = Arc::new(Store::new());
            let reflector = Reflector::new(&gvk, source, store.clone(), &config).with_expected_kind(&kind);
            let token = CancellationToken::new();
            let task = tokio::spawn(reflector.run(token.clone()));

            tick_until_done(cli.output, ticks, &store, &token).await?;
            if let Err(e) = task.await {
                error!(error = %e, "reflector task failed");
            }
        }
        Commands::Inform { gvk, ticks, resync, retry_on_error } => {
            let mut config = WatchConfig::from_env();
            if let Some(secs) = resync {
                config.resync_period = Duration::from_secs(secs);
            }
            config.retry_on_error |= retry_on_error;
            info!(gvk = %gvk, ns = ?ns, resync = ?config.resync_period, retry_on_error = config.retry_on_error, "inform invoked");

            let client = kmirror_kubehub::client(&opts).await?;
            let source = Arc::new(KubeListerWatcher::new(client, &gvk, ns).await?);
            let kind = source.kind().to_string();
            let handler = HandlerFns::new()
                .on_add(|obj| info!(key = %obj.key, phase = phase(obj), "OnAdd"))
                .on_update(|old, new| {
                    info!(key = %new.key, old_phase = phase(old), new_phase = phase(new), rv = %new.resource_version, "OnUpdate")
                })
                .on_delete(|obj| info!(key = %obj.key, phase = phase(obj), "OnDelete"))
                .on_sync(|obj| debug!(key = %obj.key, rv = %obj.resource_version, "OnSync"));
            let (store, informer) = new_informer(&gvk, source, handler, config);
            let informer = Arc::new(informer.with_expected_kind(&kind));
            let token = CancellationToken::new();
            let task = {
                let informer = informer.clone();
                let token = token.clone();
                tokio::spawn(async move { informer.run(token).await })
            };

            tokio::select! {
                synced = informer.wait_for_sync(&token) => {
                    if synced {
                        info!(objects = store.len(), "informer synced");
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("Ctrl-C received before sync; shutting down");
                    token.cancel();
                }
            }
            tick_until_done(cli.output, ticks, &store, &token).await?;
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "informer failed"),
                Err(e) => error!(error = %e, "informer task failed"),
            }
        }
    }

    Ok(())
}
