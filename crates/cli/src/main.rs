use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use rand::Rng;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use rill_core::{
    ChangeEvent, ChangeHandler, FeedClient, FeedCursor, FeedError, HandlerOutcome,
    OperationFilter, OperationKind, ResumeToken, SourceScope, TriggerMetrics,
};
use rill_feed::{ChangeFeedListener, ListenerConfig};
use rill_lease::{LeaseQueue, MemoryLeaseBackend};
use rill_metrics::{spawn_samplers, MetricsProvider, MetricsStore, MetricsStoreConfig};
use rill_scale::{evaluate, target_for, ScaleMonitorConfig, TargetScalerConfig, Vote};

#[derive(Parser, Debug)]
#[command(name = "rillctl", version, about = "Rill change-feed scaling toolkit")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate a scale vote over an explicit pending-count series
    Vote {
        /// Comma-separated pending counts, oldest first, e.g. "500,400,300,200,100"
        samples: String,
        /// Pending work one worker instance is expected to absorb
        #[arg(long = "capacity", default_value_t = 1000)]
        capacity: i64,
        /// Minimum trailing samples required before voting
        #[arg(long = "min-samples", default_value_t = 5)]
        min_samples: usize,
    },
    /// Compute the target worker count for a given amount of pending work
    Target {
        /// Total outstanding work (pending + processing)
        work: i64,
        /// Pending work one worker instance is expected to absorb
        #[arg(long = "capacity", default_value_t = 1000)]
        capacity: i64,
        /// Upper bound on the worker count
        #[arg(long = "max-instances", default_value_t = 3)]
        max_instances: u32,
    },
    /// Run the full pipeline in-process against a synthetic change feed,
    /// printing a vote and a target worker count every sampling period
    Simulate {
        /// How long to run (seconds); Ctrl-C stops early
        #[arg(long = "duration", default_value_t = 30)]
        duration_secs: u64,
        /// Mean events emitted per feed batch
        #[arg(long = "rate", default_value_t = 40)]
        rate: u64,
        /// Simulated handler latency ceiling in milliseconds
        #[arg(long = "handler-ms", default_value_t = 25)]
        handler_ms: u64,
        /// Route events through the in-memory durable lease queue
        #[arg(long = "durable", action = ArgAction::SetTrue)]
        durable: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("RILL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RILL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RILL_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_samples(raw: &str) -> Result<Vec<TriggerMetrics>> {
    let now = chrono::Utc::now();
    raw.split(',')
        .enumerate()
        .map(|(i, tok)| {
            let pending: i64 = tok
                .trim()
                .parse()
                .with_context(|| format!("sample {:?} is not an integer", tok.trim()))?;
            Ok(TriggerMetrics::at(pending, 0, now + chrono::Duration::seconds(i as i64 * 5)))
        })
        .collect()
}

fn vote_label(v: Vote) -> &'static str {
    match v {
        Vote::None => "none",
        Vote::ScaleIn => "scale-in",
        Vote::ScaleOut => "scale-out",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Vote { samples, capacity, min_samples } => {
            let series = parse_samples(&samples)?;
            if min_samples == 0 {
                bail!("--min-samples must be at least 1");
            }
            let cfg = ScaleMonitorConfig {
                max_work_per_instance: capacity,
                min_sample_count: min_samples,
            };
            let vote = evaluate(&series, &cfg);
            match cli.output {
                Output::Human => println!("{}", vote_label(vote)),
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "samples": series.len(),
                        "vote": vote,
                    }))?
                ),
            }
        }
        Commands::Target { work, capacity, max_instances } => {
            let cfg = TargetScalerConfig {
                max_work_per_instance: capacity,
                max_instance_count: max_instances,
            };
            let target = target_for(work, &cfg);
            match cli.output {
                Output::Human => println!("{}", target),
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "work": work,
                        "target_workers": target,
                    }))?
                ),
            }
        }
        Commands::Simulate { duration_secs, rate, handler_ms, durable } => {
            simulate(cli.output, duration_secs, rate, handler_ms, durable).await?;
        }
    }

    Ok(())
}

async fn simulate(
    output: Output,
    duration_secs: u64,
    rate: u64,
    handler_ms: u64,
    durable: bool,
) -> Result<()> {
    let scope = SourceScope::collection("simdb", "events");
    let handler_id = "sim";
    info!(duration_secs, rate, handler_ms, durable, "starting simulation");

    let store = Arc::new(MetricsStore::new(MetricsStoreConfig {
        snapshot_interval: Duration::from_secs(1),
        ..Default::default()
    }));
    let (sampler_cancel, sampler_rx) = watch::channel(false);
    let sampler = spawn_samplers(Arc::clone(&store), sampler_rx);

    let client: Arc<dyn FeedClient> = Arc::new(SyntheticClient::new(rate));
    let handler: Arc<dyn ChangeHandler> = Arc::new(SyntheticHandler { max_delay_ms: handler_ms });
    let cfg = ListenerConfig::new(scope.clone(), handler_id);

    let lease = durable.then(|| {
        Arc::new(LeaseQueue::new(Arc::new(MemoryLeaseBackend::new())))
    });
    let listener = match &lease {
        Some(q) => ChangeFeedListener::with_lease_queue(
            Arc::clone(&client),
            Arc::clone(&handler),
            Arc::clone(&store),
            Arc::clone(q),
            cfg,
        )?,
        None => ChangeFeedListener::new(
            Arc::clone(&client),
            Arc::clone(&handler),
            Arc::clone(&store),
            cfg,
        )?,
    };
    listener.start().await?;

    let mut provider = MetricsProvider::new(Arc::clone(&store), handler_id, scope.clone());
    if let Some(q) = &lease {
        provider = provider.with_lease_queue(Arc::clone(q));
    }
    let monitor_cfg = ScaleMonitorConfig::default();
    let target_cfg = TargetScalerConfig::default();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration_secs);
    let mut report = tokio::time::interval(Duration::from_secs(5));
    report.tick().await;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping simulation");
                break;
            }
            _ = report.tick() => {
                let metrics = provider.get_metrics().await?;
                let history = provider.history();
                let vote = evaluate(&history, &monitor_cfg);
                let total = metrics.pending_events.saturating_add(metrics.processing_events);
                let target = target_for(total, &target_cfg);
                match output {
                    Output::Human => println!(
                        "pending={:<6} processing={:<4} vote={:<9} target={}",
                        metrics.pending_events, metrics.processing_events,
                        vote_label(vote), target
                    ),
                    Output::Json => println!(
                        "{}",
                        serde_json::to_string(&serde_json::json!({
                            "pending": metrics.pending_events,
                            "processing": metrics.processing_events,
                            "vote": vote,
                            "target_workers": target,
                        }))?
                    ),
                }
            }
        }
    }

    listener.stop().await?;
    let _ = sampler_cancel.send(true);
    if let Err(e) = sampler.await {
        warn!(error = %e, "sampler task ended abnormally");
    }
    info!("simulation stopped");
    Ok(())
}

/// Feed client producing an endless stream of synthetic change events with a
/// shared monotonic sequence, so cursors reopened after a simulated resume
/// continue where the feed left off.
struct SyntheticClient {
    rate: u64,
    seq: Arc<AtomicU64>,
}

impl SyntheticClient {
    fn new(rate: u64) -> Self {
        Self { rate, seq: Arc::new(AtomicU64::new(0)) }
    }
}

#[async_trait::async_trait]
impl FeedClient for SyntheticClient {
    async fn open_cursor(
        &self,
        _scope: &SourceScope,
        _filter: OperationFilter,
        _resume_from: Option<&ResumeToken>,
    ) -> Result<Box<dyn FeedCursor>, FeedError> {
        Ok(Box::new(SyntheticCursor { rate: self.rate, seq: Arc::clone(&self.seq) }))
    }
}

struct SyntheticCursor {
    rate: u64,
    seq: Arc<AtomicU64>,
}

#[async_trait::async_trait]
impl FeedCursor for SyntheticCursor {
    async fn next_batch(&mut self) -> Result<Vec<ChangeEvent>, FeedError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let count = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..=self.rate * 2)
        };
        let events = (0..count)
            .map(|_| {
                let n = self.seq.fetch_add(1, Ordering::Relaxed);
                ChangeEvent {
                    document_key: format!("doc-{n}"),
                    operation: OperationKind::Insert,
                    document: serde_json::json!({ "seq": n }),
                    resume_token: ResumeToken::new(serde_json::json!({ "seq": n })),
                }
            })
            .collect();
        Ok(events)
    }
}

/// Handler with random latency and a small synthetic failure rate.
struct SyntheticHandler {
    max_delay_ms: u64,
}

#[async_trait::async_trait]
impl ChangeHandler for SyntheticHandler {
    async fn invoke(&self, event: &ChangeEvent) -> HandlerOutcome {
        let (delay, fail) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(0..=self.max_delay_ms), rng.gen_bool(0.02))
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if fail {
            HandlerOutcome::failed(format!("synthetic failure for {}", event.document_key))
        } else {
            HandlerOutcome::ok()
        }
    }
}
