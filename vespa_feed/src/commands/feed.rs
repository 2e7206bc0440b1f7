use std::{
    fs::File,
    io::{BufRead, BufReader},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use tokio::sync::{Notify, mpsc};
use tracing::{info, warn};
use vespa_feed_clap_blocks::{feed::FeedClientConfig, logging::LoggingConfig};
use vespa_feed_client::{
    CircuitBreaker, CircuitState, Dispatcher, FeedClient, Feeder, OperationResult, Stats,
    StatsCollector, Throttler,
};
use vespa_feed_document::{Decoder, Document};
use vespa_feed_time::{SystemProvider, TimeProvider};

/// Documents decoded ahead of the dispatcher
const DECODE_BUFFER: usize = 1024;

#[derive(Debug, Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    feed_config: FeedClientConfig,

    /// File to read the feed from, `-` for stdin
    ///
    /// Either a JSON array of operations, or a stream of JSON operation objects.
    #[clap(value_name = "FILE", default_value = "-")]
    file: String,

    /// Print the outcome of every operation, not just the failures
    #[clap(long = "verbose-results", action)]
    verbose_results: bool,
}

pub(crate) async fn command(config: Config) -> Result<(), anyhow::Error> {
    let Config {
        feed_config,
        file,
        verbose_results,
        ..
    } = config;

    let input: Box<dyn BufRead + Send> = if file == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let f = File::open(&file).with_context(|| format!("failed to open {file}"))?;
        Box::new(BufReader::new(f))
    };

    let FeedOutcome { stats, error } = feed(input, &feed_config, verbose_results).await?;
    println!("{}", serde_json::to_string_pretty(&stats.to_json())?);

    if let Some(e) = error {
        return Err(e);
    }
    if stats.unsuccessful() > 0 {
        anyhow::bail!(
            "{} of {} operations failed",
            stats.unsuccessful(),
            stats.responses + stats.errors
        );
    }
    Ok(())
}

#[derive(Debug)]
struct FeedOutcome {
    stats: Stats,
    /// Why the feed stopped before the end of the input, if it did
    error: Option<anyhow::Error>,
}

/// Feed every document decoded from `input`, pacing on the throttler and stopping early if
/// the circuit breaker opens
async fn feed<R>(
    input: R,
    feed_config: &FeedClientConfig,
    verbose_results: bool,
) -> Result<FeedOutcome, anyhow::Error>
where
    R: BufRead + Send + 'static,
{
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
    let client = FeedClient::connect(
        feed_config.target.as_str(),
        feed_config.connections.get(),
        feed_config.client_options(),
    )
    .context("failed to create feed client")?;
    let throttler = Arc::new(Throttler::new(
        client.connections(),
        Arc::clone(&time_provider),
    ));
    let breaker = Arc::new(CircuitBreaker::new(
        feed_config.grace,
        feed_config.doom,
        Arc::clone(&time_provider),
    ));
    let feeder = Arc::new(ObservedFeeder {
        client,
        throttler: Arc::clone(&throttler),
        breaker: Arc::clone(&breaker),
        inflight: AtomicI64::new(0),
    });

    let stats = Arc::new(StatsCollector::new());
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::builder(feeder as _)
        .workers(feed_config.workers.get())
        .stats(Arc::clone(&stats))
        .results(results_tx)
        .start()?;

    let pending = Arc::new(Pending::default());
    let printer = tokio::spawn(print_results(
        results_rx,
        Arc::clone(&pending),
        verbose_results,
    ));

    let (documents_tx, mut documents_rx) = mpsc::channel(DECODE_BUFFER);
    let reader = tokio::task::spawn_blocking(move || {
        for document in Decoder::new(input) {
            // the feed loop stopped early
            if documents_tx.blocking_send(document).is_err() {
                break;
            }
        }
    });

    let mut error = None;
    let mut state = CircuitState::Closed;
    while let Some(document) = documents_rx.recv().await {
        let document = match document {
            Ok(document) => document,
            Err(e) => {
                error = Some(anyhow::Error::new(e).context("failed to decode feed"));
                break;
            }
        };

        let current = breaker.state();
        if current != state {
            warn!(from = %state, to = %current, "circuit breaker changed state");
            state = current;
        }
        if state == CircuitState::Open {
            error = Some(anyhow!(
                "operations kept failing for more than {}, aborting feed",
                humantime::format_duration(feed_config.doom)
            ));
            break;
        }

        pending
            .wait_below(|| throttler.target_inflight())
            .await;
        pending.count.fetch_add(1, Ordering::SeqCst);
        dispatcher.enqueue(document).await?;
    }
    drop(documents_rx);

    dispatcher.close().await?;
    // releases the results channel
    drop(dispatcher);
    printer.await?;
    reader.await?;

    let stats = stats.snapshot();
    info!(
        ok = stats.successes(),
        failed = stats.unsuccessful(),
        "feed finished"
    );
    Ok(FeedOutcome { stats, error })
}

/// Sends through the client while keeping the throttler and circuit breaker informed
#[derive(Debug)]
struct ObservedFeeder {
    client: FeedClient,
    throttler: Arc<Throttler>,
    breaker: Arc<CircuitBreaker>,
    inflight: AtomicI64,
}

#[async_trait]
impl Feeder for ObservedFeeder {
    async fn send(&self, document: &Document) -> OperationResult {
        self.throttler.sent();
        let inflight = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self.client.send(document).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        self.throttler.observe(&result, inflight);
        self.breaker.observe(&result);
        result
    }
}

/// Operations enqueued but not yet finalized
#[derive(Debug, Default)]
struct Pending {
    count: AtomicI64,
    notify: Notify,
}

impl Pending {
    async fn wait_below(&self, target: impl Fn() -> i64 + Send) {
        loop {
            // registered before the check, so a finish in between still wakes us
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count.load(Ordering::SeqCst) < target() {
                return;
            }
            notified.await;
        }
    }

    fn finished(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

async fn print_results(
    mut results: mpsc::UnboundedReceiver<OperationResult>,
    pending: Arc<Pending>,
    verbose: bool,
) {
    while let Some(result) = results.recv().await {
        pending.finished();
        if !result.success() {
            warn!(%result, "operation failed");
        }
        if verbose {
            let mut line = json!({
                "id": result.id.to_string(),
                "status": result.status.to_string(),
                "http_status": result.http_status,
                "latency_ms": result.latency.as_millis() as u64,
            });
            if !result.message.is_empty() {
                line["message"] = json!(result.message);
            }
            if !result.trace.is_empty() {
                line["trace"] = json!(result.trace);
            }
            if let Some(error) = &result.error {
                line["error"] = json!(error.to_string());
            }
            println!("{line}");
        }
    }
}
