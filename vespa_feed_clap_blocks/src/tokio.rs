//! Config for the tokio runtime driving the feed.

use std::{
    num::{NonZeroU32, NonZeroUsize},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

/// Tokio runtime type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TokioRuntimeType {
    /// Current-thread runtime.
    CurrentThread,

    /// Multi-thread runtime.
    #[default]
    MultiThread,
}

/// CLI config for the tokio runtime.
#[derive(Debug, Clone, clap::Parser)]
#[allow(missing_copy_implementations)]
pub struct TokioRuntimeConfig {
    /// Set the maximum number of runtime threads to use.
    ///
    /// Defaults to the number of logical cores on the system.
    #[clap(long = "num-threads", env = "VESPA_FEED_NUM_THREADS", action)]
    pub num_threads: Option<NonZeroUsize>,

    /// Tokio runtime type.
    #[clap(
        long = "runtime-type",
        env = "VESPA_FEED_RUNTIME_TYPE",
        default_value_t = TokioRuntimeType::default(),
        value_enum,
        action
    )]
    pub runtime_type: TokioRuntimeType,

    /// Sets the number of scheduler ticks after which the scheduler will poll for external
    /// events (timers, I/O, and so on).
    #[clap(
        long = "runtime-event-interval",
        env = "VESPA_FEED_RUNTIME_EVENT_INTERVAL",
        action
    )]
    pub event_interval: Option<NonZeroU32>,

    /// Specifies the limit for additional threads spawned by the runtime.
    #[clap(
        long = "runtime-max-blocking-threads",
        env = "VESPA_FEED_RUNTIME_MAX_BLOCKING_THREADS",
        action
    )]
    pub max_blocking_threads: Option<NonZeroUsize>,

    /// Sets a custom timeout for a thread in the blocking pool.
    #[clap(
        long = "runtime-thread-keep-alive",
        env = "VESPA_FEED_RUNTIME_THREAD_KEEP_ALIVE",
        value_parser = humantime::parse_duration
    )]
    pub thread_keep_alive: Option<Duration>,
}

impl TokioRuntimeConfig {
    /// Creates the tokio runtime builder.
    pub fn builder(&self) -> Result<::tokio::runtime::Builder, std::io::Error> {
        // NOTE: no log macros will work here!
        //
        // The subscriber is installed from within the runtime built here, so use
        // eprintln!() instead.

        let mut builder = match self.runtime_type {
            TokioRuntimeType::CurrentThread => ::tokio::runtime::Builder::new_current_thread(),
            TokioRuntimeType::MultiThread => ::tokio::runtime::Builder::new_multi_thread(),
        };

        builder.enable_time();
        builder.enable_io();

        let thread_counter = Arc::new(AtomicUsize::new(1));
        builder.thread_name_fn(move || {
            format!(
                "vespa-feed-{}",
                thread_counter.fetch_add(1, Ordering::SeqCst)
            )
        });

        let num_threads = match self.num_threads {
            None => std::thread::available_parallelism()?,
            Some(n) => n,
        };
        builder.worker_threads(num_threads.get());

        if let Some(x) = self.event_interval {
            builder.event_interval(x.get());
        }

        if let Some(x) = self.max_blocking_threads {
            builder.max_blocking_threads(x.get());
        }

        if let Some(x) = self.thread_keep_alive {
            builder.thread_keep_alive(x);
        }

        Ok(builder)
    }
}
