//! Common CLI flags for logging

use tracing_subscriber::{
    EnvFilter,
    fmt::writer::BoxMakeWriter,
    util::{SubscriberInitExt, TryInitError},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to install the global subscriber: {0}")]
    Install(#[from] TryInitError),
}

/// Logs: message format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// human-readable, single line
    #[default]
    Full,
    /// human-readable, multi line
    Pretty,
    /// machine-parseable
    Json,
}

/// Logs: destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogDestination {
    Stdout,
    #[default]
    Stderr,
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,hyper::proto::h1=info` specifies debug logging for all modules
    /// except for the `hyper::proto::h1` module which will only display info
    /// level logging.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter.
    /// Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug,hyper::proto::h1=info,h2=info'
    ///
    /// -vvv 'trace,hyper::proto::h1=info,h2=info'
    #[clap(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        verbatim_doc_comment
    )]
    pub log_verbose_count: u8,

    /// Logs: destination
    ///
    /// Results and stats go to stdout, so logs default to stderr.
    #[clap(
        long = "log-destination",
        env = "LOG_DESTINATION",
        default_value = "stderr",
        value_enum,
        action
    )]
    pub log_destination: LogDestination,

    /// Logs: message format
    #[clap(
        long = "log-format",
        env = "LOG_FORMAT",
        default_value = "full",
        value_enum,
        action
    )]
    pub log_format: LogFormat,
}

impl LoggingConfig {
    /// Filter used when neither `--log-filter` nor `-v` is given
    pub const DEFAULT_LOG_FILTER: &'static str = "warn";

    /// The effective filter; `-v` wins over `--log-filter`, which wins over `default`
    pub fn env_filter(&self, default: &str) -> Result<EnvFilter, Error> {
        let directives = match self.log_verbose_count {
            0 => self.log_filter.as_deref().unwrap_or(default),
            1 => "info",
            2 => "debug,hyper::proto::h1=info,h2=info",
            _ => "trace,hyper::proto::h1=info,h2=info",
        };
        Ok(EnvFilter::try_new(directives)?)
    }

    pub fn install_global_subscriber(&self) -> Result<(), Error> {
        let filter = self.env_filter(Self::DEFAULT_LOG_FILTER)?;
        let writer = match self.log_destination {
            LogDestination::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogDestination::Stderr => BoxMakeWriter::new(std::io::stderr),
        };
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer);
        match self.log_format {
            LogFormat::Full => builder.finish().try_init()?,
            LogFormat::Pretty => builder.pretty().finish().try_init()?,
            LogFormat::Json => builder.json().finish().try_init()?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;

    fn parse(args: &[&str]) -> LoggingConfig {
        LoggingConfig::parse_from(std::iter::once("test").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.log_verbose_count, 0);
        assert_eq!(config.log_format, LogFormat::Full);
        assert_eq!(config.log_destination, LogDestination::Stderr);
        assert_eq!(
            config
                .env_filter(LoggingConfig::DEFAULT_LOG_FILTER)
                .unwrap()
                .to_string(),
            "warn"
        );
    }

    #[test]
    fn verbose_count_overrides_filter() {
        let config = parse(&["--log-filter", "vespa_feed_client=debug"]);
        assert_eq!(
            config.env_filter("warn").unwrap().to_string(),
            "vespa_feed_client=debug"
        );

        let config = parse(&["--log-filter", "vespa_feed_client=debug", "-v"]);
        assert_eq!(config.log_verbose_count, 1);
        assert_eq!(config.env_filter("warn").unwrap().to_string(), "info");

        let config = parse(&["-vvv", "--log-format", "json"]);
        assert_eq!(config.log_verbose_count, 3);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn invalid_filter() {
        let config = parse(&["--log-filter", "vespa_feed_client=loud"]);
        assert!(matches!(
            config.env_filter("warn"),
            Err(Error::InvalidFilter(_))
        ));
    }
}
