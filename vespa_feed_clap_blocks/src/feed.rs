//! CLI config for the feed client, dispatcher and circuit breaker

use std::{num::NonZeroUsize, str::FromStr, sync::Arc, time::Duration};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use secrecy::Secret;
use url::Url;
use vespa_feed_client::{Authenticator, BearerToken, ClientOptions, Compression};

/// An extra request header, given as `Name: value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderArg {
    pub name: HeaderName,
    pub value: HeaderValue,
}

impl FromStr for HeaderArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, value) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid header '{s}', expected 'Name: value'"))?;
        let name = HeaderName::from_str(name.trim())
            .map_err(|e| format!("invalid header name in '{s}': {e}"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| format!("invalid header value in '{s}': {e}"))?;
        Ok(Self { name, value })
    }
}

#[derive(Debug, Clone, clap::Parser)]
pub struct FeedClientConfig {
    /// The URL of the document API endpoint to feed to
    #[clap(
        long = "target",
        env = "VESPA_FEED_TARGET",
        default_value = "http://127.0.0.1:8080",
        action
    )]
    pub target: Url,

    /// Number of HTTP connections to the endpoint
    #[clap(
        long = "connections",
        env = "VESPA_FEED_CONNECTIONS",
        default_value = "8",
        action
    )]
    pub connections: NonZeroUsize,

    /// Server-side timeout of each operation
    ///
    /// The client waits somewhat longer than this before giving up on a request.
    #[clap(
        long = "timeout",
        env = "VESPA_FEED_TIMEOUT",
        value_parser = humantime::parse_duration
    )]
    pub timeout: Option<Duration>,

    /// Route to send operations through
    #[clap(long = "route", env = "VESPA_FEED_ROUTE", action)]
    pub route: Option<String>,

    /// Server-side trace level, 0 disables tracing
    #[clap(long = "trace", default_value = "0", action)]
    pub trace: u8,

    /// Request body compression: auto, gzip or none
    #[clap(
        long = "compression",
        env = "VESPA_FEED_COMPRESSION",
        default_value_t = Compression::default(),
        action
    )]
    pub compression: Compression,

    /// Have the server accept operations without applying them
    #[clap(long = "speedtest", action)]
    pub speedtest: bool,

    /// Extra header sent with every request, as `Name: value`; may be repeated
    #[clap(long = "header", action = clap::ArgAction::Append)]
    pub headers: Vec<HeaderArg>,

    /// Bearer token used to authenticate with the endpoint
    #[clap(long = "token", env = "VESPA_FEED_TOKEN")]
    pub token: Option<Secret<String>>,

    /// Number of documents fed concurrently, at most one per document id
    #[clap(
        long = "workers",
        env = "VESPA_FEED_WORKERS",
        default_value = "256",
        action
    )]
    pub workers: NonZeroUsize,

    /// How long operations may keep failing before the feed is considered degraded
    #[clap(
        long = "grace",
        env = "VESPA_FEED_GRACE",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub grace: Duration,

    /// How long operations may keep failing before the feed is aborted, `0s` to never abort
    #[clap(
        long = "doom",
        env = "VESPA_FEED_DOOM",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub doom: Duration,
}

impl FeedClientConfig {
    pub fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for HeaderArg { name, value } in &self.headers {
            headers.append(name.clone(), value.clone());
        }
        headers
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            timeout: self.timeout,
            route: self.route.clone(),
            trace_level: self.trace,
            speedtest: self.speedtest,
            compression: self.compression,
            headers: self.header_map(),
            authenticator: self
                .token
                .clone()
                .map(|token| Arc::new(BearerToken::from(token)) as Arc<dyn Authenticator>),
            ..Default::default()
        }
    }
}
