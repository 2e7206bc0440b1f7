use std::{fmt::Display, sync::Arc, time::Duration};

use vespa_feed_document::DocumentId;

use crate::Error;

/// Outcome classification of a single operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation was applied
    Success,
    /// The test-and-set condition did not match; a valid outcome that must not be retried
    ConditionNotMet,
    /// The backend is overloaded or unavailable (HTTP 502, 504 or 507)
    VespaFailure,
    /// Network failure, unreadable response, or an unrecognized HTTP status
    TransportFailure,
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::ConditionNotMet => write!(f, "condition-not-met"),
            Self::VespaFailure => write!(f, "vespa-failure"),
            Self::TransportFailure => write!(f, "transport-failure"),
        }
    }
}

/// The result of sending one operation
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub id: DocumentId,
    pub status: Status,
    /// HTTP status of the response, `0` if no response was received
    pub http_status: u16,
    pub message: String,
    pub trace: String,
    pub latency: Duration,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub error: Option<Arc<Error>>,
}

impl OperationResult {
    /// An empty result for `id`, classified as a transport failure until a response says
    /// otherwise
    pub fn new(id: DocumentId) -> Self {
        Self {
            id,
            status: Status::TransportFailure,
            http_status: 0,
            message: String::new(),
            trace: String::new(),
            latency: Duration::ZERO,
            bytes_sent: 0,
            bytes_recv: 0,
            error: None,
        }
    }

    pub fn with_status(mut self, status: Status, http_status: u16) -> Self {
        self.status = status;
        self.http_status = http_status;
        self
    }

    pub fn with_error(mut self, error: Error) -> Self {
        self.status = Status::TransportFailure;
        self.error = Some(Arc::new(error));
        self
    }

    /// True if the operation reached a final, non-retryable outcome
    pub fn success(&self) -> bool {
        matches!(self.status, Status::Success | Status::ConditionNotMet)
    }

    /// True for the failures that count against a circuit breaker
    pub fn is_failure(&self) -> bool {
        matches!(self.status, Status::VespaFailure | Status::TransportFailure)
    }

    /// The server asked us to slow down
    pub fn is_throttled(&self) -> bool {
        matches!(self.http_status, 429 | 503)
    }
}

impl Display for OperationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} status={} http_status={} latency={:?}",
            self.id, self.status, self.http_status, self.latency
        )?;
        if !self.message.is_empty() {
            write!(f, " message={:?}", self.message)?;
        }
        if let Some(error) = &self.error {
            write!(f, " error=\"{error}\"")?;
        }
        Ok(())
    }
}
