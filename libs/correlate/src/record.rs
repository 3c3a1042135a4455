//! Inbound request records and the loggers that consume them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Snapshot of one inbound webhook request.
///
/// Records are built once by the receiver and never mutated; the header map
/// is a deep copy of what the transport delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRecord {
    /// Remote peer address (with port), empty when unknown.
    pub remote_addr: String,

    /// HTTP method.
    pub method: String,

    /// Protocol version, e.g. `HTTP/1.1`.
    pub proto: String,

    /// Request target as received.
    pub raw_url: String,

    /// Header names (lowercase) to all of their values, in arrival order.
    pub headers: BTreeMap<String, Vec<String>>,

    /// Request body.
    pub body: String,

    /// When the receiver finished reading the request.
    pub received_at: DateTime<Utc>,
}

impl InboundRecord {
    /// A record carrying only a method and a body, stamped now.
    pub fn new(method: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            remote_addr: String::new(),
            method: method.into(),
            proto: String::new(),
            raw_url: String::new(),
            headers: BTreeMap::new(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    /// First value of a header, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Parse the body as JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Sink for inbound records.
///
/// Implementations must not block: the receiver calls `record` on its
/// request path and always answers the peer afterwards.
pub trait RequestLogger: Send + Sync {
    /// Consume one record.
    fn record(&self, record: InboundRecord);
}

impl<L: RequestLogger + ?Sized> RequestLogger for Arc<L> {
    fn record(&self, record: InboundRecord) {
        (**self).record(record)
    }
}

/// Logs every record at info level and drops it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl RequestLogger for TracingLogger {
    fn record(&self, record: InboundRecord) {
        info!(
            remote_addr = %record.remote_addr,
            method = %record.method,
            url = %record.raw_url,
            body_len = record.body.len(),
            received_at = %record.received_at.to_rfc3339(),
            "Inbound request"
        );
    }
}

/// Forwards records into a bounded channel, dropping them when the channel
/// is full or closed.
#[derive(Debug, Clone)]
pub struct ChannelLogger {
    tx: mpsc::Sender<InboundRecord>,
}

impl ChannelLogger {
    /// Create a logger that forwards into `tx`.
    pub fn new(tx: mpsc::Sender<InboundRecord>) -> Self {
        Self { tx }
    }
}

impl RequestLogger for ChannelLogger {
    fn record(&self, record: InboundRecord) {
        if let Err(e) = self.tx.try_send(record) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    debug!("Channel full, dropping inbound request")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!("Channel closed, dropping inbound request")
                }
            }
        }
    }
}
