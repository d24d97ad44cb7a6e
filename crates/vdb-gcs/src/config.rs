//! Connection configuration.
//!
//! This module defines the tunables of a GCS connection: the fragmentation
//! threshold, flow-control limits, the receive queue bound and logging.

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::{GcsError, GcsResult};
use crate::fragment::FRAGMENT_OVERHEAD;
use crate::types::MEMBER_NAME_MAX;

/// Default maximum transport message size in bytes.
pub const DEFAULT_PKT_SIZE: usize = 64500;

/// Default flow-control upper limit (receive queue length).
pub const DEFAULT_FC_UPPER_LIMIT: usize = 16;

/// Default flow-control lower limit (receive queue length).
pub const DEFAULT_FC_LOWER_LIMIT: usize = 8;

/// Default hard limit on the local receive queue.
pub const DEFAULT_RECV_QUEUE_HARD_LIMIT: usize = 1 << 20;

// ============================================================================
// Connection Configuration
// ============================================================================

/// Configuration for a GCS connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    /// Maximum size of one encoded transport message.
    ///
    /// Actions larger than this are fragmented. The effective value is
    /// additionally capped by the transport's own limit.
    pub pkt_size: usize,

    /// Receive queue length above which this member asks the group to pause.
    pub fc_upper_limit: usize,

    /// Receive queue length below which a paused member releases the group.
    pub fc_lower_limit: usize,

    /// Receive queue length at which the connection fails.
    pub recv_queue_hard_limit: usize,

    /// Human-readable node name, published in the state exchange.
    pub node_name: Option<String>,

    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            pkt_size: DEFAULT_PKT_SIZE,
            fc_upper_limit: DEFAULT_FC_UPPER_LIMIT,
            fc_lower_limit: DEFAULT_FC_LOWER_LIMIT,
            recv_queue_hard_limit: DEFAULT_RECV_QUEUE_HARD_LIMIT,
            node_name: None,
            log: LogConfig::default(),
        }
    }
}

impl GcsConfig {
    /// Creates a configuration with small limits, for tests.
    ///
    /// Small packets force fragmentation and small queues exercise flow
    /// control without large payloads.
    pub fn testing() -> Self {
        Self {
            pkt_size: 256,
            fc_upper_limit: 4,
            fc_lower_limit: 2,
            recv_queue_hard_limit: 1024,
            node_name: None,
            log: LogConfig::default(),
        }
    }

    /// Sets the packet size.
    pub fn with_pkt_size(mut self, pkt_size: usize) -> Self {
        self.pkt_size = pkt_size;
        self
    }

    /// Sets the flow-control limits.
    pub fn with_flow_limits(mut self, lower: usize, upper: usize) -> Self {
        self.fc_lower_limit = lower;
        self.fc_upper_limit = upper;
        self
    }

    /// Sets the receive queue hard limit.
    pub fn with_recv_queue_hard_limit(mut self, limit: usize) -> Self {
        self.recv_queue_hard_limit = limit;
        self
    }

    /// Sets the node name.
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    /// Sets the logging configuration.
    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> GcsResult<()> {
        validate_pkt_size(self.pkt_size)?;
        if self.fc_lower_limit >= self.fc_upper_limit {
            return Err(GcsError::Config(format!(
                "fc_lower_limit ({}) must be below fc_upper_limit ({})",
                self.fc_lower_limit, self.fc_upper_limit
            )));
        }
        if self.recv_queue_hard_limit <= self.fc_upper_limit {
            return Err(GcsError::Config(format!(
                "recv_queue_hard_limit ({}) must exceed fc_upper_limit ({})",
                self.recv_queue_hard_limit, self.fc_upper_limit
            )));
        }
        if let Some(name) = &self.node_name {
            if name.len() >= MEMBER_NAME_MAX {
                return Err(GcsError::Config(format!(
                    "node_name longer than {} bytes",
                    MEMBER_NAME_MAX - 1
                )));
            }
        }
        Ok(())
    }
}

/// Checks that a packet size leaves room for fragment payload.
pub(crate) fn validate_pkt_size(pkt_size: usize) -> GcsResult<()> {
    if pkt_size <= FRAGMENT_OVERHEAD {
        return Err(GcsError::Config(format!(
            "pkt_size ({pkt_size}) must exceed fragment overhead ({FRAGMENT_OVERHEAD})"
        )));
    }
    Ok(())
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSink {
    /// Standard error.
    #[default]
    Stderr,
    /// Append to a file.
    File(PathBuf),
    /// Hand each formatted line to an application callback. Not
    /// serializable.
    #[serde(skip)]
    Callback(LogCallback),
}

/// Application handler for log lines, called with the event's level and
/// the formatted line without its trailing newline.
#[derive(Clone)]
pub struct LogCallback(Arc<dyn Fn(Level, &str) + Send + Sync>);

impl LogCallback {
    /// Wraps a handler.
    pub fn new(handler: impl Fn(Level, &str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(handler))
    }

    /// Passes one line to the handler.
    pub fn call(&self, level: Level, line: &str) {
        (self.0)(level, line);
    }
}

impl Debug for LogCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LogCallback(..)")
    }
}

impl PartialEq for LogCallback {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for LogCallback {}

/// Logging configuration, consumed by [`crate::logging::init`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log destination.
    pub sink: LogSink,

    /// Enables debug-level output.
    pub debug: bool,

    /// Prefixes every line with a timestamp.
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            sink: LogSink::Stderr,
            debug: false,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Sends output to a file.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sink = LogSink::File(path.into());
        self
    }

    /// Sends output to an application callback.
    pub fn with_callback(
        mut self,
        handler: impl Fn(Level, &str) + Send + Sync + 'static,
    ) -> Self {
        self.sink = LogSink::Callback(LogCallback::new(handler));
        self
    }

    /// Enables or disables debug output.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Enables or disables timestamps.
    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }
}
