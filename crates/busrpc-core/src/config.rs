//! Server, client and per-request configuration.

use crate::info::RequestInfo;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default time a client waits for a response or a stream peer for an ack.
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Default buffer size of every bus subscription.
pub const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Default window during which a client collects claims.
pub const DEFAULT_AFFINITY_TIMEOUT_MS: u64 = 1000;

/// Default delay after which the best claim so far is accepted.
pub const DEFAULT_SHORT_CIRCUIT_TIMEOUT_MS: u64 = 200;

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Ack timeout of server-side streams, in milliseconds.
    pub timeout_ms: u64,
    /// Subscription buffer size.
    pub channel_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            channel_size: DEFAULT_CHANNEL_SIZE,
        }
    }
}

impl ServerConfig {
    /// `timeout_ms` as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Set the timeout, saturating at `u64::MAX` milliseconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = saturating_millis(timeout);
        self
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default request timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Subscription buffer size.
    pub channel_size: usize,
    /// Subscribe to the stream fan-in channel.
    pub enable_streams: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            channel_size: DEFAULT_CHANNEL_SIZE,
            enable_streams: false,
        }
    }
}

impl ClientConfig {
    /// `timeout_ms` as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Set the timeout, saturating at `u64::MAX` milliseconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = saturating_millis(timeout);
        self
    }

    /// Subscribe to stream frames so `open_stream` can be used.
    pub fn with_streams(mut self) -> Self {
        self.enable_streams = true;
        self
    }
}

/// How a client picks one server among the claims it receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Claims below this affinity are ignored.
    pub minimum_affinity: f32,
    /// A claim at or above this affinity wins at once (0 disables).
    pub maximum_affinity: f32,
    /// Take the first eligible claim.
    pub accept_first_available: bool,
    /// Length of the claim window, in milliseconds.
    pub affinity_timeout_ms: u64,
    /// After this delay the best claim so far wins (0 disables).
    pub short_circuit_timeout_ms: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            minimum_affinity: 0.0,
            maximum_affinity: 0.0,
            accept_first_available: false,
            affinity_timeout_ms: DEFAULT_AFFINITY_TIMEOUT_MS,
            short_circuit_timeout_ms: DEFAULT_SHORT_CIRCUIT_TIMEOUT_MS,
        }
    }
}

impl SelectionConfig {
    /// Selection used when a call does not override it: affinity-routed
    /// methods weigh claims, others take the first server that answers.
    pub fn for_method(info: &RequestInfo) -> Self {
        if info.affinity_enabled {
            Self::default()
        } else {
            Self {
                accept_first_available: true,
                ..Self::default()
            }
        }
    }

    /// Length of the claim window.
    pub fn affinity_timeout(&self) -> Duration {
        Duration::from_millis(self.affinity_timeout_ms)
    }

    pub fn short_circuit_timeout(&self) -> Option<Duration> {
        (self.short_circuit_timeout_ms > 0)
            .then(|| Duration::from_millis(self.short_circuit_timeout_ms))
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub selection: Option<SelectionConfig>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout, saturating at `u64::MAX` milliseconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override how the server is picked for this call.
    pub fn with_selection(mut self, selection: SelectionConfig) -> Self {
        self.selection = Some(selection);
        self
    }

    /// Effective timeout given the client default.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    /// Effective selection given the method's routing flags.
    pub fn selection_for(&self, info: &RequestInfo) -> SelectionConfig {
        self.selection
            .clone()
            .unwrap_or_else(|| SelectionConfig::for_method(info))
    }
}
