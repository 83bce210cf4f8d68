//! Service and method metadata.
//!
//! A [`ServiceDefinition`] is built once per server or client instance and
//! shared by all of its handlers. [`RequestInfo`] is derived per call and
//! knows every channel name the call touches.

use crate::channel;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Routing flags of one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodInfo {
    /// Servers score requests and the client picks the best claim.
    pub affinity_enabled: bool,
    /// Fan-out call: every subscribed server executes and answers.
    pub multi: bool,
    /// Run the claim protocol even without an affinity function.
    pub require_claim: bool,
}

/// Name, instance id and registered methods of a service.
#[derive(Debug)]
pub struct ServiceDefinition {
    pub name: String,
    pub id: String,
    methods: RwLock<HashMap<String, MethodInfo>>,
}

impl ServiceDefinition {
    /// Create a definition with no methods.
    ///
    /// # Arguments
    ///
    /// * `name` - Service name, the first part of every channel
    /// * `id` - Instance id: a server id for servers, ignored by clients
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            methods: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a method.
    ///
    /// # Arguments
    ///
    /// * `name` - Method name as used in channel names
    /// * `affinity_enabled` - Servers score requests and the client picks the best claim
    /// * `multi` - Fan-out: every server executes and answers, no claim race
    /// * `require_claim` - Run the claim race even without affinity
    pub fn register_method(
        &self,
        name: impl Into<String>,
        affinity_enabled: bool,
        multi: bool,
        require_claim: bool,
    ) {
        self.methods.write().insert(
            name.into(),
            MethodInfo {
                affinity_enabled,
                multi,
                require_claim,
            },
        );
    }

    /// Builder form of [`Self::register_method`].
    pub fn with_method(
        self,
        name: impl Into<String>,
        affinity_enabled: bool,
        multi: bool,
        require_claim: bool,
    ) -> Self {
        self.register_method(name, affinity_enabled, multi, require_claim);
        self
    }

    /// Flags of `name`, if registered.
    pub fn method(&self, name: &str) -> Option<MethodInfo> {
        self.methods.read().get(name).copied()
    }

    /// Routing info for a call to `method` on `topic`.
    ///
    /// # Panics
    ///
    /// Panics if `method` was never registered. Stubs register every method
    /// up front, so a miss here is a programming error.
    pub fn get_info(&self, method: &str, topic: &[String]) -> RequestInfo {
        let m = match self.method(method) {
            Some(m) => m,
            None => panic!("method {method} is not registered on service {}", self.name),
        };

        RequestInfo {
            service: self.name.clone(),
            method: method.to_string(),
            topic: topic.to_vec(),
            multi: m.multi,
            affinity_enabled: m.affinity_enabled,
            require_claim: m.require_claim,
        }
    }
}

/// Per-call routing info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub service: String,
    pub method: String,
    pub topic: Vec<String>,
    pub multi: bool,
    pub affinity_enabled: bool,
    pub require_claim: bool,
}

impl RequestInfo {
    /// Whether a call must pick a single server through the claim race.
    /// Fan-out calls never do.
    pub fn needs_claim(&self) -> bool {
        !self.multi && (self.require_claim || self.affinity_enabled)
    }

    /// Key of the handler serving this call on a server.
    pub fn handler_key(&self) -> String {
        channel::handler_key(&self.method, &self.topic)
    }

    /// Channel requests and server notifications are published on.
    pub fn rpc_channel(&self) -> String {
        channel::rpc_channel(&self.service, &self.method, &self.topic)
    }

    /// Channel the client broadcasts claim verdicts on.
    pub fn claim_response_channel(&self) -> String {
        channel::claim_response_channel(&self.service, &self.method, &self.topic)
    }

    /// Channel servers receive stream opens and client frames on.
    pub fn stream_server_channel(&self) -> String {
        channel::stream_server_channel(&self.service, &self.method, &self.topic)
    }
}

/// Convert borrowed topic segments into the owned form used by [`RequestInfo`].
pub fn topic(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
