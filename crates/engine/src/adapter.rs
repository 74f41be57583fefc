//! The pluggable protocol adapter interface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::telemetry::Telemetry;

/// Per-session protocol driver. Each worker task owns one instance and calls
/// `start_job` / `send_request` / `finish_job` for every job it replays.
#[async_trait]
pub trait ProtocolAdapter: Send {
    /// Acquire per-session state, typically a connection. May fail
    /// internally; failures are reported through the telemetry sink, not
    /// returned.
    async fn start_job(&mut self, job_id: &str);

    /// Perform one request/response exchange. Returning `false` fails the
    /// session: the worker skips its remaining tasks.
    async fn send_request(&mut self, request: &[u8]) -> bool;

    /// Release per-session state. Must not fail.
    async fn finish_job(&mut self, job_id: &str);
}

/// Builds one adapter instance per worker task.
pub trait AdapterFactory: Send + Sync {
    /// The `--protocol` id this factory registers under.
    fn name(&self) -> &'static str;

    fn build(&self, telemetry: Telemetry) -> Box<dyn ProtocolAdapter>;
}

/// Registry of protocol adapters keyed by name. Compiled in; no runtime
/// loading.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<&'static str, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn AdapterFactory>) {
        self.factories.insert(factory.name(), factory);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AdapterFactory>> {
        self.factories.get(name).cloned()
    }

    /// Registered protocol ids, sorted for help and error text.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
