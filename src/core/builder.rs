use std::sync::Arc;

use crate::{
    config::EngineConfig,
    core::Engine,
    events::Bus,
    subscribers::{LogWriter, Subscribe, SubscriberSet},
    tracer::{NoopTracer, TracerRef},
    transport::Connection,
};

/// Builder for constructing an [`Engine`].
pub struct EngineBuilder {
    connection: Arc<dyn Connection>,
    cfg: EngineConfig,
    tracer: TracerRef,
    subscribers: Option<Vec<Arc<dyn Subscribe>>>,
}

impl EngineBuilder {
    /// Creates a builder bound to the shared `connection`.
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            cfg: EngineConfig::default(),
            tracer: Arc::new(NoopTracer),
            subscribers: None,
        }
    }

    /// Replaces the engine configuration.
    pub fn with_config(mut self, cfg: EngineConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Sets the span provider used for per-message spans.
    ///
    /// Defaults to [`NoopTracer`].
    pub fn with_tracer(mut self, tracer: TracerRef) -> Self {
        self.tracer = tracer;
        self
    }

    /// Sets event subscribers for observability.
    ///
    /// When never called, a single [`LogWriter`] is installed. Passing an
    /// empty vector disables event delivery.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = Some(subscribers);
        self
    }

    /// Builds the engine and spawns the subscriber listener.
    ///
    /// Must be called within a Tokio runtime.
    pub fn build(self) -> Engine {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let subscribers = self
            .subscribers
            .unwrap_or_else(|| vec![Arc::new(LogWriter::new()) as Arc<dyn Subscribe>]);
        let subs = Arc::new(SubscriberSet::new(subscribers, bus.clone()));

        Engine::new_internal(self.cfg, self.connection, self.tracer, bus, subs)
    }
}
