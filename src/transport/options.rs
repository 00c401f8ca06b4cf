//! # Transport options resolved from ordered mutators.
//!
//! [`TransportConfig`] is the base configuration value handed to the
//! connection when building a subscriber or publisher. Callers never build
//! it field by field; they pass an ordered sequence of [`ConfigOption`]
//! mutators which are applied in order (later options win).
//!
//! ## Presets
//! ```text
//! consumer_topic_durable(rk, exchange, queue, prefetch)
//!   persistent=false, binding=rk, prefetch, exchange(topic, durable),
//!   queue(durable), topology=Declare
//!
//! publisher_topic_durable(rk, exchange)
//!   persistent=false, routing key=rk, confirm=true,
//!   exchange(topic, durable), topology=Declare
//! ```
//!
//! Any field left as `None` keeps the transport default.

use std::fmt;
use std::sync::Arc;

use crate::error::TransportError;
use crate::transport::topic;

/// Exchange routing type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    /// Routes on exact routing-key equality.
    #[default]
    Direct,
    /// Routes to every bound queue.
    Fanout,
    /// Routes on `*`/`#` patterns.
    Topic,
}

/// How topology is established before use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TopologyStrategy {
    /// Declare the exchange/queue/binding if missing.
    #[default]
    Declare,
    /// Expect the topology to exist already; fail otherwise.
    Existing,
}

/// Exchange identity and durability.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ExchangeConfig {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeConfig {
    /// Durable topic exchange named `name`.
    pub fn durable_topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

/// Queue identity and durability.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct QueueConfig {
    pub name: String,
    pub durable: bool,
}

impl QueueConfig {
    /// Durable queue named `name`.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

/// Resolved subscriber/publisher settings.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TransportConfig {
    /// Publish routing key, and binding key for subscribers.
    pub routing_key: Option<String>,
    pub exchange: Option<ExchangeConfig>,
    pub queue: Option<QueueConfig>,
    /// Delivery persistence flag for published messages.
    pub persistent: Option<bool>,
    /// Maximum unacknowledged deliveries per subscription (`0` = unbounded).
    pub prefetch: Option<u16>,
    /// Wait for broker confirmation on publish.
    pub confirm: Option<bool>,
    pub topology: Option<TopologyStrategy>,
}

impl TransportConfig {
    /// Applies `options` in order to a default configuration.
    pub fn from_options<I>(options: I) -> Self
    where
        I: IntoIterator<Item = ConfigOption>,
    {
        let mut cfg = Self::default();
        for opt in options {
            opt.apply(&mut cfg);
        }
        cfg
    }

    /// Exchange name, `""` (default exchange) when unset.
    pub fn exchange_name(&self) -> &str {
        self.exchange.as_ref().map(|e| e.name.as_str()).unwrap_or("")
    }

    /// Queue name, `""` when unset.
    pub fn queue_name(&self) -> &str {
        self.queue.as_ref().map(|q| q.name.as_str()).unwrap_or("")
    }

    /// Routing key, `""` when unset.
    pub fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or("")
    }

    /// Topology strategy, [`TopologyStrategy::Declare`] when unset.
    pub fn topology(&self) -> TopologyStrategy {
        self.topology.unwrap_or_default()
    }

    /// Checks that this configuration describes a valid queue binding.
    ///
    /// - a queue name is required;
    /// - a routing key requires a named exchange;
    /// - topic binding keys must be well-formed patterns.
    pub fn validate_binding(&self) -> Result<(), TransportError> {
        if self.queue_name().is_empty() {
            return Err(TransportError::invalid("queue name is required"));
        }
        let Some(key) = self.routing_key.as_deref() else {
            return Ok(());
        };
        let Some(exchange) = self.exchange.as_ref().filter(|e| !e.name.is_empty()) else {
            return Err(TransportError::invalid(format!(
                "binding key {key:?} requires a named exchange"
            )));
        };
        if exchange.kind == ExchangeKind::Topic {
            topic::validate_pattern(key)?;
        }
        Ok(())
    }

    /// Checks that this configuration can route a published message.
    pub fn validate_publish(&self) -> Result<(), TransportError> {
        if self.exchange_name().is_empty() && self.routing_key().is_empty() {
            return Err(TransportError::invalid(
                "publish needs an exchange or a routing key",
            ));
        }
        if self.routing_key().contains(['*', '#']) {
            return Err(TransportError::invalid(format!(
                "routing key {:?} must not contain wildcards",
                self.routing_key()
            )));
        }
        Ok(())
    }
}

/// A named, independently-toggleable configuration mutator.
#[derive(Clone)]
pub struct ConfigOption {
    name: &'static str,
    f: Arc<dyn Fn(&mut TransportConfig) + Send + Sync>,
}

impl ConfigOption {
    /// Creates a custom mutator.
    pub fn new<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(&mut TransportConfig) + Send + Sync + 'static,
    {
        Self {
            name,
            f: Arc::new(f),
        }
    }

    /// Returns the option name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Applies the mutator.
    pub fn apply(&self, cfg: &mut TransportConfig) {
        (self.f)(cfg)
    }
}

impl fmt::Debug for ConfigOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConfigOption").field(&self.name).finish()
    }
}

pub fn with_routing_key(key: impl Into<String>) -> ConfigOption {
    let key = key.into();
    ConfigOption::new("routing_key", move |c| c.routing_key = Some(key.clone()))
}

pub fn with_exchange(exchange: ExchangeConfig) -> ConfigOption {
    ConfigOption::new("exchange", move |c| c.exchange = Some(exchange.clone()))
}

pub fn with_queue(queue: QueueConfig) -> ConfigOption {
    ConfigOption::new("queue", move |c| c.queue = Some(queue.clone()))
}

pub fn with_persistent(persistent: bool) -> ConfigOption {
    ConfigOption::new("persistent", move |c| c.persistent = Some(persistent))
}

pub fn with_prefetch(prefetch: u16) -> ConfigOption {
    ConfigOption::new("prefetch", move |c| c.prefetch = Some(prefetch))
}

pub fn with_confirm(confirm: bool) -> ConfigOption {
    ConfigOption::new("confirm", move |c| c.confirm = Some(confirm))
}

pub fn with_topology(topology: TopologyStrategy) -> ConfigOption {
    ConfigOption::new("topology", move |c| c.topology = Some(topology))
}

/// Durable topic-exchange consumer preset.
pub fn consumer_topic_durable(
    routing_key: impl Into<String>,
    exchange: impl Into<String>,
    queue: impl Into<String>,
    prefetch: u16,
) -> Vec<ConfigOption> {
    vec![
        with_persistent(false),
        with_routing_key(routing_key),
        with_prefetch(prefetch),
        with_exchange(ExchangeConfig::durable_topic(exchange)),
        with_queue(QueueConfig::durable(queue)),
        with_topology(TopologyStrategy::Declare),
    ]
}

/// Durable topic-exchange publisher preset with confirms.
pub fn publisher_topic_durable(
    routing_key: impl Into<String>,
    exchange: impl Into<String>,
) -> Vec<ConfigOption> {
    vec![
        with_persistent(false),
        with_routing_key(routing_key),
        with_confirm(true),
        with_exchange(ExchangeConfig::durable_topic(exchange)),
        with_topology(TopologyStrategy::Declare),
    ]
}
