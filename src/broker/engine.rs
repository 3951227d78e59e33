//! Broker engine
//!
//! `Broker` is the owned, injectable root of all broker state: the queue
//! registry, the delivery-tag counter and the optional persistence handle.
//! It is cheap to clone (all clones share state) and every method is
//! synchronous, so it can be used from tasks, threads and tests alike.
//! Several independent brokers can live in one process.
//!
//! Concurrency and usage notes:
//! - The registry is behind a read/write lock that is only held for lookups
//!   and declarations, never while a queue is being mutated.
//! - Each queue serializes its own publish/dispatch/ack traffic (see
//!   `queue.rs`), so a slow consumer on one queue never stalls another.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::exchange::{ExchangeHandle, ExchangeKind};
use crate::broker::queue::{Queue, QueueHandle};
use crate::broker::registry::Registry;
use crate::config::BrokerSettings;
use crate::persistence::Persistence;
use crate::utils::Result;

/// Prefix of queue names generated for an empty declaration.
pub const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    registry: RwLock<Registry>,
    tags: Arc<AtomicU64>,
    persistence: Option<Persistence>,
    settings: BrokerSettings,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl Broker {
    /// An in-memory broker. Durable queues behave like transient ones across
    /// restarts because there is nothing to restart from.
    pub fn new(settings: BrokerSettings) -> Self {
        Self::build(settings, None)
    }

    /// A broker backed by `persistence`, with every durable queue and its
    /// stored messages recovered.
    pub fn with_persistence(persistence: Persistence, settings: BrokerSettings) -> Result<Self> {
        let broker = Self::build(settings, Some(persistence.clone()));

        for name in persistence.durable_queues()? {
            let stored = persistence.load_messages(&name)?;
            let recovered = stored.len();
            let queue = broker.declare_queue(&name, true)?;
            queue.restore(stored);
            info!(queue = %name, recovered, "durable queue restored");
        }

        Ok(broker)
    }

    /// Picks in-memory or on-disk operation from `settings.data_dir`.
    pub fn open(settings: BrokerSettings) -> Result<Self> {
        match settings.data_dir.clone() {
            Some(dir) => {
                let persistence = Persistence::open(&dir, settings.sync_writes)?;
                info!(data_dir = %dir, "opened message store");
                Self::with_persistence(persistence, settings)
            }
            None => Ok(Self::new(settings)),
        }
    }

    fn build(settings: BrokerSettings, persistence: Option<Persistence>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                registry: RwLock::new(Registry::new()),
                tags: Arc::new(AtomicU64::new(0)),
                persistence,
                settings,
            }),
        }
    }

    pub fn default_prefetch(&self) -> u16 {
        self.inner.settings.prefetch
    }

    /// Creates the queue on first declaration; later declarations with the
    /// same durability return the same queue.
    ///
    /// An empty name declares a fresh transient queue with a generated
    /// `amq.gen-` name. A durability mismatch fails with `ParameterConflict`
    /// and changes nothing.
    pub fn declare_queue(&self, name: &str, durable: bool) -> Result<QueueHandle> {
        let name = if name.is_empty() {
            format!("{GENERATED_QUEUE_PREFIX}{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let mut registry = self.inner.registry.write();
        if let Some(existing) = registry.existing_queue(&name, durable)? {
            return Ok(existing);
        }

        if durable {
            if let Some(persistence) = &self.inner.persistence {
                persistence.save_queue(&name)?;
            }
        }

        let queue = Queue::new(
            &name,
            durable,
            self.inner.tags.clone(),
            self.inner.persistence.clone(),
        );
        registry.insert_queue(queue.clone());
        debug!(queue = %name, durable, "queue declared");
        Ok(queue)
    }

    /// Idempotent; a different type under the same name fails with
    /// `ParameterConflict`.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<ExchangeHandle> {
        let mut registry = self.inner.registry.write();
        let exchange = registry.declare_exchange(name, kind)?;
        debug!(exchange = %name, %kind, "exchange declared");
        Ok(exchange.handle())
    }

    /// Binds `queue` to `exchange` under `routing_key`. Duplicate bindings
    /// are a no-op.
    pub fn bind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let added = self
            .inner
            .registry
            .write()
            .bind(exchange, queue, routing_key)?;
        if added {
            debug!(exchange, queue, routing_key, "binding added");
        }
        Ok(())
    }

    /// The queues a message would be routed to. Empty when nothing matches.
    pub fn resolve_route(&self, exchange: &str, routing_key: &str) -> Result<Vec<QueueHandle>> {
        self.inner
            .registry
            .read()
            .resolve_route(exchange, routing_key)
    }

    pub fn queue(&self, name: &str) -> Option<QueueHandle> {
        self.inner.registry.read().queue(name).cloned()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeHandle> {
        self.inner.registry.read().exchange(name).map(|e| e.handle())
    }

    /// Names of all declared queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .registry
            .read()
            .queues()
            .map(|q| q.name().to_string())
            .collect();
        names.sort();
        names
    }
}
