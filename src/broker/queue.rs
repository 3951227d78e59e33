//! Queues
//!
//! A `Queue` pairs its identity (name, durability) with a mutex-guarded
//! `Dispatcher`. Every operation takes the lock once, mutates, runs a
//! dispatch pass and releases it, so publish, ack, nack, attach and detach
//! are serialized per queue and a message is never handed to two consumers.
//! Queues do not block each other.
//!
//! Durable queues with a `Persistence` write persistent messages to disk
//! inside the same critical section, before the publish returns.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::broker::dispatcher::{Attached, Dispatcher, Enqueued};
use crate::broker::message::{DeliveryTag, Message};
use crate::persistence::Persistence;
use crate::utils::{BrokerError, Result};

/// What `declare_queue` returns: a shared reference to the live queue.
pub type QueueHandle = Arc<Queue>;

pub struct Queue {
    name: String,
    durable: bool,
    dispatcher: Mutex<Dispatcher>,
    tags: Arc<AtomicU64>,
    store: Option<Persistence>,
}

impl Queue {
    /// `store` is ignored for transient queues.
    pub(crate) fn new(
        name: &str,
        durable: bool,
        tags: Arc<AtomicU64>,
        store: Option<Persistence>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            durable,
            dispatcher: Mutex::new(Dispatcher::new()),
            tags,
            store: if durable { store } else { None },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn pending_len(&self) -> usize {
        self.dispatcher.lock().pending_len()
    }

    /// Payloads of the pending messages, head first.
    pub fn pending_payloads(&self) -> Vec<Vec<u8>> {
        self.dispatcher
            .lock()
            .pending()
            .map(|e| e.message.payload.clone())
            .collect()
    }

    pub fn unacked_len(&self) -> usize {
        self.dispatcher.lock().unacked_len()
    }

    pub fn consumer_count(&self) -> usize {
        self.dispatcher.lock().consumer_count()
    }

    /// Unacknowledged deliveries currently held by `consumer`.
    pub fn outstanding(&self, consumer: &str) -> Option<usize> {
        self.dispatcher.lock().outstanding(consumer)
    }

    /// Appends a message to the tail, storing it first when both the queue
    /// and the message are durable.
    pub(crate) fn enqueue(self: &Arc<Self>, message: Message) -> Result<()> {
        let mut dispatcher = self.dispatcher.lock();

        let store_key = match &self.store {
            Some(store) if message.durability.is_persistent() => {
                Some(store.store_message(&self.name, &message)?)
            }
            _ => None,
        };

        dispatcher.enqueue(Enqueued::new(message, store_key));
        self.pump(&mut dispatcher);
        Ok(())
    }

    /// Loads messages recovered from storage. They may have been delivered
    /// before the restart, so they are flagged as redelivered.
    pub(crate) fn restore(self: &Arc<Self>, stored: Vec<(u64, Message)>) {
        let mut dispatcher = self.dispatcher.lock();
        for (key, message) in stored {
            let mut entry = Enqueued::new(message, Some(key));
            entry.redelivered = true;
            dispatcher.enqueue(entry);
        }
        self.pump(&mut dispatcher);
    }

    pub(crate) fn attach(self: &Arc<Self>, consumer: Attached) -> Result<()> {
        let mut dispatcher = self.dispatcher.lock();
        dispatcher.attach(consumer)?;
        self.pump(&mut dispatcher);
        Ok(())
    }

    pub(crate) fn detach(self: &Arc<Self>, consumer: &str) {
        let mut dispatcher = self.dispatcher.lock();
        match dispatcher.detach(consumer) {
            Some(0) => debug!(queue = %self.name, consumer, "consumer detached"),
            Some(requeued) => {
                debug!(queue = %self.name, consumer, requeued, "consumer detached, deliveries requeued")
            }
            None => return,
        }
        self.pump(&mut dispatcher);
    }

    pub(crate) fn ack(self: &Arc<Self>, tag: DeliveryTag) -> Result<()> {
        let mut dispatcher = self.dispatcher.lock();
        let entry = dispatcher.ack(tag)?;
        self.forget(entry);
        self.pump(&mut dispatcher);
        Ok(())
    }

    pub(crate) fn nack(self: &Arc<Self>, tag: DeliveryTag) -> Result<()> {
        let mut dispatcher = self.dispatcher.lock();
        dispatcher.nack(tag)?;
        self.pump(&mut dispatcher);
        Ok(())
    }

    fn pump(self: &Arc<Self>, dispatcher: &mut Dispatcher) {
        let settled = dispatcher.pump(&self.tags, &Arc::downgrade(self));
        for entry in settled {
            self.forget(entry);
        }
    }

    /// Deletes the stored copy of a settled message. A failure here only
    /// means the message comes back after a restart.
    fn forget(&self, entry: Enqueued) {
        let (Some(store), Some(key)) = (&self.store, entry.store_key) else {
            return;
        };
        if let Err(e) = store.remove_message(&self.name, key) {
            warn!(queue = %self.name, key, error = %e, "failed to delete settled message");
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("durable", &self.durable)
            .field("persistent_store", &self.store.is_some())
            .finish()
    }
}

pub(crate) fn unknown_queue(name: &str) -> BrokerError {
    BrokerError::UnknownQueue(name.to_string())
}
