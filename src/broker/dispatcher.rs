//! Per-queue dispatch state
//!
//! A `Dispatcher` owns everything that must change atomically for one queue:
//! the FIFO of pending messages, the attached consumers in round-robin order,
//! and the table of unacknowledged deliveries. It is always held behind the
//! queue's mutex, and every mutation is followed by a `pump`, so one dispatch
//! pass runs each time the queue's state changes.
//!
//! Invariants:
//! - an entry is either in `pending` or in `unacked`, never both
//! - a consumer's `outstanding` equals its number of `unacked` entries
//! - requeued entries go back to the head of `pending`
//!
//! The dispatcher does not touch storage. `pump` and `ack` hand settled
//! entries back to the caller, which deletes them from disk.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::broker::consumer::Delivery;
use crate::broker::message::{AckMode, ConsumerTag, DeliveryTag, Message};
use crate::broker::queue::Queue;
use crate::utils::{BrokerError, Result};

/// A message sitting in a queue, pending or unacknowledged.
#[derive(Debug, Clone)]
pub(crate) struct Enqueued {
    pub message: Message,
    /// Key of the stored copy, if the message was written to disk.
    pub store_key: Option<u64>,
    pub redelivered: bool,
}

impl Enqueued {
    pub fn new(message: Message, store_key: Option<u64>) -> Self {
        Self {
            message,
            store_key,
            redelivered: false,
        }
    }
}

/// A consumer as seen from the queue.
#[derive(Debug)]
pub(crate) struct Attached {
    pub tag: ConsumerTag,
    pub ack_mode: AckMode,
    /// `0` = unlimited.
    pub prefetch: u16,
    pub outstanding: usize,
    pub sender: UnboundedSender<Delivery>,
}

impl Attached {
    /// Auto-ack consumers never hold outstanding deliveries, so prefetch
    /// does not limit them.
    fn is_eligible(&self) -> bool {
        match self.ack_mode {
            AckMode::Auto => true,
            AckMode::Manual => self.prefetch == 0 || self.outstanding < self.prefetch as usize,
        }
    }
}

#[derive(Debug)]
struct Unacked {
    consumer: ConsumerTag,
    entry: Enqueued,
}

#[derive(Debug, Default)]
pub(crate) struct Dispatcher {
    pending: VecDeque<Enqueued>,
    consumers: Vec<Attached>,
    cursor: usize,
    unacked: BTreeMap<DeliveryTag, Unacked>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, entry: Enqueued) {
        self.pending.push_back(entry);
    }

    pub fn attach(&mut self, consumer: Attached) -> Result<()> {
        if self.consumers.iter().any(|c| c.tag == consumer.tag) {
            return Err(BrokerError::DuplicateConsumer(consumer.tag));
        }
        self.consumers.push(consumer);
        Ok(())
    }

    /// Removes a consumer and puts its unacknowledged entries back at the
    /// head of the queue in their original order. Returns how many were
    /// requeued, or `None` if the consumer was not attached.
    pub fn detach(&mut self, tag: &str) -> Option<usize> {
        let idx = self.consumers.iter().position(|c| c.tag == tag)?;
        Some(self.detach_at(idx))
    }

    /// Settles a delivery positively. The returned entry is gone from the
    /// queue for good.
    pub fn ack(&mut self, tag: DeliveryTag) -> Result<Enqueued> {
        let unacked = self.take_unacked(tag)?;
        Ok(unacked.entry)
    }

    /// Settles a delivery negatively: the message becomes the next one
    /// attempted.
    pub fn nack(&mut self, tag: DeliveryTag) -> Result<()> {
        let unacked = self.take_unacked(tag)?;
        self.requeue(unacked.entry);
        Ok(())
    }

    /// Hands pending messages to eligible consumers until either runs out.
    ///
    /// Consumers are visited round-robin starting after the last one served,
    /// skipping those at their prefetch limit. A consumer whose receiving end
    /// is gone is detached on the spot and the message goes back to the head.
    /// Returns the entries settled by auto-ack handoff.
    pub fn pump(&mut self, tags: &AtomicU64, origin: &Weak<Queue>) -> Vec<Enqueued> {
        let mut auto_acked = Vec::new();

        while !self.pending.is_empty() {
            let Some(idx) = self.next_eligible() else {
                break;
            };
            let Some(entry) = self.pending.pop_front() else {
                break;
            };

            let tag = tags.fetch_add(1, Ordering::SeqCst) + 1;
            let consumer = &mut self.consumers[idx];
            let delivery = Delivery::new(
                tag,
                consumer.tag.clone(),
                consumer.ack_mode,
                entry.message.clone(),
                entry.redelivered,
                origin.clone(),
            );

            if consumer.sender.send(delivery).is_err() {
                debug!(consumer = %consumer.tag, "consumer channel closed, detaching");
                self.pending.push_front(entry);
                self.detach_at(idx);
                continue;
            }

            match consumer.ack_mode {
                AckMode::Manual => {
                    consumer.outstanding += 1;
                    self.unacked.insert(
                        tag,
                        Unacked {
                            consumer: consumer.tag.clone(),
                            entry,
                        },
                    );
                }
                AckMode::Auto => auto_acked.push(entry),
            }
            self.cursor = (idx + 1) % self.consumers.len();
        }

        auto_acked
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Enqueued> {
        self.pending.iter()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn outstanding(&self, consumer: &str) -> Option<usize> {
        self.consumers
            .iter()
            .find(|c| c.tag == consumer)
            .map(|c| c.outstanding)
    }

    /// Round-robin from `cursor`, but a consumer with nothing outstanding
    /// always wins over one that is busy and merely under its prefetch.
    fn next_eligible(&self) -> Option<usize> {
        let n = self.consumers.len();
        let mut order = (0..n).map(|offset| (self.cursor + offset) % n);
        let first_idle = order.clone().find(|&idx| {
            let c = &self.consumers[idx];
            c.outstanding == 0 && c.is_eligible()
        });
        first_idle.or_else(|| order.find(|&idx| self.consumers[idx].is_eligible()))
    }

    fn take_unacked(&mut self, tag: DeliveryTag) -> Result<Unacked> {
        let unacked = self
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;

        match self
            .consumers
            .iter_mut()
            .find(|c| c.tag == unacked.consumer)
        {
            Some(consumer) => consumer.outstanding = consumer.outstanding.saturating_sub(1),
            None => warn!(delivery_tag = tag, "settled delivery of a detached consumer"),
        }
        Ok(unacked)
    }

    fn requeue(&mut self, mut entry: Enqueued) {
        entry.redelivered = true;
        self.pending.push_front(entry);
    }

    fn detach_at(&mut self, idx: usize) -> usize {
        let consumer = self.consumers.remove(idx);
        if idx < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.consumers.len() {
            self.cursor = 0;
        }

        let owned: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == consumer.tag)
            .map(|(tag, _)| *tag)
            .collect();

        // Highest tag first, so the oldest delivery ends up at the very head.
        for tag in owned.iter().rev() {
            if let Some(unacked) = self.unacked.remove(tag) {
                self.requeue(unacked.entry);
            }
        }
        owned.len()
    }
}
