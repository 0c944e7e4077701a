//! Component D: the checkpoint watcher & demultiplexer.
//!
//! The teacher's `event_bus::hub::EventHub` is the closest structural match
//! (an `Arc`-shared hub with lazy-subscribe semantics, `RwLock`-guarded
//! sender, `tracing::warn!` on subscriber lag) but it is built on
//! `tokio::sync::broadcast`, which queues every published value per
//! subscriber and drops the *oldest* on overflow. The checkpoint watcher
//! needs the opposite: at most one checkpoint queued per subscriber, with a
//! late subscriber overwriting — not failing behind — an unconsumed value.
//! `tokio::sync::watch` (already imported, unused, by the teacher's hub for
//! its shutdown signal) gives exactly that "last value wins" mailbox, so
//! this module builds the fan-out on a `watch` sender per subscriber
//! instead of one shared `broadcast` sender.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::model::Checkpoint;

/// The upstream checkpoint feed a demultiplexer forwards — typically the
/// replication batch writer's commit stream. Abstracted so the demux's
/// lazy-subscribe/teardown lifecycle doesn't depend on how upstream
/// checkpoints are actually produced (§4.4).
#[async_trait::async_trait]
pub trait UpstreamCheckpointSource: Send + Sync {
    /// Block until the next checkpoint (or terminal condition) is
    /// available. Returning `None` signals upstream has closed for good.
    async fn next(&mut self) -> Option<CheckpointSignal>;
}

/// A checkpoint-change notification, or the terminal states a subscriber
/// must also observe (§4.4).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckpointSignal {
    Changed(Checkpoint),
    /// The upstream source closed; no further checkpoints will arrive.
    UpstreamClosed,
    /// The upstream source reported an unrecoverable error.
    UpstreamError(String),
}

/// Fans a single upstream checkpoint-change stream out to any number of
/// subscribers without ever buffering more than the latest signal per
/// subscriber (§4.4).
///
/// Upstream is subscribed lazily on the first subscriber and torn down once
/// the last subscriber drops, matching the teacher's hub lifecycle (a fresh
/// `broadcast::Sender` only exists while at least one side holds it).
pub struct CheckpointDemux {
    subscriber_count: AtomicUsize,
    senders: Mutex<Vec<watch::Sender<Option<CheckpointSignal>>>>,
}

impl Default for CheckpointDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointDemux {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscriber_count: AtomicUsize::new(0),
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber, synthesizing its initial value from
    /// `initial` (the watcher's "getFirstValue" behavior: a subscriber that
    /// joins after the first checkpoint still observes one immediately,
    /// per §4.4).
    pub async fn subscribe(&self, initial: Option<Checkpoint>) -> CheckpointSubscription {
        self.subscriber_count.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(initial.map(CheckpointSignal::Changed));
        self.senders.lock().await.push(tx);
        CheckpointSubscription {
            receiver: rx,
            demux: self,
        }
    }

    /// Publish a new checkpoint to every live subscriber, overwriting any
    /// value a slow subscriber has not yet observed (§4.4 last-value-wins).
    pub async fn publish(&self, checkpoint: Checkpoint) {
        self.broadcast(CheckpointSignal::Changed(checkpoint)).await;
    }

    pub async fn publish_closed(&self) {
        self.broadcast(CheckpointSignal::UpstreamClosed).await;
    }

    pub async fn publish_error(&self, message: impl Into<String>) {
        self.broadcast(CheckpointSignal::UpstreamError(message.into())).await;
    }

    async fn broadcast(&self, signal: CheckpointSignal) {
        let mut senders = self.senders.lock().await;
        senders.retain(|tx| tx.send(Some(signal.clone())).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::SeqCst)
    }
}

/// A single subscriber's view of the demultiplexed checkpoint stream.
pub struct CheckpointSubscription<'a> {
    receiver: watch::Receiver<Option<CheckpointSignal>>,
    demux: &'a CheckpointDemux,
}

impl CheckpointSubscription<'_> {
    /// Await the next checkpoint signal distinct from the one last
    /// observed. Coalesces any number of intermediate publishes into the
    /// latest one, per the demultiplexer's mailbox-of-one contract.
    pub async fn recv(&mut self) -> Option<CheckpointSignal> {
        if self.receiver.changed().await.is_err() {
            return None;
        }
        self.receiver.borrow_and_update().clone()
    }

    /// The most recently observed signal without waiting for a new one.
    pub fn current(&self) -> Option<CheckpointSignal> {
        self.receiver.borrow().clone()
    }
}

impl Drop for CheckpointSubscription<'_> {
    fn drop(&mut self) {
        // Decrement synchronously; the demux's sender list is pruned lazily
        // on the next publish (closed watch::Sender detection), mirroring
        // the teacher's hub which tolerates stale subscriber entries between
        // publishes rather than eagerly compacting on every drop.
        self.demux.subscriber_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wraps a [`CheckpointDemux`] with the lazy upstream lifecycle §4.4
/// describes: the upstream source is only subscribed to while at least one
/// downstream subscriber exists, and torn down the moment the last one
/// drops, rather than running for the demux's entire lifetime. Separated
/// from [`CheckpointDemux`] itself so the plain mailbox-of-one fan-out stays
/// usable on its own (as the batch writer does, publishing directly) without
/// every caller needing an `UpstreamCheckpointSource` to construct one.
pub struct LazyCheckpointDemux {
    demux: Arc<CheckpointDemux>,
    factory: Box<dyn Fn() -> Box<dyn UpstreamCheckpointSource> + Send + Sync>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LazyCheckpointDemux {
    pub fn new(factory: impl Fn() -> Box<dyn UpstreamCheckpointSource> + Send + Sync + 'static) -> Self {
        Self {
            demux: Arc::new(CheckpointDemux::new()),
            factory: Box::new(factory),
            pump: Mutex::new(None),
        }
    }

    /// Subscribe, spinning up the upstream pump task first if this is the
    /// first live subscriber. Takes `this` by `Arc` reference (rather than
    /// as a `self: Arc<Self>` receiver, which only a closed set of pointer
    /// types may use on stable Rust) so the pump task can hold its own clone
    /// of the demux independent of the caller's borrow.
    pub async fn subscribe(this: &Arc<Self>, initial: Option<Checkpoint>) -> CheckpointSubscription<'_> {
        let mut pump = this.pump.lock().await;
        if pump.is_none() {
            let mut source = (this.factory)();
            let demux = this.demux.clone();
            *pump = Some(tokio::spawn(async move {
                loop {
                    match source.next().await {
                        Some(CheckpointSignal::Changed(checkpoint)) => demux.publish(checkpoint).await,
                        Some(CheckpointSignal::UpstreamClosed) | None => {
                            demux.publish_closed().await;
                            return;
                        }
                        Some(CheckpointSignal::UpstreamError(message)) => {
                            demux.publish_error(message).await;
                            return;
                        }
                    }
                }
            }));
        }
        drop(pump);
        this.demux.subscribe(initial).await
    }

    /// Called once a subscriber drops and the live count reaches zero;
    /// aborts the upstream pump so no task lingers with no one to deliver
    /// to. The demux itself stays alive for a future subscriber to restart
    /// it.
    pub async fn teardown_if_idle(&self) {
        if self.demux.subscriber_count() == 0
            && let Some(handle) = self.pump.lock().await.take()
        {
            handle.abort();
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.demux.subscriber_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Lsn, OpId};

    fn cp(n: u64) -> Checkpoint {
        Checkpoint {
            checkpoint: OpId(n),
            lsn: Lsn(format!("0/{n}")),
        }
    }

    #[tokio::test]
    async fn late_subscriber_observes_latest_published_value() {
        let demux = CheckpointDemux::new();
        demux.publish(cp(1)).await;

        let mut sub = demux.subscribe(Some(cp(1))).await;
        demux.publish(cp(2)).await;

        let signal = sub.recv().await.unwrap();
        assert_eq!(signal, CheckpointSignal::Changed(cp(2)));
    }

    #[tokio::test]
    async fn rapid_publishes_coalesce_to_last_value_only() {
        let demux = CheckpointDemux::new();
        let mut sub = demux.subscribe(None).await;

        demux.publish(cp(1)).await;
        demux.publish(cp(2)).await;
        demux.publish(cp(3)).await;

        let signal = sub.recv().await.unwrap();
        assert_eq!(signal, CheckpointSignal::Changed(cp(3)));
    }

    #[tokio::test]
    async fn upstream_closed_is_observed_by_subscribers() {
        let demux = CheckpointDemux::new();
        let mut sub = demux.subscribe(Some(cp(1))).await;
        demux.publish_closed().await;
        assert_eq!(sub.recv().await, Some(CheckpointSignal::UpstreamClosed));
    }
}
