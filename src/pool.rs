//! # Worker Pools
//!
//! Each pipeline stage is a fixed set of OS threads, one bounded MPSC inbox
//! per thread. Senders route a message to a specific worker by reducing a
//! stable key (the connection id) modulo the pool size, which pins all work
//! for one connection to one worker and removes cross-worker ordering
//! concerns. Within one inbox delivery is strict FIFO.
//!
//! There is no cooperative suspension: a worker blocks on its inbox, drains
//! everything queued, does the work, and repeats. Pools that interleave long
//! scans with message handling (the query scheduler) use the non-blocking
//! drain instead so fresh messages preempt scan quanta.

use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::types::ConnId;

/// Bound on each worker inbox. Senders block briefly once a worker is this
/// far behind, which is the only back-pressure in the pipeline.
const INBOX_BOUND: usize = 4096;

/// Creates the channel set for a pool of `threads` workers.
///
/// Returns the shareable dispatch handle and one [`Inbox`] per worker. The
/// caller spawns the worker threads itself, which keeps construction free of
/// ordering cycles: every pool's handle exists before any worker starts.
pub fn pool<M: Send + 'static>(threads: usize) -> (PoolHandle<M>, Vec<Inbox<M>>) {
    assert!(threads >= 1, "pool must have at least one worker");
    let mut senders = Vec::with_capacity(threads);
    let mut inboxes = Vec::with_capacity(threads);
    for _ in 0..threads {
        let (tx, rx) = mpsc::sync_channel(INBOX_BOUND);
        senders.push(tx);
        inboxes.push(Inbox { rx });
    }
    (PoolHandle { senders }, inboxes)
}

/// Spawns one named thread per inbox, running `run` over it.
pub fn spawn_workers<M, F>(name: &str, inboxes: Vec<Inbox<M>>, run: F) -> Vec<JoinHandle<()>>
where
    M: Send + 'static,
    F: Fn(Inbox<M>) + Send + Clone + 'static,
{
    inboxes
        .into_iter()
        .enumerate()
        .map(|(i, inbox)| {
            let run = run.clone();
            thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || run(inbox))
                .expect("failed to spawn worker thread")
        })
        .collect()
}

// =============================================================================
// Dispatch Handle
// =============================================================================

/// Cloneable sender side of a pool.
pub struct PoolHandle<M> {
    senders: Vec<SyncSender<M>>,
}

impl<M> Clone for PoolHandle<M> {
    fn clone(&self) -> Self {
        Self {
            senders: self.senders.clone(),
        }
    }
}

impl<M: Send> PoolHandle<M> {
    fn index(&self, key: ConnId) -> usize {
        (key.as_raw() % self.senders.len() as u64) as usize
    }

    /// Routes a message to the worker pinned to `key`. Send failures mean the
    /// pool is shutting down and are deliberately ignored; in-flight work for
    /// a dying pipeline has nowhere useful to go.
    pub fn dispatch(&self, key: ConnId, msg: M) {
        let _ = self.senders[self.index(key)].send(msg);
    }

    /// Routes a batch of messages to the worker pinned to `key` in one pass.
    pub fn dispatch_multi(&self, key: ConnId, msgs: Vec<M>) {
        let tx = &self.senders[self.index(key)];
        for msg in msgs {
            let _ = tx.send(msg);
        }
    }

    /// Delivers one freshly built message to every worker in the pool.
    pub fn dispatch_all(&self, make: impl Fn() -> M) {
        for tx in &self.senders {
            let _ = tx.send(make());
        }
    }
}

// =============================================================================
// Inbox
// =============================================================================

/// The receive side owned by exactly one worker thread.
pub struct Inbox<M> {
    rx: Receiver<M>,
}

impl<M> Inbox<M> {
    /// Blocks for at least one message, then drains everything queued.
    /// Returns `None` once all senders are gone.
    pub fn pop_all(&self) -> Option<Vec<M>> {
        let first = self.rx.recv().ok()?;
        let mut batch = vec![first];
        self.drain_into(&mut batch);
        Some(batch)
    }

    /// Drains whatever is queued without blocking. Returns `None` once all
    /// senders are gone and the queue is empty.
    pub fn pop_all_no_wait(&self) -> Option<Vec<M>> {
        let mut batch = Vec::new();
        match self.rx.try_recv() {
            Ok(msg) => batch.push(msg),
            Err(TryRecvError::Empty) => return Some(batch),
            Err(TryRecvError::Disconnected) => return None,
        }
        self.drain_into(&mut batch);
        Some(batch)
    }

    fn drain_into(&self, batch: &mut Vec<M>) {
        while let Ok(msg) = self.rx.try_recv() {
            batch.push(msg);
        }
    }
}
