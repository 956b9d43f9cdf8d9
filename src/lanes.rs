//! Per-ledger ordered execution lanes.
//!
//! Every ledger hashes onto one lane, and each lane is a single tokio task
//! draining a queue of submitted futures one at a time. That gives the
//! engine its concurrency contract for free: operations on one ledger are
//! mutually exclusive without locks, while different ledgers proceed in
//! parallel up to the lane count.

use std::future::Future;

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};

pub(crate) struct LaneSet {
    lanes: Vec<mpsc::UnboundedSender<BoxFuture<'static, ()>>>,
}

impl LaneSet {
    /// Spawns `lane_count` worker tasks (at least one).
    pub fn new(lane_count: usize) -> Self {
        let lanes = (0..lane_count.max(1))
            .map(|lane| {
                let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
                tokio::spawn(async move {
                    while let Some(task) = rx.recv().await {
                        task.await;
                    }
                    trace!(lane, "Execution lane drained.");
                });
                tx
            })
            .collect();
        Self { lanes }
    }

    /// Queues `future` on the lane owning `key` and returns a receiver for
    /// its result. The receiver fails only if the engine shut down before
    /// the future ran.
    pub fn submit<F, T>(&self, key: u64, future: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = async move {
            // The caller may have given up waiting; the work still runs to
            // completion to keep the lane's ordering intact.
            let _ = tx.send(future.await);
        }
        .boxed();

        let lane = (key % self.lanes.len() as u64) as usize;
        if self.lanes[lane].send(task).is_err() {
            debug!(key, lane, "Submission after lane shutdown.");
        }
        rx
    }
}
