use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::graph::NodeId;

/// The nodes that may make progress right now.
///
/// Any thread may push; workers pop with a timeout so that an empty queue hands them over
/// to maintenance. An id may be popped after its node finished, so consumers must tolerate
/// stale entries.
#[derive(Debug)]
pub struct CompletableQueue {
    sender: Sender<NodeId>,
    receiver: Receiver<NodeId>,
}

impl Default for CompletableQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletableQueue {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    pub fn push(&self, node: NodeId) {
        // cannot fail, we hold a receiver ourselves
        if self.sender.send(node).is_err() {
            tracing::error!(%node, "completable queue is disconnected");
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<NodeId> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Discards everything currently queued, returning how many entries were dropped.
    pub fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_pop_times_out_when_empty() {
        let queue = CompletableQueue::new();
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)), None);
    }

    #[test]
    fn test_fifo_across_threads() {
        let queue = CompletableQueue::new();
        thread::scope(|s| {
            s.spawn(|| {
                for n in 0..3 {
                    queue.push(NodeId(n));
                }
            });
        });

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_timeout(Duration::ZERO), Some(NodeId(0)));
        assert_eq!(queue.drain(), 2);
        assert!(queue.is_empty());
    }
}
