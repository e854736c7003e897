//! Forwarding engine: two FIFO queues decoupling the protocol handlers from
//! delivery. Workers swap a whole queue out under the lock, then resolve
//! destinations and send with the lock long released, so slow sockets never
//! back up into the handlers.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
};

use bytes::Bytes;
use tracing::debug;

use crate::registry::Registry;

/// A targeted (prefix-group) delivery. The payload is the already-packed
/// forward frame, shared by reference across all recipients.
pub struct UnicastTask {
    pub dest_name: String,
    pub payload: Bytes,
}

/// One copy to a representative of every live service name.
pub struct BroadcastTask {
    pub payload: Bytes,
}

#[derive(Default)]
struct Queues {
    unicast: VecDeque<UnicastTask>,
    broadcast: VecDeque<BroadcastTask>,
    terminate: bool,
}

#[derive(Default)]
pub struct Forwarder {
    queues: Mutex<Queues>,
    cond: Condvar,
}

impl Forwarder {
    pub fn queue_unicast(&self, task: UnicastTask) {
        let mut q = self.queues.lock().unwrap();
        q.unicast.push_back(task);
        self.cond.notify_one();
    }

    pub fn queue_broadcast(&self, task: BroadcastTask) {
        let mut q = self.queues.lock().unwrap();
        q.broadcast.push_back(task);
        self.cond.notify_one();
    }

    /// Wakes every worker; they exit once the flag is observed.
    pub fn shutdown(&self) {
        let mut q = self.queues.lock().unwrap();
        q.terminate = true;
        self.cond.notify_all();
    }

    /// Worker body; blocks on the condition until work or shutdown.
    /// Delivery is best-effort: a destination that refuses the bytes (gone,
    /// half-closed, over its cap) is logged and skipped, never retried —
    /// the sender already got its response at enqueue time.
    pub fn run_worker(&self, registry: &Registry) {
        loop {
            let (unicast, broadcast) = {
                let mut q = self.queues.lock().unwrap();
                while q.unicast.is_empty() && q.broadcast.is_empty() {
                    if q.terminate {
                        return;
                    }
                    q = self.cond.wait(q).unwrap();
                }
                if q.terminate {
                    return;
                }
                (std::mem::take(&mut q.unicast), std::mem::take(&mut q.broadcast))
            };

            for task in unicast {
                let dests = registry.resolve_connections(&task.dest_name);
                if dests.is_empty() {
                    debug!(dest = %task.dest_name, "forward: dropped, no live destination");
                    continue;
                }
                for sock in dests {
                    if !sock.send_data(&task.payload) {
                        debug!(id = sock.id(), dest = %task.dest_name, "forward: dropped for one destination");
                    }
                }
            }
            for task in broadcast {
                for sock in registry.broadcast_targets() {
                    if !sock.send_data(&task.payload) {
                        debug!(id = sock.id(), "forward: broadcast copy dropped");
                    }
                }
            }
        }
    }
}
