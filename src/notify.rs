//! Bounded delivery queue for LISTEN/NOTIFY notifications.
//!
//! The scanner is the only producer. What happens when the queue is full is
//! decided by [`OverflowPolicy`]: with `Block` a listener that stops reading
//! also stalls the command stream, since the scanner feeds both.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::protocol::Notification;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 5;

/// What the scanner does with a notification when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued notification.
    #[default]
    DropOldest,
    /// Wait for a consumer to make room.
    Block,
}

struct State {
    queue: VecDeque<Notification>,
    /// Set once the scanner stopped; queued items stay readable.
    finished: bool,
    dropped: u64,
}

struct Shared {
    state: Mutex<State>,
    capacity: usize,
    policy: OverflowPolicy,
    item_ready: Notify,
    space_ready: Notify,
}

/// Create a connected producer/consumer pair.
pub(crate) fn channel(capacity: usize, policy: OverflowPolicy) -> (NotificationSender, Notifications) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::with_capacity(capacity),
            finished: false,
            dropped: 0,
        }),
        capacity,
        policy,
        item_ready: Notify::new(),
        space_ready: Notify::new(),
    });

    (
        NotificationSender {
            shared: Arc::clone(&shared),
        },
        Notifications { shared },
    )
}

/// Producer half, owned by the scanner task.
pub(crate) struct NotificationSender {
    shared: Arc<Shared>,
}

impl NotificationSender {
    pub(crate) async fn send(&self, notification: Notification) {
        let shared = &self.shared;

        match shared.policy {
            OverflowPolicy::DropOldest => {
                let mut state = shared.state.lock();
                if state.queue.len() >= shared.capacity {
                    if let Some(evicted) = state.queue.pop_front() {
                        state.dropped += 1;
                        warn!(
                            channel = %evicted.channel,
                            pid = evicted.process_id,
                            "notification queue full, dropping oldest notification"
                        );
                    }
                }
                state.queue.push_back(notification);
            }
            OverflowPolicy::Block => {
                let mut pending = Some(notification);
                loop {
                    let space = shared.space_ready.notified();
                    tokio::pin!(space);
                    space.as_mut().enable();

                    {
                        let mut state = shared.state.lock();
                        if state.queue.len() < shared.capacity {
                            if let Some(n) = pending.take() {
                                state.queue.push_back(n);
                            }
                            break;
                        }
                    }

                    space.await;
                }
            }
        }

        shared.item_ready.notify_one();
    }

    /// Mark the producer as stopped and wake every waiting consumer.
    pub(crate) fn finish(&self) {
        self.shared.state.lock().finished = true;
        self.shared.item_ready.notify_waiters();
    }
}

/// Read side of the notification feed.
///
/// Cloned handles share one queue: each notification is delivered to exactly
/// one of them.
#[derive(Clone)]
pub struct Notifications {
    shared: Arc<Shared>,
}

impl Notifications {
    /// Wait for the next notification.
    ///
    /// Returns `None` once the connection's reader stopped and every queued
    /// notification was consumed.
    pub async fn recv(&self) -> Option<Notification> {
        loop {
            let ready = self.shared.item_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if let Some(n) = state.queue.pop_front() {
                    drop(state);
                    self.shared.space_ready.notify_one();
                    return Some(n);
                }
                if state.finished {
                    return None;
                }
            }

            ready.await;
        }
    }

    /// Take a queued notification without waiting.
    pub fn try_recv(&self) -> Option<Notification> {
        let n = self.shared.state.lock().queue.pop_front();
        if n.is_some() {
            self.shared.space_ready.notify_one();
        }
        n
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notifications evicted under [`OverflowPolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    /// Whether the producer has stopped.
    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().finished
    }
}

impl std::fmt::Debug for Notifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Notifications")
            .field("queued", &state.queue.len())
            .field("capacity", &self.shared.capacity)
            .field("policy", &self.shared.policy)
            .field("finished", &state.finished)
            .finish()
    }
}
