//! Per-vertex mailboxes.
//!
//! One consolidated inbox per vertex, read by that vertex's function during
//! a super-step; one outbox per sender, sharded so that concurrent vertex
//! invocations never contend on a single shared structure while sending.
//! `deliver()` is the barrier between steps: it reduces every shard into
//! the inbox vector via the user's commutative `Message::merge` and is
//! always called single-threaded by the engine driver.
//!
//! Shard selection is keyed by thread index, the same "one shard per pool
//! thread" shape as a per-core sharded-state cache.

use std::cell::UnsafeCell;

use crate::loom::sync::Mutex as LoomMutex;
use crate::pool::ComputePool;

/// A message type carried between vertices. `merge` must be commutative and
/// associative: the order in which concurrent senders' shards are reduced
/// at `deliver()` time is unspecified.
pub trait Message: Clone + Send + 'static {
    fn merge(&mut self, other: Self);
}

/// The unit type is a valid (trivial) message/global-state: used by
/// algorithms that only need mailbox delivery's quiescence signal and carry
/// no per-step global state of their own (e.g. transitive closure, BFS).
impl Message for () {
    fn merge(&mut self, _other: Self) {}
}

/// The protocol shared by [`SequentialMailboxes`] and [`ShardedMailboxes`].
pub trait Mailboxes {
    type Message: Message;

    /// Number of vertices this mailbox set is sized for.
    fn vertex_count(&self) -> usize;

    /// Exposes `vertex`'s consolidated inbox (populated by the most recent
    /// `deliver()`) and a `send` callback that appends to the *current
    /// thread's* outbox shard. Only the vertex's own function may read its
    /// inbox; this is enforced by convention (the engine only calls
    /// `with_mailbox(v, ...)` from within vertex `v`'s own invocation), not
    /// by the type system.
    fn with_mailbox<R>(
        &self,
        vertex: usize,
        f: impl FnOnce(&Option<Self::Message>, &mut dyn FnMut(Self::Message, usize)) -> R,
    ) -> R;

    /// Swap outbox shards into the consolidated inbox, merging cross-shard
    /// duplicates for the same destination. Returns `true` iff at least one
    /// message was produced during the step just ended. Single-threaded;
    /// called by the engine driver between super-steps.
    fn deliver(&self) -> bool;
}

/// Single outbox vector, no sharding — used when `parallelism == 1` or in
/// tests.
pub struct SequentialMailboxes<M: Message> {
    inbox: UnsafeCell<Vec<Option<M>>>,
    outbox: UnsafeCell<Vec<Option<M>>>,
}

// Safety: `SequentialMailboxes` is only ever driven single-threaded (its
// name says so); the `UnsafeCell`s exist purely to give `with_mailbox` a
// `&self` signature matching the shared `Mailboxes` trait.
unsafe impl<M: Message> Sync for SequentialMailboxes<M> {}

impl<M: Message> SequentialMailboxes<M> {
    pub fn new(vertex_count: usize) -> Self {
        Self {
            inbox: UnsafeCell::new((0..vertex_count).map(|_| None).collect()),
            outbox: UnsafeCell::new((0..vertex_count).map(|_| None).collect()),
        }
    }
}

impl<M: Message> Mailboxes for SequentialMailboxes<M> {
    type Message = M;

    fn vertex_count(&self) -> usize {
        unsafe { (*self.inbox.get()).len() }
    }

    fn with_mailbox<R>(
        &self,
        vertex: usize,
        f: impl FnOnce(&Option<Self::Message>, &mut dyn FnMut(Self::Message, usize)) -> R,
    ) -> R {
        let inbox_ref = unsafe { &(*self.inbox.get())[vertex] };
        let outbox = self.outbox.get();
        let mut send = |message: M, destination: usize| {
            let slot = unsafe { &mut (*outbox)[destination] };
            match slot {
                Some(existing) => existing.merge(message),
                None => *slot = Some(message),
            }
        };
        f(inbox_ref, &mut send)
    }

    fn deliver(&self) -> bool {
        let inbox = unsafe { &mut *self.inbox.get() };
        let outbox = unsafe { &mut *self.outbox.get() };
        let mut produced = false;
        for (slot, sent) in inbox.iter_mut().zip(outbox.iter_mut()) {
            if let Some(message) = sent.take() {
                produced = true;
                *slot = Some(message);
            } else {
                *slot = None;
            }
        }
        produced
    }
}

/// One outbox shard per pool thread (workers + fast-path external slots),
/// swapped into the consolidated inbox at step boundaries. Shard selection
/// uses the sending thread's pool-assigned index; unregistered/external
/// threads share the last shard under a lock.
pub struct ShardedMailboxes<M: Message> {
    pool: ComputePool,
    vertex_count: usize,
    shards: Vec<UnsafeCell<Vec<Option<M>>>>,
    /// Guards the last shard (index `shards.len() - 1`) against concurrent
    /// use by unregistered threads, which have no pool thread index of
    /// their own and so all fall back to sharing one slot.
    external_shard_lock: LoomMutex<()>,
    inbox: UnsafeCell<Vec<Option<M>>>,
}

// Safety: each shard is written only by the one thread whose pool index
// selects it during a step; the one exception (unregistered threads
// sharing the last shard) is serialized by `external_shard_lock`.
// `deliver()`, which reads every shard, is only ever called
// single-threaded between steps.
unsafe impl<M: Message> Sync for ShardedMailboxes<M> {}

impl<M: Message> ShardedMailboxes<M> {
    pub fn new(vertex_count: usize, pool: ComputePool) -> Self {
        let shard_count = pool.parallelism().max(1);
        let shards = (0..shard_count)
            .map(|_| UnsafeCell::new((0..vertex_count).map(|_| None).collect()))
            .collect();
        Self {
            pool,
            vertex_count,
            shards,
            external_shard_lock: LoomMutex::new(()),
            inbox: UnsafeCell::new((0..vertex_count).map(|_| None).collect()),
        }
    }

    /// Runs `f` against the outbox shard the current thread owns, holding
    /// `external_shard_lock` for the duration if the caller is an
    /// unregistered thread sharing the fallback shard.
    fn with_shard_for_current_thread<R>(&self, f: impl FnOnce(&UnsafeCell<Vec<Option<M>>>) -> R) -> R {
        match self.pool.current_thread_index() {
            Some(index) if index < self.shards.len() => f(&self.shards[index]),
            _ => {
                let _guard = self.external_shard_lock.lock();
                f(self.shards.last().expect("at least one shard"))
            }
        }
    }
}

impl<M: Message> Mailboxes for ShardedMailboxes<M> {
    type Message = M;

    fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    fn with_mailbox<R>(
        &self,
        vertex: usize,
        f: impl FnOnce(&Option<Self::Message>, &mut dyn FnMut(Self::Message, usize)) -> R,
    ) -> R {
        let inbox_ref = unsafe { &(*self.inbox.get())[vertex] };
        self.with_shard_for_current_thread(|shard_cell| {
            let mut send = |message: M, destination: usize| {
                let slot = unsafe { &mut (*shard_cell.get())[destination] };
                match slot {
                    Some(existing) => existing.merge(message),
                    None => *slot = Some(message),
                }
            };
            f(inbox_ref, &mut send)
        })
    }

    fn deliver(&self) -> bool {
        let inbox = unsafe { &mut *self.inbox.get() };
        for slot in inbox.iter_mut() {
            *slot = None;
        }
        let mut produced = false;
        for shard in &self.shards {
            let shard = unsafe { &mut *shard.get() };
            for (destination, sent) in shard.iter_mut().enumerate() {
                if let Some(message) = sent.take() {
                    produced = true;
                    match &mut inbox[destination] {
                        Some(existing) => existing.merge(message),
                        None => inbox[destination] = Some(message),
                    }
                }
            }
        }
        produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolBuilder;

    #[derive(Clone, Debug, PartialEq)]
    struct SumMessage(i64);

    impl Message for SumMessage {
        fn merge(&mut self, other: Self) {
            self.0 += other.0;
        }
    }

    #[test]
    fn sequential_mailbox_round_trip_merges_in_send_order() {
        let mailboxes = SequentialMailboxes::<SumMessage>::new(3);
        mailboxes.with_mailbox(0, |_inbox, send| {
            send(SumMessage(1), 2);
            send(SumMessage(4), 2);
        });
        assert!(mailboxes.deliver());
        mailboxes.with_mailbox(2, |inbox, _send| {
            assert_eq!(*inbox, Some(SumMessage(5)));
        });
    }

    #[test]
    fn deliver_reports_false_when_nothing_was_sent() {
        let mailboxes = SequentialMailboxes::<SumMessage>::new(2);
        assert!(!mailboxes.deliver());
    }

    #[test]
    fn sharded_mailbox_merges_across_shards_order_independently() {
        let pool = PoolBuilder::new().worker_threads(2).build();
        pool.register_current_thread();
        let mailboxes = ShardedMailboxes::<SumMessage>::new(2, pool.clone());

        pool.join(
            || mailboxes.with_mailbox(1, |_inbox, send| send(SumMessage(10), 0)),
            || mailboxes.with_mailbox(1, |_inbox, send| send(SumMessage(32), 0)),
        );

        assert!(mailboxes.deliver());
        mailboxes.with_mailbox(0, |inbox, _send| {
            assert_eq!(*inbox, Some(SumMessage(42)));
        });
        pool.shut_down();
    }

    proptest::proptest! {
        #[test]
        fn merged_inbox_equals_fold_of_sent_messages_regardless_of_order(
            amounts in proptest::collection::vec(-1000i64..1000, 0..32)
        ) {
            let mailboxes = SequentialMailboxes::<SumMessage>::new(1);
            mailboxes.with_mailbox(0, |_inbox, send| {
                for &amount in &amounts {
                    send(SumMessage(amount), 0);
                }
            });
            mailboxes.deliver();
            let expected: i64 = amounts.iter().sum();
            mailboxes.with_mailbox(0, |inbox, _send| {
                assert_eq!(*inbox, if amounts.is_empty() { None } else { Some(SumMessage(expected)) });
            });
        }
    }
}
