//! Compute pool: worker loop, random victim selection, spin/steal/park
//! state machine, `dispatch`/`join`/`parallel_for`, and user-thread
//! fast-path registration.
//!
//! The worker loop follows a local -> steal -> park structure, generalized
//! here from polling an async task to running a plain `FnOnce()` job; the
//! caller-participates `join` shape and the external-thread fallback path
//! follow a `join`-via-stack-job, `in_worker`-style pattern.

mod deque;
mod job;
mod park;
mod rand;
mod state;

use std::cell::RefCell;

use crate::error::PoolPanic;
use crate::loom::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use crate::loom::sync::Arc;
use crate::loom::thread::JoinHandle;
use deque::Deque;
use job::{JoinDescriptor, ParallelForSlice, Task};
use park::{ParkingRegistry, ParkingSpot};
use rand::VictimRng;
use state::SpinState;

const DEFAULT_SPIN_COUNT: u32 = 5000;
const DEFAULT_MAX_SPINNING_THREADS: u32 = 1;
const DEFAULT_MIN_ACTIVE_FOR_SPIN: u32 = 4;

/// Builds a [`ComputePool`], with its tunables exposed as overridable
/// fields rather than hard-coded constants, the way
/// `rayon::ThreadPoolBuilder` exposes `num_threads`.
pub struct PoolBuilder {
    name: String,
    worker_threads: usize,
    external_fast_path_threads: usize,
    allow_non_fast_path_threads: bool,
    spin_count: u32,
    max_spinning_threads: u32,
    min_active_for_spin: u32,
    deque_capacity: usize,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            name: "weft-pool".to_string(),
            worker_threads: num_cpus::get().max(1),
            external_fast_path_threads: 1,
            allow_non_fast_path_threads: false,
            spin_count: DEFAULT_SPIN_COUNT,
            max_spinning_threads: DEFAULT_MAX_SPINNING_THREADS,
            min_active_for_spin: DEFAULT_MIN_ACTIVE_FOR_SPIN,
            deque_capacity: deque::DEFAULT_CAPACITY,
        }
    }
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    pub fn external_fast_path_threads(mut self, count: usize) -> Self {
        self.external_fast_path_threads = count;
        self
    }

    pub fn allow_non_fast_path_threads(mut self, allow: bool) -> Self {
        self.allow_non_fast_path_threads = allow;
        self
    }

    pub fn spin_count(mut self, count: u32) -> Self {
        self.spin_count = count;
        self
    }

    pub fn max_spinning_threads(mut self, count: u32) -> Self {
        self.max_spinning_threads = count;
        self
    }

    pub fn min_active_for_spin(mut self, count: u32) -> Self {
        self.min_active_for_spin = count;
        self
    }

    /// Per-worker deque capacity; must be a power of two. Smaller
    /// capacities make the overflow inline-execution fallback easier to
    /// exercise deliberately; the default (256) is large enough that most
    /// workloads never hit it.
    pub fn deque_capacity(mut self, capacity: usize) -> Self {
        self.deque_capacity = capacity;
        self
    }

    pub fn build(self) -> ComputePool {
        ComputePool::start(self)
    }
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

struct PoolInner {
    id: u64,
    name: String,
    deques: Vec<Deque>,
    worker_count: usize,
    fast_path_capacity: usize,
    next_fast_path_index: AtomicUsize,
    work_available: ParkingSpot,
    join_parking: Arc<ParkingRegistry>,
    spin_state: SpinState,
    cancelled: AtomicBool,
    active_workers: AtomicU64,
    coprime_strides: Vec<u64>,
    handles: std::sync::Mutex<Vec<JoinHandle>>,
    allow_non_fast_path_threads: bool,
    spin_count: u32,
    max_spinning_threads: u32,
    min_active_for_spin: u32,
    seed_counter: AtomicU64,
}

/// A running compute pool. Cheaply `Clone`, like `Arc`'s handles elsewhere
/// in the crate; every clone refers to the same worker threads and queues.
#[derive(Clone)]
pub struct ComputePool(Arc<PoolInner>);

/// Per-thread registration record: which index this thread holds in a given
/// pool, its local deque, and its victim-selection RNG. Kept in thread-local
/// storage rather than behind the pool's `Arc` so it never needs to be
/// `Sync`. Set exactly once when a worker thread starts; for external
/// fast-path threads it is set at `register_current_thread()`.
struct ThreadContext {
    pool_id: u64,
    index: usize,
    rng: VictimRng,
}

crate::loom::thread_local! {
    static THREAD_CONTEXTS: RefCell<Vec<ThreadContext>> = RefCell::new(Vec::new());
    static AMBIENT_POOL_STACK: RefCell<Vec<ComputePool>> = RefCell::new(Vec::new());
}

static DEFAULT_POOL: std::sync::OnceLock<std::sync::Mutex<Option<ComputePool>>> = std::sync::OnceLock::new();

fn with_context<R>(pool_id: u64, f: impl FnOnce(Option<&ThreadContext>) -> R) -> R {
    THREAD_CONTEXTS.with(|cell| {
        let contexts = cell.borrow();
        f(contexts.iter().find(|c| c.pool_id == pool_id))
    })
}

impl ComputePool {
    fn start(builder: PoolBuilder) -> Self {
        let worker_count = builder.worker_threads.max(1);
        let fast_path_capacity = worker_count + builder.external_fast_path_threads;
        let total_threads = fast_path_capacity as u64;

        let deque_capacity = builder.deque_capacity;
        let deques = (0..fast_path_capacity).map(|_| Deque::new(deque_capacity)).collect();

        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            name: builder.name,
            deques,
            worker_count,
            fast_path_capacity,
            next_fast_path_index: AtomicUsize::new(worker_count),
            work_available: ParkingSpot::new(),
            join_parking: Arc::new(ParkingRegistry::new(fast_path_capacity)),
            spin_state: SpinState::new(),
            cancelled: AtomicBool::new(false),
            active_workers: AtomicU64::new(worker_count as u64),
            coprime_strides: rand::coprime_strides(total_threads),
            handles: std::sync::Mutex::new(Vec::with_capacity(worker_count)),
            allow_non_fast_path_threads: builder.allow_non_fast_path_threads,
            spin_count: builder.spin_count,
            max_spinning_threads: builder.max_spinning_threads,
            min_active_for_spin: builder.min_active_for_spin,
            seed_counter: AtomicU64::new(1),
        });

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let inner = inner.clone();
            let thread_name = format!("{}-worker-{index}", inner.name);
            let handle = crate::loom::thread::spawn(thread_name, move || {
                worker_loop(inner, index);
            })
            .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        *inner.handles.lock().unwrap() = handles;

        tracing::debug!(pool = %inner.name, worker_count, fast_path_capacity, "pool started");
        ComputePool(inner)
    }

    /// Submit `f` for execution; never blocks.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &self.0;
        let task = Task::dispatch(f);
        let overflowed = with_context(inner.id, |ctx| match ctx {
            Some(ctx) => inner.deques[ctx.index].push_front(task),
            None => {
                let victim = rand::random_index(inner.fast_path_capacity);
                inner.deques[victim].push_back(task)
            }
        });
        match overflowed {
            Ok(()) => inner.wakeup_worker_if_required(),
            Err(task) => task.run(),
        }
    }

    /// Fork-join with caller participation. `a` always runs on the calling
    /// thread; `b` is enqueued for another thread (or run inline if the
    /// local deque is full).
    pub fn join<A, B, RA, RB>(&self, a: A, b: B) -> (RA, RB)
    where
        A: FnOnce() -> RA + Send,
        B: FnOnce() -> RB + Send,
        RA: Send,
        RB: Send,
    {
        match self.try_join(a, b) {
            Ok(result) => result,
            Err(panic) => panic.resume(),
        }
    }

    /// Throwing variant of `join`: catches panics from either side and
    /// surfaces one arbitrary error after both sides have completed. Early
    /// cancellation of the sibling on error is not supported.
    pub fn try_join<A, B, RA, RB>(&self, a: A, b: B) -> Result<(RA, RB), PoolPanic>
    where
        A: FnOnce() -> RA + Send,
        B: FnOnce() -> RB + Send,
        RA: Send,
        RB: Send,
    {
        let inner = self.0.clone();
        let ctx_index = self.require_fast_path("join");

        let mut b_result: Option<RB> = None;
        let descriptor = JoinDescriptor::new(|| {
            // Bound to the lifetime of this stack frame only; the result is
            // written back through the `Option` before `mark_done` is
            // observed by the caller below.
            b_result = Some(b());
        });
        // `b_result` must be written before `descriptor` observes `done`, and
        // read only afterwards; see the safety note on `Task::Join`.
        let descriptor_ptr: *const JoinDescriptor = &descriptor;

        let enqueued = match ctx_index {
            Some(index) => inner.deques[index].push_front(Task::from_join(descriptor_ptr)),
            None => {
                let victim = rand::random_index(inner.fast_path_capacity);
                inner.deques[victim].push_back(Task::from_join(descriptor_ptr))
            }
        };

        let a_result = match enqueued {
            Ok(()) => {
                inner.wakeup_worker_if_required();
                catch_unwind_send(a)
            }
            Err(task) => {
                // Overflow: run `b` inline immediately and mark done
                // before running `a`.
                task.run();
                catch_unwind_send(a)
            }
        };

        inner.wait_for_descriptor(descriptor.state(), ctx_index);

        let mut descriptor = descriptor;
        let b_panic = descriptor.take_panic();
        drop(descriptor);

        let a_value = match a_result {
            Ok(v) => v,
            Err(payload) => return Err(PoolPanic::new(payload)),
        };
        if let Some(payload) = b_panic {
            return Err(PoolPanic::new(payload));
        }
        let b_value = b_result.expect("join: b did not run");
        Ok((a_value, b_value))
    }

    /// Recursive range subdivision. `f` receives `(start, end, total)` for
    /// a half-open sub-range; grain size is `n / parallelism`, adaptive
    /// down to 1.
    pub fn parallel_for<F>(&self, n: usize, f: F)
    where
        F: Fn(usize, usize, usize) + Sync,
    {
        if n == 0 {
            return;
        }
        let parallelism = self.parallelism().max(1);
        let grain = (n / parallelism).max(1);
        let body = move |i: usize| f(i, i + 1, n);
        self.parallel_for_recursive(0, n, grain, &body, n);
    }

    /// Recursively halve `start..end` down to `grain`, enqueuing the upper
    /// half for stealing and recursing into the lower half inline. A
    /// stolen half keeps halving the same way through
    /// [`job::ParallelForSlice::execute_leaf`], so the range fans out
    /// across as many thieves as its size supports rather than stopping
    /// after one split.
    pub(crate) fn parallel_for_recursive(&self, start: usize, end: usize, grain: usize, body: &(dyn Fn(usize) + Sync), total: usize) {
        if end - start <= grain {
            for i in start..end {
                body(i);
            }
            return;
        }
        let mid = start + (end - start) / 2;
        let inner = &self.0;
        let ctx_index = self.require_fast_path("parallel_for");

        let slice = ParallelForSlice::new(mid, end, grain, total, body, self);
        let slice_ptr: *const ParallelForSlice<'_> = &slice;

        let enqueued = match ctx_index {
            Some(index) => inner.deques[index].push_front(Task::from_parallel_for(slice_ptr)),
            None => {
                let victim = rand::random_index(inner.fast_path_capacity);
                inner.deques[victim].push_back(Task::from_parallel_for(slice_ptr))
            }
        };

        match enqueued {
            Ok(()) => {
                inner.wakeup_worker_if_required();
                self.parallel_for_recursive(start, mid, grain, body, total);
            }
            Err(task) => {
                task.run();
                self.parallel_for_recursive(start, mid, grain, body, total);
                return;
            }
        }

        inner.wait_for_descriptor(slice.state(), ctx_index);
        let mut slice = slice;
        if let Some(payload) = slice.take_panic() {
            std::panic::resume_unwind(payload);
        }
    }

    /// Register the calling thread as a fast-path thread. Idempotent:
    /// calling again on an already-registered thread returns the same
    /// index.
    pub fn register_current_thread(&self) -> usize {
        let inner = &self.0;
        if let Some(index) = with_context(inner.id, |ctx| ctx.map(|c| c.index)) {
            return index;
        }
        let index = inner.next_fast_path_index.fetch_add(1, Ordering::Relaxed);
        assert!(
            index < inner.fast_path_capacity,
            "fast-path thread capacity ({}) exceeded for pool '{}'",
            inner.fast_path_capacity,
            inner.name
        );
        let seed = inner.seed_counter.fetch_add(1, Ordering::Relaxed) ^ ((index as u64) << 32);
        THREAD_CONTEXTS.with(|cell| {
            cell.borrow_mut().push(ThreadContext {
                pool_id: inner.id,
                index,
                rng: VictimRng::new(seed, inner.fast_path_capacity as u64),
            });
        });
        park::bind_registry(inner.join_parking.clone());
        tracing::trace!(pool = %inner.name, index, "registered fast-path thread");
        index
    }

    /// `None` iff the caller is not registered with this pool.
    pub fn current_thread_index(&self) -> Option<usize> {
        with_context(self.0.id, |ctx| ctx.map(|c| c.index))
    }

    /// `totalThreads`: worker threads plus fast-path external slots.
    pub fn parallelism(&self) -> usize {
        self.0.fast_path_capacity
    }

    /// Idempotent. Signals every worker to exit and joins their threads.
    /// Must be called to reclaim worker threads.
    pub fn shut_down(&self) {
        let inner = &self.0;
        if inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(pool = %inner.name, "pool shutting down");
        inner.work_available.notify();
        // `notify` wakes any single parked worker via the condvar's
        // `notify_all`; looping is unnecessary since every worker rechecks
        // `cancelled` on each loop iteration and will in turn wake the next.
        let handles = std::mem::take(&mut *inner.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!(pool = %inner.name, "pool shut down");
    }

    /// Run `f` with `pool` installed as the ambient pool for this thread,
    /// restoring whatever was previously ambient on any exit path.
    pub fn with_pool<R>(pool: ComputePool, f: impl FnOnce() -> R) -> R {
        AMBIENT_POOL_STACK.with(|stack| stack.borrow_mut().push(pool));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        AMBIENT_POOL_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
        match result {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// The current thread's ambient pool, if `with_pool` has one installed,
    /// falling back to the process-wide default set via
    /// [`ComputePool::set_default`].
    pub fn current() -> Option<ComputePool> {
        let scoped = AMBIENT_POOL_STACK.with(|stack| stack.borrow().last().cloned());
        scoped.or_else(|| DEFAULT_POOL.get().and_then(|m| m.lock().unwrap().clone()))
    }

    /// Install `pool` as the process-wide default, displacing any previous
    /// default.
    pub fn set_default(pool: ComputePool) {
        let cell = DEFAULT_POOL.get_or_init(|| std::sync::Mutex::new(None));
        *cell.lock().unwrap() = Some(pool);
    }

    fn require_fast_path(&self, op: &'static str) -> Option<usize> {
        let inner = &self.0;
        let registered = with_context(inner.id, |ctx| ctx.map(|c| c.index));
        if registered.is_none() && !inner.allow_non_fast_path_threads {
            panic!(
                "{op} called from an unregistered thread on pool '{}'; \
                 either call register_current_thread() first or build the \
                 pool with allow_non_fast_path_threads(true)",
                inner.name
            );
        }
        registered
    }
}

impl PoolInner {
    fn steal(&self, rng: &VictimRng, self_index: u64) -> Option<Task> {
        let probe = rng.new_probe_sequence(self_index, &self.coprime_strides);
        for victim in probe {
            if let Some(task) = self.deques[victim as usize].pop_back() {
                return Some(task);
            }
        }
        None
    }

    /// Producer path: decide whether an idle worker needs a real wakeup or
    /// whether an already-spinning worker will find this work on its own.
    fn wakeup_worker_if_required(&self) {
        if self.spin_state.record_wakeup() {
            self.work_available.notify();
        }
    }

    /// Shared wait loop used by `join`/`parallel_for`: the caller keeps
    /// doing useful work (its own deque, then stealing, then spinning) until
    /// the awaited descriptor is done, then registers as a waiter and parks.
    fn wait_for_descriptor(&self, state: &state::TaskState, ctx_index: Option<usize>) {
        let spin_budget = (self.spin_count / self.worker_count.max(1) as u32).max(1);
        loop {
            if state.is_done(Ordering::Acquire) {
                return;
            }

            let found = ctx_index.and_then(|index| {
                with_context(self.id, |ctx| {
                    let ctx = ctx.expect("ctx_index implies a bound ThreadContext");
                    self.deques[index]
                        .pop_front()
                        .or_else(|| self.steal(&ctx.rng, index as u64))
                        .or_else(|| spin(self, &ctx.rng, index, spin_budget))
                })
            });
            if let Some(task) = found {
                task.run();
                continue;
            }

            let wake_id = ctx_index.map(|i| i as u64).unwrap_or(state::EXTERNAL_THREAD_SENTINEL);
            if state.register_waiter(wake_id) {
                return;
            }
            let spot = self.join_parking.spot(wake_id);
            let token = spot.pre_wait();
            if state.is_done(Ordering::Acquire) {
                spot.cancel_wait(token);
                return;
            }
            spot.commit_wait(token);
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>, index: usize) {
    let seed = inner.seed_counter.fetch_add(1, Ordering::Relaxed) ^ ((index as u64) << 32);
    THREAD_CONTEXTS.with(|cell| {
        cell.borrow_mut().push(ThreadContext {
            pool_id: inner.id,
            index,
            rng: VictimRng::new(seed, inner.fast_path_capacity as u64),
        });
    });
    park::bind_registry(inner.join_parking.clone());
    tracing::trace!(pool = %inner.name, index, "worker started");

    let spin_budget = (inner.spin_count / inner.worker_count.max(1) as u32).max(1);

    while !inner.cancelled.load(Ordering::Relaxed) {
        let task = with_context(inner.id, |ctx| {
            let ctx = ctx.expect("worker always has a bound ThreadContext");
            inner.deques[index]
                .pop_front()
                .or_else(|| inner.steal(&ctx.rng, index as u64))
                .or_else(|| spin(&inner, &ctx.rng, index, spin_budget))
        });

        match task {
            Some(task) => task.run(),
            None => park_until_work(&inner, index),
        }
    }

    park::unbind_registry();
    tracing::trace!(pool = %inner.name, index, "worker exiting");
}

/// Busy-loop in `steal()` before parking, bounded by the pool-wide
/// spinning state word.
fn spin(inner: &PoolInner, rng: &VictimRng, index: usize, spin_budget: u32) -> Option<Task> {
    if inner.active_workers.load(Ordering::Relaxed) > inner.min_active_for_spin as u64 {
        return None;
    }
    if !inner.spin_state.try_enter_spinning(inner.max_spinning_threads) {
        return None;
    }

    for _ in 0..spin_budget {
        if let Some(task) = inner.steal(rng, index as u64) {
            inner.spin_state.leave_spinning();
            return Some(task);
        }
        std::hint::spin_loop();
    }

    let had_debt = inner.spin_state.leave_spinning();
    if had_debt {
        inner.steal(rng, index as u64)
    } else {
        None
    }
}

fn park_until_work(inner: &PoolInner, index: usize) {
    inner.active_workers.fetch_sub(1, Ordering::AcqRel);
    let token = inner.work_available.pre_wait();

    let anything_findable = inner.deques[index].has_stealable_tasks()
        || inner.deques.iter().any(Deque::has_stealable_tasks)
        || inner.cancelled.load(Ordering::Relaxed);

    if anything_findable {
        inner.work_available.cancel_wait(token);
    } else {
        tracing::trace!(pool = %inner.name, index, "worker parking");
        inner.work_available.commit_wait(token);
        tracing::trace!(pool = %inner.name, index, "worker woke");
    }
    inner.active_workers.fetch_add(1, Ordering::AcqRel);
}

/// Runs `f` and converts a panic into an `Err` carrying its payload, the way
/// `std::panic::catch_unwind` does, asserting the closure's captured state
/// is safe to observe post-unwind (the caller only ever reads the result
/// after the unwind boundary, never resumes executing the closure).
fn catch_unwind_send<F, R>(f: F) -> Result<R, Box<dyn std::any::Any + Send + 'static>>
where
    F: FnOnce() -> R,
{
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc as StdArc;

    #[test]
    fn simple_join_increments_both_counters() {
        let pool = PoolBuilder::new().worker_threads(2).build();
        pool.register_current_thread();
        let mut a = 0;
        let mut b = 0;
        pool.join(|| a += 1, || b += 1);
        assert_eq!((a, b), (1, 1));
        pool.shut_down();
    }

    #[test]
    fn parallel_for_covers_every_index_exactly_once() {
        let pool = PoolBuilder::new().worker_threads(4).build();
        pool.register_current_thread();
        let hits: Vec<StdAtomicUsize> = (0..1000).map(|_| StdAtomicUsize::new(0)).collect();
        let hits = StdArc::new(hits);
        let hits_for_body = hits.clone();
        pool.parallel_for(1000, move |start, end, _total| {
            for i in start..end {
                hits_for_body[i].fetch_add(1, StdOrdering::SeqCst);
            }
        });
        assert!(hits.iter().all(|h| h.load(StdOrdering::SeqCst) == 1));
        pool.shut_down();
    }

    #[test]
    fn dispatch_from_foreign_thread_overflows_inline_without_blocking() {
        let pool = PoolBuilder::new()
            .worker_threads(1)
            .allow_non_fast_path_threads(true)
            .deque_capacity(4)
            .build();
        let counter = StdArc::new(StdAtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.dispatch(move || {
                counter.fetch_add(1, StdOrdering::SeqCst);
            });
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(counter.load(StdOrdering::SeqCst), 8);
        pool.shut_down();
    }

    #[test]
    fn try_join_surfaces_a_panic_from_either_side() {
        let pool = PoolBuilder::new().worker_threads(2).build();
        pool.register_current_thread();
        let result = pool.try_join(|| 1, || -> i32 { panic!("b failed") });
        assert!(result.is_err());
        pool.shut_down();
    }

    #[test]
    #[should_panic(expected = "unregistered thread")]
    fn join_from_unregistered_thread_panics_by_default() {
        let pool = PoolBuilder::new().worker_threads(1).build();
        pool.join(|| (), || ());
    }

    #[test]
    fn register_current_thread_is_idempotent() {
        let pool = PoolBuilder::new().worker_threads(1).build();
        let first = pool.register_current_thread();
        let second = pool.register_current_thread();
        assert_eq!(first, second);
        pool.shut_down();
    }
}
