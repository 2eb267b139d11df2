//! Bounded priority operation queue with identifier-based coalescing.
//!
//! Work is submitted as closures and executed by a fixed pool of worker
//! threads. Each submission carries a [`Priority`]; operations are FIFO
//! within a priority and higher priorities overtake lower ones.
//!
//! Submissions may also carry an identifier plus a piece of coalescing
//! data. While an operation with the same identifier is still *pending*
//! (queued, not yet running), a new submission does not enqueue a second
//! operation: its data is folded into the pending one with the supplied
//! merge function, its completion handler is appended, and its work
//! closure is dropped. When the pending operation eventually runs it
//! receives the merged data, and every accumulated completion handler
//! runs after it.
//!
//! # Example
//!
//! ```
//! use diskstash_opqueue::{OperationQueue, Priority};
//!
//! let queue: OperationQueue<u64> = OperationQueue::new(1);
//! queue.schedule(Priority::Default, || println!("hello"));
//! queue.wait_until_idle();
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// Scheduling priority of a submitted operation.
///
/// Operations of a higher priority overtake queued operations of a lower
/// one; within a priority, execution order is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Background work (eviction sweeps, maintenance).
    Low,
    /// Regular reads and writes.
    Default,
    /// Configuration writes and urgent maintenance.
    High,
}

const LANE_COUNT: usize = 3;

impl Priority {
    /// Lane index in pop order (high first).
    fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Default => 1,
            Priority::Low => 2,
        }
    }
}

type Work<D> = Box<dyn FnOnce(Option<D>) + Send>;

/// Boxed completion handler run after an operation finishes.
pub type Completion = Box<dyn FnOnce() + Send>;

struct Operation<D> {
    priority: Priority,
    identifier: Option<String>,
    data: Option<D>,
    work: Work<D>,
    completions: Vec<Completion>,
}

struct QueueState<D> {
    /// Operation ids per lane, indexed by [`Priority::lane`].
    lanes: [VecDeque<u64>; LANE_COUNT],
    /// Pending (not yet running) operations by id.
    pending: HashMap<u64, Operation<D>>,
    /// Pending operation id per coalescing identifier.
    identifiers: HashMap<String, u64>,
    next_id: u64,
    running: usize,
    stopping: bool,
}

impl<D> QueueState<D> {
    fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    /// Pop the highest-priority pending operation, unregistering its
    /// identifier so later same-identifier submissions enqueue fresh.
    fn pop_next(&mut self) -> Option<Operation<D>> {
        for lane in &mut self.lanes {
            while let Some(id) = lane.pop_front() {
                if let Some(op) = self.pending.remove(&id) {
                    if let Some(identifier) = &op.identifier {
                        if self.identifiers.get(identifier) == Some(&id) {
                            self.identifiers.remove(identifier);
                        }
                    }
                    return Some(op);
                }
            }
        }
        None
    }
}

struct QueueShared<D> {
    state: Mutex<QueueState<D>>,
    work_ready: Condvar,
    idle: Condvar,
}

/// Fixed-concurrency priority operation queue.
///
/// Generic over the coalescing payload `D` carried by identifier-bearing
/// submissions. Dropping the queue stops the workers once their current
/// operations finish; still-pending work is discarded.
pub struct OperationQueue<D = ()> {
    shared: Arc<QueueShared<D>>,
    workers: Vec<JoinHandle<()>>,
}

impl<D: Send + 'static> OperationQueue<D> {
    /// Create a queue backed by `max_concurrency` worker threads.
    ///
    /// # Arguments
    /// * `max_concurrency` - Worker thread count; clamped to at least 1
    pub fn new(max_concurrency: usize) -> Self {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                pending: HashMap::new(),
                identifiers: HashMap::new(),
                next_id: 0,
                running: 0,
                stopping: false,
            }),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
        });

        let workers: Vec<JoinHandle<()>> = (0..max_concurrency.max(1))
            .map(|i| {
                let shared: Arc<QueueShared<D>> = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("opqueue-worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("Failed to spawn operation queue worker")
            })
            .collect();

        Self { shared, workers }
    }

    /// Create a queue sized to the machine's available parallelism.
    pub fn with_default_concurrency() -> Self {
        let concurrency: usize = thread::available_parallelism().map(usize::from).unwrap_or(4);
        Self::new(concurrency)
    }

    /// Submit a fire-and-forget operation.
    ///
    /// # Arguments
    /// * `priority` - Scheduling priority
    /// * `work` - Closure run on a worker thread
    pub fn schedule(&self, priority: Priority, work: impl FnOnce() + Send + 'static) {
        self.push(priority, None, None, Box::new(move |_| work()), Vec::new());
    }

    /// Submit an operation that coalesces with a pending one sharing
    /// `identifier`.
    ///
    /// If no pending operation carries the identifier, this enqueues
    /// normally. Otherwise the pending operation's data becomes
    /// `merge(existing, data)`, its priority is raised to the higher of
    /// the two, `completion` is appended to its handlers, and `work` is
    /// dropped. A running operation never coalesces.
    ///
    /// # Arguments
    /// * `priority` - Scheduling priority
    /// * `identifier` - Coalescing identity
    /// * `data` - Payload handed to `work` (merged across submissions)
    /// * `merge` - Pure merge of two payloads
    /// * `work` - Closure receiving the (possibly merged) payload
    /// * `completion` - Handler run after the operation; all coalesced
    ///   submissions' handlers run when the merged operation completes
    pub fn schedule_coalescing(
        &self,
        priority: Priority,
        identifier: impl Into<String>,
        data: D,
        merge: fn(D, D) -> D,
        work: impl FnOnce(D) + Send + 'static,
        completion: Option<Completion>,
    ) {
        let identifier: String = identifier.into();
        let mut state = self.shared.state.lock();
        if state.stopping {
            return;
        }

        let existing: Option<u64> = state.identifiers.get(&identifier).copied();
        if let Some(id) = existing {
            let relocate: Option<(usize, usize)> = match state.pending.get_mut(&id) {
                Some(op) => {
                    op.data = Some(match op.data.take() {
                        Some(current) => merge(current, data),
                        None => data,
                    });
                    if let Some(completion) = completion {
                        op.completions.push(completion);
                    }
                    if priority > op.priority {
                        let from: usize = op.priority.lane();
                        op.priority = priority;
                        Some((from, priority.lane()))
                    } else {
                        None
                    }
                }
                None => None,
            };
            if let Some((from, to)) = relocate {
                state.lanes[from].retain(|&queued| queued != id);
                state.lanes[to].push_back(id);
            }
            return;
        }

        drop(state);
        self.push(
            priority,
            Some(identifier),
            Some(data),
            Box::new(move |data| {
                if let Some(data) = data {
                    work(data);
                }
            }),
            completion.into_iter().collect(),
        );
    }

    /// Block until no operation is pending or running.
    pub fn wait_until_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.running > 0 || !state.is_empty() {
            self.shared.idle.wait(&mut state);
        }
    }

    fn push(
        &self,
        priority: Priority,
        identifier: Option<String>,
        data: Option<D>,
        work: Work<D>,
        completions: Vec<Completion>,
    ) {
        let mut state = self.shared.state.lock();
        if state.stopping {
            return;
        }
        let id: u64 = state.next_id;
        state.next_id += 1;
        if let Some(identifier) = &identifier {
            state.identifiers.insert(identifier.clone(), id);
        }
        state.pending.insert(
            id,
            Operation {
                priority,
                identifier,
                data,
                work,
                completions,
            },
        );
        state.lanes[priority.lane()].push_back(id);
        drop(state);
        self.shared.work_ready.notify_one();
    }
}

impl<D: Send + 'static> Default for OperationQueue<D> {
    fn default() -> Self {
        Self::with_default_concurrency()
    }
}

impl<D> Drop for OperationQueue<D> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
            for lane in &mut state.lanes {
                lane.clear();
            }
            state.pending.clear();
            state.identifiers.clear();
        }
        self.shared.work_ready.notify_all();
        self.shared.idle.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop<D>(shared: Arc<QueueShared<D>>) {
    loop {
        let op: Operation<D> = {
            let mut state = shared.state.lock();
            loop {
                if state.stopping {
                    return;
                }
                if let Some(op) = state.pop_next() {
                    state.running += 1;
                    break op;
                }
                shared.work_ready.wait(&mut state);
            }
        };

        (op.work)(op.data);
        for completion in op.completions {
            completion();
        }

        let mut state = shared.state.lock();
        state.running -= 1;
        if state.running == 0 && state.is_empty() {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_schedule_runs_work() {
        let queue: OperationQueue = OperationQueue::new(2);
        let (tx, rx) = mpsc::channel::<u32>();
        queue.schedule(Priority::Default, move || {
            tx.send(7).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), 7);
    }

    #[test]
    fn test_priority_overtakes_fifo() {
        // Single worker; a blocker keeps the lanes backed up so the
        // later submissions are ordered purely by priority.
        let queue: OperationQueue = OperationQueue::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        queue.schedule(Priority::Default, move || {
            gate_rx.recv().unwrap();
        });

        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        for (priority, label) in [
            (Priority::Low, "low"),
            (Priority::Default, "default"),
            (Priority::High, "high"),
        ] {
            let order: Arc<Mutex<Vec<&'static str>>> = Arc::clone(&order);
            queue.schedule(priority, move || order.lock().push(label));
        }

        gate_tx.send(()).unwrap();
        queue.wait_until_idle();
        assert_eq!(*order.lock(), vec!["high", "default", "low"]);
    }

    #[test]
    fn test_coalescing_merges_data_and_runs_all_completions() {
        let queue: OperationQueue<u64> = OperationQueue::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        queue.schedule(Priority::Default, move || {
            gate_rx.recv().unwrap();
        });

        let observed = Arc::new(Mutex::new(Vec::<u64>::new()));
        let completions = Arc::new(AtomicUsize::new(0));
        for target in [100u64, 200] {
            let observed: Arc<Mutex<Vec<u64>>> = Arc::clone(&observed);
            let completions: Arc<AtomicUsize> = Arc::clone(&completions);
            queue.schedule_coalescing(
                Priority::Low,
                "trim",
                target,
                u64::max,
                move |merged| observed.lock().push(merged),
                Some(Box::new(move || {
                    completions.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }

        gate_tx.send(()).unwrap();
        queue.wait_until_idle();
        assert_eq!(*observed.lock(), vec![200]);
        assert_eq!(completions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_distinct_identifiers_do_not_coalesce() {
        let queue: OperationQueue<u64> = OperationQueue::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        queue.schedule(Priority::Default, move || {
            gate_rx.recv().unwrap();
        });

        let runs = Arc::new(AtomicUsize::new(0));
        for identifier in ["a", "b"] {
            let runs: Arc<AtomicUsize> = Arc::clone(&runs);
            queue.schedule_coalescing(
                Priority::Default,
                identifier,
                1,
                u64::max,
                move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                },
                None,
            );
        }

        gate_tx.send(()).unwrap();
        queue.wait_until_idle();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_coalescing_raises_priority() {
        let queue: OperationQueue<u64> = OperationQueue::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        queue.schedule(Priority::Default, move || {
            gate_rx.recv().unwrap();
        });

        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        {
            let order: Arc<Mutex<Vec<&'static str>>> = Arc::clone(&order);
            queue.schedule_coalescing(
                Priority::Low,
                "raise",
                1,
                u64::max,
                move |_| order.lock().push("coalesced"),
                None,
            );
        }
        {
            let order: Arc<Mutex<Vec<&'static str>>> = Arc::clone(&order);
            queue.schedule(Priority::Default, move || order.lock().push("plain"));
        }
        // Second submission upgrades the pending "raise" op to High, so
        // it runs ahead of the Default op scheduled before it.
        queue.schedule_coalescing(Priority::High, "raise", 2, u64::max, |_| {}, None);

        gate_tx.send(()).unwrap();
        queue.wait_until_idle();
        assert_eq!(*order.lock(), vec!["coalesced", "plain"]);
    }

    #[test]
    fn test_wait_until_idle_drains_burst() {
        let queue: OperationQueue = OperationQueue::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter: Arc<AtomicUsize> = Arc::clone(&counter);
            queue.schedule(Priority::Default, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.wait_until_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_identifier_reusable_after_run() {
        let queue: OperationQueue<u64> = OperationQueue::new(1);
        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let runs: Arc<AtomicUsize> = Arc::clone(&runs);
            queue.schedule_coalescing(
                Priority::Default,
                "repeat",
                1,
                u64::max,
                move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                },
                None,
            );
            queue.wait_until_idle();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
