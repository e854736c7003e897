//! Worker pool backing the broker: short tasks on pooled threads, dedicated
//! threads for long work, durable named threads, and delayed/repeating
//! timers.
//!
//! Submission never runs a task inline; every variant hands the closure to
//! another thread and returns.

use std::{
    collections::HashMap,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU32, Ordering},
        mpsc::{Receiver, Sender, channel},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, warn};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,
    #[error("no named thread {0:?}")]
    NoSuchThread(String),
    #[error("thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Where a submitted task runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkKind {
    /// A short task picked up by one of the pooled workers.
    Pooled,
    /// A long-running task that gets a thread of its own.
    Dedicated,
}

/// Handle for cancelling a timer queued with
/// [`queue_timer`](WorkerPool::queue_timer).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerId(u32);

struct TimerEntry {
    id: u32,
    deadline: Instant,
    period: Option<Duration>,
    task: Arc<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct TimerState {
    entries: Vec<TimerEntry>,
    stopped: bool,
}

struct NamedWorker {
    tx: Sender<Option<Task>>,
    handle: JoinHandle<()>,
}

struct Inner {
    work_tx: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dedicated: Mutex<Vec<JoinHandle<()>>>,
    named: Mutex<HashMap<String, NamedWorker>>,
    timers: Mutex<TimerState>,
    timer_cond: Condvar,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
    next_timer_id: AtomicU32,
}

/// Cheaply cloneable handle; all clones share the same threads.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// Spawns `workers` pooled threads plus the timer thread. `workers == 0`
    /// picks a default from the machine's parallelism.
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        let workers = if workers == 0 {
            thread::available_parallelism().map_or(4, |n| n.get().clamp(2, 8))
        } else {
            workers
        };

        let (tx, rx) = channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));

        let inner = Arc::new(Inner {
            work_tx: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::with_capacity(workers)),
            dedicated: Mutex::new(Vec::new()),
            named: Mutex::new(HashMap::new()),
            timers: Mutex::new(TimerState::default()),
            timer_cond: Condvar::new(),
            timer_thread: Mutex::new(None),
            next_timer_id: AtomicU32::new(1),
        });

        {
            let mut handles = inner.workers.lock().unwrap();
            for i in 0..workers {
                let rx = Arc::clone(&rx);
                let handle = thread::Builder::new()
                    .name(format!("busbar-worker-{i}"))
                    .spawn(move || worker_loop(&rx))?;
                handles.push(handle);
            }
        }

        let timer_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("busbar-timer".to_string())
            .spawn(move || timer_loop(&timer_inner))?;
        *inner.timer_thread.lock().unwrap() = Some(handle);

        debug!(workers, "pool: started");
        Ok(Self { inner })
    }

    /// Submits a task. `Dedicated` spawns a fresh thread so the pooled
    /// workers never stall behind long work.
    pub fn queue_work<F>(&self, f: F, kind: WorkKind) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        match kind {
            WorkKind::Pooled => {
                let guard = self.inner.work_tx.lock().unwrap();
                let tx = guard.as_ref().ok_or(PoolError::ShutDown)?;
                tx.send(Box::new(f)).map_err(|_| PoolError::ShutDown)
            }
            WorkKind::Dedicated => {
                let handle = thread::Builder::new()
                    .name("busbar-dedicated".to_string())
                    .spawn(f)?;
                self.inner.dedicated.lock().unwrap().push(handle);
                Ok(())
            }
        }
    }

    /// Runs a task on the durable thread named `name`, spawning it on first
    /// use. Tasks for the same name execute in submission order.
    pub fn queue_to_named<F>(&self, name: &str, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut named = self.inner.named.lock().unwrap();
        if !named.contains_key(name) {
            let (tx, rx) = channel::<Option<Task>>();
            let thread_name = format!("busbar-{name}");
            let handle =
                thread::Builder::new().name(thread_name).spawn(move || named_loop(&rx))?;
            named.insert(name.to_string(), NamedWorker { tx, handle });
        }
        let worker = named.get(name).ok_or(PoolError::ShutDown)?;
        worker.tx.send(Some(Box::new(f))).map_err(|_| PoolError::ShutDown)
    }

    pub fn has_named(&self, name: &str) -> bool {
        self.inner.named.lock().unwrap().contains_key(name)
    }

    /// Stops the named thread after it finishes its queued tasks and joins
    /// it.
    pub fn terminate_named(&self, name: &str) -> Result<(), PoolError> {
        let worker = self
            .inner
            .named
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| PoolError::NoSuchThread(name.to_string()))?;
        let _ = worker.tx.send(None);
        if worker.handle.join().is_err() {
            warn!(name, "pool: named thread panicked");
        }
        Ok(())
    }

    /// Schedules `f` to run on a pooled worker after `delay`, repeating every
    /// `delay` when `repeat` is set.
    pub fn queue_timer<F>(&self, f: F, delay: Duration, repeat: bool) -> Result<TimerId, PoolError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let entry = TimerEntry {
            id,
            deadline: Instant::now() + delay,
            period: repeat.then_some(delay),
            task: Arc::new(f),
        };
        let mut timers = self.inner.timers.lock().unwrap();
        if timers.stopped {
            return Err(PoolError::ShutDown);
        }
        timers.entries.push(entry);
        self.inner.timer_cond.notify_one();
        Ok(TimerId(id))
    }

    /// Cancels a pending timer. A timer already handed to a worker still
    /// runs that one time.
    pub fn cancel_timer(&self, id: TimerId) {
        let mut timers = self.inner.timers.lock().unwrap();
        timers.entries.retain(|e| e.id != id.0);
        self.inner.timer_cond.notify_one();
    }

    /// Stops the timer thread, closes the work queue, and joins every
    /// thread. Queued tasks still drain before the workers exit.
    pub fn shutdown(&self) {
        {
            let mut timers = self.inner.timers.lock().unwrap();
            timers.stopped = true;
            timers.entries.clear();
            self.inner.timer_cond.notify_all();
        }
        if let Some(handle) = self.inner.timer_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        // Dropping the sender ends the worker loops once the queue drains.
        self.inner.work_tx.lock().unwrap().take();
        for handle in self.inner.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        for handle in self.inner.dedicated.lock().unwrap().drain(..) {
            let _ = handle.join();
        }

        let named: Vec<String> = self.inner.named.lock().unwrap().keys().cloned().collect();
        for name in named {
            let _ = self.terminate_named(&name);
        }
        debug!("pool: shut down");
    }
}

fn worker_loop(rx: &Mutex<Receiver<Task>>) {
    loop {
        let task = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        match task {
            Ok(task) => task(),
            Err(_) => return,
        }
    }
}

fn named_loop(rx: &Receiver<Option<Task>>) {
    while let Ok(Some(task)) = rx.recv() {
        task();
    }
}

fn timer_loop(inner: &Arc<Inner>) {
    let mut timers = inner.timers.lock().unwrap();
    loop {
        if timers.stopped {
            return;
        }
        let now = Instant::now();
        let next = timers
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.deadline)
            .map(|(i, e)| (i, e.deadline));
        match next {
            None => timers = inner.timer_cond.wait(timers).unwrap(),
            Some((i, deadline)) if deadline <= now => {
                let mut entry = timers.entries.swap_remove(i);
                let task = Arc::clone(&entry.task);
                if let Some(period) = entry.period {
                    entry.deadline = now + period;
                    timers.entries.push(entry);
                }
                drop(timers);
                submit_timer_task(inner, task);
                timers = inner.timers.lock().unwrap();
            }
            Some((_, deadline)) => {
                let (guard, _) =
                    inner.timer_cond.wait_timeout(timers, deadline - now).unwrap();
                timers = guard;
            }
        }
    }
}

/// Due timers run on the pooled workers, never on the timer thread itself.
fn submit_timer_task(inner: &Inner, task: Arc<dyn Fn() + Send + Sync>) {
    let guard = inner.work_tx.lock().unwrap();
    match guard.as_ref().map(|tx| tx.send(Box::new(move || task()))) {
        Some(Ok(())) => {}
        _ => warn!("pool: dropped timer task, work queue closed"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counter_task(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(counter: &Arc<AtomicUsize>, want: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < want {
            assert!(Instant::now() < deadline, "timed out waiting for {want} tasks");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn pooled_work_runs_off_thread() {
        let pool = WorkerPool::new(2).unwrap();
        let submitter = thread::current().id();
        let (tx, rx) = channel();
        pool.queue_work(
            move || {
                tx.send(thread::current().id()).unwrap();
            },
            WorkKind::Pooled,
        )
        .unwrap();
        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(ran_on, submitter);
        pool.shutdown();
    }

    #[test]
    fn named_thread_is_reused_and_ordered() {
        let pool = WorkerPool::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let order = Arc::clone(&order);
            pool.queue_to_named("seq", move || order.lock().unwrap().push(i)).unwrap();
        }
        assert!(pool.has_named("seq"));
        pool.terminate_named("seq").unwrap();
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn timer_fires_and_repeats() {
        let pool = WorkerPool::new(1).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = pool
            .queue_timer(
                move || {
                    h.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(5),
                true,
            )
            .unwrap();
        wait_for(&hits, 3);
        pool.cancel_timer(id);
        pool.shutdown();
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let pool = WorkerPool::new(1).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = pool
            .queue_timer(counter_fn(&hits), Duration::from_millis(200), false)
            .unwrap();
        pool.cancel_timer(id);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        pool.shutdown();
    }

    fn counter_fn(counter: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dedicated_work_gets_its_own_thread() {
        let pool = WorkerPool::new(1).unwrap();
        // park the single pooled worker; dedicated work must still run
        let (block_tx, block_rx) = channel::<()>();
        pool.queue_work(
            move || {
                let _ = block_rx.recv();
            },
            WorkKind::Pooled,
        )
        .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        pool.queue_work(counter_task(&hits), WorkKind::Dedicated).unwrap();
        wait_for(&hits, 1);

        block_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn shutdown_drains_queued_work() {
        let pool = WorkerPool::new(2).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            pool.queue_work(counter_task(&hits), WorkKind::Pooled).unwrap();
        }
        pool.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 16);
        assert!(matches!(
            pool.queue_work(|| {}, WorkKind::Pooled),
            Err(PoolError::ShutDown)
        ));
    }
}
