use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, SendError, Sender};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::broadcast::pool_events::{ExitReason, PoolEvent, PoolEventBroadcaster, RestartReason};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::worker::registry::TaskRegistry;
use crate::worker::stats::{resident_memory_bytes, DurationHistory, PoolStats, WorkerInfo};
use crate::worker::task::{completion_pair, Completion, Task, TaskHandle, TaskId, WorkerId};

/// Upper bound on how long the dispatcher sleeps between housekeeping passes.
const MAX_TICK: Duration = Duration::from_millis(50);

/// Messages consumed by the dispatcher thread.
enum Inbound {
    Submit(Task),
    Terminate,
    Ready {
        worker_id: WorkerId,
    },
    Done {
        worker_id: WorkerId,
        task_id: TaskId,
        result: Result<Value, String>,
    },
    Crashed {
        worker_id: WorkerId,
        task_id: Option<TaskId>,
        reason: String,
    },
}

/// Messages sent to one worker thread.
enum WorkerRequest {
    Run {
        task_id: TaskId,
        method: String,
        args: Value,
    },
    Shutdown,
}

/// Bounded pool of worker threads executing named tasks.
///
/// A single dispatcher thread owns the queue, the worker table and the
/// in-flight table; every task leaves the in-flight table exactly once, and
/// that removal is the only place its completion is settled.
pub struct WorkerPool {
    inbound: Sender<Inbound>,
    registry: Arc<TaskRegistry>,
    stats: Arc<RwLock<PoolStats>>,
    events: PoolEventBroadcaster,
    terminated: AtomicBool,
    next_task_id: AtomicU64,
    default_timeout: Duration,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, registry: TaskRegistry) -> Result<Self, PoolError> {
        Self::with_events(config, registry, PoolEventBroadcaster::default())
    }

    /// Creates a pool that publishes lifecycle events on `events`.
    pub fn with_events(
        config: PoolConfig,
        registry: TaskRegistry,
        events: PoolEventBroadcaster,
    ) -> Result<Self, PoolError> {
        if config.max_workers == 0 {
            return Err(PoolError::SpawnFailed(
                "max_workers must be at least 1".to_string(),
            ));
        }

        let (inbound_tx, inbound_rx) = unbounded::<Inbound>();
        let registry = Arc::new(registry);
        let stats = Arc::new(RwLock::new(PoolStats::default()));
        let default_timeout = Duration::from_millis(config.task_timeout_ms);
        let min_workers = config.min_workers.min(config.max_workers);
        let max_workers = config.max_workers;

        let mut dispatcher = Dispatcher::new(
            config,
            Arc::clone(&registry),
            inbound_tx.clone(),
            Arc::clone(&stats),
            events.clone(),
        );
        dispatcher.ensure_min_workers()?;
        dispatcher.publish_stats();

        let handle = thread::Builder::new()
            .name("relocator-pool-dispatcher".to_string())
            .spawn(move || dispatcher.run(inbound_rx))
            .map_err(|e| PoolError::SpawnFailed(e.to_string()))?;

        info!(
            "Worker pool started with {} worker(s), max {}",
            min_workers, max_workers
        );

        Ok(Self {
            inbound: inbound_tx,
            registry,
            stats,
            events,
            terminated: AtomicBool::new(false),
            next_task_id: AtomicU64::new(0),
            default_timeout,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    /// Submits a task. `timeout` falls back to `task_timeout_ms`.
    ///
    /// The returned handle always settles exactly once.
    pub fn exec(&self, method: &str, args: Value, timeout: Option<Duration>) -> TaskHandle {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (completion, handle) = completion_pair(task_id);

        if self.terminated.load(Ordering::SeqCst) {
            completion.settle(Err(PoolError::Terminated));
            return handle;
        }
        if !self.registry.contains(method) {
            completion.settle(Err(PoolError::UnknownMethod(method.to_string())));
            return handle;
        }

        let task = Task {
            id: task_id,
            method: method.to_string(),
            args,
            timeout: timeout.unwrap_or(self.default_timeout),
            created_at: Instant::now(),
            completion,
        };
        if let Err(SendError(Inbound::Submit(task))) = self.inbound.send(Inbound::Submit(task)) {
            task.completion.settle(Err(PoolError::Terminated));
        }
        handle
    }

    /// Submits a task and blocks until it settles.
    pub fn exec_wait(
        &self,
        method: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, PoolError> {
        self.exec(method, args, timeout).wait()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Rejects queued and in-flight tasks with `Terminated` and stops all
    /// workers. Idempotent.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            let _ = self.inbound.send(Inbound::Terminate);
        }

        let handle = match self.dispatcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Worker pool dispatcher panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

struct WorkerSlot {
    id: WorkerId,
    requests: Sender<WorkerRequest>,
    handle: Option<JoinHandle<()>>,
    ready: bool,
    current_task: Option<TaskId>,
    tasks_completed: u64,
    restart_count: u32,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
}

impl WorkerSlot {
    fn is_idle(&self) -> bool {
        self.ready && self.current_task.is_none()
    }

    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            ready: self.ready,
            busy: self.current_task.is_some(),
            current_task: self.current_task,
            tasks_completed: self.tasks_completed,
            restart_count: self.restart_count,
            last_used: self.last_used_at,
        }
    }
}

struct InFlight {
    method: String,
    worker_id: WorkerId,
    started_at: Instant,
    deadline: Instant,
    timeout: Duration,
    completion: Completion,
}

#[derive(Default)]
struct Counters {
    completed: u64,
    failed: u64,
    timed_out: u64,
    crashed: u64,
    restarts: u64,
}

struct Dispatcher {
    config: PoolConfig,
    registry: Arc<TaskRegistry>,
    inbound: Sender<Inbound>,
    stats: Arc<RwLock<PoolStats>>,
    events: PoolEventBroadcaster,
    queue: VecDeque<Task>,
    workers: BTreeMap<WorkerId, WorkerSlot>,
    in_flight: HashMap<TaskId, InFlight>,
    next_worker_id: WorkerId,
    history: DurationHistory,
    counters: Counters,
    memory_bytes: Option<u64>,
    last_stats_event: Instant,
}

impl Dispatcher {
    fn new(
        config: PoolConfig,
        registry: Arc<TaskRegistry>,
        inbound: Sender<Inbound>,
        stats: Arc<RwLock<PoolStats>>,
        events: PoolEventBroadcaster,
    ) -> Self {
        let history = DurationHistory::new(config.duration_history);
        Self {
            config,
            registry,
            inbound,
            stats,
            events,
            queue: VecDeque::new(),
            workers: BTreeMap::new(),
            in_flight: HashMap::new(),
            next_worker_id: 1,
            history,
            counters: Counters::default(),
            memory_bytes: resident_memory_bytes(),
            last_stats_event: Instant::now(),
        }
    }

    fn min_workers(&self) -> usize {
        self.config.min_workers.min(self.config.max_workers)
    }

    fn run(mut self, inbound: Receiver<Inbound>) {
        debug!("Worker pool dispatcher started");

        loop {
            match inbound.recv_timeout(self.next_wakeup()) {
                Ok(Inbound::Terminate) => break,
                Ok(message) => self.handle(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            self.expire_timeouts();
            self.dispatch();
            self.reap_idle();
            if let Err(e) = self.ensure_min_workers() {
                error!("Failed to restore minimum worker count: {}", e);
            }
            self.publish_stats();
            self.maybe_emit_stats_event();
        }

        self.shutdown(&inbound);
    }

    fn next_wakeup(&self) -> Duration {
        let now = Instant::now();
        self.in_flight
            .values()
            .map(|f| f.deadline.saturating_duration_since(now))
            .min()
            .map_or(MAX_TICK, |d| d.min(MAX_TICK))
    }

    fn handle(&mut self, message: Inbound) {
        match message {
            Inbound::Submit(task) => {
                debug!("Queued task {} ({})", task.id, task.method);
                self.queue.push_back(task);
            }
            Inbound::Ready { worker_id } => {
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    slot.ready = true;
                    slot.last_used = Instant::now();
                    debug!("Worker {} ready", worker_id);
                    self.events.send(PoolEvent::Ready { worker_id });
                }
            }
            Inbound::Done {
                worker_id,
                task_id,
                result,
            } => self.on_done(worker_id, task_id, result),
            Inbound::Crashed {
                worker_id,
                task_id,
                reason,
            } => self.on_crash(worker_id, task_id, reason),
            Inbound::Terminate => {}
        }
    }

    fn on_done(&mut self, worker_id: WorkerId, task_id: TaskId, result: Result<Value, String>) {
        let Some(flight) = self.in_flight.remove(&task_id) else {
            debug!(
                "Discarding late result for task {} from worker {}",
                task_id, worker_id
            );
            return;
        };

        self.history.record(flight.started_at.elapsed());
        let outcome = match result {
            Ok(value) => {
                self.counters.completed += 1;
                Ok(value)
            }
            Err(message) => {
                self.counters.failed += 1;
                debug!("Task {} ({}) failed: {}", task_id, flight.method, message);
                Err(PoolError::TaskFailed(message))
            }
        };

        let mut recycle = false;
        if let Some(slot) = self.workers.get_mut(&worker_id) {
            slot.current_task = None;
            slot.tasks_completed += 1;
            slot.last_used = Instant::now();
            slot.last_used_at = Utc::now();
            recycle = slot.tasks_completed >= self.config.max_tasks_per_worker;
        }

        self.publish_stats();
        flight.completion.settle(outcome);

        if recycle {
            self.restart_worker(worker_id, RestartReason::MaxTasks);
        }
    }

    fn on_crash(&mut self, worker_id: WorkerId, task_id: Option<TaskId>, reason: String) {
        let Some(mut slot) = self.workers.remove(&worker_id) else {
            debug!("Ignoring crash report from retired worker {}", worker_id);
            return;
        };
        error!("Worker {} crashed: {}", worker_id, reason);

        if let Some(handle) = slot.handle.take() {
            let _ = handle.join();
        }

        if let Some(flight) = task_id
            .or(slot.current_task)
            .and_then(|id| self.in_flight.remove(&id))
        {
            self.counters.failed += 1;
            self.counters.crashed += 1;
            self.publish_stats();
            flight.completion.settle(Err(PoolError::WorkerCrashed { worker_id, reason }));
        }

        if self.workers.len() < self.min_workers() {
            self.spawn_replacement(worker_id, slot.restart_count, RestartReason::Crash);
        } else {
            self.events.send(PoolEvent::Exited {
                worker_id,
                reason: ExitReason::Crashed,
            });
        }
    }

    fn expire_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for task_id in expired {
            let Some(flight) = self.in_flight.remove(&task_id) else {
                continue;
            };
            warn!(
                "Task {} ({}) timed out after {:?} on worker {}",
                task_id, flight.method, flight.timeout, flight.worker_id
            );
            self.counters.failed += 1;
            self.counters.timed_out += 1;
            self.events.send(PoolEvent::TaskTimedOut {
                task_id,
                worker_id: flight.worker_id,
                method: flight.method.clone(),
            });

            // The hung thread is abandoned: dropping its request channel lets
            // it exit once the handler returns, and its late result is
            // discarded because the task is no longer in flight.
            if let Some(slot) = self.workers.remove(&flight.worker_id) {
                self.spawn_replacement(slot.id, slot.restart_count, RestartReason::Timeout);
            }

            self.publish_stats();
            flight.completion.settle(Err(PoolError::Timeout {
                task_id,
                method: flight.method,
                timeout_ms: flight.timeout.as_millis() as u64,
            }));
        }
    }

    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let idle = self.workers.values().find(|w| w.is_idle()).map(|w| w.id);
            if let Some(worker_id) = idle {
                if let Some(task) = self.queue.pop_front() {
                    self.assign(worker_id, task);
                }
                continue;
            }

            let starting = self.workers.values().filter(|w| !w.ready).count();
            if self.workers.len() >= self.config.max_workers || self.queue.len() <= starting {
                break;
            }
            // The match is retried once the new worker reports Ready.
            if let Err(e) = self.spawn_worker(0) {
                error!("Failed to spawn worker: {}", e);
                if self.workers.is_empty() {
                    if let Some(task) = self.queue.pop_front() {
                        task.completion.settle(Err(e));
                    }
                    continue;
                }
                break;
            }
        }
    }

    fn assign(&mut self, worker_id: WorkerId, mut task: Task) {
        let Some(slot) = self.workers.get_mut(&worker_id) else {
            self.queue.push_front(task);
            return;
        };

        let request = WorkerRequest::Run {
            task_id: task.id,
            method: task.method.clone(),
            args: std::mem::take(&mut task.args),
        };
        if let Err(SendError(request)) = slot.requests.send(request) {
            warn!(
                "Worker {} stopped accepting work; requeueing task {}",
                worker_id, task.id
            );
            if let WorkerRequest::Run { args, .. } = request {
                task.args = args;
            }
            self.queue.push_front(task);
            self.workers.remove(&worker_id);
            return;
        }

        slot.current_task = Some(task.id);
        let now = Instant::now();
        debug!(
            "Dispatched task {} ({}) to worker {} after {:?} in queue",
            task.id,
            task.method,
            worker_id,
            task.created_at.elapsed()
        );
        self.in_flight.insert(
            task.id,
            InFlight {
                method: task.method,
                worker_id,
                started_at: now,
                deadline: now + task.timeout,
                timeout: task.timeout,
                completion: task.completion,
            },
        );
    }

    fn reap_idle(&mut self) {
        let idle_timeout = Duration::from_millis(self.config.worker_idle_timeout_ms);
        while self.workers.len() > self.min_workers() {
            let candidate = self
                .workers
                .values()
                .find(|w| w.is_idle() && w.last_used.elapsed() >= idle_timeout)
                .map(|w| w.id);
            let Some(worker_id) = candidate else {
                break;
            };
            if let Some(slot) = self.workers.remove(&worker_id) {
                debug!("Worker {} idle for {:?}, stopping", worker_id, idle_timeout);
                stop_worker(slot);
                self.events.send(PoolEvent::Exited {
                    worker_id,
                    reason: ExitReason::Idle,
                });
            }
        }
    }

    fn ensure_min_workers(&mut self) -> Result<(), PoolError> {
        while self.workers.len() < self.min_workers() {
            self.spawn_worker(0)?;
        }
        Ok(())
    }

    fn spawn_worker(&mut self, restart_count: u32) -> Result<WorkerId, PoolError> {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        let (request_tx, request_rx) = unbounded::<WorkerRequest>();
        let inbound = self.inbound.clone();
        let registry = Arc::clone(&self.registry);

        let handle = thread::Builder::new()
            .name(format!("relocator-worker-{}", worker_id))
            .stack_size(self.config.worker_stack_size_bytes)
            .spawn(move || run_worker(worker_id, request_rx, inbound, registry))
            .map_err(|e| PoolError::SpawnFailed(e.to_string()))?;

        self.workers.insert(
            worker_id,
            WorkerSlot {
                id: worker_id,
                requests: request_tx,
                handle: Some(handle),
                ready: false,
                current_task: None,
                tasks_completed: 0,
                restart_count,
                last_used: Instant::now(),
                last_used_at: Utc::now(),
            },
        );
        debug!("Spawned worker {}", worker_id);
        self.events.send(PoolEvent::Spawned { worker_id });
        Ok(worker_id)
    }

    fn restart_worker(&mut self, worker_id: WorkerId, reason: RestartReason) {
        let Some(slot) = self.workers.remove(&worker_id) else {
            return;
        };
        let restart_count = slot.restart_count;
        stop_worker(slot);
        self.spawn_replacement(worker_id, restart_count, reason);
    }

    fn spawn_replacement(
        &mut self,
        old_worker_id: WorkerId,
        restart_count: u32,
        reason: RestartReason,
    ) {
        let restart_count = restart_count + 1;
        match self.spawn_worker(restart_count) {
            Ok(new_worker_id) => {
                self.counters.restarts += 1;
                info!(
                    "Worker {} replaced by worker {} ({:?}, restart #{})",
                    old_worker_id, new_worker_id, reason, restart_count
                );
                self.events.send(PoolEvent::Restarted {
                    old_worker_id,
                    new_worker_id,
                    restart_count,
                    reason,
                });
            }
            Err(e) => error!("Failed to replace worker {}: {}", old_worker_id, e),
        }
    }

    fn snapshot(&self) -> PoolStats {
        let busy = self
            .workers
            .values()
            .filter(|w| w.current_task.is_some())
            .count();
        let idle = self.workers.values().filter(|w| w.is_idle()).count();
        PoolStats {
            total_workers: self.workers.len(),
            busy_workers: busy,
            idle_workers: idle,
            queued_tasks: self.queue.len(),
            completed_tasks: self.counters.completed,
            failed_tasks: self.counters.failed,
            timed_out_tasks: self.counters.timed_out,
            crashed_tasks: self.counters.crashed,
            restarts: self.counters.restarts,
            avg_task_duration_ms: self.history.average_ms(),
            memory_bytes: self.memory_bytes,
            workers: self.workers.values().map(WorkerSlot::info).collect(),
        }
    }

    fn publish_stats(&self) {
        let snapshot = self.snapshot();
        match self.stats.write() {
            Ok(mut stats) => *stats = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    fn maybe_emit_stats_event(&mut self) {
        let interval = Duration::from_millis(self.config.stats_interval_ms);
        if self.last_stats_event.elapsed() < interval {
            return;
        }
        self.last_stats_event = Instant::now();
        self.memory_bytes = resident_memory_bytes();

        let snapshot = self.snapshot();
        debug!(
            "Pool stats: {} workers ({} busy), {} queued, {} completed, {} failed",
            snapshot.total_workers,
            snapshot.busy_workers,
            snapshot.queued_tasks,
            snapshot.completed_tasks,
            snapshot.failed_tasks
        );
        self.events.send(PoolEvent::Stats(snapshot));
    }

    fn shutdown(&mut self, inbound: &Receiver<Inbound>) {
        info!("Shutting down worker pool...");

        for task in self.queue.drain(..) {
            task.completion.settle(Err(PoolError::Terminated));
        }
        for (_, flight) in self.in_flight.drain() {
            flight.completion.settle(Err(PoolError::Terminated));
        }
        // Submissions that raced with terminate.
        while let Ok(message) = inbound.try_recv() {
            if let Inbound::Submit(task) = message {
                task.completion.settle(Err(PoolError::Terminated));
            }
        }

        let workers = std::mem::take(&mut self.workers);
        for (worker_id, slot) in workers {
            if slot.current_task.is_some() {
                // Busy threads are left to finish on their own.
                let _ = slot.requests.send(WorkerRequest::Shutdown);
            } else {
                stop_worker(slot);
            }
            self.events.send(PoolEvent::Exited {
                worker_id,
                reason: ExitReason::Shutdown,
            });
        }

        self.publish_stats();
        info!("Worker pool stopped");
    }
}

fn stop_worker(mut slot: WorkerSlot) {
    let _ = slot.requests.send(WorkerRequest::Shutdown);
    if let Some(handle) = slot.handle.take() {
        if handle.join().is_err() {
            error!("Worker {} panicked during shutdown", slot.id);
        }
    }
}

fn run_worker(
    worker_id: WorkerId,
    requests: Receiver<WorkerRequest>,
    inbound: Sender<Inbound>,
    registry: Arc<TaskRegistry>,
) {
    debug!("Worker {} started", worker_id);
    if inbound.send(Inbound::Ready { worker_id }).is_err() {
        return;
    }

    while let Ok(request) = requests.recv() {
        let (task_id, method, args) = match request {
            WorkerRequest::Run {
                task_id,
                method,
                args,
            } => (task_id, method, args),
            WorkerRequest::Shutdown => break,
        };

        let Some(handler) = registry.get(&method) else {
            let result = Err(format!("No handler registered for method '{}'", method));
            if inbound
                .send(Inbound::Done {
                    worker_id,
                    task_id,
                    result,
                })
                .is_err()
            {
                break;
            }
            continue;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
            Ok(result) => {
                if inbound
                    .send(Inbound::Done {
                        worker_id,
                        task_id,
                        result,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(payload) => {
                let _ = inbound.send(Inbound::Crashed {
                    worker_id,
                    task_id: Some(task_id),
                    reason: panic_message(payload.as_ref()),
                });
                return;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(min_workers: usize, max_workers: usize) -> PoolConfig {
        PoolConfig {
            min_workers,
            max_workers,
            task_timeout_ms: 5_000,
            max_tasks_per_worker: 100,
            worker_idle_timeout_ms: 60_000,
            stats_interval_ms: 60_000,
            worker_stack_size_bytes: 2 * 1024 * 1024,
            duration_history: 10,
        }
    }

    fn test_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry
            .register("echo", Ok)
            .register("sleep", |args| {
                let ms = args["ms"].as_u64().unwrap_or(0);
                thread::sleep(Duration::from_millis(ms));
                Ok(args)
            })
            .register("fail", |_| Err("handler refused".to_string()))
            .register("panic", |_| panic!("boom"));
        registry
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn drain_events(rx: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_exec_returns_handler_result() {
        let pool = WorkerPool::new(test_config(1, 2), test_registry()).unwrap();

        let result = pool.exec_wait("echo", json!({"photo": "p1"}), None);
        assert_eq!(result, Ok(json!({"photo": "p1"})));

        let stats = pool.stats();
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.failed_tasks, 0);
    }

    #[test]
    fn test_handler_error_fails_task() {
        let pool = WorkerPool::new(test_config(1, 1), test_registry()).unwrap();

        let result = pool.exec_wait("fail", Value::Null, None);
        assert_eq!(
            result,
            Err(PoolError::TaskFailed("handler refused".to_string()))
        );
        assert_eq!(pool.stats().failed_tasks, 1);

        // The worker survives a handler error.
        assert_eq!(pool.exec_wait("echo", json!(1), None), Ok(json!(1)));
    }

    #[test]
    fn test_unknown_method_settles_immediately() {
        let pool = WorkerPool::new(test_config(1, 1), test_registry()).unwrap();
        let result = pool.exec("resize", Value::Null, None).wait();
        assert_eq!(result, Err(PoolError::UnknownMethod("resize".to_string())));
    }

    #[test]
    fn test_timeout_rejects_and_replaces_worker() {
        let pool = WorkerPool::new(test_config(1, 1), test_registry()).unwrap();
        let mut events = pool.subscribe();

        let started = Instant::now();
        let result = pool
            .exec("sleep", json!({"ms": 500}), Some(Duration::from_millis(50)))
            .wait();
        let elapsed = started.elapsed();

        match result {
            Err(PoolError::Timeout { timeout_ms, method, .. }) => {
                assert_eq!(timeout_ms, 50);
                assert_eq!(method, "sleep");
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(elapsed < Duration::from_millis(400), "took {:?}", elapsed);

        assert!(wait_until(Duration::from_secs(2), || {
            let stats = pool.stats();
            stats.total_workers == 1 && stats.idle_workers == 1
        }));
        let stats = pool.stats();
        assert_eq!(stats.timed_out_tasks, 1);
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.workers[0].restart_count, 1);

        let events = drain_events(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::Restarted {
                reason: RestartReason::Timeout,
                restart_count: 1,
                ..
            }
        )));

        // The abandoned worker's late result must not count as a completion.
        thread::sleep(Duration::from_millis(550));
        assert_eq!(pool.stats().completed_tasks, 0);
        assert_eq!(pool.exec_wait("echo", json!("after"), None), Ok(json!("after")));
    }

    #[test]
    fn test_crash_settles_task_and_pool_recovers() {
        let pool = WorkerPool::new(test_config(1, 1), test_registry()).unwrap();

        match pool.exec_wait("panic", Value::Null, None) {
            Err(PoolError::WorkerCrashed { reason, .. }) => assert_eq!(reason, "boom"),
            other => panic!("expected crash, got {:?}", other),
        }

        assert_eq!(pool.exec_wait("echo", json!(2), None), Ok(json!(2)));
        let stats = pool.stats();
        assert_eq!(stats.crashed_tasks, 1);
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.total_workers, 1);
    }

    #[test]
    fn test_long_task_does_not_block_second_worker() {
        let pool = WorkerPool::new(test_config(1, 2), test_registry()).unwrap();

        let first = pool.exec("sleep", json!({"ms": 300}), None);
        let rest: Vec<TaskHandle> = (0..4)
            .map(|i| pool.exec("sleep", json!({"ms": 10, "i": i}), None))
            .collect();

        let mut rest = rest.into_iter();
        let second = rest.next().unwrap();
        let third = rest.next().unwrap();
        assert!(second.wait().is_ok());
        assert!(third.wait().is_ok());
        assert!(
            first.try_result().is_none(),
            "tasks 2 and 3 should finish while task 1 is still running"
        );

        for handle in rest {
            assert!(handle.wait().is_ok());
        }
        assert_eq!(first.wait(), Ok(json!({"ms": 300})));

        let stats = pool.stats();
        assert_eq!(stats.completed_tasks, 5);
        assert!(stats.total_workers <= 2);
    }

    #[test]
    fn test_worker_restarted_after_max_tasks() {
        let mut config = test_config(1, 1);
        config.max_tasks_per_worker = 2;
        let pool = WorkerPool::new(config, test_registry()).unwrap();
        let mut events = pool.subscribe();

        for i in 0..3 {
            assert_eq!(pool.exec_wait("echo", json!(i), None), Ok(json!(i)));
        }

        assert!(wait_until(Duration::from_secs(2), || pool.stats().restarts >= 1));
        let events = drain_events(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::Restarted {
                reason: RestartReason::MaxTasks,
                ..
            }
        )));
        assert_eq!(pool.stats().completed_tasks, 3);
    }

    #[test]
    fn test_idle_workers_reaped_down_to_minimum() {
        let mut config = test_config(1, 3);
        config.worker_idle_timeout_ms = 50;
        let pool = WorkerPool::new(config, test_registry()).unwrap();
        let mut events = pool.subscribe();

        let handles: Vec<TaskHandle> = (0..3)
            .map(|_| pool.exec("sleep", json!({"ms": 100}), None))
            .collect();
        for handle in handles {
            assert!(handle.wait().is_ok());
        }

        assert!(wait_until(Duration::from_secs(2), || {
            pool.stats().total_workers == 1
        }));
        let events = drain_events(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::Exited {
                reason: ExitReason::Idle,
                ..
            }
        )));
    }

    #[test]
    fn test_terminate_rejects_pending_and_future_tasks() {
        let pool = WorkerPool::new(test_config(1, 1), test_registry()).unwrap();

        let running = pool.exec("sleep", json!({"ms": 300}), None);
        let queued = pool.exec("echo", json!(1), None);
        thread::sleep(Duration::from_millis(20));

        pool.terminate();
        assert!(pool.is_terminated());
        assert_eq!(running.wait(), Err(PoolError::Terminated));
        assert_eq!(queued.wait(), Err(PoolError::Terminated));
        assert_eq!(
            pool.exec("echo", json!(2), None).wait(),
            Err(PoolError::Terminated)
        );

        // Second terminate is a no-op.
        pool.terminate();
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "worker panicked");
    }
}
