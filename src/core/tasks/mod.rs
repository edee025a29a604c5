//! Dependency-ordered task execution
//!
//! [`TaskRunner`] runs named task bodies on a fixed worker pool. A task is
//! submitted together with the tasks it consumes, so a task can only depend
//! on tasks that already exist and the graph is acyclic by construction.
//!
//! Guarantees:
//! - a body starts only after every input succeeded
//! - if an input fails, the dependent fails with the same [`TaskFailure`]
//!   and its body never runs
//! - [`TaskRunner::join`] returns once every submitted task is terminal
//!
//! Bodies run to completion once dispatched; there is no mid-flight
//! cancellation. Calling `join` or `Task::get` on a pending task from inside
//! a task body can deadlock the pool and must not be done.

mod cell;

use cell::{Dependency, TaskCell};

use crate::core::error::{DeployError, Result};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info_span, warn};

/// Failure of a task, shared by every dependent that failed because of it
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Task whose body failed
    pub task: String,
    pub cause: Arc<DeployError>,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task '{}' failed: {}", self.task, self.cause)
    }
}

impl std::error::Error for TaskFailure {}

/// Terminal state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Succeeded,
    Failed,
    /// Never scheduled because an input failed
    Skipped,
}

/// Timing record for one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskMetric {
    pub name: String,
    pub state: TaskState,
    pub elapsed: Duration,
}

/// Handle to the eventual output of a task
pub struct Task<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            cell: self.cell.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    pub fn name(&self) -> &str {
        self.cell.name()
    }

    /// Block until the task is terminal and return its output
    pub fn get(&self) -> std::result::Result<Arc<T>, TaskFailure> {
        self.cell.wait()
    }

    pub fn is_terminal(&self) -> bool {
        self.cell.is_terminal()
    }

    fn dependency(&self) -> Arc<dyn Dependency> {
        self.cell.clone()
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.cell.name()).finish()
    }
}

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

struct Shared {
    pending: Mutex<usize>,
    drained: Condvar,
    metrics: Mutex<Vec<TaskMetric>>,
}

impl Shared {
    fn register(&self) {
        *self.pending.lock() += 1;
    }

    fn arrive(&self, metric: TaskMetric) {
        self.metrics.lock().push(metric);
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.drained.notify_all();
        }
    }
}

/// Fixed-size worker pool executing a task graph
pub struct TaskRunner {
    shared: Arc<Shared>,
    sender: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskRunner {
    /// Start a runner with `workers` threads
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let (sender, receiver) = channel::unbounded::<Job>();

        let handles = (0..workers)
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("deltadeploy-worker-{}", i))
                    .spawn(move || worker_loop(receiver))
                    .map_err(|e| DeployError::Task(format!("failed to spawn worker: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TaskRunner {
            shared: Arc::new(Shared {
                pending: Mutex::new(0),
                drained: Condvar::new(),
                metrics: Mutex::new(Vec::new()),
            }),
            sender,
            workers: handles,
        })
    }

    /// An already-resolved task
    pub fn value<T: Send + Sync + 'static>(&self, value: T) -> Task<T> {
        let cell = TaskCell::new("value");
        cell.succeed(Arc::new(value));
        Task {
            cell: Arc::new(cell),
        }
    }

    /// Submit a task without inputs
    pub fn submit<O, F>(&self, name: &str, body: F) -> Task<O>
    where
        O: Send + Sync + 'static,
        F: FnOnce() -> Result<O> + Send + 'static,
    {
        self.spawn(name, Vec::new(), body)
    }

    /// Submit a task consuming one input
    pub fn submit1<I, O, F>(&self, name: &str, input: &Task<I>, body: F) -> Task<O>
    where
        I: Send + Sync + 'static,
        O: Send + Sync + 'static,
        F: FnOnce(&I) -> Result<O> + Send + 'static,
    {
        let input = input.clone();
        self.spawn(name, vec![input.dependency()], move || {
            let value = ready_value(&input)?;
            body(&value)
        })
    }

    /// Submit a task consuming two inputs
    pub fn submit2<A, B, O, F>(&self, name: &str, a: &Task<A>, b: &Task<B>, body: F) -> Task<O>
    where
        A: Send + Sync + 'static,
        B: Send + Sync + 'static,
        O: Send + Sync + 'static,
        F: FnOnce(&A, &B) -> Result<O> + Send + 'static,
    {
        let (a, b) = (a.clone(), b.clone());
        self.spawn(name, vec![a.dependency(), b.dependency()], move || {
            let va = ready_value(&a)?;
            let vb = ready_value(&b)?;
            body(&va, &vb)
        })
    }

    /// Submit a task consuming any number of same-typed inputs
    pub fn submit_all<I, O, F>(&self, name: &str, inputs: &[Task<I>], body: F) -> Task<O>
    where
        I: Send + Sync + 'static,
        O: Send + Sync + 'static,
        F: FnOnce(&[Arc<I>]) -> Result<O> + Send + 'static,
    {
        let inputs: Vec<Task<I>> = inputs.to_vec();
        let deps = inputs.iter().map(Task::dependency).collect();
        self.spawn(name, deps, move || {
            let values = inputs.iter().map(ready_value).collect::<Result<Vec<_>>>()?;
            body(&values)
        })
    }

    /// A task equivalent to `blocked` that is not resolved until `on` is.
    ///
    /// Serializes operations that share a remote resource without a data
    /// dependency. Fails with `blocked`'s failure first, then `on`'s.
    pub fn block_on<T, U>(&self, blocked: &Task<T>, on: &Task<U>) -> Task<T>
    where
        T: Send + Sync + 'static,
        U: Send + Sync + 'static,
    {
        let name = format!("{} (after {})", blocked.name(), on.name());
        let cell = Arc::new(TaskCell::new(&name));
        self.shared.register();

        let shared = self.shared.clone();
        let target = cell.clone();
        let source = blocked.clone();
        let started = Instant::now();
        gate(
            vec![blocked.dependency(), on.dependency()],
            Box::new(move |failure| {
                let state = match failure {
                    Some(failure) => {
                        target.fail(failure);
                        TaskState::Skipped
                    }
                    None => match source.cell.value() {
                        Some(value) => {
                            target.succeed(value);
                            TaskState::Succeeded
                        }
                        None => {
                            target.fail(not_ready(&source));
                            TaskState::Failed
                        }
                    },
                };
                shared.arrive(TaskMetric {
                    name,
                    state,
                    elapsed: started.elapsed(),
                });
            }),
        );

        Task { cell }
    }

    /// Block until every submitted task is terminal
    pub fn join(&self) {
        let _span = info_span!("join").entered();
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.drained.wait(&mut pending);
        }
    }

    /// Number of submitted tasks not yet terminal
    pub fn pending_count(&self) -> usize {
        *self.shared.pending.lock()
    }

    /// Metrics of every task that reached a terminal state, in completion order
    pub fn metrics(&self) -> Vec<TaskMetric> {
        self.shared.metrics.lock().clone()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn spawn<O, F>(&self, name: &str, deps: Vec<Arc<dyn Dependency>>, body: F) -> Task<O>
    where
        O: Send + Sync + 'static,
        F: FnOnce() -> Result<O> + Send + 'static,
    {
        let cell = Arc::new(TaskCell::new(name));
        self.shared.register();

        let shared = self.shared.clone();
        let sender = self.sender.clone();
        let target = cell.clone();
        let name = name.to_string();

        gate(
            deps,
            Box::new(move |failure| {
                if let Some(failure) = failure {
                    debug!("Skipping task '{}': {}", name, failure);
                    target.fail(failure);
                    shared.arrive(TaskMetric {
                        name,
                        state: TaskState::Skipped,
                        elapsed: Duration::ZERO,
                    });
                    return;
                }

                let job_shared = shared.clone();
                let job_target = target.clone();
                let job_name = name.clone();
                let job = Job::Run(Box::new(move || {
                    run_body(&job_name, &job_target, &job_shared, body)
                }));

                if sender.send(job).is_err() {
                    target.fail(TaskFailure {
                        cause: Arc::new(DeployError::Task("task runner shut down".to_string())),
                        task: name.clone(),
                    });
                    shared.arrive(TaskMetric {
                        name,
                        state: TaskState::Failed,
                        elapsed: Duration::ZERO,
                    });
                }
            }),
        );

        Task { cell }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.join();
        for _ in &self.workers {
            self.sender.send(Job::Shutdown).ok();
        }
        for worker in self.workers.drain(..) {
            worker.join().ok();
        }
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        match job {
            Job::Run(job) => job(),
            Job::Shutdown => break,
        }
    }
}

fn run_body<O, F>(name: &str, cell: &TaskCell<O>, shared: &Shared, body: F)
where
    O: Send + Sync + 'static,
    F: FnOnce() -> Result<O>,
{
    let _span = info_span!("task", name = name).entered();
    let started = Instant::now();

    let outcome = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(DeployError::Task(format!("task panicked: {}", message)))
    });

    let state = match outcome {
        Ok(value) => {
            cell.succeed(Arc::new(value));
            TaskState::Succeeded
        }
        Err(e) => {
            warn!("Task '{}' failed: {}", name, e);
            cell.fail(TaskFailure {
                task: name.to_string(),
                cause: Arc::new(e),
            });
            TaskState::Failed
        }
    };

    shared.arrive(TaskMetric {
        name: name.to_string(),
        state,
        elapsed: started.elapsed(),
    });
}

/// Invoke `ready` once every dependency is terminal, passing the first
/// failure in declaration order.
fn gate(
    deps: Vec<Arc<dyn Dependency>>,
    ready: Box<dyn FnOnce(Option<TaskFailure>) + Send>,
) {
    if deps.is_empty() {
        ready(None);
        return;
    }

    let deps = Arc::new(deps);
    let remaining = Arc::new(AtomicUsize::new(deps.len()));
    let ready = Arc::new(Mutex::new(Some(ready)));

    for dep in deps.iter() {
        let deps = deps.clone();
        let remaining = remaining.clone();
        let ready = ready.clone();
        dep.on_terminal(Box::new(move || {
            if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                return;
            }
            let failure = deps.iter().find_map(|d| d.failure());
            if let Some(ready) = ready.lock().take() {
                ready(failure);
            }
        }));
    }
}

fn ready_value<T: Send + Sync + 'static>(task: &Task<T>) -> Result<Arc<T>> {
    task.cell
        .value()
        .ok_or_else(|| DeployError::Task(format!("input '{}' is not resolved", task.name())))
}

fn not_ready<T: Send + Sync + 'static>(task: &Task<T>) -> TaskFailure {
    TaskFailure {
        task: task.name().to_string(),
        cause: Arc::new(DeployError::Task(format!(
            "input '{}' is not resolved",
            task.name()
        ))),
    }
}
