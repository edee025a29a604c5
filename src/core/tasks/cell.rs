//! Single-assignment result cell behind a task handle

use super::TaskFailure;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

type Continuation = Box<dyn FnOnce() + Send>;

enum Slot<T> {
    Pending,
    Succeeded(Arc<T>),
    Failed(TaskFailure),
}

impl<T> Slot<T> {
    fn result(&self) -> Option<Result<Arc<T>, TaskFailure>> {
        match self {
            Slot::Pending => None,
            Slot::Succeeded(value) => Some(Ok(value.clone())),
            Slot::Failed(failure) => Some(Err(failure.clone())),
        }
    }
}

struct Inner<T> {
    slot: Slot<T>,
    continuations: Vec<Continuation>,
}

pub(super) struct TaskCell<T> {
    name: String,
    inner: Mutex<Inner<T>>,
    terminal: Condvar,
}

/// Type-erased view used for gating dependents
pub(super) trait Dependency: Send + Sync {
    /// Run `f` once the task is terminal (immediately if it already is)
    fn on_terminal(&self, f: Continuation);

    fn failure(&self) -> Option<TaskFailure>;
}

impl<T> TaskCell<T> {
    pub(super) fn new(name: &str) -> Self {
        TaskCell {
            name: name.to_string(),
            inner: Mutex::new(Inner {
                slot: Slot::Pending,
                continuations: Vec::new(),
            }),
            terminal: Condvar::new(),
        }
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn is_terminal(&self) -> bool {
        !matches!(self.inner.lock().slot, Slot::Pending)
    }

    pub(super) fn value(&self) -> Option<Arc<T>> {
        match &self.inner.lock().slot {
            Slot::Succeeded(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub(super) fn wait(&self) -> Result<Arc<T>, TaskFailure> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(result) = inner.slot.result() {
                return result;
            }
            self.terminal.wait(&mut inner);
        }
    }

    pub(super) fn succeed(&self, value: Arc<T>) {
        self.resolve(Slot::Succeeded(value));
    }

    pub(super) fn fail(&self, failure: TaskFailure) {
        self.resolve(Slot::Failed(failure));
    }

    /// First resolution wins; continuations run outside the lock.
    fn resolve(&self, slot: Slot<T>) {
        let continuations = {
            let mut inner = self.inner.lock();
            if !matches!(inner.slot, Slot::Pending) {
                return;
            }
            inner.slot = slot;
            std::mem::take(&mut inner.continuations)
        };
        self.terminal.notify_all();
        for continuation in continuations {
            continuation();
        }
    }
}

impl<T: Send + Sync + 'static> Dependency for TaskCell<T> {
    fn on_terminal(&self, f: Continuation) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.slot, Slot::Pending) {
                inner.continuations.push(f);
                return;
            }
        }
        f();
    }

    fn failure(&self) -> Option<TaskFailure> {
        match &self.inner.lock().slot {
            Slot::Failed(failure) => Some(failure.clone()),
            _ => None,
        }
    }
}
