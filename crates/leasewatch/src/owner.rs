//! Lease owners and their liveness.
//!
//! A lease remembers *who* acquired it as an [`OwnerHandle`]. The handle is a
//! shared cell whose state is flipped to [`OwnerState::Terminated`] when the
//! owning execution unit goes away:
//! - OS threads: a thread-local guard is torn down when the thread exits.
//! - tokio tasks: [`OwnerScope::run`] installs a task-local guard that is dropped
//!   when the scoped future completes or is cancelled.
//!
//! A task scope takes precedence over the thread it happens to be polled on.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Liveness of a lease owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnerState {
    /// Handle created, owner not started yet
    New,
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
    /// Owner ended; anything it still holds is leaked
    Terminated,
}

impl OwnerState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Runnable => "RUNNABLE",
            Self::Blocked => "BLOCKED",
            Self::Waiting => "WAITING",
            Self::TimedWaiting => "TIMED_WAITING",
            Self::Terminated => "TERMINATED",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Runnable => 1,
            Self::Blocked => 2,
            Self::Waiting => 3,
            Self::TimedWaiting => 4,
            Self::Terminated => 5,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::Runnable,
            2 => Self::Blocked,
            3 => Self::Waiting,
            4 => Self::TimedWaiting,
            _ => Self::Terminated,
        }
    }
}

impl std::fmt::Display for OwnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

struct OwnerInner {
    id: u64,
    name: String,
    state: AtomicU8,
}

/// Shared identity of a thread or task that holds leases.
#[derive(Clone)]
pub struct OwnerHandle {
    inner: Arc<OwnerInner>,
}

impl OwnerHandle {
    /// Create a detached handle in the `New` state.
    ///
    /// Runtimes other than threads and tokio tasks can drive the state
    /// themselves through [`OwnerHandle::set_state`].
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_state(name, OwnerState::New)
    }

    fn with_state(name: impl Into<String>, state: OwnerState) -> Self {
        Self {
            inner: Arc::new(OwnerInner {
                id: NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                state: AtomicU8::new(state.to_u8()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> OwnerState {
        OwnerState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Update the reported state. `Terminated` is sticky.
    pub fn set_state(&self, state: OwnerState) {
        let _ = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if OwnerState::from_u8(current).is_terminated() {
                    None
                } else {
                    Some(state.to_u8())
                }
            });
    }

    pub fn is_same(&self, other: &OwnerHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for OwnerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Marks its handle terminated when dropped.
struct LivenessGuard {
    handle: OwnerHandle,
}

impl LivenessGuard {
    fn running(handle: OwnerHandle) -> Self {
        handle.set_state(OwnerState::Runnable);
        Self { handle }
    }

    fn for_current_thread() -> Self {
        Self::running(OwnerHandle::new(current_thread_name()))
    }
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.handle.set_state(OwnerState::Terminated);
    }
}

thread_local! {
    static THREAD_OWNER: LivenessGuard = LivenessGuard::for_current_thread();
}

tokio::task_local! {
    static TASK_OWNER: LivenessGuard;
}

fn current_thread_name() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}

/// Owner of whatever is acquired right now on this task or thread.
pub fn current() -> OwnerHandle {
    if let Ok(handle) = TASK_OWNER.try_with(|guard| guard.handle.clone()) {
        return handle;
    }
    THREAD_OWNER
        .try_with(|guard| guard.handle.clone())
        // Thread-locals are already being torn down: the thread is exiting.
        .unwrap_or_else(|_| OwnerHandle::with_state(current_thread_name(), OwnerState::Terminated))
}

/// Scope that attributes leases to a named async task rather than to the
/// worker thread that polls it.
///
/// ```ignore
/// let scope = OwnerScope::new("billing-job");
/// tokio::spawn(scope.run(async move { /* provider.acquire().await ... */ }));
/// ```
pub struct OwnerScope {
    handle: OwnerHandle,
}

impl OwnerScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            handle: OwnerHandle::new(name),
        }
    }

    pub fn handle(&self) -> OwnerHandle {
        self.handle.clone()
    }

    /// Run `fut` as this owner. The owner is terminated once `fut` completes
    /// or is dropped.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        TASK_OWNER.scope(LivenessGuard::running(self.handle), fut).await
    }
}
