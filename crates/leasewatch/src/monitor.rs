//! LeaseMonitor - background leak detection and reclaim.
//!
//! Lifecycle: `Created → Running → Stopping → Stopped`. `Stopped` is terminal.
//!
//! Each sweep:
//! 1. Snapshot the registry
//! 2. Classify leases: owner terminated → orphaned, held past threshold → overdue
//! 3. If anything is suspicious, log the whole table at info
//! 4. Log every orphaned lease at error and hand its resource back to the pool
//!
//! A sweep that panics is logged at warn and the loop carries on.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{LifecycleError, SweepError};
use crate::pool::{LeasedResource, ResourcePool};
use crate::provider::ProviderCore;
use crate::record::LeaseRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Created,
    Running,
    /// Stop requested; waiting for the in-flight sweep to finish
    Stopping,
    Stopped,
}

/// Outcome of classifying one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseVerdict {
    Healthy,
    /// Held longer than the threshold. Reported, never reclaimed.
    Overdue,
    /// Owner terminated without releasing. Reported and reclaimed.
    Orphaned,
}

impl LeaseVerdict {
    pub fn is_suspicious(&self) -> bool {
        !matches!(self, Self::Healthy)
    }

    fn marker(&self) -> &'static str {
        match self {
            Self::Healthy => "  ",
            Self::Overdue => "! ",
            Self::Orphaned => "!!",
        }
    }
}

/// Classify a lease as of `now`. The threshold is exclusive: a lease held for
/// exactly `threshold` is still healthy.
pub fn classify<R: LeasedResource>(
    record: &LeaseRecord<R>,
    now: Instant,
    threshold: Duration,
) -> LeaseVerdict {
    if record.owner_state().is_terminated() {
        LeaseVerdict::Orphaned
    } else if record.lease_duration_at(now) > threshold {
        LeaseVerdict::Overdue
    } else {
        LeaseVerdict::Healthy
    }
}

/// What one sweep saw and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub active: usize,
    pub overdue: usize,
    pub orphaned: usize,
    pub reclaimed: usize,
    pub reclaim_failures: usize,
    /// The sweep was aborted by a panic; counts are incomplete.
    pub panicked: bool,
}

impl SweepReport {
    pub fn suspicious(&self) -> usize {
        self.overdue + self.orphaned
    }
}

/// Background monitor owned by a [`crate::TrackedProvider`].
pub struct LeaseMonitor<P: ResourcePool> {
    core: Arc<ProviderCore<P>>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<MonitorState>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl<P: ResourcePool> LeaseMonitor<P> {
    pub(crate) fn new(core: Arc<ProviderCore<P>>) -> Self {
        let (state, _) = watch::channel(MonitorState::Created);
        Self {
            core,
            cancel: CancellationToken::new(),
            state: Arc::new(state),
            task: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn start(&self) -> Result<(), LifecycleError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;

        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match *state {
            MonitorState::Created => {
                *state = MonitorState::Running;
                true
            }
            MonitorState::Running => {
                outcome = Err(LifecycleError::AlreadyStarted);
                false
            }
            MonitorState::Stopping | MonitorState::Stopped => {
                outcome = Err(LifecycleError::Stopped);
                false
            }
        });
        outcome?;

        let handle = runtime.spawn(run(
            Arc::clone(&self.core),
            self.cancel.clone(),
            Arc::clone(&self.state),
        ));
        *self.task() = Some(handle);
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        let mut never_started = false;
        self.state.send_if_modified(|state| match *state {
            MonitorState::Created => {
                *state = MonitorState::Stopped;
                never_started = true;
                true
            }
            MonitorState::Running => {
                *state = MonitorState::Stopping;
                true
            }
            MonitorState::Stopping | MonitorState::Stopped => false,
        });
        if never_started {
            tracing::debug!("Lease monitor stopped before it was started");
            return;
        }

        self.cancel.cancel();

        let handle = self.task().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Lease monitor task failed");
                }
                self.state.send_replace(MonitorState::Stopped);
            }
            None => {
                // Another caller owns the join; wait for it to finish.
                let mut rx = self.state.subscribe();
                let _ = rx.wait_for(|s| *s == MonitorState::Stopped).await;
            }
        }
    }
}

impl<P: ResourcePool> Drop for LeaseMonitor<P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<P: ResourcePool>(
    core: Arc<ProviderCore<P>>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<MonitorState>>,
) {
    tracing::info!(
        interval = ?core.config.sweep_interval,
        threshold = ?core.config.lease_threshold,
        "Lease monitor started"
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(core.config.sweep_interval) => {}
        }
        // Not cancellable: stop() waits for an in-flight sweep.
        sweep_guarded(&core).await;
    }

    state.send_replace(MonitorState::Stopped);
    tracing::info!("Lease monitor stopped");
}

/// Run one sweep, converting a panic into a logged [`SweepError`].
pub(crate) async fn sweep_guarded<P: ResourcePool>(core: &ProviderCore<P>) -> SweepReport {
    match AssertUnwindSafe(sweep(core)).catch_unwind().await {
        Ok(report) => report,
        Err(payload) => {
            let err = SweepError::from_panic(payload);
            tracing::warn!(error = %err, "Lease sweep failed - continuing on next interval");
            SweepReport {
                panicked: true,
                ..Default::default()
            }
        }
    }
}

async fn sweep<P: ResourcePool>(core: &ProviderCore<P>) -> SweepReport {
    let snapshot = core.registry.snapshot();
    let now = Instant::now();
    let threshold = core.config.lease_threshold;

    let classified: Vec<_> = snapshot
        .iter()
        .map(|record| (record, classify(record, now, threshold)))
        .collect();

    let mut report = SweepReport {
        active: snapshot.len(),
        ..Default::default()
    };
    for (_, verdict) in &classified {
        match verdict {
            LeaseVerdict::Overdue => report.overdue += 1,
            LeaseVerdict::Orphaned => report.orphaned += 1,
            LeaseVerdict::Healthy => {}
        }
    }

    if report.suspicious() == 0 {
        tracing::trace!(active = report.active, "Lease sweep clean");
        return report;
    }

    let table = classified
        .iter()
        .map(|(record, verdict)| {
            format!(
                "{} {}",
                verdict.marker(),
                record.summary_line(now, &core.attribution)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    tracing::info!(
        active = report.active,
        overdue = report.overdue,
        orphaned = report.orphaned,
        "Suspicious leases detected:\n{}",
        table
    );

    for (record, verdict) in &classified {
        if *verdict != LeaseVerdict::Orphaned {
            continue;
        }

        let call_site = core.attribution.call_site(record.stack());
        tracing::error!(
            lease = %record.id(),
            key = ?record.key(),
            owner = record.owner_name(),
            call_site = %call_site,
            "Owner {} terminated while holding a lease - reclaiming\n{}",
            record.owner_name(),
            core.attribution.trace(record.stack())
        );

        match core.reclaim(record).await {
            Ok(true) => report.reclaimed += 1,
            Ok(false) => {
                tracing::debug!(lease = %record.id(), "Lease released before it could be reclaimed")
            }
            Err(err) => {
                report.reclaim_failures += 1;
                let cause = std::error::Error::source(&err)
                    .map(ToString::to_string)
                    .unwrap_or_default();
                tracing::warn!(
                    error = %err,
                    cause = %cause,
                    "Reclaim failed - lease no longer tracked"
                );
            }
        }
    }

    report
}
