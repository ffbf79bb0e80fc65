//! TrackedProvider: drop-in acquire/release wrapper that records every lease.
//!
//! Flow:
//! 1. `acquire()` forwards to the pool; on success the caller, its call stack
//!    and the time are registered as a lease
//! 2. `release()` forgets the lease, then forwards to the pool
//! 3. `start()`/`stop()` drive the background [`LeaseMonitor`]
//!
//! Pool errors are returned untouched. The tracker never retries, wraps, or
//! swallows them.

use std::sync::Arc;
use std::time::Instant;

use crate::config::MonitorConfig;
use crate::error::{LifecycleError, SweepError};
use crate::monitor::{self, LeaseMonitor, MonitorState, SweepReport};
use crate::owner;
use crate::pool::{LeasedResource, ResourcePool};
use crate::record::{LeaseRecord, LeaseSummary};
use crate::registry::LeaseRegistry;
use crate::stack::{Attribution, BacktraceCapture, FrameFilter, StackCapture};

/// State shared between foreground callers and the monitor task.
pub(crate) struct ProviderCore<P: ResourcePool> {
    pub(crate) pool: P,
    pub(crate) registry: LeaseRegistry<P::Resource>,
    pub(crate) config: MonitorConfig,
    pub(crate) attribution: Attribution,
    capture: Arc<dyn StackCapture>,
}

impl<P: ResourcePool> ProviderCore<P> {
    async fn acquire(&self) -> Result<P::Resource, P::Error> {
        // Owner is whoever called, not whichever worker thread resumes us.
        let owner = owner::current();
        let resource = self.pool.acquire().await?;

        let stack = self.capture.capture();
        let record = self
            .registry
            .add(LeaseRecord::new(resource.clone(), owner, stack));

        tracing::debug!(
            lease = %record.id(),
            key = ?record.key(),
            owner = record.owner_name(),
            "Lease acquired"
        );
        Ok(resource)
    }

    async fn release(&self, resource: P::Resource) -> Result<(), P::Error> {
        match self.registry.remove_by_resource(&resource) {
            Some(record) => tracing::debug!(
                lease = %record.id(),
                key = ?record.key(),
                held = ?record.lease_duration(),
                "Lease released"
            ),
            None => tracing::debug!(
                key = ?resource.lease_key(),
                "Releasing untracked resource"
            ),
        }
        // The lease is over even if the pool fails to take the resource back.
        self.pool.release(resource).await
    }

    /// Forced release on behalf of a dead owner.
    ///
    /// Returns `Ok(false)` if the lease was already gone (released or
    /// reclaimed concurrently); the pool is only called by whoever removed
    /// the record.
    pub(crate) async fn reclaim(
        &self,
        record: &LeaseRecord<P::Resource>,
    ) -> Result<bool, SweepError> {
        let Some(removed) = self.registry.remove_lease(record) else {
            return Ok(false);
        };

        self.pool
            .release(removed.resource().clone())
            .await
            .map_err(|e| SweepError::Reclaim {
                lease: removed.id(),
                key: format!("{:?}", removed.key()),
                source: Box::new(e),
            })?;
        Ok(true)
    }
}

/// Builder for [`TrackedProvider`].
pub struct TrackedProviderBuilder<P: ResourcePool> {
    pool: P,
    config: MonitorConfig,
    capture: Arc<dyn StackCapture>,
    filter: Option<Arc<dyn FrameFilter>>,
}

impl<P: ResourcePool> TrackedProviderBuilder<P> {
    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stack_capture(mut self, capture: Arc<dyn StackCapture>) -> Self {
        self.capture = capture;
        self
    }

    /// Replace the namespace filter derived from the config.
    pub fn frame_filter(mut self, filter: Arc<dyn FrameFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn build(self) -> TrackedProvider<P> {
        let attribution = match self.filter {
            Some(filter) => Attribution::new(self.config.skip_frames, filter),
            None => self.config.attribution(),
        };

        let core = Arc::new(ProviderCore {
            pool: self.pool,
            registry: LeaseRegistry::new(),
            config: self.config,
            attribution,
            capture: self.capture,
        });

        TrackedProvider {
            monitor: LeaseMonitor::new(Arc::clone(&core)),
            core,
        }
    }
}

/// The single entry point through which the application acquires and releases
/// pooled resources.
pub struct TrackedProvider<P: ResourcePool> {
    core: Arc<ProviderCore<P>>,
    monitor: LeaseMonitor<P>,
}

impl<P: ResourcePool> TrackedProvider<P> {
    /// Wrap `pool` with the default (environment-derived) configuration.
    pub fn new(pool: P) -> Self {
        Self::builder(pool).build()
    }

    pub fn builder(pool: P) -> TrackedProviderBuilder<P> {
        TrackedProviderBuilder {
            pool,
            config: MonitorConfig::default(),
            capture: Arc::new(BacktraceCapture),
            filter: None,
        }
    }

    /// Check out a resource and record who holds it.
    ///
    /// The owner is the enclosing [`OwnerScope`](crate::OwnerScope) if there is
    /// one, otherwise the OS thread. A plain `tokio::spawn` task is attributed
    /// to its runtime worker thread, which outlives the task: a lease it leaks
    /// is reported as overdue but never reclaimed. Run such tasks under
    /// `OwnerScope::run` to have their leases reclaimed when they end.
    pub async fn acquire(&self) -> Result<P::Resource, P::Error> {
        self.core.acquire().await
    }

    pub async fn release(&self, resource: P::Resource) -> Result<(), P::Error> {
        self.core.release(resource).await
    }

    /// Start the background monitor. Call once, after the pool is configured.
    pub fn start(&self) -> Result<(), LifecycleError> {
        self.monitor.start()
    }

    /// Stop the monitor and wait for its loop (and any in-flight sweep) to exit.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.monitor.stop().await;
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.monitor.state()
    }

    /// Run one sweep now, on the caller's task.
    pub async fn sweep_now(&self) -> SweepReport {
        monitor::sweep_guarded(&self.core).await
    }

    pub fn active_leases(&self) -> usize {
        self.core.registry.len()
    }

    pub fn is_tracked(&self, resource: &P::Resource) -> bool {
        self.core.registry.contains(&resource.lease_key())
    }

    /// Diagnostics view of all outstanding leases, oldest first.
    pub fn leases(&self) -> Vec<LeaseSummary> {
        let now = Instant::now();
        self.core
            .registry
            .snapshot()
            .iter()
            .map(|record| record.summarize(now, &self.core.attribution))
            .collect()
    }

    pub fn pool(&self) -> &P {
        &self.core.pool
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.core.config
    }
}
