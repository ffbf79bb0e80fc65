//! leasewatch: leak-detecting lease tracker for pooled resources.
//!
//! Wrap a pool in a [`TrackedProvider`] and use it in place of the pool's own
//! acquire/release. Every checkout is recorded with its owner, call stack and
//! start time. Once started, a background [`LeaseMonitor`] reports leases held
//! too long and hands back resources whose owner died without releasing them.

pub mod config;
pub mod error;
pub mod monitor;
pub mod owner;
pub mod pool;
mod provider;
pub mod record;
pub mod registry;
pub mod stack;

pub use config::MonitorConfig;
pub use error::{LifecycleError, SweepError};
pub use monitor::{LeaseMonitor, LeaseVerdict, MonitorState, SweepReport, classify};
pub use owner::{OwnerHandle, OwnerScope, OwnerState};
pub use pool::{LeasedResource, ResourcePool};
pub use provider::{TrackedProvider, TrackedProviderBuilder};
pub use record::{LeaseId, LeaseRecord, LeaseSummary};
pub use registry::LeaseRegistry;
pub use stack::{
    Attribution, BacktraceCapture, CallFrame, CallSite, CallStack, FrameFilter, NamespaceFilter,
    StackCapture,
};

/// leasewatch version from Cargo.toml
pub const LEASEWATCH_VERSION: &str = env!("CARGO_PKG_VERSION");
