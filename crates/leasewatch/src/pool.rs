//! Boundary traits for the wrapped resource pool.
//!
//! The tracker never sizes, validates or evicts anything itself. It only needs
//! the pool's own acquire/release pair and a way to tell two handles apart.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;

/// A handle checked out of a pool.
///
/// The registry keeps a clone of every outstanding handle so the monitor can
/// hand it back on the owner's behalf. Handles are expected to be cheap to
/// clone (an `Arc`, an id, a pooled-connection wrapper).
pub trait LeasedResource: Clone + Send + Sync + 'static {
    /// Identity of the underlying resource. Two handles with equal keys refer
    /// to the same physical resource.
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    fn lease_key(&self) -> Self::Key;
}

/// The external pool being supervised.
#[async_trait]
pub trait ResourcePool: Send + Sync + 'static {
    type Resource: LeasedResource;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn acquire(&self) -> Result<Self::Resource, Self::Error>;

    async fn release(&self, resource: Self::Resource) -> Result<(), Self::Error>;
}
