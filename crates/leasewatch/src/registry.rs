//! Registry of outstanding leases.
//!
//! One mutex guards the live map. It is held only for an insert, a remove, or
//! the copy taken by [`LeaseRegistry::snapshot`]; never across logging, pool
//! calls or `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::pool::LeasedResource;
use crate::record::LeaseRecord;

type LeaseMap<R> = HashMap<<R as LeasedResource>::Key, Arc<LeaseRecord<R>>>;

pub struct LeaseRegistry<R: LeasedResource> {
    leases: Mutex<LeaseMap<R>>,
}

impl<R: LeasedResource> LeaseRegistry<R> {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` on the live map, recovering from poison. Every critical
    /// section is a single map call, so a poisoned map is still consistent.
    fn with_leases<T>(&self, f: impl FnOnce(&mut LeaseMap<R>) -> T) -> T {
        let (result, recovered) = match self.leases.lock() {
            Ok(mut guard) => (f(&mut guard), false),
            Err(poisoned) => {
                let mut guard = poisoned.into_inner();
                self.leases.clear_poison();
                (f(&mut guard), true)
            }
        };
        if recovered {
            tracing::error!("Lease registry mutex poisoned - recovered");
        }
        result
    }

    pub fn add(&self, record: LeaseRecord<R>) -> Arc<LeaseRecord<R>> {
        let record = Arc::new(record);
        let replaced =
            self.with_leases(|leases| leases.insert(record.key().clone(), Arc::clone(&record)));

        if let Some(previous) = replaced {
            tracing::warn!(
                lease = %previous.id(),
                key = ?previous.key(),
                "Resource checked out twice without release - replacing stale lease"
            );
        }
        record
    }

    /// Remove the lease for `resource`, if any. Absence is not an error.
    pub fn remove_by_resource(&self, resource: &R) -> Option<Arc<LeaseRecord<R>>> {
        self.remove_by_key(&resource.lease_key())
    }

    pub fn remove_by_key(&self, key: &R::Key) -> Option<Arc<LeaseRecord<R>>> {
        self.with_leases(|leases| leases.remove(key))
    }

    /// Remove `record` only if it is still the live lease for its key.
    ///
    /// The pool may have recycled the resource into a newer lease since the
    /// record was observed; that lease is left alone.
    pub fn remove_lease(&self, record: &LeaseRecord<R>) -> Option<Arc<LeaseRecord<R>>> {
        self.with_leases(|leases| match leases.get(record.key()) {
            Some(current) if current.id() == record.id() => leases.remove(record.key()),
            _ => None,
        })
    }

    /// Point-in-time copy of all leases, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<LeaseRecord<R>>> {
        let mut leases: Vec<_> = self.with_leases(|leases| leases.values().cloned().collect());
        leases.sort_by_key(|record| record.acquired_at());
        leases
    }

    pub fn contains(&self, key: &R::Key) -> bool {
        self.with_leases(|leases| leases.contains_key(key))
    }

    pub fn len(&self) -> usize {
        self.with_leases(|leases| leases.len())
    }

    pub fn is_empty(&self) -> bool {
        self.with_leases(|leases| leases.is_empty())
    }
}

impl<R: LeasedResource> Default for LeaseRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}
