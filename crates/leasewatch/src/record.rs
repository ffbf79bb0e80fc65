//! Lease records: one per outstanding checkout.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::owner::{OwnerHandle, OwnerState};
use crate::pool::LeasedResource;
use crate::stack::{Attribution, CallStack};

/// Unique identifier for a lease.
///
/// Resource keys are reused as the pool recycles connections; lease ids never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(uuid::Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An outstanding checkout: which resource, who holds it, since when, from where.
pub struct LeaseRecord<R: LeasedResource> {
    id: LeaseId,
    resource: R,
    key: R::Key,
    owner: OwnerHandle,
    stack: CallStack,
    acquired_at: Instant,
    acquired_wall: DateTime<Utc>,
}

impl<R: LeasedResource> LeaseRecord<R> {
    pub fn new(resource: R, owner: OwnerHandle, stack: CallStack) -> Self {
        Self {
            id: LeaseId::new(),
            key: resource.lease_key(),
            resource,
            owner,
            stack,
            acquired_at: Instant::now(),
            acquired_wall: Utc::now(),
        }
    }

    /// Override the acquisition instant (replaying or importing leases).
    pub fn acquired_at_instant(mut self, acquired_at: Instant) -> Self {
        self.acquired_at = acquired_at;
        self
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    pub fn key(&self) -> &R::Key {
        &self.key
    }

    pub fn owner(&self) -> &OwnerHandle {
        &self.owner
    }

    pub fn owner_name(&self) -> &str {
        self.owner.name()
    }

    pub fn owner_state(&self) -> OwnerState {
        self.owner.state()
    }

    pub fn stack(&self) -> &CallStack {
        &self.stack
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn acquired_wall(&self) -> DateTime<Utc> {
        self.acquired_wall
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration_at(Instant::now())
    }

    pub fn lease_duration_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.acquired_at)
    }

    /// One-line diagnostic row: duration, owner state, owner name, call site.
    pub fn summary_line(&self, now: Instant, attribution: &Attribution) -> String {
        format!(
            "{:>10}  {:<13}  {:<24}  {}",
            format_duration(self.lease_duration_at(now)),
            self.owner_state().as_str(),
            self.owner_name(),
            attribution.call_site(&self.stack),
        )
    }

    pub fn summarize(&self, now: Instant, attribution: &Attribution) -> LeaseSummary {
        LeaseSummary {
            lease_id: self.id,
            resource: format!("{:?}", self.key),
            owner: self.owner_name().to_string(),
            owner_state: self.owner_state(),
            acquired_at: self.acquired_wall.to_rfc3339(),
            held_secs: self.lease_duration_at(now).as_secs_f64(),
            call_site: attribution.call_site(&self.stack).to_string(),
        }
    }
}

impl<R: LeasedResource> std::fmt::Debug for LeaseRecord<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseRecord")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("stack", &self.stack)
            .finish()
    }
}

/// Serializable view of a lease for diagnostics endpoints and reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSummary {
    pub lease_id: LeaseId,
    /// Debug rendering of the resource key.
    pub resource: String,
    pub owner: String,
    pub owner_state: OwnerState,
    /// Wall-clock acquisition time (RFC 3339).
    pub acquired_at: String,
    pub held_secs: f64,
    pub call_site: String,
}

/// `4.2s`, `3m 07.0s`, `2h 05m 09s`.
///
/// Rounded to tenths before the unit is picked, so 59.96s reads `1m 00.0s`.
pub fn format_duration(duration: Duration) -> String {
    let tenths = (duration.as_millis() + 50) / 100;
    if tenths < 600 {
        format!("{}.{}s", tenths / 10, tenths % 10)
    } else if tenths < 36_000 {
        let rest = tenths % 600;
        format!("{}m {:02}.{}s", tenths / 600, rest / 10, rest % 10)
    } else {
        let total = (tenths + 5) / 10;
        format!("{}h {:02}m {:02}s", total / 3600, (total % 3600) / 60, total % 60)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::stack::{CallFrame, NamespaceFilter};

    #[derive(Debug, Clone)]
    struct Conn(u32);

    impl LeasedResource for Conn {
        type Key = u32;

        fn lease_key(&self) -> u32 {
            self.0
        }
    }

    fn attribution() -> Attribution {
        Attribution::new(0, Arc::new(NamespaceFilter::new("billing")))
    }

    #[test]
    fn duration_is_derived_from_acquired_at() {
        let now = Instant::now();
        let record = LeaseRecord::new(Conn(1), OwnerHandle::new("t1"), CallStack::default())
            .acquired_at_instant(now - Duration::from_secs(90));

        assert_eq!(record.lease_duration_at(now), Duration::from_secs(90));
        assert!(record.lease_duration() >= Duration::from_secs(90));
    }

    #[test]
    fn duration_never_negative() {
        let record = LeaseRecord::new(Conn(1), OwnerHandle::new("t1"), CallStack::default());
        let earlier = record.acquired_at() - Duration::from_secs(1);
        assert_eq!(record.lease_duration_at(earlier), Duration::ZERO);
    }

    #[test]
    fn key_comes_from_resource() {
        let record = LeaseRecord::new(Conn(7), OwnerHandle::new("t1"), CallStack::default());
        assert_eq!(*record.key(), 7);
        assert_eq!(record.resource().0, 7);
    }

    #[test]
    fn summary_line_has_all_columns() {
        let stack = CallStack::from(vec![
            CallFrame::new("billing::db", Some("InvoiceDao"), "load").at("src/db.rs", 42),
        ]);
        let now = Instant::now();
        let record = LeaseRecord::new(Conn(1), OwnerHandle::new("worker-3"), stack)
            .acquired_at_instant(now - Duration::from_secs(75));

        let line = record.summary_line(now, &attribution());
        assert!(line.contains("1m 15.0s"));
        assert!(line.contains("NEW"));
        assert!(line.contains("worker-3"));
        assert!(line.ends_with("billing::db::InvoiceDao::load (src/db.rs:42)"));
    }

    #[test]
    fn summarize_reports_unknown_site() {
        let record = LeaseRecord::new(Conn(9), OwnerHandle::new("t9"), CallStack::default());
        let summary = record.summarize(record.acquired_at(), &attribution());
        assert_eq!(summary.resource, "9");
        assert_eq!(summary.call_site, "<unknown>");
        assert_eq!(summary.held_secs, 0.0);
    }

    #[test]
    fn format_duration_ranges() {
        assert_eq!(format_duration(Duration::from_millis(4200)), "4.2s");
        assert_eq!(format_duration(Duration::from_secs(187)), "3m 07.0s");
        assert_eq!(format_duration(Duration::from_secs(7509)), "2h 05m 09s");
    }

    #[test]
    fn format_duration_rounds_before_picking_unit() {
        assert_eq!(format_duration(Duration::from_millis(59_960)), "1m 00.0s");
        assert_eq!(format_duration(Duration::from_millis(119_970)), "2m 00.0s");
        assert_eq!(format_duration(Duration::from_millis(59_940)), "59.9s");
        assert_eq!(format_duration(Duration::from_millis(3_599_970)), "1h 00m 00s");
        assert_eq!(format_duration(Duration::ZERO), "0.0s");
    }

    #[test]
    fn lease_summary_serializes() {
        let summary = LeaseSummary {
            lease_id: LeaseId(uuid::Uuid::nil()),
            resource: "Conn(3)".to_string(),
            owner: "worker-3".to_string(),
            owner_state: OwnerState::Terminated,
            acquired_at: "2026-01-01T00:00:00+00:00".to_string(),
            held_secs: 61.5,
            call_site: "billing::db::InvoiceDao::load (src/db.rs:42)".to_string(),
        };
        insta::assert_json_snapshot!("lease_summary", summary);
    }
}
