#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use leasewatch::{CallFrame, CallStack, LeasedResource, ResourcePool, StackCapture};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conn {
    pub id: u32,
}

impl LeasedResource for Conn {
    type Key = u32;

    fn lease_key(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted")]
    Exhausted,
    #[error("connection {0} is not checked out")]
    NotCheckedOut(u32),
}

/// In-memory pool that counts every call and rejects double releases.
pub struct CountingPool {
    capacity: u32,
    free: Mutex<Vec<u32>>,
    acquires: AtomicUsize,
    releases: Mutex<HashMap<u32, usize>>,
}

impl CountingPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            free: Mutex::new((0..capacity).rev().collect()),
            acquires: AtomicUsize::new(0),
            releases: Mutex::new(HashMap::new()),
        }
    }

    pub fn releases_of(&self, id: u32) -> usize {
        self.releases.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    pub fn total_releases(&self) -> usize {
        self.releases.lock().unwrap().values().sum()
    }

    pub fn total_acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    /// Connections currently checked out according to the pool itself.
    pub fn outstanding(&self) -> usize {
        self.capacity as usize - self.free.lock().unwrap().len()
    }
}

#[async_trait]
impl ResourcePool for CountingPool {
    type Resource = Conn;
    type Error = PoolError;

    async fn acquire(&self) -> Result<Conn, PoolError> {
        let id = self.free.lock().unwrap().pop().ok_or(PoolError::Exhausted)?;
        self.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(Conn { id })
    }

    async fn release(&self, conn: Conn) -> Result<(), PoolError> {
        *self.releases.lock().unwrap().entry(conn.id).or_default() += 1;
        let mut free = self.free.lock().unwrap();
        if free.contains(&conn.id) {
            return Err(PoolError::NotCheckedOut(conn.id));
        }
        free.push(conn.id);
        Ok(())
    }
}

/// Stack capture returning the same application frames every time.
pub struct FixedStack;

impl StackCapture for FixedStack {
    fn capture(&self) -> CallStack {
        CallStack::from(vec![
            CallFrame::new("std::backtrace", Some("Backtrace"), "force_capture"),
            CallFrame::new("leasewatch::provider", Some("ProviderCore"), "acquire"),
            CallFrame::new("billing::db", Some("BaseDao"), "connection").at("src/db/base.rs", 17),
            CallFrame::new("billing::db", Some("InvoiceDao"), "load").at("src/db/invoice.rs", 42),
            CallFrame::new("billing::jobs", None, "run_nightly").at("src/jobs.rs", 8),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: HashMap<String, String>,
}

impl CapturedEvent {
    /// True if the message or any field mentions `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.message.contains(needle) || self.fields.values().any(|v| v.contains(needle))
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Tracing layer that keeps every event for later assertions.
#[derive(Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn at_level(&self, level: Level) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl<S> Layer<S> for LogCapture
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.events.lock().unwrap().push(CapturedEvent {
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: HashMap<String, String>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.insert(field.name().to_string(), rendered);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), value.to_string());
        }
    }
}

/// Capture all events on the current thread until the guard is dropped.
pub fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::registry().with(capture.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (capture, guard)
}
