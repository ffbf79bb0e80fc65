//! Call-site attribution: which frame of a captured stack is "the caller".
//!
//! The raw stack starts inside the tracker and the async runtime. Attribution
//! skips a few leading frames, then picks the first frame a [`FrameFilter`]
//! accepts. The filter is the only policy knob; the monitor never looks at
//! frames directly.

use std::sync::Arc;

use super::capture::{CallFrame, CallStack};

/// Decides whether a frame belongs to the application and can be blamed.
pub trait FrameFilter: Send + Sync {
    fn is_attributable(&self, frame: &CallFrame) -> bool;
}

impl<F> FrameFilter for F
where
    F: Fn(&CallFrame) -> bool + Send + Sync,
{
    fn is_attributable(&self, frame: &CallFrame) -> bool {
        self(frame)
    }
}

/// Crates whose frames are never application code.
const INFRASTRUCTURE_CRATES: &[&str] = &[
    "std",
    "core",
    "alloc",
    "tokio",
    "tokio_util",
    "futures",
    "futures_util",
    "futures_executor",
    "async_trait",
    "leasewatch",
    "__rust_begin_short_backtrace",
    "__rust_end_short_backtrace",
];

/// Accepts frames under an application module prefix, except excluded
/// plumbing types (base DAOs, pool adapters).
///
/// An empty prefix accepts any frame outside the runtime and the tracker.
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    prefix: String,
    excluded_types: Vec<String>,
}

impl NamespaceFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            excluded_types: Vec::new(),
        }
    }

    pub fn exclude_type(mut self, type_name: impl Into<String>) -> Self {
        self.excluded_types.push(type_name.into());
        self
    }

    pub fn exclude_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_types.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn in_namespace(&self, module: &str) -> bool {
        if self.prefix.is_empty() {
            let root = module.split("::").next().unwrap_or_default();
            return !root.is_empty() && !INFRASTRUCTURE_CRATES.contains(&root);
        }
        let prefix = self.prefix.trim_end_matches("::");
        module == prefix || module.starts_with(&format!("{prefix}::"))
    }
}

impl FrameFilter for NamespaceFilter {
    fn is_attributable(&self, frame: &CallFrame) -> bool {
        if !self.in_namespace(&frame.module) {
            return false;
        }
        match frame.type_name {
            Some(ref ty) => !self.excluded_types.iter().any(|ex| ex == ty),
            None => true,
        }
    }
}

/// The frame a lease is blamed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSite {
    Attributed(CallFrame),
    Unknown,
}

impl CallSite {
    pub fn frame(&self) -> Option<&CallFrame> {
        match self {
            CallSite::Attributed(frame) => Some(frame),
            CallSite::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, CallSite::Attributed(_))
    }
}

impl std::fmt::Display for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallSite::Attributed(frame) => write!(f, "{}", frame),
            CallSite::Unknown => f.write_str("<unknown>"),
        }
    }
}

/// Attribution strategy: leading frames to skip plus a frame filter.
#[derive(Clone)]
pub struct Attribution {
    skip_frames: usize,
    filter: Arc<dyn FrameFilter>,
}

impl Attribution {
    pub fn new(skip_frames: usize, filter: Arc<dyn FrameFilter>) -> Self {
        Self {
            skip_frames,
            filter,
        }
    }

    fn position(&self, stack: &CallStack) -> Option<usize> {
        stack
            .frames()
            .iter()
            .enumerate()
            .skip(self.skip_frames)
            .find(|(_, frame)| self.filter.is_attributable(frame))
            .map(|(idx, _)| idx)
    }

    /// Single-line call site for summaries.
    pub fn call_site(&self, stack: &CallStack) -> CallSite {
        match self.position(stack) {
            Some(idx) => CallSite::Attributed(stack.frames()[idx].clone()),
            None => CallSite::Unknown,
        }
    }

    /// Multi-line trace of every attributable frame from the call site outwards.
    pub fn trace(&self, stack: &CallStack) -> String {
        let Some(start) = self.position(stack) else {
            return String::from("\tat <unknown>");
        };

        stack.frames()[start..]
            .iter()
            .filter(|frame| self.filter.is_attributable(frame))
            .map(|frame| format!("\tat {}", frame))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl std::fmt::Debug for Attribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attribution")
            .field("skip_frames", &self.skip_frames)
            .finish_non_exhaustive()
    }
}
