//! Call-stack capture at acquire time.

use std::backtrace::Backtrace;
use std::sync::{Arc, OnceLock};

/// One frame of a captured call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    /// Module path, e.g. `billing::db`.
    pub module: String,
    /// Declaring type, when the frame is a method (`InvoiceDao`).
    pub type_name: Option<String>,
    pub method: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl CallFrame {
    pub fn new(module: impl Into<String>, type_name: Option<&str>, method: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            type_name: type_name.map(str::to_string),
            method: method.into(),
            file: None,
            line: None,
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    /// `module::Type::method`, skipping empty parts.
    pub fn qualified_name(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if !self.module.is_empty() {
            parts.push(&self.module);
        }
        if let Some(ref ty) = self.type_name {
            parts.push(ty);
        }
        parts.push(&self.method);
        parts.join("::")
    }

    /// Parse one demangled symbol (`<a::B as c::D>::m::{{closure}}`) into a frame.
    pub fn from_symbol(symbol: &str) -> Self {
        let path = normalize_symbol(symbol);
        let mut segments: Vec<&str> = path.split("::").filter(|s| !s.is_empty()).collect();

        let method = segments.pop().unwrap_or_default().to_string();
        let type_name = match segments.last() {
            Some(seg) if seg.starts_with(|c: char| c.is_ascii_uppercase()) => {
                segments.pop().map(str::to_string)
            }
            _ => None,
        };

        Self {
            module: segments.join("::"),
            type_name,
            method,
            file: None,
            line: None,
        }
    }
}

impl std::fmt::Display for CallFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified_name())?;
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, " ({}:{})", file, line),
            (Some(file), None) => write!(f, " ({})", file),
            _ => Ok(()),
        }
    }
}

/// Strip closure markers, symbol hashes, generics and `<T as Trait>` wrappers.
fn normalize_symbol(symbol: &str) -> String {
    let mut path = symbol.trim().replace("::{{closure}}", "");

    // Legacy mangling leaves a `::h0123456789abcdef` hash suffix.
    if let Some(idx) = path.rfind("::h") {
        let hash = &path[idx + 3..];
        if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
            path.truncate(idx);
        }
    }

    if path.starts_with('<')
        && let Some(close) = matching_angle(&path)
    {
        let qualified = &path[1..close];
        let self_ty = split_top_level_as(qualified);
        let rest = &path[close + 1..];
        path = format!("{}{}", self_ty, rest);
    }

    strip_generics(&path)
}

/// Index of the `>` closing the `<` at position 0.
fn matching_angle(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level_as(s: &str) -> &str {
    let mut depth = 0usize;
    let bytes = s.as_bytes();
    for (i, c) in s.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ' ' if depth == 0 && bytes[i..].starts_with(b" as ") => return &s[..i],
            _ => {}
        }
    }
    s
}

fn strip_generics(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0usize;
    for c in s.chars() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.replace("::::", "::")
}

/// Ordered frames, innermost first. Immutable once captured.
///
/// A stack taken from a live [`Backtrace`] keeps it unresolved. Symbols are
/// resolved the first time the frames are read, and clones share the result.
#[derive(Clone, Default)]
pub struct CallStack(Arc<StackInner>);

#[derive(Default)]
struct StackInner {
    raw: Option<Backtrace>,
    frames: OnceLock<Vec<CallFrame>>,
}

impl CallStack {
    pub fn from_backtrace(backtrace: Backtrace) -> Self {
        Self(Arc::new(StackInner {
            raw: Some(backtrace),
            frames: OnceLock::new(),
        }))
    }

    pub fn frames(&self) -> &[CallFrame] {
        self.0.frames.get_or_init(|| match self.0.raw {
            // Full format: the short one trims frames around runtime entry points.
            Some(ref backtrace) => parse_frames(&format!("{:#}", backtrace)),
            None => Vec::new(),
        })
    }

    /// Whether symbols have been resolved yet.
    pub fn is_resolved(&self) -> bool {
        self.0.frames.get().is_some()
    }

    pub fn len(&self) -> usize {
        self.frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames().is_empty()
    }

    /// Parse the text rendering of a `std::backtrace::Backtrace`.
    ///
    /// ```text
    ///    3: billing::db::InvoiceDao::load
    ///              at ./src/db.rs:42:9
    /// ```
    pub fn parse_backtrace(rendered: &str) -> Self {
        Self::from(parse_frames(rendered))
    }
}

fn parse_frames(rendered: &str) -> Vec<CallFrame> {
    let mut frames: Vec<CallFrame> = Vec::new();

    for line in rendered.lines() {
        let line = line.trim();
        if let Some(location) = line.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut()
                && frame.file.is_none()
            {
                let (file, line_no) = parse_location(location);
                frame.file = Some(file);
                frame.line = line_no;
            }
            continue;
        }

        if let Some((index, symbol)) = line.split_once(": ")
            && !index.is_empty()
            && index.chars().all(|c| c.is_ascii_digit())
        {
            frames.push(CallFrame::from_symbol(symbol));
        }
    }

    frames
}

impl From<Vec<CallFrame>> for CallStack {
    fn from(frames: Vec<CallFrame>) -> Self {
        Self(Arc::new(StackInner {
            raw: None,
            frames: OnceLock::from(frames),
        }))
    }
}

impl PartialEq for CallStack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.frames() == other.frames()
    }
}

impl Eq for CallStack {}

impl std::fmt::Debug for CallStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.frames.get() {
            Some(frames) => f.debug_list().entries(frames).finish(),
            None => f.write_str("CallStack(<unresolved>)"),
        }
    }
}

/// `path/to/file.rs:42:9` → (`path/to/file.rs`, 42). Column is dropped.
fn parse_location(location: &str) -> (String, Option<u32>) {
    let mut parts = location.rsplitn(3, ':');
    let last = parts.next();
    let middle = parts.next();
    let head = parts.next();

    match (head, middle, last) {
        (Some(file), Some(line), Some(_col)) => match line.parse() {
            Ok(line) => (file.to_string(), Some(line)),
            Err(_) => (location.to_string(), None),
        },
        (None, Some(file), Some(line)) => match line.parse() {
            Ok(line) => (file.to_string(), Some(line)),
            Err(_) => (location.to_string(), None),
        },
        _ => (location.to_string(), None),
    }
}

/// Source of call stacks for new leases.
pub trait StackCapture: Send + Sync {
    fn capture(&self) -> CallStack;
}

/// Captures the live stack with `std::backtrace`, regardless of `RUST_BACKTRACE`.
/// Symbol resolution is deferred until a lease is rendered.
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktraceCapture;

impl StackCapture for BacktraceCapture {
    fn capture(&self) -> CallStack {
        CallStack::from_backtrace(Backtrace::force_capture())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_method_symbol() {
        let frame = CallFrame::from_symbol("billing::db::InvoiceDao::load");
        assert_eq!(frame.module, "billing::db");
        assert_eq!(frame.type_name.as_deref(), Some("InvoiceDao"));
        assert_eq!(frame.method, "load");
    }

    #[test]
    fn parses_free_function_symbol() {
        let frame = CallFrame::from_symbol("billing::jobs::run_nightly::{{closure}}");
        assert_eq!(frame.module, "billing::jobs");
        assert_eq!(frame.type_name, None);
        assert_eq!(frame.method, "run_nightly");
    }

    #[test]
    fn parses_trait_impl_symbol() {
        let frame =
            CallFrame::from_symbol("<billing::db::InvoiceDao<T> as billing::db::Dao>::find::{{closure}}");
        assert_eq!(frame.module, "billing::db");
        assert_eq!(frame.type_name.as_deref(), Some("InvoiceDao"));
        assert_eq!(frame.method, "find");
    }

    #[test]
    fn strips_legacy_hash() {
        let frame = CallFrame::from_symbol("billing::main::h0123456789abcdef");
        assert_eq!(frame.module, "billing");
        assert_eq!(frame.method, "main");
    }

    #[test]
    fn parses_rendered_backtrace() {
        let rendered = "   0: std::backtrace::Backtrace::force_capture\n\
                        \x20            at /rustc/abc/library/std/src/backtrace.rs:312:9\n\
                        \x20  1: billing::db::InvoiceDao::load\n\
                        \x20            at ./src/db.rs:42:9\n\
                        \x20  2: main\n";
        let stack = CallStack::parse_backtrace(rendered);

        assert_eq!(stack.len(), 3);
        let frame = &stack.frames()[1];
        assert_eq!(frame.qualified_name(), "billing::db::InvoiceDao::load");
        assert_eq!(frame.file.as_deref(), Some("./src/db.rs"));
        assert_eq!(frame.line, Some(42));
        assert_eq!(stack.frames()[2].file, None);
    }

    #[test]
    fn frame_display_includes_location() {
        let frame = CallFrame::new("billing::db", Some("InvoiceDao"), "load").at("src/db.rs", 42);
        assert_eq!(frame.to_string(), "billing::db::InvoiceDao::load (src/db.rs:42)");
    }

    #[test]
    fn backtrace_capture_sees_this_test() {
        let stack = BacktraceCapture.capture();
        // Symbol resolution may be unavailable in stripped builds; only check
        // that whatever resolved is well-formed.
        assert!(stack.frames().iter().all(|f| !f.method.is_empty()));
    }

    #[test]
    fn backtrace_capture_resolves_lazily() {
        let stack = BacktraceCapture.capture();
        assert!(!stack.is_resolved());
        assert_eq!(format!("{:?}", stack), "CallStack(<unresolved>)");

        let copy = stack.clone();
        let frames = stack.frames().len();
        assert!(stack.is_resolved());
        // Clones share the resolved frames.
        assert!(copy.is_resolved());
        assert_eq!(copy.len(), frames);
    }

    #[test]
    fn stacks_from_frames_are_resolved() {
        let stack = CallStack::from(vec![CallFrame::new("billing::db", None, "load")]);
        assert!(stack.is_resolved());
        assert!(CallStack::default().is_empty());
        assert_eq!(stack, CallStack::parse_backtrace("   0: billing::db::load\n"));
    }
}
