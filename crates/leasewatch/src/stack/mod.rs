//! Call stacks captured at acquire time and the policy that blames a frame.

mod attribution;
mod capture;

pub use attribution::{Attribution, CallSite, FrameFilter, NamespaceFilter};
pub use capture::{BacktraceCapture, CallFrame, CallStack, StackCapture};
