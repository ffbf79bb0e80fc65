//! Error types for the tracker's own failure modes.
//!
//! Pool errors are never wrapped: `acquire`/`release` return the pool's own
//! error type untouched.

use crate::record::LeaseId;

/// Misuse of the provider lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("lease monitor already started")]
    AlreadyStarted,
    #[error("lease monitor stopped; it cannot be restarted")]
    Stopped,
    #[error("start() must be called from within a tokio runtime")]
    NoRuntime,
}

/// A failure inside one monitor sweep. Logged, never returned to callers.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("sweep panicked: {message}")]
    Panicked { message: String },

    #[error("failed to reclaim lease {lease} ({key})")]
    Reclaim {
        lease: LeaseId,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SweepError {
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        SweepError::Panicked { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        let err = SweepError::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "sweep panicked: boom");

        let err = SweepError::from_panic(Box::new(String::from("kaboom")));
        assert_eq!(err.to_string(), "sweep panicked: kaboom");

        let err = SweepError::from_panic(Box::new(42u8));
        assert_eq!(err.to_string(), "sweep panicked: non-string panic payload");
    }

    #[test]
    fn reclaim_error_keeps_source() {
        let source: Box<dyn std::error::Error + Send + Sync> = "pool closed".into();
        let err = SweepError::Reclaim {
            lease: LeaseId::new(),
            key: "conn-7".to_string(),
            source,
        };
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("pool closed"));
    }
}
