//! Cooperative cancellation for long-running stages.
//!
//! A token is checked between stages and once per frame inside extraction
//! and detection. It trips either when `cancel()` is called or when its
//! deadline passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{PipelineError, Result};

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that trips once `timeout` has elapsed from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.is_expired()
    }

    fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Returns `Err(PipelineError::Cancelled)` once the token has tripped.
    pub fn check(&self, stage: &str) -> Result<()> {
        if self.flag.load(Ordering::SeqCst) {
            return Err(PipelineError::Cancelled(format!("cancelled during {stage}")));
        }
        if self.is_expired() {
            return Err(PipelineError::Cancelled(format!(
                "job deadline exceeded during {stage}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_passes() {
        let token = CancelToken::new();
        assert!(token.check("extract").is_ok());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        let err = token.check("detect").unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(ref msg) if msg.contains("detect")));
    }

    #[test]
    fn zero_timeout_trips_immediately() {
        let token = CancelToken::with_timeout(Duration::ZERO);
        let err = token.check("track").unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }
}
