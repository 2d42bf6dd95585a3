use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    /// Helpers pull requesters into their location.
    Normal,
    /// Helpers reach requesters out of band; dispatch only pops the queue.
    Degraded,
}

impl ServiceMode {
    pub fn degrade(self) -> Self {
        Self::Degraded
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Degraded => "degraded",
        }
    }
}

/// Per-session mode flag. Starts `Normal`, moves to `Degraded` at most once.
#[derive(Debug, Default)]
pub struct ModeState {
    degraded: AtomicBool,
}

impl ModeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> ServiceMode {
        if self.degraded.load(Ordering::SeqCst) {
            ServiceMode::Degraded
        } else {
            ServiceMode::Normal
        }
    }

    /// Returns `true` only for the call that performed the transition.
    pub fn degrade(&self) -> bool {
        !self.degraded.swap(true, Ordering::SeqCst)
    }
}
