use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::{CdcError, Result};

/// Consumer lifecycle: `Created → Connecting → Subscribed → Running → Draining → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Connecting,
    Subscribed,
    Running,
    Draining,
    Disconnected,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Subscribed => "subscribed",
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Disconnected => "disconnected",
        }
    }

    /// Numeric code exported on the lifecycle gauge
    pub fn code(&self) -> i64 {
        match self {
            LifecycleState::Created => 0,
            LifecycleState::Connecting => 1,
            LifecycleState::Subscribed => 2,
            LifecycleState::Running => 3,
            LifecycleState::Draining => 4,
            LifecycleState::Disconnected => 5,
        }
    }

    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Created, Connecting)
                | (Connecting, Subscribed)
                | (Connecting, Created)
                | (Subscribed, Running)
                | (Subscribed, Draining)
                | (Running, Draining)
                | (Draining, Disconnected)
        )
    }

    /// Whether the consumer is attached to the broker and serving
    pub fn is_serving(&self) -> bool {
        matches!(self, LifecycleState::Subscribed | LifecycleState::Running)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared handle on the lifecycle state.
///
/// Clones observe the same state through one watch channel. Transitions are
/// validated and logged before they are published.
#[derive(Clone)]
pub struct Lifecycle {
    state: Arc<watch::Sender<LifecycleState>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Created);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn current(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&self, next: LifecycleState) -> Result<()> {
        let mut rejected = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                let from = std::mem::replace(current, next);
                info!(from = %from, to = %next, "Lifecycle transition");
                true
            } else {
                rejected = Some(*current);
                false
            }
        });

        match rejected {
            None => Ok(()),
            Some(from) => {
                error!(from = %from, to = %next, "Rejected lifecycle transition");
                Err(CdcError::InvalidTransition { from, to: next })
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
