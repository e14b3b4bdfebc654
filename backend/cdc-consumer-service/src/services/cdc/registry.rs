//! Dispatch registry: operation kind → ordered list of change handlers.
//!
//! The registry is assembled before the consumer starts and then shared
//! read-only by every partition task. `dispatch` runs the matching handlers
//! one after another inside the calling partition task, so a slow handler only
//! holds back its own partition.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

use super::classifier::OperationKind;
use super::models::ChangeEvent;
use crate::error::HandlerError;

/// Receiver of classified change events.
///
/// Delivery is at-least-once: the same event may be handed over again after a
/// retry, a rebalance or a restart, so implementations must be idempotent.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Stable name used in logs and failure reports.
    fn name(&self) -> &str;

    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError>;
}

/// Adapts a synchronous closure into a [`ChangeHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> ChangeHandler for FnHandler<F>
where
    F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        (self.f)(event)
    }
}

/// Which events a registration receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerScope {
    Only(OperationKind),
    /// Every event, including `Unknown` classifications
    AllKinds,
}

impl HandlerScope {
    fn matches(&self, kind: OperationKind) -> bool {
        match self {
            HandlerScope::Only(k) => *k == kind,
            HandlerScope::AllKinds => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: HandlerError,
}

/// Aggregated result of one dispatch. Inspected by the commit coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success {
        invoked: usize,
    },
    PartialFailure {
        succeeded: usize,
        failures: Vec<HandlerFailure>,
    },
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Success { .. })
    }

    pub fn failures(&self) -> &[HandlerFailure] {
        match self {
            DispatchOutcome::Success { .. } => &[],
            DispatchOutcome::PartialFailure { failures, .. } => failures,
        }
    }
}

struct Registration {
    scope: HandlerScope,
    handler: Arc<dyn ChangeHandler>,
}

#[derive(Default)]
pub struct DispatchRegistry {
    registrations: Vec<Registration>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler. Handlers run in registration order.
    pub fn register(&mut self, scope: HandlerScope, handler: Arc<dyn ChangeHandler>) -> &mut Self {
        debug!(handler = handler.name(), ?scope, "Registered change handler");
        self.registrations.push(Registration { scope, handler });
        self
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Invoke every matching handler in registration order.
    ///
    /// A failing or panicking handler is recorded and the remaining handlers
    /// still run.
    pub async fn dispatch(&self, event: &ChangeEvent) -> DispatchOutcome {
        let mut invoked = 0;
        let mut failures = Vec::new();

        for registration in self.registrations.iter().filter(|r| r.scope.matches(event.kind)) {
            invoked += 1;
            let handler = &registration.handler;

            let result = AssertUnwindSafe(handler.handle(event))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))));

            if let Err(error) = result {
                error!(
                    handler = handler.name(),
                    topic = %event.topic,
                    partition = event.partition,
                    offset = event.offset,
                    operation = %event.kind,
                    error = %error,
                    "Change handler failed"
                );
                failures.push(HandlerFailure {
                    handler: handler.name().to_string(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            DispatchOutcome::Success { invoked }
        } else {
            DispatchOutcome::PartialFailure {
                succeeded: invoked - failures.len(),
                failures,
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cdc::models::{ChangeEnvelope, SourceInfo};
    use parking_lot::Mutex;

    fn event(kind: OperationKind) -> ChangeEvent {
        ChangeEvent {
            topic: "dbserver1.public.users".to_string(),
            partition: 0,
            offset: 5,
            kind,
            envelope: ChangeEnvelope {
                before: None,
                after: None,
                source: SourceInfo {
                    database: "postgres".to_string(),
                    schema: "public".to_string(),
                    table: "users".to_string(),
                    connector_version: String::new(),
                    connector: None,
                    server_name: None,
                },
                operation: "c".to_string(),
                event_time_ms: 0,
            },
        }
    }

    fn recorder(
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    ) -> Arc<dyn ChangeHandler> {
        Arc::new(FnHandler::new(name, move |_event: &ChangeEvent| {
            log.lock().push(name);
            if fail {
                Err(HandlerError::failed(format!("{} refused", name)))
            } else {
                Ok(())
            }
        }))
    }

    struct PanickingHandler;

    #[async_trait]
    impl ChangeHandler for PanickingHandler {
        fn name(&self) -> &str {
            "panicker"
        }

        async fn handle(&self, _event: &ChangeEvent) -> Result<(), HandlerError> {
            panic!("handler exploded");
        }
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order_with_wildcards() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DispatchRegistry::new();
        registry
            .register(HandlerScope::AllKinds, recorder("audit", log.clone(), false))
            .register(
                HandlerScope::Only(OperationKind::Insert),
                recorder("insert", log.clone(), false),
            )
            .register(
                HandlerScope::Only(OperationKind::Delete),
                recorder("delete", log.clone(), false),
            )
            .register(HandlerScope::AllKinds, recorder("metrics", log.clone(), false));

        let outcome = registry.dispatch(&event(OperationKind::Insert)).await;

        assert_eq!(outcome, DispatchOutcome::Success { invoked: 3 });
        assert_eq!(*log.lock(), vec!["audit", "insert", "metrics"]);

        log.lock().clear();
        registry.dispatch(&event(OperationKind::Delete)).await;
        assert_eq!(*log.lock(), vec!["audit", "delete", "metrics"]);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DispatchRegistry::new();
        registry
            .register(HandlerScope::AllKinds, recorder("first", log.clone(), true))
            .register(HandlerScope::AllKinds, recorder("second", log.clone(), false));

        let outcome = registry.dispatch(&event(OperationKind::Update)).await;

        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert!(!outcome.is_success());
        match outcome {
            DispatchOutcome::PartialFailure {
                succeeded,
                failures,
            } => {
                assert_eq!(succeeded, 1);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].handler, "first");
                assert_eq!(failures[0].error, HandlerError::failed("first refused"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_is_reported_not_propagated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DispatchRegistry::new();
        registry
            .register(HandlerScope::AllKinds, Arc::new(PanickingHandler))
            .register(HandlerScope::AllKinds, recorder("after", log.clone(), false));

        let outcome = registry.dispatch(&event(OperationKind::Delete)).await;

        assert_eq!(*log.lock(), vec!["after"]);
        assert_eq!(
            outcome.failures()[0].error,
            HandlerError::Panicked("handler exploded".to_string())
        );
    }

    #[tokio::test]
    async fn test_no_matching_handlers_is_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DispatchRegistry::new();
        registry.register(
            HandlerScope::Only(OperationKind::Insert),
            recorder("insert", log.clone(), false),
        );

        let outcome = registry.dispatch(&event(OperationKind::Unknown)).await;

        assert_eq!(outcome, DispatchOutcome::Success { invoked: 0 });
        assert!(log.lock().is_empty());
    }
}
