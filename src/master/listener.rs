//! Delivery of terminal task outcomes.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

use super::task::{TaskListener, TaskOutcome};
use crate::observability;

/// Hands every listener its outcome.
///
/// A listener is consumed when notified, so no task can be notified twice.
/// A panicking callback is logged and the remaining listeners are still
/// notified.
#[derive(Debug, Default, Clone, Copy)]
pub struct ListenerDispatch;

impl ListenerDispatch {
    pub fn notify(&self, listener: TaskListener, outcome: TaskOutcome) {
        observability::record_task_outcome(outcome.label());
        let source = outcome.source().to_string();

        match listener {
            TaskListener::Channel(tx) => {
                if tx.send(outcome).is_err() {
                    debug!(source = %source, "Task handle dropped before outcome");
                }
            }
            TaskListener::Callback(callback) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(move || callback(outcome))) {
                    observability::record_listener_panic();
                    warn!(
                        source = %source,
                        panic = %panic_message(panic.as_ref()),
                        "Task listener panicked"
                    );
                }
            }
        }
    }

    /// Notify listeners in order.
    pub fn notify_all(&self, outcomes: impl IntoIterator<Item = (TaskListener, TaskOutcome)>) {
        for (listener, outcome) in outcomes {
            self.notify(listener, outcome);
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn outcome(source: &str) -> TaskOutcome {
        TaskOutcome::NoLongerMaster {
            source: source.to_string(),
        }
    }

    #[test]
    fn test_panicking_listener_does_not_stop_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();

        ListenerDispatch.notify_all(vec![
            (
                TaskListener::callback(move |_| {
                    c1.fetch_add(1, Ordering::SeqCst);
                }),
                outcome("a"),
            ),
            (TaskListener::callback(|_| panic!("listener bug")), outcome("b")),
            (
                TaskListener::callback(move |_| {
                    c2.fetch_add(1, Ordering::SeqCst);
                }),
                outcome("c"),
            ),
        ]);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_channel_listener() {
        let (listener, handle) = TaskListener::channel();
        ListenerDispatch.notify(listener, outcome("x"));
        assert_eq!(handle.outcome().await.source(), "x");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
