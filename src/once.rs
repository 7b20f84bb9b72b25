//! Run-at-most-once actions

use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use thiserror::Error;

type Action<T> = Box<dyn FnOnce() -> T + Send>;

/// The action panicked on its only run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("action panicked: {message}")]
pub struct ActionPanicked {
    pub message: String,
}

/// An action that runs at most once and keeps what it produced
///
/// The first call to [`OnceAction::run`] executes the action, concurrent
/// callers block until it is done, and every later call returns the captured
/// result without running anything. A panic inside the action is captured and
/// reported to every caller as [`ActionPanicked`].
pub struct OnceAction<T> {
    action: Mutex<Option<Action<T>>>,
    result: OnceLock<Result<T, ActionPanicked>>,
}

impl<T> OnceAction<T> {
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self {
            action: Mutex::new(Some(Box::new(action))),
            result: OnceLock::new(),
        }
    }

    /// Run the action if it has not run yet and return its captured result
    pub fn run(&self) -> Result<&T, &ActionPanicked> {
        self.result
            .get_or_init(|| {
                let Some(action) = self.action.lock().take() else {
                    return Err(ActionPanicked {
                        message: "action was taken without completing".to_string(),
                    });
                };

                panic::catch_unwind(AssertUnwindSafe(action)).map_err(|payload| ActionPanicked {
                    message: panic_message(payload.as_ref()),
                })
            })
            .as_ref()
    }

    /// Whether the action has already run
    pub fn is_completed(&self) -> bool {
        self.result.get().is_some()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let action = OnceAction::new(move || counter.fetch_add(1, Ordering::SeqCst) + 42);

        assert!(!action.is_completed());
        assert_eq!(action.run(), Ok(&42));
        assert_eq!(action.run(), Ok(&42));
        assert!(action.is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_callers_share_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let action = Arc::new(OnceAction::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            "started"
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let action = action.clone();
                thread::spawn(move || *action.run().unwrap())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), "started");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_is_captured() {
        let action: OnceAction<()> = OnceAction::new(|| panic!("boom"));

        let err = action.run().unwrap_err();
        assert_eq!(err.message, "boom");

        // Later callers see the same failure, the action is not retried
        assert_eq!(action.run().unwrap_err().message, "boom");
        assert!(action.is_completed());
    }
}
