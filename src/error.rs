//! Error taxonomy and the reporting channel.
//!
//! Three kinds of problems exist in the core:
//!
//! - tracking errors: misuse of the ambient target stack (internal invariant)
//! - computation errors: a unit body, watch callback, `before` hook or tick
//!   callback panicked; caught at the unit boundary
//! - runaway updates: a unit kept re-queueing itself within one flush
//!
//! Computation errors go through [`report`]: with an error handler configured
//! they are handed to it and swallowed, otherwise they keep propagating.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use tracing::{debug, warn};

use crate::config;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the reactive core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A unit body, watch callback, `before` hook or tick callback panicked.
    #[error("error in {info}: {message}")]
    Computation {
        /// Where the failure happened, e.g. `getter for watcher "render"`.
        info: String,
        /// Panic message, if it was a string.
        message: String,
    },

    /// A unit re-queued itself more often than allowed within one flush.
    #[error("you may have an infinite update loop in {unit} ({count} consecutive re-runs)")]
    InfiniteUpdateLoop {
        /// Label of the offending unit.
        unit: String,
        /// Number of re-runs before it was dropped.
        count: usize,
    },

    /// The ambient target stack was popped without a matching push.
    #[error("evaluation target stack underflow: pop without a matching push")]
    TargetStackUnderflow,

    /// A unit was torn down while it was the active unit.
    #[error("cannot tear down {unit} while it is the active evaluation unit")]
    TeardownWhileActive {
        /// Label of the unit.
        unit: String,
    },

    /// `set`/`del` was called on a primitive value.
    #[error("cannot {op} reactive property on a primitive value")]
    InvalidTarget {
        /// The attempted operation (`set` or `delete`).
        op: &'static str,
    },

    /// Tried to change the key set of an object used as root data.
    #[error("avoid adding or deleting reactive properties of root data at runtime")]
    RootDataMutation,

    /// `watch_path` got a path with unsupported characters.
    #[error("failed watching path \"{0}\": only simple dot-delimited paths are accepted")]
    InvalidPath(String),

    /// A computed value without setter was assigned.
    #[error("computed property \"{0}\" was assigned to but it has no setter")]
    ReadonlyComputed(String),
}

/// A caught panic together with its original payload.
///
/// The payload is kept so that unhandled failures of synchronous units can be
/// re-raised unchanged to the caller that triggered the mutation.
pub(crate) struct Failure {
    pub(crate) error: Error,
    payload: Box<dyn Any + Send>,
}

impl Failure {
    pub(crate) fn from_panic(info: String, payload: Box<dyn Any + Send>) -> Self {
        let message = panic_message(payload.as_ref());
        Self {
            error: Error::Computation { info, message },
            payload,
        }
    }

    /// A failure that did not originate from a panic; raising it panics with
    /// the error itself as payload.
    pub(crate) fn from_error(error: Error) -> Self {
        Self {
            payload: Box::new(error.clone()),
            error,
        }
    }

    /// Continue unwinding with the original panic payload.
    pub(crate) fn raise(self) -> ! {
        panic::resume_unwind(self.payload)
    }
}

impl std::fmt::Debug for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Failure").field("error", &self.error).finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<Error>() {
        err.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run user code, converting a panic into a [`Failure`] labelled with `info`.
pub(crate) fn invoke_guarded<R>(
    info: impl FnOnce() -> String,
    f: impl FnOnce() -> R,
) -> std::result::Result<R, Failure> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Failure::from_panic(info(), payload))
}

/// Hand a failure to the configured error handler.
///
/// Returns `Ok(())` when a handler took it, and gives the failure back when
/// none is configured so the caller can propagate it.
pub(crate) fn report(failure: Failure) -> std::result::Result<(), Failure> {
    let Some(handler) = config::error_handler() else {
        return Err(failure);
    };
    debug!(error = %failure.error, "computation error handed to error handler");
    if invoke_guarded(|| "error handler".to_string(), || handler(&failure.error)).is_err() {
        // Handler panics stay contained here.
        warn!(error = %failure.error, "error handler panicked while handling error");
    }
    Ok(())
}

/// Emit a diagnostic through the warn handler, or `tracing` unless silenced.
pub(crate) fn diagnose(error: Error) {
    if let Some(handler) = config::warn_handler() {
        if invoke_guarded(|| "warn handler".to_string(), || handler(&error)).is_err() {
            warn!(%error, "warn handler panicked");
        }
    } else if !config::silent() {
        match &error {
            Error::InfiniteUpdateLoop { unit, count } => {
                warn!(unit = %unit, count, "infinite update loop detected, dropping unit from flush: {error}");
            }
            Error::TargetStackUnderflow => {
                tracing::error!("tracking invariant violated: {error}");
            }
            other => warn!("{other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn invoke_guarded_captures_panic_message() {
        let failure = invoke_guarded(|| "getter for watcher \"t\"".to_string(), || panic!("boom"))
            .unwrap_err();
        assert_eq!(
            failure.error,
            Error::Computation {
                info: "getter for watcher \"t\"".to_string(),
                message: "boom".to_string(),
            }
        );
    }

    #[test]
    fn report_without_handler_gives_failure_back() {
        let failure = invoke_guarded(String::new, || panic!("nope")).unwrap_err();
        assert!(report(failure).is_err());
    }

    #[test]
    fn report_with_handler_swallows() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let _config = Config::new()
            .error_handler(move |err| seen_in_handler.borrow_mut().push(err.to_string()))
            .install();

        let failure = invoke_guarded(|| "tick callback".to_string(), || panic!("bad")).unwrap_err();
        assert!(report(failure).is_ok());
        assert_eq!(seen.borrow().as_slice(), ["error in tick callback: bad"]);
    }

    #[test]
    fn panicking_handler_is_contained() {
        let _config = Config::new().error_handler(|_| panic!("handler broke")).install();
        let failure = invoke_guarded(String::new, || panic!("first")).unwrap_err();
        assert!(report(failure).is_ok());
    }

    #[test]
    fn diagnose_prefers_warn_handler() {
        let seen = Rc::new(RefCell::new(None));
        let seen_in_handler = seen.clone();
        let _config = Config::new()
            .warn_handler(move |err| *seen_in_handler.borrow_mut() = Some(err.clone()))
            .install();

        diagnose(Error::TargetStackUnderflow);
        assert_eq!(*seen.borrow(), Some(Error::TargetStackUnderflow));
    }
}
