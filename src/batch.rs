use std::cell::Cell;

use crate::error::Result;
use crate::tick::flush;

// Thread-local batch depth counter
// When > 0, queued units are not flushed synchronously even in
// synchronous mode; the outermost batch flushes on exit
thread_local! {
    static BATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Check if currently inside a batch
pub fn is_batching() -> bool {
    BATCH_DEPTH.try_with(Cell::get).unwrap_or(0) > 0
}

fn enter_batch() {
    BATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
}

/// Leave one level; true when the outermost batch was left
fn exit_batch() -> bool {
    BATCH_DEPTH
        .try_with(|depth| {
            let remaining = depth.get().saturating_sub(1);
            depth.set(remaining);
            remaining == 0
        })
        .unwrap_or(false)
}

/// RAII guard that exits the batch even when the body panics.
///
/// On the normal path the guard is disarmed and `batch` flushes itself, so
/// the flush result reaches the caller. While unwinding the guard flushes and
/// can only log a failure.
struct BatchGuard {
    armed: bool,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if self.armed && exit_batch() {
            if let Err(err) = flush() {
                tracing::error!(%err, "flush after unwinding batch failed");
            }
        }
    }
}

/// Group several mutations into one update cycle
///
/// Units queued by changes inside `f` run once, when the outermost batch
/// returns. This holds in synchronous mode too, where units would otherwise
/// re-run at every single change.
///
/// # Example
/// ```ignore
/// // Without batch (synchronous mode): render runs 3 times
/// state.set("voltage", 5.0);
/// state.set("current", 2.0);
/// state.set("load", 1.0);
///
/// // With batch: render runs once
/// batch(|| {
///     state.set("voltage", 5.0);
///     state.set("current", 2.0);
///     state.set("load", 1.0);
/// })?;
/// ```
///
/// Returns the value of `f`, or the first unhandled error of the closing
/// flush.
pub fn batch<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    enter_batch();
    let mut guard = BatchGuard { armed: true };
    // If f() panics, the guard exits the batch during unwinding
    let value = f();
    guard.armed = false;
    drop(guard);

    if exit_batch() {
        flush()?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_nesting_tracks_depth() {
        assert!(!is_batching());

        let result = batch(|| {
            assert!(is_batching());
            let inner = batch(|| {
                assert!(is_batching());
                "inner"
            });
            assert!(is_batching());
            inner
        });

        assert_eq!(result, Ok(Ok("inner")));
        assert!(!is_batching());
    }

    #[test]
    fn batch_exits_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _ = batch(|| panic!("body failed"));
        });
        assert!(result.is_err());
        assert!(!is_batching());
    }

    #[test]
    fn batch_returns_value() {
        assert_eq!(batch(|| 42), Ok(42));
    }
}
