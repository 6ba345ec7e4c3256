//! Deferred job queue ("next tick").
//!
//! There is no ambient event loop to hook into, so the end of a turn is
//! whatever the host says it is: it calls [`flush`] (directly, after a
//! [`batch`](crate::batch), or from the [`on_tick`](crate::Config::on_tick)
//! hook it installed). Jobs scheduled while a flush drains the queue run in
//! the same flush.

use std::cell::RefCell;
use std::collections::VecDeque;

use tracing::debug;

use crate::config;
use crate::error::{invoke_guarded, report, Failure, Result};
use crate::scheduler;

enum TickJob {
    /// Flush the update queue
    Scheduler,
    Callback(Box<dyn FnOnce()>),
}

#[derive(Default)]
struct TickState {
    jobs: VecDeque<TickJob>,
    /// Jobs were scheduled since the last drain started
    pending: bool,
    draining: bool,
}

thread_local! {
    static TICK: RefCell<TickState> = RefCell::new(TickState::default());
}

fn push(job: TickJob) {
    let first = TICK
        .try_with(|tick| {
            let mut tick = tick.borrow_mut();
            tick.jobs.push_back(job);
            !std::mem::replace(&mut tick.pending, true)
        })
        .unwrap_or(false);
    if first {
        if let Some(hook) = config::on_tick() {
            hook();
        }
    }
}

/// Defer `callback` to the next [`flush`].
///
/// Callbacks run in scheduling order. A callback scheduled after a change
/// runs after the units re-rendering for that change.
pub fn next_tick(callback: impl FnOnce() + 'static) {
    push(TickJob::Callback(Box::new(callback)));
}

struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let _ = TICK.try_with(|tick| tick.borrow_mut().draining = false);
    }
}

pub(crate) fn schedule_scheduler_flush() {
    push(TickJob::Scheduler);
}

/// Whether a flush has work to do
pub fn is_flush_pending() -> bool {
    let pending = TICK
        .try_with(|tick| !tick.borrow().jobs.is_empty())
        .unwrap_or(false);
    pending || scheduler::is_waiting()
}

/// Run every deferred job, including jobs they schedule, until nothing is
/// left.
///
/// Returns the number of unit runs. Failures of units and tick callbacks do
/// not stop the flush; the first one no error handler took is returned after
/// the flush finished. Calls made while a flush is already running return
/// `Ok(0)`.
///
/// # Example
/// ```ignore
/// state.set("count", 1);
/// state.set("count", 2);
/// let runs = flush()?; // render unit ran once
/// ```
pub fn flush() -> Result<usize> {
    let entered = TICK
        .try_with(|tick| !std::mem::replace(&mut tick.borrow_mut().draining, true))
        .unwrap_or(false);
    if !entered {
        return Ok(0);
    }
    let _draining = DrainGuard;

    let mut ran = 0;
    let mut first_failure: Option<Failure> = None;
    loop {
        let job = TICK
            .try_with(|tick| {
                let mut tick = tick.borrow_mut();
                let job = tick.jobs.pop_front();
                if tick.jobs.is_empty() {
                    tick.pending = false;
                }
                job
            })
            .ok()
            .flatten();
        let Some(job) = job else {
            break;
        };
        let failure = match job {
            TickJob::Scheduler => {
                let (count, failure) = scheduler::flush_scheduler_queue();
                ran += count;
                failure
            }
            TickJob::Callback(callback) => {
                invoke_guarded(|| "tick callback".to_string(), callback)
                    .or_else(report)
                    .err()
            }
        };
        if let Some(failure) = failure {
            first_failure.get_or_insert(failure);
        }
    }

    debug!(ran, "tick drained");
    match first_failure {
        Some(failure) => Err(failure.error),
        None => Ok(ran),
    }
}
