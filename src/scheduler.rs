//! Update queue for batched re-runs.
//!
//! Units notified of a change are queued here at most once per flush. A flush
//! sorts the queue by unit id so units run in creation order; units queued
//! while the flush is running are inserted at their id-ordered position after
//! the unit currently running, which means a unit re-queued by its own run
//! still runs again in the same flush.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::arena::{WatcherId, WatcherState};
use crate::batch::is_batching;
use crate::config;
use crate::error::{diagnose, Error, Failure};
use crate::hash::FastHashBuilder;
use crate::tick;

#[derive(Default)]
struct SchedulerState {
    queue: Vec<WatcherId>,
    /// Units waiting in `queue` that have not started running yet
    has: HashSet<WatcherId, FastHashBuilder>,
    /// Re-queues of a unit by itself within the current flush
    circular: HashMap<WatcherId, usize, FastHashBuilder>,
    /// Runaway units refused for the rest of the current flush
    dropped: HashSet<WatcherId, FastHashBuilder>,
    /// Position of the unit currently running
    index: usize,
    /// A flush has been scheduled and not finished yet
    waiting: bool,
    flushing: bool,
}

thread_local! {
    static SCHEDULER: RefCell<SchedulerState> = RefCell::new(SchedulerState::default());
}

fn with_state<R>(f: impl FnOnce(&mut SchedulerState) -> R) -> Option<R> {
    SCHEDULER.try_with(|state| f(&mut state.borrow_mut())).ok()
}

/// Add a unit to the queue unless it is already waiting in it.
///
/// Schedules a flush for the first unit of a cycle: synchronously in
/// synchronous mode (outside of [`batch`](crate::batch)), otherwise as a tick
/// job. The result is the outcome of a synchronous flush.
pub(crate) fn queue_watcher(watcher: WatcherId) -> Result<(), Failure> {
    let schedule = with_state(|state| {
        if state.has.contains(&watcher) || state.dropped.contains(&watcher) {
            return None;
        }
        state.has.insert(watcher);
        if !state.flushing {
            state.queue.push(watcher);
        } else {
            // Keep the pending part of the queue ordered by id
            let mut position = state.queue.len();
            while position > state.index + 1 && state.queue[position - 1] > watcher {
                position -= 1;
            }
            state.queue.insert(position, watcher);
        }
        Some(!std::mem::replace(&mut state.waiting, true))
    })
    .flatten();
    let Some(schedule) = schedule else {
        return Ok(());
    };

    watcher.set_state(WatcherState::Queued);
    trace!(unit = %watcher.label(), uid = watcher.uid(), "queued");

    if !schedule {
        return Ok(());
    }
    if !config::async_mode() && !is_batching() {
        let (_, failure) = flush_scheduler_queue();
        return failure.map_or(Ok(()), Err);
    }
    tick::schedule_scheduler_flush();
    Ok(())
}

/// Whether a flush has been scheduled and not completed
pub(crate) fn is_waiting() -> bool {
    with_state(|state| state.waiting).unwrap_or(false)
}

/// Run every queued unit once, in id order.
///
/// Returns the number of units run and the first failure no error handler
/// took. A failing unit never stops the flush.
pub(crate) fn flush_scheduler_queue() -> (usize, Option<Failure>) {
    let queued = with_state(|state| {
        state.flushing = true;
        state.queue.sort();
        state.queue.len()
    })
    .unwrap_or(0);
    debug!(queued, "flush start");

    let max_update_count = config::max_update_count();
    let mut ran = 0;
    let mut first_failure = None;

    loop {
        let next = with_state(|state| state.queue.get(state.index).copied()).flatten();
        let Some(watcher) = next else {
            break;
        };

        if watcher.raw_state() == WatcherState::TornDown {
            cov_mark::hit!(torn_down_entry_skipped);
            with_state(|state| {
                state.has.remove(&watcher);
                state.index += 1;
            });
            continue;
        }

        if let Err(failure) = watcher.run_before() {
            first_failure.get_or_insert(failure);
        }
        with_state(|state| state.has.remove(&watcher));
        if let Err(failure) = watcher.run() {
            first_failure.get_or_insert(failure);
        }
        ran += 1;

        let runaway = with_state(|state| {
            if !state.has.contains(&watcher) {
                return None;
            }
            let count = state.circular.entry(watcher).or_insert(0);
            *count += 1;
            if *count <= max_update_count {
                return None;
            }
            let count = *count;
            cov_mark::hit!(runaway_unit_dropped);
            // Drop the pending re-run and refuse further ones this flush
            let index = state.index;
            if let Some(offset) = state.queue[index + 1..].iter().position(|w| *w == watcher) {
                state.queue.remove(index + 1 + offset);
            }
            state.has.remove(&watcher);
            state.dropped.insert(watcher);
            Some(count)
        })
        .flatten();
        if let Some(count) = runaway {
            watcher.set_state(WatcherState::Idle);
            diagnose(Error::InfiniteUpdateLoop {
                unit: watcher.label().to_string(),
                count,
            });
        }

        with_state(|state| state.index += 1);
    }

    with_state(|state| *state = SchedulerState::default());
    debug!(ran, failed = first_failure.is_some(), "flush end");
    (ran, first_failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::observer::{observe, Object, Value};
    use crate::watcher::Watcher;
    use std::cell::Cell;
    use std::rc::Rc;

    fn counter() -> (Object, Rc<Cell<u32>>) {
        let state = Object::new();
        state.set("n", 0);
        observe(&Value::Object(state.clone()));
        (state, Rc::new(Cell::new(0)))
    }

    #[test]
    fn queue_deduplicates_within_a_cycle() {
        let (state, runs) = counter();
        let watcher = Watcher::render({
            let state = state.clone();
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                state.get("n");
            }
        });
        state.set("n", 1);
        state.set("n", 2);
        watcher.force_update();
        assert!(is_waiting());
        assert_eq!(watcher.state(), WatcherState::Queued);

        let (ran, failure) = flush_scheduler_queue();
        assert_eq!(ran, 1);
        assert!(failure.is_none());
        assert_eq!(runs.get(), 2);
        assert!(!is_waiting());
        assert_eq!(watcher.state(), WatcherState::Idle);
    }

    #[test]
    fn torn_down_entries_are_skipped() {
        cov_mark::check!(torn_down_entry_skipped);
        let (state, runs) = counter();
        let watcher = Watcher::render({
            let state = state.clone();
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                state.get("n");
            }
        });
        state.set("n", 1);
        assert!(watcher.teardown().is_ok());

        let (ran, _) = flush_scheduler_queue();
        assert_eq!(ran, 0);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn runaway_unit_is_dropped_and_reported() {
        cov_mark::check!(runaway_unit_dropped);
        let reported = Rc::new(Cell::new(None));
        let _config = Config::new()
            .max_update_count(5)
            .warn_handler({
                let reported = reported.clone();
                move |err| {
                    if let Error::InfiniteUpdateLoop { count, .. } = err {
                        reported.set(Some(*count));
                    }
                }
            })
            .install();

        let (state, runs) = counter();
        let _looping = Watcher::render({
            let state = state.clone();
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                let n = state.get("n").as_number().unwrap_or(0.0);
                state.set("n", n + 1.0);
            }
        });
        assert_eq!(runs.get(), 1);

        let (ran, failure) = flush_scheduler_queue();
        assert!(failure.is_none());
        // One regular run plus five tolerated re-runs
        assert_eq!(ran, 6);
        assert_eq!(reported.get(), Some(6));
        assert!(!is_waiting());
    }
}
