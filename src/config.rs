//! Per-thread runtime configuration.
//!
//! ```ignore
//! let _guard = Config::new()
//!     .async_mode(false)
//!     .error_handler(|err| eprintln!("{err}"))
//!     .install();
//! // ... previous configuration comes back when `_guard` drops
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Error;

/// Default ceiling for consecutive re-runs of one unit within a flush.
pub const DEFAULT_MAX_UPDATE_COUNT: usize = 100;

type Handler = Rc<dyn Fn(&Error)>;

thread_local! {
    static CONFIG: RefCell<Config> = RefCell::new(Config::new());
}

/// Runtime switches of the reactive core.
#[derive(Clone)]
pub struct Config {
    async_mode: bool,
    silent: bool,
    max_update_count: usize,
    error_handler: Option<Handler>,
    warn_handler: Option<Handler>,
    on_tick: Option<Rc<dyn Fn()>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("async_mode", &self.async_mode)
            .field("silent", &self.silent)
            .field("max_update_count", &self.max_update_count)
            .field("error_handler", &self.error_handler.is_some())
            .field("warn_handler", &self.warn_handler.is_some())
            .field("on_tick", &self.on_tick.is_some())
            .finish()
    }
}

impl Config {
    /// Defaults: batched mode, diagnostics logged, ceiling of 100 re-runs,
    /// no handlers.
    pub fn new() -> Self {
        Self {
            async_mode: true,
            silent: false,
            max_update_count: DEFAULT_MAX_UPDATE_COUNT,
            error_handler: None,
            warn_handler: None,
            on_tick: None,
        }
    }

    /// Batched (`true`, default) or synchronous flushing.
    ///
    /// With `false` the scheduler flushes its queue right when a unit is
    /// queued, and dependencies sort their subscribers by id before
    /// notifying them in debug builds.
    pub fn async_mode(mut self, enabled: bool) -> Self {
        self.async_mode = enabled;
        self
    }

    /// Suppress diagnostics that would otherwise be logged.
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Re-run ceiling for a single unit within one flush.
    pub fn max_update_count(mut self, count: usize) -> Self {
        self.max_update_count = count;
        self
    }

    /// Receive computation errors instead of having them propagate.
    pub fn error_handler(mut self, handler: impl Fn(&Error) + 'static) -> Self {
        self.error_handler = Some(Rc::new(handler));
        self
    }

    /// Receive diagnostics (runaway units, tracking violations).
    pub fn warn_handler(mut self, handler: impl Fn(&Error) + 'static) -> Self {
        self.warn_handler = Some(Rc::new(handler));
        self
    }

    /// Called whenever the first job of a new tick gets scheduled.
    ///
    /// Hosts with an event loop use this to post a call to
    /// [`flush`](crate::flush) at the end of the current turn.
    pub fn on_tick(mut self, hook: impl Fn() + 'static) -> Self {
        self.on_tick = Some(Rc::new(hook));
        self
    }

    /// Make this the configuration of the current thread.
    ///
    /// The returned guard puts the previous configuration back when dropped.
    #[must_use = "the previous configuration is restored when the guard drops"]
    pub fn install(self) -> ConfigGuard {
        let previous = CONFIG.with(|c| c.replace(self));
        ConfigGuard {
            previous: Some(previous),
        }
    }
}

/// Restores the previously installed [`Config`] on drop.
pub struct ConfigGuard {
    previous: Option<Config>,
}

impl Drop for ConfigGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = CONFIG.try_with(|c| c.replace(previous));
        }
    }
}

fn read<R>(f: impl FnOnce(&Config) -> R, fallback: R) -> R {
    CONFIG.try_with(|c| f(&c.borrow())).unwrap_or(fallback)
}

pub(crate) fn async_mode() -> bool {
    read(|c| c.async_mode, true)
}

pub(crate) fn silent() -> bool {
    read(|c| c.silent, false)
}

pub(crate) fn max_update_count() -> usize {
    read(|c| c.max_update_count, DEFAULT_MAX_UPDATE_COUNT)
}

pub(crate) fn error_handler() -> Option<Handler> {
    read(|c| c.error_handler.clone(), None)
}

pub(crate) fn warn_handler() -> Option<Handler> {
    read(|c| c.warn_handler.clone(), None)
}

pub(crate) fn on_tick() -> Option<Rc<dyn Fn()>> {
    read(|c| c.on_tick.clone(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_previous_config() {
        assert!(async_mode());
        {
            let _outer = Config::new().async_mode(false).max_update_count(5).install();
            assert!(!async_mode());
            assert_eq!(max_update_count(), 5);
            {
                let _inner = Config::new().silent(true).install();
                assert!(async_mode());
                assert!(silent());
            }
            assert!(!async_mode());
            assert!(!silent());
        }
        assert!(async_mode());
        assert_eq!(max_update_count(), DEFAULT_MAX_UPDATE_COUNT);
    }

    #[test]
    fn debug_output_hides_handlers() {
        let config = Config::new().error_handler(|_| {});
        let rendered = format!("{config:?}");
        assert!(rendered.contains("error_handler: true"));
        assert!(rendered.contains("warn_handler: false"));
    }
}
