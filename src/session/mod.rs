//! Interactive session: live sampling vs. history browsing.
//!
//! `state` holds an immutable state value and a pure
//! `apply(state, msg) -> (state, effects)` reducer; `runtime` owns the event
//! loop that executes effects as tokio tasks and feeds their completion
//! messages back through one channel.

mod runtime;
mod state;

pub use runtime::{SessionHandle, SessionRuntime};
pub use state::{apply, Command, Effect, Filters, Mode, Msg, SessionState};

use std::time::Duration;

/// Session tunables, assembled from CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub sample_interval: Duration,
    pub max_temp_c: f64,
    pub max_mem_pct: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            max_temp_c: 90.0,
            max_mem_pct: 95.0,
        }
    }
}
