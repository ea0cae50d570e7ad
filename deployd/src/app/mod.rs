//! Application wiring: options, shared state, startup and shutdown

pub mod options;
pub mod run;
pub mod state;
