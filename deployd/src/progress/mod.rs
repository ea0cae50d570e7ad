//! Progress reporting from running deployments to the requesting client

pub mod channel;
pub mod sink;

pub use channel::{Envelope, ProgressChannel, ProgressReceiver, ProgressReporter};
pub use sink::{dispatch, ConsoleSink, ProgressSink, RelaySink};
