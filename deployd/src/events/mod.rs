//! Lifecycle events

pub mod bus;

pub use bus::{EventBus, LifecycleContext, LifecycleEvent, Listener, ListenerError};
