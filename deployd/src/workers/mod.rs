//! Background workers

pub mod deployer;
pub mod relay;
