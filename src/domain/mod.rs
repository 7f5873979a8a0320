//! Records, state rules and the ports the core depends on.

pub mod event;
pub mod money;
pub mod order;
pub mod outcome;
pub mod payment;
pub mod ports;
pub mod provider;
