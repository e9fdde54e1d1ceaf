//! Infrastructure layer - port implementations
//!
//! Hardware backed implementations of the `myrtio-ota` ports and the
//! executor tasks that drive them.

pub(crate) mod config;
pub(crate) mod drivers;
pub(crate) mod services;
pub(crate) mod tasks;
