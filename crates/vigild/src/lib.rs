//! vigild: descriptor storage, liveness re-validation, matching and token
//! issuance behind the `org.freedesktop.Vigil1` D-Bus interface.

pub mod config;
pub mod dbus_interface;
pub mod rate_limiter;
pub mod service;
pub mod store;
pub mod tokens;
