//! Device-side OTA update service.
//!
//! Accepts one authenticated session at a time, streams the compressed
//! update through an incremental inflater into a staging tree, swaps the
//! staged tree live, and hands off to the reboot hook. Any failure returns
//! the device to idle with the previous image untouched.

pub mod config;
pub mod gate;
pub mod service;
pub mod session;
pub mod storage;

pub use config::DeviceConfig;
pub use service::{Reboot, ServiceHandle, SessionOutcome, spawn};
pub use session::{DeviceState, StateCell};
