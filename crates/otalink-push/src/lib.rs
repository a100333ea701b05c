//! Host-side OTA push tool.
//!
//! Turns a source directory into a manifest plus one compressed stream and
//! drives the update protocol against a device. Phases run strictly in
//! order and abort on the first failure. No resume: a fresh invocation
//! starts a brand-new session.

pub mod push;
pub mod source;

pub use push::{PushConfig, PushError, PushReport, push_update};
pub use source::SourceTree;
