//! Remote agent daemon: scan/push cycle, offline queue, command polling,
//! and self-update.

pub mod client;
pub mod daemon;
pub mod fingerprint;
pub mod queue;
pub mod updater;
