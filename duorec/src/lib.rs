//! duorec: recording-session daemon for paired conversation capture.
//!
//! The daemon drives a session timer, watches the meeting recorder's output
//! directory, renames finished recordings to a canonical scheme and brokers
//! requests to a worker subprocess. `duorecctl` talks to it over a Unix
//! socket using the types in `duorec_ipc`.

pub mod app;
pub mod error;
pub mod ipc;
pub mod notifier;
pub mod rename;
pub mod settings;
pub mod store;
pub mod timer;
pub mod watcher;
pub mod worker;
