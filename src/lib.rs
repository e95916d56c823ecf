//! hsse-guard - session idle timeout and realtime notifications for the HSSE client

mod event;

pub use event::*;

pub mod clock;
pub mod config;
pub mod guard;
pub mod ipc;
pub mod listener;
pub mod realtime;
pub mod scheduler;
pub mod server;
pub mod time;
pub mod transport;
pub mod watcher;
