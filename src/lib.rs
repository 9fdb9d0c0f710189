//! SSH tunnel multiplexing: local TCP ports forwarded through authenticated
//! SSH sessions.

pub mod logging;
pub mod services;
pub mod settings;

pub use services::ssh;
