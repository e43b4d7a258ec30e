//! `gpu-grabd`: owns the task store, runs the scheduler on a dedicated
//! thread and answers clients over a Unix socket.

pub mod daemon;
pub mod handlers;
pub mod server;
pub mod state;

pub use daemon::run_daemon;
pub use state::DaemonState;
