//! Scheduler runner.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructor and accessors
//! - `cycle`: one scheduling cycle and the blocking run loop
//! - `recovery`: startup reconciliation and shutdown handling

mod core;
mod cycle;
mod recovery;

pub use self::core::Scheduler;
