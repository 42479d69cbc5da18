//! tspy — a local multi-worker task spooler.
//!
//! Jobs are queued in a shared SQLite database and claimed by any number
//! of independently launched workers, with priority/FIFO ordering,
//! exclusive GPU reservation, and pause/resume/kill control over the
//! spawned processes.

pub mod alloc;
pub mod config;
pub mod error;
pub mod job;
pub mod process;
pub mod store;
pub mod worker;
