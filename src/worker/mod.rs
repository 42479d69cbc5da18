//! Worker loop and session state.

pub mod run;
pub mod session;

pub use run::Worker;
pub use session::WorkerSession;
