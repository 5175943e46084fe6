//! Upload a file with client-side envelope encryption, or download and
//! decrypt a blob, as one sequential run.

pub mod cli;
pub mod error;
pub mod interrupt;
pub mod runner;

pub use error::Error;
pub use runner::{Invocation, Outcome, run};
