pub mod ci;
pub mod config;
pub mod error;
pub mod gate;
pub mod git;
pub mod host;
pub mod io;
pub mod iteration;
pub mod ledger;
pub mod merge_failure;
pub mod merge_stack;
pub mod paths;
pub mod render;
pub mod step;

#[cfg(test)]
mod testing;

pub use error::{RalphError, Result};
