pub mod bundler;
pub mod cli;
pub mod config;
pub mod dev;
pub mod error;
pub mod fsutil;
pub mod logging;
pub mod process;

#[cfg(test)]
pub mod test_utils;

pub use error::{DevServeError, Result};
