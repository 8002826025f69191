//! Command-line interface of the console

pub mod args;

pub use args::{Args, Command};
