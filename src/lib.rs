//! Run batch-driven test and update scripts inside a pseudo-terminal and turn
//! their console output into typed result events.
//!
//! Layers, leaves first:
//! - [`session`] owns the pseudo-console, pipes and child handles.
//! - [`orchestrator`] runs one session at a time with an output loop and an
//!   exit waiter.
//! - [`reassembler`] rebuilds lines from raw chunks and spots pause prompts.
//! - [`classifier`] turns lines into pass/fail/error/progress events.
//! - [`runner`] wires all of the above onto one ordered event channel.

pub mod ansi;
pub mod classifier;
pub mod config;
pub mod error;
pub mod grouping;
pub mod orchestrator;
pub mod pipeline;
pub mod prompt;
pub mod reassembler;
pub mod runner;
pub mod session;

pub use error::PtyError;
