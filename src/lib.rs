//! Ralph loop supervisor.
//!
//! Drives a command-line coding agent through an endless series of
//! iterations: each iteration commits and pushes the previous one's work,
//! sends the iteration prompt, and looks for a completion sentinel in the
//! agent's output to decide whether to carry on, retry, or wait.
//!
//! This library exposes the supervisor's modules for integration testing
//! and for embedding the loop in other tools.

pub mod config;
pub mod logging;
pub mod persistence;
pub mod process;
pub mod shutdown;
pub mod supervisor;
