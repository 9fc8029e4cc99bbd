// Library interface for netorch
// Exposes the orchestration core for the binary, integration tests and embedding test suites

pub mod cli;
pub mod clock;
pub mod config;
pub mod docker;
pub mod errors;
pub mod executor;
pub mod network;
pub mod runner;
pub mod services;
