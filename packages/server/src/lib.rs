// Conforma API Core
//
// Control plane for document conformity analysis: issues service tokens,
// dispatches jobs to the analysis worker through a resilient client, and
// receives signed status callbacks as the jobs progress.

pub mod auth;
pub mod config;
pub mod jobs;
pub mod server;

pub use config::*;
