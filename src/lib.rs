pub mod batch;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod package;
pub mod processor;
pub mod progress;
pub mod region;
pub mod report;
pub mod transform;
pub mod util;
