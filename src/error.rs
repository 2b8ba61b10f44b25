// src/error.rs
use std::io;
use thiserror::Error;

// Re-export anyhow's Result type
pub use anyhow::Result;

/// Error type for the batchmetrics library
#[derive(Error, Debug)]
pub enum ReporterError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Collection error: {0}")]
    Collection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Worker error: {0}")]
    Worker(String),
}
