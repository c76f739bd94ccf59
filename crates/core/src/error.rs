//! Error types for Conclave Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unrecognized server URL: {0}")]
    UnrecognizedUrl(String),
}

pub type Result<T> = std::result::Result<T, Error>;
