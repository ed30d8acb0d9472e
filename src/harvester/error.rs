// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a regular file: {0}")]
    NotRegularFile(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl Error {
    /// Whether retrying the same path can never succeed.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Error::NotRegularFile(_) | Error::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
