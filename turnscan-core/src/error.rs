use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::peripheral::{PeripheralKind, PeripheralRole};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Could not detect selected {role} peripheral ({kind})")]
    PeripheralNotFound {
        role: PeripheralRole,
        kind: PeripheralKind,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{kind} failed: {message}")]
    Peripheral {
        kind: PeripheralKind,
        message: String,
    },

    #[error("Timed out waiting for {operation}: {detail}")]
    Timeout { operation: String, detail: String },

    #[error("File never became ready for processing: {}", .0.display())]
    FileNotReady(PathBuf),

    #[error("No model files found in result directory {}", .0.display())]
    NoModelOutput(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid asset state: {0}")]
    InvalidAssetState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Directory watch error: {0}")]
    Watch(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn peripheral(kind: PeripheralKind, message: impl Into<String>) -> Self {
        PipelineError::Peripheral {
            kind,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
