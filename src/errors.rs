use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Can't allocate memory")]
    NoMemory,
    #[error("{iface}: {op} failed: {source}")]
    Device {
        iface: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Inspection pipeline failed")]
    Pipeline,
    #[error("{0}")]
    Generic(#[from] io::Error),
}

impl Error {
    pub(crate) fn device(iface: &str, op: &'static str, source: io::Error) -> Self {
        Error::Device {
            iface: iface.to_string(),
            op,
            source,
        }
    }
}

/// Failure signalled by the inspection pipeline for one packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("pipeline rejected packet: {reason}")]
pub struct PipelineError {
    pub reason: String,
}

impl PipelineError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
