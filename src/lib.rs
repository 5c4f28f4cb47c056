use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Resource {name} already exists and is not managed by Cluster")]
    ResourceExists { kind: String, name: String },

    #[error("Invalid resource key: {0}")]
    MalformedKey(String),

    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),

    #[error("Timed out after {0:?} waiting for caches to sync")]
    CacheSyncTimeout(Duration),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::ResourceExists { .. } => "ResourceExists",
            Error::MalformedKey(_) => "MalformedKey",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::CacheSyncTimeout(_) => "CacheSyncTimeout",
        }
    }

    /// Whether this is the api server rejecting a create because the name is taken
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(err)) if err.reason == "AlreadyExists")
    }
}

pub mod controllers;

pub use controllers::{run, ControllerConfig, State};

/// Informers, work queue and worker loop
pub mod runtime;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Custom resources
pub mod resources;
