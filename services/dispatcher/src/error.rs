//! Error types for the dispatcher.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for our schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The `projects` section has no `defaults` entry.
    #[error("projects.defaults section is missing")]
    MissingDefaults,

    /// A project that would run is missing a required field.
    #[error("project {project}: missing required field {field}")]
    MissingField { project: String, field: &'static str },

    /// A required environment variable is not set.
    #[error("environment variable {0} not found")]
    MissingEnv(String),

    /// A value is present but unusable.
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    /// A device id appears in more than one device group.
    #[error("device {device_id} is assigned to both {first} and {second}")]
    DuplicateDevice {
        device_id: String,
        first: String,
        second: String,
    },
}

/// Errors from the queue and device farm APIs.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection, timeout or other transport failure.
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The API answered with a non-success status.
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    /// The response body did not match the expected shape.
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Building the HTTP client failed.
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

impl ClientError {
    /// Whether a later attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode { .. } | Self::Build(_) => false,
        }
    }
}

/// Errors preparing or starting a job process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The job launcher binary is missing or not executable.
    #[error("launcher binary {path} not found or not executable after {attempts} attempts")]
    BinaryMissing { path: PathBuf, attempts: u32 },

    /// The process could not be spawned.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The job directory or manifest could not be written.
    #[error("failed to prepare job directory {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest could not be serialized.
    #[error("failed to render job manifest: {0}")]
    Render(#[from] serde_yaml::Error),
}
