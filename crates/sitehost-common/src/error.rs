use std::path::PathBuf;

use thiserror::Error;

/// Errors from loading TLS material
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Private key error: {0}")]
    Key(String),

    #[error("TLS configuration error: {0}")]
    Config(String),
}
