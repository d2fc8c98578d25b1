//! Error types for ipset-guard

use ipset_read::IpSetError;
use thiserror::Error;

/// Result type alias for guard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring the guard
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configured set could not be resolved
    #[error("cannot get ipset {set:?} from kernel, check the process runs as root: {source}")]
    Resolve {
        set: String,
        #[source]
        source: IpSetError,
    },

    /// The startup membership probe failed
    #[error("failed to test read ipset {set:?}, check all processes run as root: {source}")]
    SelfTest {
        set: String,
        #[source]
        source: IpSetError,
    },

    /// Channel error outside of set resolution
    #[error("ipset error: {0}")]
    IpSet(#[from] IpSetError),
}

impl Error {
    /// Check if the error comes down to missing privileges
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::Resolve { source, .. } | Error::SelfTest { source, .. } | Error::IpSet(source) => {
                source.is_permission_denied()
            }
            Error::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            Error::Config(_) | Error::ConfigParse(_) => false,
        }
    }
}
