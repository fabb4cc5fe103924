//! Error types for the artifact store

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StoreError {
    Io(Box<std::io::Error>),
    /// The payload stream ended before the declared size arrived
    TruncatedTransfer {
        expected: u64,
        received: u64,
    },
    /// The completed temp file could not be moved into place
    PlacementFailure {
        path: PathBuf,
        source: Box<std::io::Error>,
    },
    InvalidName(String),
}

impl StoreError {
    pub(crate) fn placement(path: PathBuf, err: std::io::Error) -> Self {
        StoreError::PlacementFailure {
            path,
            source: Box::new(err),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "IO error: {}", err),
            StoreError::TruncatedTransfer { expected, received } => write!(
                f,
                "Truncated transfer: expected {} bytes, received {}",
                expected, received
            ),
            StoreError::PlacementFailure { path, source } => {
                write!(f, "Could not place artifact at {:?}: {}", path, source)
            }
            StoreError::InvalidName(msg) => write!(f, "Invalid name: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(err) => Some(err.as_ref()),
            StoreError::PlacementFailure { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_truncated_transfer_display() {
        let err = StoreError::TruncatedTransfer {
            expected: 1000,
            received: 12,
        };
        assert_eq!(
            format!("{}", err),
            "Truncated transfer: expected 1000 bytes, received 12"
        );
    }

    #[test]
    fn test_placement_failure_has_source() {
        let err = StoreError::placement(
            PathBuf::from("/cache/ab/ab12/out.o"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(format!("{}", err).contains("ab12/out.o"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: StoreError = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(format!("{}", err), "IO error: disk gone");
    }
}
