//! Protocol versioning for Huddle.
//!
//! Clients announce the major version they speak in their `connect` frame.
//! The server answers with the version it runs; only the major number has
//! to agree.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check whether a client speaking `major` can talk to this version.
    #[must_use]
    pub fn accepts(&self, major: u8) -> bool {
        self.major == major
    }

    /// Negotiate against the major version a client announced.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedVersion`] when the majors differ.
    pub fn negotiate(&self, client_major: u8) -> Result<Version, ProtocolError> {
        if self.accepts(client_major) {
            Ok(*self)
        } else {
            Err(ProtocolError::UnsupportedVersion {
                client: client_major,
                server: self.major,
            })
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_same_major() {
        let server = Version::new(1, 3);
        assert_eq!(server.negotiate(1).unwrap(), server);
    }

    #[test]
    fn test_negotiate_rejects_other_major() {
        let err = PROTOCOL_VERSION.negotiate(2).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedVersion { client: 2, server: 1 }
        ));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
    }
}
