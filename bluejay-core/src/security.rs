//! Link security levels
//!
//! The level of a link is the pairing outcome both transports reduce to: whether the link is
//! encrypted, whether the pairing procedure was man in the middle protected, and whether Secure
//! Connections generated the key. Orderings on the enum follow strength, so requirement checks
//! are plain comparisons.

use core::fmt;

/// The security level of a link
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SecurityLevel {
    /// No encryption
    NoSecurity,
    /// Encrypted, but the key exchange was not man in the middle protected
    Encrypted,
    /// Encrypted with an authenticated (man in the middle protected) key
    Authenticated,
    /// Encrypted with an authenticated key generated with Secure Connections
    AuthenticatedSecureConnections,
}

impl SecurityLevel {
    /// Check if this level satisfies `requirement`
    pub fn satisfies(&self, requirement: SecurityLevel) -> bool {
        *self >= requirement
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SecurityLevel::NoSecurity => f.write_str("no security"),
            SecurityLevel::Encrypted => f.write_str("encrypted"),
            SecurityLevel::Authenticated => f.write_str("authenticated"),
            SecurityLevel::AuthenticatedSecureConnections => {
                f.write_str("authenticated with secure connections")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_order_by_strength() {
        assert!(SecurityLevel::AuthenticatedSecureConnections.satisfies(SecurityLevel::Encrypted));
        assert!(!SecurityLevel::Encrypted.satisfies(SecurityLevel::Authenticated));
        assert!(SecurityLevel::NoSecurity.satisfies(SecurityLevel::NoSecurity));
    }
}
