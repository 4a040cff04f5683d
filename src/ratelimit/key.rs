//! Rate key construction.

use std::fmt;

/// How a caller was identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityClass {
    /// Identified by an API key header
    Token,
    /// Identified by client IP address
    Address,
}

impl IdentityClass {
    /// Prefix used when serializing a key of this class.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityClass::Token => "token",
            IdentityClass::Address => "addr",
        }
    }
}

impl fmt::Display for IdentityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that scopes one caller's counter.
///
/// Equality is exact and case-sensitive on both parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    /// Class of the identity
    pub class: IdentityClass,
    /// Token value or address text
    pub identifier: String,
}

impl RateKey {
    pub fn new(class: IdentityClass, identifier: impl Into<String>) -> Self {
        Self {
            class,
            identifier: identifier.into(),
        }
    }

    /// Storage form: `"<class>:<identifier>"`.
    pub fn to_string_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.identifier)
    }
}
