//! Object addressing.
//!
//! Addresses take the form `<module>/<local>`. The module part groups
//! objects under the local worker that drives them; the sentinel module
//! [`GLOBAL_MODULE_ID`] marks objects that apply to every module.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel module ID meaning "any module".
pub const GLOBAL_MODULE_ID: &str = "global";

/// Address of a controllable object: `<module>/<local>`.
///
/// An address without a `/` separator is treated as a local ID in the
/// global module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ObjectAddress(String);

impl ObjectAddress {
    /// Creates an address from its raw string form.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Splits the address into `(module, local)`.
    pub fn split(&self) -> (&str, &str) {
        match self.0.split_once('/') {
            Some((module, local)) => (module, local),
            None => (GLOBAL_MODULE_ID, self.0.as_str()),
        }
    }

    /// Returns the module part of the address.
    pub fn module(&self) -> &str {
        self.split().0
    }

    /// Returns the local part of the address.
    pub fn local(&self) -> &str {
        self.split().1
    }

    /// Returns true if the address lives in the global module.
    pub fn is_global(&self) -> bool {
        self.module() == GLOBAL_MODULE_ID
    }

    /// Returns the address with its module replaced by the global sentinel.
    pub fn to_global(&self) -> ObjectAddress {
        join_module_local(GLOBAL_MODULE_ID, self.local())
    }

    /// Raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectAddress {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Joins a module ID and a local ID into an address.
pub fn join_module_local(module: &str, local: &str) -> ObjectAddress {
    ObjectAddress(format!("{}/{}", module, local))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_module_and_local() {
        let addr = ObjectAddress::new("m1/S4");
        assert_eq!(addr.split(), ("m1", "S4"));
        assert_eq!(addr.module(), "m1");
        assert_eq!(addr.local(), "S4");
        assert!(!addr.is_global());
    }

    #[test]
    fn test_split_without_separator_is_global() {
        let addr = ObjectAddress::new("S4");
        assert_eq!(addr.split(), (GLOBAL_MODULE_ID, "S4"));
        assert!(addr.is_global());
    }

    #[test]
    fn test_join_roundtrip() {
        let addr = join_module_local("m2", "O7");
        assert_eq!(addr.as_str(), "m2/O7");
        assert_eq!(addr.split(), ("m2", "O7"));
    }

    #[test]
    fn test_to_global() {
        let addr = ObjectAddress::new("m1/O7");
        assert_eq!(addr.to_global().as_str(), "global/O7");
        assert!(addr.to_global().is_global());
    }

    #[test]
    fn test_serde_transparent() {
        let addr = ObjectAddress::new("m1/L1");
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"m1/L1\"");
        let back: ObjectAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
