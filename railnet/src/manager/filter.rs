//! Module filter.
//!
//! The filter is how a worker receives only the traffic for its own
//! module while still seeing globally broadcast events.

use crate::api::{ObjectAddress, GLOBAL_MODULE_ID};

/// Address-prefix matcher used by every pool to gate deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleFilter(String);

impl ModuleFilter {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self(module_id.into())
    }

    /// The empty filter, matching everything.
    pub fn any() -> Self {
        Self(String::new())
    }

    /// Returns true if the given address is contained in the module with
    /// this filter's ID, or the filter is empty, or the address has a
    /// global module ID.
    pub fn matches(&self, address: &ObjectAddress) -> bool {
        if self.0.is_empty() {
            return true;
        }
        let module = address.module();
        module == self.0 || module == GLOBAL_MODULE_ID
    }

    /// Same rule applied to a bare module ID.
    pub fn matches_module_id(&self, id: &str) -> bool {
        if self.0.is_empty() {
            return true;
        }
        id == self.0 || id == GLOBAL_MODULE_ID
    }
}

impl From<&str> for ModuleFilter {
    fn from(module_id: &str) -> Self {
        Self::new(module_id)
    }
}

impl From<String> for ModuleFilter {
    fn from(module_id: String) -> Self {
        Self(module_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = ModuleFilter::any();
        assert!(filter.matches(&ObjectAddress::new("m1/S4")));
        assert!(filter.matches(&ObjectAddress::new("global/S4")));
        assert!(filter.matches_module_id("anything"));
    }

    #[test]
    fn test_filter_matches_own_module() {
        let filter = ModuleFilter::new("m1");
        assert!(filter.matches(&ObjectAddress::new("m1/S4")));
        assert!(!filter.matches(&ObjectAddress::new("m2/S4")));
    }

    #[test]
    fn test_filter_matches_global_module() {
        let filter = ModuleFilter::new("m1");
        assert!(filter.matches(&ObjectAddress::new("global/S4")));
        // A bare local ID lives in the global module.
        assert!(filter.matches(&ObjectAddress::new("S4")));
    }

    #[test]
    fn test_filter_matches_module_id() {
        let filter = ModuleFilter::new("m1");
        assert!(filter.matches_module_id("m1"));
        assert!(filter.matches_module_id("global"));
        assert!(!filter.matches_module_id("m2"));
    }
}
