//! Native access policy - who may link native code
//!
//! Checked before any other work on a linkage request. The caller is the
//! source location of the public call, captured with `#[track_caller]`.

use crate::error::LinkError;
use crate::logging;
use serde::{Deserialize, Serialize};
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};

/// Policy applied to callers outside the allow-list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Allow,
    /// Allow, logging a warning the first time
    Warn,
    Deny,
}

impl AccessMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "allow" => Some(Self::Allow),
            "warn" => Some(Self::Warn),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

/// Capability check for native linkage
#[derive(Debug)]
pub struct NativeAccess {
    mode: AccessMode,
    allowed_callers: Vec<String>,
    warned: AtomicBool,
}

impl NativeAccess {
    /// `allowed_callers` are source path prefixes that bypass the mode
    pub fn new(mode: AccessMode, allowed_callers: Vec<String>) -> Self {
        Self {
            mode,
            allowed_callers,
            warned: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Check that `caller` may perform `operation`
    pub fn ensure(&self, caller: &Location<'_>, operation: &'static str) -> Result<(), LinkError> {
        if self.mode == AccessMode::Allow || self.is_allowed(caller.file()) {
            return Ok(());
        }

        let caller = format!("{}:{}", caller.file(), caller.line());
        match self.mode {
            AccessMode::Warn => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    logging::log_access_warning(&caller, operation);
                }
                Ok(())
            }
            _ => {
                let err = LinkError::NativeAccessDenied { caller, operation };
                logging::log_link_rejected(operation, &err);
                Err(err)
            }
        }
    }

    fn is_allowed(&self, file: &str) -> bool {
        let file = file.replace('\\', "/");
        self.allowed_callers
            .iter()
            .any(|prefix| file.starts_with(prefix.replace('\\', "/").as_str()))
    }
}

impl Default for NativeAccess {
    fn default() -> Self {
        Self::new(AccessMode::Allow, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_and_deny() {
        let here = Location::caller();
        assert!(NativeAccess::default().ensure(here, "downcallHandle").is_ok());

        let deny = NativeAccess::new(AccessMode::Deny, Vec::new());
        match deny.ensure(here, "upcallStub") {
            Err(LinkError::NativeAccessDenied { caller, operation }) => {
                assert!(caller.contains("access.rs"));
                assert_eq!(operation, "upcallStub");
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[test]
    fn test_allowed_callers_bypass_deny() {
        let here = Location::caller();
        let deny = NativeAccess::new(AccessMode::Deny, vec!["src/".to_string()]);
        assert!(deny.ensure(here, "downcallHandle").is_ok());
    }

    #[test]
    fn test_warn_allows() {
        let warn = NativeAccess::new(AccessMode::Warn, Vec::new());
        let here = Location::caller();
        assert!(warn.ensure(here, "downcallHandle").is_ok());
        assert!(warn.ensure(here, "downcallHandle").is_ok());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(AccessMode::parse("Deny"), Some(AccessMode::Deny));
        assert_eq!(AccessMode::parse(" warn "), Some(AccessMode::Warn));
        assert_eq!(AccessMode::parse("maybe"), None);
    }
}
