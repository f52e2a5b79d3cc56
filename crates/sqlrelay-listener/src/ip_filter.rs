//! Client IP allow/deny filtering
//!
//! Applied to TCP clients at accept time, before any daemon is involved.
//! UNIX-socket clients are local by definition and bypass the filter.

use regex::Regex;
use sqlrelay_common::{RelayError, Result};

/// Compiled allow/deny patterns
#[derive(Debug, Default)]
pub struct IpFilter {
    allowed: Option<Regex>,
    denied: Option<Regex>,
}

impl IpFilter {
    pub fn new(allowed: Option<&str>, denied: Option<&str>) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                RelayError::ConfigError(format!("bad ip filter regex '{}': {}", pattern, e))
            })
        };
        Ok(Self {
            allowed: allowed.map(compile).transpose()?,
            denied: denied.map(compile).transpose()?,
        })
    }

    /// Deny wins over allow; no patterns means everyone is welcome
    pub fn allows(&self, addr: &str) -> bool {
        if let Some(allowed) = &self.allowed {
            if !allowed.is_match(addr) {
                return false;
            }
        }
        if let Some(denied) = &self.denied {
            if denied.is_match(addr) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_by_default() {
        let filter = IpFilter::new(None, None).unwrap();
        assert!(filter.allows("10.0.0.1"));
    }

    #[test]
    fn allow_list_restricts() {
        let filter = IpFilter::new(Some(r"^192\.168\."), None).unwrap();
        assert!(filter.allows("192.168.1.4"));
        assert!(!filter.allows("10.0.0.1"));
    }

    #[test]
    fn deny_wins_over_allow() {
        let filter = IpFilter::new(Some(r"^192\.168\."), Some(r"^192\.168\.13\.")).unwrap();
        assert!(filter.allows("192.168.1.4"));
        assert!(!filter.allows("192.168.13.9"));
    }

    #[test]
    fn bad_regex_is_a_config_error() {
        assert!(IpFilter::new(Some("("), None).is_err());
    }
}
