//! Client authentication
//!
//! The daemon authenticates every session before any other command runs.
//! The core ships a static user list; alternative schemes plug in through
//! the `Authenticator` trait.

use crate::config::UserConfig;

/// Pluggable authentication check
pub trait Authenticator: Send {
    /// Validate a user/password pair
    fn authenticate(&self, user: &str, password: &str) -> bool;
}

/// Validates against the pre-configured user list
pub struct StaticUserList {
    users: Vec<UserConfig>,
}

impl StaticUserList {
    pub fn new(users: Vec<UserConfig>) -> Self {
        Self { users }
    }

    pub fn from_config(users: &[UserConfig]) -> Self {
        Self {
            users: users.to_vec(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for StaticUserList {
    fn authenticate(&self, user: &str, password: &str) -> bool {
        self.users
            .iter()
            .any(|u| u.user == user && constant_time_eq(u.password.as_bytes(), password.as_bytes()))
    }
}

// Compare without short-circuiting on the first mismatched byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
