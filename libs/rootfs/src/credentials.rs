//! Registry pull credentials.

use std::fmt;

/// Optional username/password used when pulling from a registry.
///
/// An empty username and password means an anonymous pull.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PullCredentials {
    pub username: String,
    pub password: String,
}

impl PullCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Both fields unset.
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    /// `username:password`, or an empty string for anonymous credentials.
    ///
    /// Only for key derivation. Never log this value.
    pub fn canonical(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("{}:{}", self.username, self.password)
    }
}

impl fmt::Debug for PullCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullCredentials")
            .field("username", &self.username)
            .field(
                "password",
                &if self.password.is_empty() { "" } else { "<redacted>" },
            )
            .finish()
    }
}
