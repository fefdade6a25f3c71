//! Authenticated caller identity

use serde::{Deserialize, Serialize};

/// Identity of an authenticated caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Username (certificate CN, front-proxy header or TokenReview user)
    pub username: String,
    /// Group memberships
    pub groups: Vec<String>,
}

impl UserIdentity {
    /// Identity with a username and no groups
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            groups: Vec::new(),
        }
    }

    /// Attach groups to the identity
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}
