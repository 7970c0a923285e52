//! Routing predicate (§3) used by every send path in [`super::manager`].

use std::collections::HashMap;

/// Exactly one of the four targeting axes, or `{}` meaning "everyone".
/// Construct with the free functions below rather than the struct literal
/// so the "exactly one" invariant can't be violated by accident.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    pub connection_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Post-filter applied after the primary index lookup (§4.2 step 7).
    pub metadata: HashMap<String, String>,
}

impl Selector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn connection(id: impl Into<String>) -> Self {
        Self {
            connection_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn user_and_session(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
