//! Who is editing.

use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
    pub id: Uuid,
    pub nickname: String,
    pub avatar_url: Option<String>,
}

impl UserProfile {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            nickname: nickname.into(),
            avatar_url: None,
        }
    }
}

/// Source of the signed-in user. `None` means nobody is signed in.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Option<UserProfile>;
}

/// Fixed identity, for tests and tools.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user: Option<UserProfile>,
}

impl StaticIdentity {
    pub fn signed_in(user: UserProfile) -> Self {
        Self { user: Some(user) }
    }

    pub fn anonymous() -> Self {
        Self { user: None }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Option<UserProfile> {
        self.user.clone()
    }
}
