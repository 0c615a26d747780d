//! Which user an inbound mailbox or phone number belongs to.

use crate::error::Result;
use crate::{Provider, UserId};

/// Maps a provider account (mailbox address, phone number) to the user that
/// owns it. Ingestion never looks users up any other way.
#[async_trait::async_trait]
pub trait InboxOwnerResolver: Send + Sync {
    async fn resolve_inbox_owner(&self, provider: Provider, account_identifier: &str) -> Result<UserId>;
}

/// Every account belongs to the one configured user.
#[derive(Debug, Clone)]
pub struct SingleTenantOwner {
    user_id: UserId,
}

impl SingleTenantOwner {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[async_trait::async_trait]
impl InboxOwnerResolver for SingleTenantOwner {
    async fn resolve_inbox_owner(&self, provider: Provider, account_identifier: &str) -> Result<UserId> {
        tracing::trace!(%provider, account_identifier, user_id = %self.user_id, "resolved inbox owner");
        Ok(self.user_id.clone())
    }
}
