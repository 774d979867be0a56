//! Storage seams of the verification service.
//!
//! The database repositories implement these traits directly; the in-memory
//! stores in [`super::memory`] implement them for tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailverify_common::AppResult;
use mailverify_db::entities::{account, verification_token};
use mailverify_db::repositories::{AccountRepository, VerificationTokenRepository};
use sea_orm::Set;
use std::sync::Arc;

/// Persistent record of outstanding verification tokens.
///
/// `replace_for_account`, `restore` and `take` must each be atomic against
/// the store.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist a token record.
    async fn insert(&self, record: verification_token::Model) -> AppResult<()>;

    /// Delete every token of the record's account and insert the record.
    ///
    /// Returns how many tokens were deleted. Of any number of concurrent
    /// calls for one account exactly one record survives.
    async fn replace_for_account(&self, record: verification_token::Model) -> AppResult<u64>;

    /// Re-insert a taken record unless its account holds a token again.
    ///
    /// `Ok(false)` means a newer token exists and the record was dropped.
    async fn restore(&self, record: verification_token::Model) -> AppResult<bool>;

    /// Remove a token record and return it.
    ///
    /// Of two concurrent calls for the same token at most one gets `Some`.
    async fn take(&self, token: &str) -> AppResult<Option<verification_token::Model>>;

    /// Number of token records of an account.
    async fn count_for_account(&self, account_id: &str) -> AppResult<u64>;

    /// Delete tokens whose expiry is at or before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64>;
}

/// Read/verify access to accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> AppResult<Option<account::Model>>;

    async fn find_by_email(&self, email: &str) -> AppResult<Option<account::Model>>;

    /// Set the verified flag. `Ok(false)` when it was already set.
    async fn mark_email_verified(&self, id: &str) -> AppResult<bool>;
}

pub type SharedTokenStore = Arc<dyn TokenStore>;
pub type SharedAccountStore = Arc<dyn AccountStore>;

#[async_trait]
impl TokenStore for VerificationTokenRepository {
    async fn insert(&self, record: verification_token::Model) -> AppResult<()> {
        self.create(verification_token::ActiveModel {
            token: Set(record.token),
            account_id: Set(record.account_id),
            expires_at: Set(record.expires_at),
            created_at: Set(record.created_at),
        })
        .await?;
        Ok(())
    }

    async fn replace_for_account(&self, record: verification_token::Model) -> AppResult<u64> {
        Self::replace_for_account(self, record).await
    }

    async fn restore(&self, record: verification_token::Model) -> AppResult<bool> {
        Self::restore(self, record).await
    }

    async fn take(&self, token: &str) -> AppResult<Option<verification_token::Model>> {
        Self::take(self, token).await
    }

    async fn count_for_account(&self, account_id: &str) -> AppResult<u64> {
        self.count_by_account(account_id).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        self.delete_expired(now).await
    }
}

#[async_trait]
impl AccountStore for AccountRepository {
    async fn find_by_id(&self, id: &str) -> AppResult<Option<account::Model>> {
        Self::find_by_id(self, id).await
    }

    async fn find_by_email(&self, email: &str) -> AppResult<Option<account::Model>> {
        Self::find_by_email(self, email).await
    }

    async fn mark_email_verified(&self, id: &str) -> AppResult<bool> {
        Self::mark_email_verified(self, id).await
    }
}
