//! In-memory stores.
//!
//! Used by tests across the workspace and by local runs without Postgres.
//! Each operation holds the lock for its whole duration, which gives the
//! same atomicity the database repositories get from single statements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailverify_common::{AppError, AppResult};
use mailverify_db::entities::{account, verification_token};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::store::{AccountStore, TokenStore};

/// Token store backed by a `HashMap`.
#[derive(Clone, Default)]
pub struct MemoryTokenStore {
    tokens: Arc<RwLock<HashMap<String, verification_token::Model>>>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records of an account.
    pub async fn tokens_for_account(&self, account_id: &str) -> Vec<verification_token::Model> {
        self.tokens
            .read()
            .await
            .values()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn insert(&self, record: verification_token::Model) -> AppResult<()> {
        let mut tokens = self.tokens.write().await;
        if tokens.contains_key(&record.token) {
            return Err(AppError::Database(format!(
                "duplicate token for account {}",
                record.account_id
            )));
        }
        tokens.insert(record.token.clone(), record);
        Ok(())
    }

    async fn replace_for_account(&self, record: verification_token::Model) -> AppResult<u64> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.account_id != record.account_id);
        let deleted = (before - tokens.len()) as u64;
        tokens.insert(record.token.clone(), record);
        Ok(deleted)
    }

    async fn restore(&self, record: verification_token::Model) -> AppResult<bool> {
        let mut tokens = self.tokens.write().await;
        if tokens.values().any(|t| t.account_id == record.account_id) {
            return Ok(false);
        }
        tokens.insert(record.token.clone(), record);
        Ok(true)
    }

    async fn take(&self, token: &str) -> AppResult<Option<verification_token::Model>> {
        Ok(self.tokens.write().await.remove(token))
    }

    async fn count_for_account(&self, account_id: &str) -> AppResult<u64> {
        Ok(self
            .tokens
            .read()
            .await
            .values()
            .filter(|t| t.account_id == account_id)
            .count() as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let now = now.fixed_offset();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| !t.is_expired_at(now));
        Ok((before - tokens.len()) as u64)
    }
}

/// Account store backed by a `HashMap`.
#[derive(Clone, Default)]
pub struct MemoryAccountStore {
    accounts: Arc<RwLock<HashMap<String, account::Model>>>,
}

impl MemoryAccountStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unverified account.
    pub async fn add(&self, id: &str, email: &str) -> account::Model {
        let model = account::Model {
            id: id.to_string(),
            email: email.to_lowercase(),
            email_verified: false,
            created_at: Utc::now().into(),
            verified_at: None,
        };
        self.accounts
            .write()
            .await
            .insert(model.id.clone(), model.clone());
        model
    }

}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find_by_id(&self, id: &str) -> AppResult<Option<account::Model>> {
        Ok(self.accounts.read().await.get(id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> AppResult<Option<account::Model>> {
        let email = email.to_lowercase();
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .find(|a| a.email == email)
            .cloned())
    }

    async fn mark_email_verified(&self, id: &str) -> AppResult<bool> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| AppError::AccountNotFound(id.to_string()))?;

        if account.email_verified {
            return Ok(false);
        }
        account.email_verified = true;
        account.verified_at = Some(Utc::now().into());
        Ok(true)
    }
}
