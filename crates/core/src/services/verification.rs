//! Email verification service.
//!
//! Issues single-use, time-bounded tokens, hands the email off to the
//! delivery queue, and consumes tokens presented back by the user.

use chrono::{DateTime, Utc};
use mailverify_common::{AppError, AppResult, IdGenerator, redact_token};
use mailverify_db::entities::{account, verification_token};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use validator::ValidateEmail;

use super::delivery::DeliveryService;
use super::store::{SharedAccountStore, SharedTokenStore};

/// How the caller identifies the account to verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountRef {
    Id(String),
    Email(String),
}

/// Result of a successful issuance.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub account_id: String,
    pub email: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Tokens removed before this one was issued
    pub superseded: u64,
}

/// Result of a successful consumption.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationConfirmation {
    pub account_id: String,
    /// `false` when the account had already been verified by another token
    pub newly_verified: bool,
}

/// Email verification service.
#[derive(Clone)]
pub struct VerificationService {
    accounts: SharedAccountStore,
    tokens: SharedTokenStore,
    delivery: DeliveryService,
    token_ttl: Duration,
    id_gen: IdGenerator,
}

impl VerificationService {
    /// Create a new verification service.
    #[must_use]
    pub fn new(
        accounts: SharedAccountStore,
        tokens: SharedTokenStore,
        delivery: DeliveryService,
        token_ttl: Duration,
    ) -> Self {
        Self {
            accounts,
            tokens,
            delivery,
            token_ttl,
            id_gen: IdGenerator::new(),
        }
    }

    /// Issue a fresh token for an unverified account and queue its email.
    ///
    /// The new token replaces every earlier token of the account in one store
    /// operation, so concurrent resends leave exactly one. When the email
    /// cannot be queued the new token is removed again and the queue error
    /// is returned.
    pub async fn issue_or_resend(&self, target: AccountRef) -> AppResult<IssuedToken> {
        let account = self.resolve(&target).await?;

        if account.email_verified {
            return Err(AppError::AlreadyVerified);
        }

        let ttl = chrono::Duration::from_std(self.token_ttl)
            .map_err(|e| AppError::Config(format!("Invalid token TTL: {e}")))?;

        let token = self.id_gen.generate_token();
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| AppError::Config(format!("Token TTL {ttl} is out of range")))?;

        let superseded = self
            .tokens
            .replace_for_account(verification_token::Model {
                token: token.clone(),
                account_id: account.id.clone(),
                expires_at: expires_at.fixed_offset(),
                created_at: now.fixed_offset(),
            })
            .await?;
        if superseded > 0 {
            debug!(account_id = %account.id, superseded, "Superseded earlier verification tokens");
        }

        if let Err(e) = self
            .delivery
            .queue_verification_email(&account.email, &token)
            .await
        {
            warn!(
                account_id = %account.id,
                error = %e,
                "Failed to queue verification email, rolling back token"
            );
            if let Err(rollback) = self.tokens.take(&token).await {
                error!(
                    account_id = %account.id,
                    token = %redact_token(&token),
                    error = %rollback,
                    "Failed to roll back verification token"
                );
            }
            return Err(e);
        }

        info!(
            account_id = %account.id,
            token = %redact_token(&token),
            %expires_at,
            "Issued verification token"
        );

        Ok(IssuedToken {
            account_id: account.id,
            email: account.email,
            token,
            expires_at,
            superseded,
        })
    }

    /// Consume a token and mark its account verified.
    ///
    /// The token is removed whether it turns out valid or expired. A token
    /// can be consumed at most once.
    pub async fn consume(&self, token: &str) -> AppResult<VerificationConfirmation> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::Validation("token must not be empty".to_string()));
        }

        let record = self
            .tokens
            .take(token)
            .await?
            .ok_or(AppError::TokenNotFound)?;

        if record.is_expired_at(Utc::now().fixed_offset()) {
            info!(
                account_id = %record.account_id,
                token = %redact_token(token),
                "Discarded expired verification token"
            );
            return Err(AppError::TokenExpired);
        }

        let newly_verified = match self.accounts.mark_email_verified(&record.account_id).await {
            Ok(changed) => changed,
            Err(AppError::AccountNotFound(id)) => {
                return Err(AppError::AccountNotFound(id));
            }
            Err(e) => {
                let account_id = record.account_id.clone();
                match self.tokens.restore(record).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(account_id = %account_id, "Token superseded meanwhile, not restored");
                    }
                    Err(restore) => {
                        error!(
                            account_id = %account_id,
                            error = %restore,
                            "Failed to restore verification token"
                        );
                    }
                }
                return Err(e);
            }
        };

        info!(
            account_id = %record.account_id,
            newly_verified,
            "Email address verified"
        );

        Ok(VerificationConfirmation {
            account_id: record.account_id,
            newly_verified,
        })
    }

    /// Delete expired tokens. Returns the number removed.
    pub async fn purge_expired(&self) -> AppResult<u64> {
        self.tokens.purge_expired(Utc::now()).await
    }

    /// Number of outstanding tokens of an account.
    pub async fn outstanding_tokens(&self, account_id: &str) -> AppResult<u64> {
        self.tokens.count_for_account(account_id).await
    }

    async fn resolve(&self, target: &AccountRef) -> AppResult<account::Model> {
        match target {
            AccountRef::Id(id) => {
                let id = id.trim();
                if id.is_empty() {
                    return Err(AppError::Validation("accountId must not be empty".to_string()));
                }
                self.accounts
                    .find_by_id(id)
                    .await?
                    .ok_or_else(|| AppError::AccountNotFound(id.to_string()))
            }
            AccountRef::Email(email) => {
                let email = email.trim();
                if !email.validate_email() {
                    return Err(AppError::Validation(format!("invalid email address: {email}")));
                }
                self.accounts
                    .find_by_email(email)
                    .await?
                    .ok_or_else(|| AppError::AccountNotFound(email.to_string()))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::services::delivery::RecordingDelivery;
    use crate::services::memory::{MemoryAccountStore, MemoryTokenStore};
    use crate::services::store::{AccountStore, TokenStore};
    use async_trait::async_trait;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(24 * 60 * 60);

    struct Harness {
        service: VerificationService,
        accounts: MemoryAccountStore,
        tokens: MemoryTokenStore,
        delivery: RecordingDelivery,
    }

    async fn harness(ttl: Duration) -> Harness {
        let accounts = MemoryAccountStore::new();
        accounts.add("alice", "alice@example.com").await;
        let tokens = MemoryTokenStore::new();
        let delivery = RecordingDelivery::new();

        let service = VerificationService::new(
            Arc::new(accounts.clone()),
            Arc::new(tokens.clone()),
            Arc::new(delivery.clone()),
            ttl,
        );

        Harness {
            service,
            accounts,
            tokens,
            delivery,
        }
    }

    #[tokio::test]
    async fn test_issue_queues_job_with_account_email() {
        let h = harness(TTL).await;

        let issued = h
            .service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await
            .unwrap();

        assert_eq!(issued.email, "alice@example.com");
        assert_eq!(issued.token.len(), 43);
        assert_eq!(
            h.delivery.queued().await,
            vec![("alice@example.com".to_string(), issued.token.clone())]
        );
        assert_eq!(h.tokens.count_for_account("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_issue_by_email_is_case_insensitive() {
        let h = harness(TTL).await;

        let issued = h
            .service
            .issue_or_resend(AccountRef::Email("ALICE@example.com".to_string()))
            .await
            .unwrap();

        assert_eq!(issued.account_id, "alice");
    }

    #[tokio::test]
    async fn test_issue_invalidates_prior_tokens() {
        let h = harness(TTL).await;

        let first = h
            .service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await
            .unwrap();
        let second = h
            .service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await
            .unwrap();

        assert_eq!(second.superseded, 1);
        assert_eq!(h.tokens.count_for_account("alice").await.unwrap(), 1);
        assert!(matches!(
            h.service.consume(&first.token).await,
            Err(AppError::TokenNotFound)
        ));
        assert!(h.service.consume(&second.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_consume_is_single_use() {
        let h = harness(TTL).await;
        let issued = h
            .service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await
            .unwrap();

        let confirmation = h.service.consume(&issued.token).await.unwrap();
        assert_eq!(confirmation.account_id, "alice");
        assert!(confirmation.newly_verified);

        assert!(matches!(
            h.service.consume(&issued.token).await,
            Err(AppError::TokenNotFound)
        ));

        let account = h.accounts.find_by_id("alice").await.unwrap().unwrap();
        assert!(account.email_verified);
    }

    #[tokio::test]
    async fn test_expired_token_is_deleted() {
        let h = harness(Duration::ZERO).await;
        let issued = h
            .service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await
            .unwrap();

        assert!(matches!(
            h.service.consume(&issued.token).await,
            Err(AppError::TokenExpired)
        ));
        assert_eq!(h.tokens.count_for_account("alice").await.unwrap(), 0);
        assert!(matches!(
            h.service.consume(&issued.token).await,
            Err(AppError::TokenNotFound)
        ));

        let account = h.accounts.find_by_id("alice").await.unwrap().unwrap();
        assert!(!account.email_verified);
    }

    #[tokio::test]
    async fn test_resend_for_verified_account_is_rejected() {
        let h = harness(TTL).await;
        h.accounts.mark_email_verified("alice").await.unwrap();

        let result = h
            .service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await;

        assert!(matches!(result, Err(AppError::AlreadyVerified)));
        assert_eq!(h.tokens.count_for_account("alice").await.unwrap(), 0);
        assert!(h.delivery.queued().await.is_empty());
    }

    #[tokio::test]
    async fn test_consume_second_valid_token_is_idempotent() {
        let h = harness(TTL).await;
        let issued = h
            .service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await
            .unwrap();

        // A token that raced past supersession
        let now = Utc::now();
        h.tokens
            .insert(verification_token::Model {
                token: "stray".to_string(),
                account_id: "alice".to_string(),
                expires_at: (now + chrono::Duration::hours(1)).fixed_offset(),
                created_at: now.fixed_offset(),
            })
            .await
            .unwrap();

        assert!(h.service.consume(&issued.token).await.unwrap().newly_verified);
        let second = h.service.consume("stray").await.unwrap();
        assert!(!second.newly_verified);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let h = harness(TTL).await;

        let by_id = h
            .service
            .issue_or_resend(AccountRef::Id("ghost".to_string()))
            .await;
        let by_email = h
            .service
            .issue_or_resend(AccountRef::Email("ghost@example.com".to_string()))
            .await;

        assert!(matches!(by_id, Err(AppError::AccountNotFound(_))));
        assert!(matches!(by_email, Err(AppError::AccountNotFound(_))));
    }

    #[tokio::test]
    async fn test_input_validation() {
        let h = harness(TTL).await;

        assert!(matches!(
            h.service
                .issue_or_resend(AccountRef::Email("not-an-email".to_string()))
                .await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            h.service.issue_or_resend(AccountRef::Id("  ".to_string())).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            h.service.consume("   ").await,
            Err(AppError::Validation(_))
        ));
        assert!(h.delivery.queued().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_no_token() {
        let h = harness(TTL).await;
        h.delivery.set_failing(true);

        let result = h
            .service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await;

        assert!(matches!(result, Err(AppError::Queue(_))));
        assert_eq!(h.tokens.count_for_account("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_after_resend_leaves_no_token() {
        let h = harness(TTL).await;
        h.service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await
            .unwrap();

        h.delivery.set_failing(true);
        assert!(
            h.service
                .issue_or_resend(AccountRef::Id("alice".to_string()))
                .await
                .is_err()
        );
        assert_eq!(h.tokens.count_for_account("alice").await.unwrap(), 0);
    }

    /// Token store that hands control back to the runtime before every call,
    /// so concurrent service calls interleave between store round trips.
    struct YieldingTokens(MemoryTokenStore);

    #[async_trait]
    impl TokenStore for YieldingTokens {
        async fn insert(&self, record: verification_token::Model) -> AppResult<()> {
            tokio::task::yield_now().await;
            self.0.insert(record).await
        }

        async fn replace_for_account(&self, record: verification_token::Model) -> AppResult<u64> {
            tokio::task::yield_now().await;
            self.0.replace_for_account(record).await
        }

        async fn restore(&self, record: verification_token::Model) -> AppResult<bool> {
            tokio::task::yield_now().await;
            self.0.restore(record).await
        }

        async fn take(&self, token: &str) -> AppResult<Option<verification_token::Model>> {
            tokio::task::yield_now().await;
            self.0.take(token).await
        }

        async fn count_for_account(&self, account_id: &str) -> AppResult<u64> {
            tokio::task::yield_now().await;
            self.0.count_for_account(account_id).await
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
            tokio::task::yield_now().await;
            self.0.purge_expired(now).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_issue_leaves_one_consumable_token() {
        let accounts = MemoryAccountStore::new();
        accounts.add("alice", "alice@example.com").await;
        let tokens = MemoryTokenStore::new();

        let service = VerificationService::new(
            Arc::new(accounts),
            Arc::new(YieldingTokens(tokens.clone())),
            Arc::new(RecordingDelivery::new()),
            TTL,
        );

        let (a, b) = tokio::join!(
            service.issue_or_resend(AccountRef::Id("alice".to_string())),
            service.issue_or_resend(AccountRef::Id("alice".to_string())),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(tokens.count_for_account("alice").await.unwrap(), 1);

        let outcomes = [
            service.consume(&a.token).await.is_ok(),
            service.consume(&b.token).await.is_ok(),
        ];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_config_error() {
        let h = harness(Duration::from_secs(10_u64.pow(13))).await;

        let result = h
            .service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await;

        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(h.tokens.count_for_account("alice").await.unwrap(), 0);
        assert!(h.delivery.queued().await.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let h = harness(Duration::ZERO).await;
        h.service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await
            .unwrap();

        assert_eq!(h.service.purge_expired().await.unwrap(), 1);
        assert_eq!(h.service.outstanding_tokens("alice").await.unwrap(), 0);
    }

    /// Account store whose verify step always fails.
    struct BrokenAccounts(MemoryAccountStore);

    #[async_trait]
    impl AccountStore for BrokenAccounts {
        async fn find_by_id(&self, id: &str) -> AppResult<Option<account::Model>> {
            self.0.find_by_id(id).await
        }

        async fn find_by_email(&self, email: &str) -> AppResult<Option<account::Model>> {
            self.0.find_by_email(email).await
        }

        async fn mark_email_verified(&self, _id: &str) -> AppResult<bool> {
            Err(AppError::Database("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_verify_restores_token() {
        let accounts = MemoryAccountStore::new();
        accounts.add("alice", "alice@example.com").await;
        let tokens = MemoryTokenStore::new();

        let service = VerificationService::new(
            Arc::new(BrokenAccounts(accounts)),
            Arc::new(tokens.clone()),
            Arc::new(RecordingDelivery::new()),
            TTL,
        );

        let issued = service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await
            .unwrap();

        assert!(matches!(
            service.consume(&issued.token).await,
            Err(AppError::Database(_))
        ));
        assert_eq!(tokens.tokens_for_account("alice").await.len(), 1);
    }

    /// Account store whose verify step fails after a resend slipped in.
    struct SupersededDuringVerify {
        accounts: MemoryAccountStore,
        tokens: MemoryTokenStore,
    }

    #[async_trait]
    impl AccountStore for SupersededDuringVerify {
        async fn find_by_id(&self, id: &str) -> AppResult<Option<account::Model>> {
            self.accounts.find_by_id(id).await
        }

        async fn find_by_email(&self, email: &str) -> AppResult<Option<account::Model>> {
            self.accounts.find_by_email(email).await
        }

        async fn mark_email_verified(&self, id: &str) -> AppResult<bool> {
            let now = Utc::now();
            self.tokens
                .replace_for_account(verification_token::Model {
                    token: "newer".to_string(),
                    account_id: id.to_string(),
                    expires_at: (now + chrono::Duration::hours(1)).fixed_offset(),
                    created_at: now.fixed_offset(),
                })
                .await?;
            Err(AppError::Database("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_verify_does_not_restore_superseded_token() {
        let accounts = MemoryAccountStore::new();
        accounts.add("alice", "alice@example.com").await;
        let tokens = MemoryTokenStore::new();

        let service = VerificationService::new(
            Arc::new(SupersededDuringVerify {
                accounts,
                tokens: tokens.clone(),
            }),
            Arc::new(tokens.clone()),
            Arc::new(RecordingDelivery::new()),
            TTL,
        );

        let issued = service
            .issue_or_resend(AccountRef::Id("alice".to_string()))
            .await
            .unwrap();

        assert!(matches!(
            service.consume(&issued.token).await,
            Err(AppError::Database(_))
        ));

        let kept = tokens.tokens_for_account("alice").await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].token, "newer");
    }
}
