//! Verification token repository.

use std::sync::Arc;

use crate::entities::{Account, VerificationToken, verification_token};
use chrono::{DateTime, Utc};
use mailverify_common::{AppError, AppResult};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, DeleteResult,
    EntityTrait, PaginatorTrait, QueryFilter, QuerySelect, Set, TransactionTrait,
};

fn db_err(e: sea_orm::DbErr) -> AppError {
    AppError::Database(e.to_string())
}

fn active(record: verification_token::Model) -> verification_token::ActiveModel {
    verification_token::ActiveModel {
        token: Set(record.token),
        account_id: Set(record.account_id),
        expires_at: Set(record.expires_at),
        created_at: Set(record.created_at),
    }
}

/// Verification token repository for database operations.
#[derive(Clone)]
pub struct VerificationTokenRepository {
    db: Arc<DatabaseConnection>,
}

impl VerificationTokenRepository {
    /// Create a new verification token repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find a token record.
    pub async fn find_by_token(&self, token: &str) -> AppResult<Option<verification_token::Model>> {
        VerificationToken::find_by_id(token)
            .one(self.db.as_ref())
            .await
            .map_err(db_err)
    }

    /// Insert a token record.
    pub async fn create(
        &self,
        model: verification_token::ActiveModel,
    ) -> AppResult<verification_token::Model> {
        model
            .insert(self.db.as_ref())
            .await
            .map_err(db_err)
    }

    /// Open a transaction holding the row lock of `account_id`.
    ///
    /// Writers of one account's tokens go through this lock, so they run one
    /// after another.
    async fn lock_account(&self, account_id: &str) -> AppResult<DatabaseTransaction> {
        let txn = self.db.begin().await.map_err(db_err)?;

        let locked = Account::find_by_id(account_id)
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(db_err)?;

        if locked.is_none() {
            return Err(AppError::AccountNotFound(account_id.to_string()));
        }
        Ok(txn)
    }

    /// Replace every token of the record's account with `record`.
    ///
    /// Returns how many tokens were deleted. Concurrent calls for one account
    /// leave exactly one token behind.
    pub async fn replace_for_account(&self, record: verification_token::Model) -> AppResult<u64> {
        let txn = self.lock_account(&record.account_id).await?;

        let deleted: DeleteResult = VerificationToken::delete_many()
            .filter(verification_token::Column::AccountId.eq(record.account_id.as_str()))
            .exec(&txn)
            .await
            .map_err(db_err)?;

        active(record).insert(&txn).await.map_err(db_err)?;
        txn.commit().await.map_err(db_err)?;

        Ok(deleted.rows_affected)
    }

    /// Put a taken record back unless its account holds a token again.
    ///
    /// Returns `false` when a newer token exists and the record was dropped.
    pub async fn restore(&self, record: verification_token::Model) -> AppResult<bool> {
        let txn = self.lock_account(&record.account_id).await?;

        let existing = VerificationToken::find()
            .filter(verification_token::Column::AccountId.eq(record.account_id.as_str()))
            .count(&txn)
            .await
            .map_err(db_err)?;

        if existing > 0 {
            txn.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        active(record).insert(&txn).await.map_err(db_err)?;
        txn.commit().await.map_err(db_err)?;
        Ok(true)
    }

    /// Atomically remove a token record and return it.
    ///
    /// The row is locked with `SELECT ... FOR UPDATE` and deleted in the same
    /// transaction, so of two concurrent callers exactly one gets the record.
    pub async fn take(&self, token: &str) -> AppResult<Option<verification_token::Model>> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(db_err)?;

        let found = VerificationToken::find_by_id(token)
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(db_err)?;

        if found.is_some() {
            VerificationToken::delete_by_id(token)
                .exec(&txn)
                .await
                .map_err(db_err)?;
        }

        txn.commit()
            .await
            .map_err(db_err)?;

        Ok(found)
    }

    /// Count the token records of an account.
    pub async fn count_by_account(&self, account_id: &str) -> AppResult<u64> {
        VerificationToken::find()
            .filter(verification_token::Column::AccountId.eq(account_id))
            .count(self.db.as_ref())
            .await
            .map_err(db_err)
    }

    /// Delete tokens that expired before `now`.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result: DeleteResult = VerificationToken::delete_many()
            .filter(verification_token::Column::ExpiresAt.lte(now.fixed_offset()))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected)
    }
}
