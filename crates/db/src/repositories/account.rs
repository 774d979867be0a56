//! Account repository.

use std::sync::Arc;

use crate::entities::{Account, account};
use chrono::Utc;
use mailverify_common::{AppError, AppResult};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

/// Account repository for database operations.
#[derive(Clone)]
pub struct AccountRepository {
    db: Arc<DatabaseConnection>,
}

impl AccountRepository {
    /// Create a new account repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find an account by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<account::Model>> {
        Account::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find an account by email address (case-insensitive).
    pub async fn find_by_email(&self, email: &str) -> AppResult<Option<account::Model>> {
        Account::find()
            .filter(account::Column::Email.eq(email.to_lowercase()))
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Mark an account's email as verified.
    ///
    /// Returns `true` if this call flipped the flag, `false` if the account
    /// was already verified.
    pub async fn mark_email_verified(&self, id: &str) -> AppResult<bool> {
        let result = Account::update_many()
            .col_expr(account::Column::EmailVerified, Expr::value(true))
            .col_expr(
                account::Column::VerifiedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(account::Column::Id.eq(id))
            .filter(account::Column::EmailVerified.eq(false))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        if result.rows_affected > 0 {
            return Ok(true);
        }

        // Nothing updated: either already verified or gone
        match self.find_by_id(id).await? {
            Some(_) => Ok(false),
            None => Err(AppError::AccountNotFound(id.to_string())),
        }
    }
}
