//! Create verification token table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(VerificationToken::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(VerificationToken::Token)
                            .string_len(128)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(VerificationToken::AccountId)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(VerificationToken::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(VerificationToken::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_verification_token_account")
                            .from(VerificationToken::Table, VerificationToken::AccountId)
                            .to(Account::Table, Account::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Not unique: issuance deletes prior tokens instead
        manager
            .create_index(
                Index::create()
                    .name("idx_verification_token_account_id")
                    .table(VerificationToken::Table)
                    .col(VerificationToken::AccountId)
                    .to_owned(),
            )
            .await?;

        // Index: expires_at (for sweep)
        manager
            .create_index(
                Index::create()
                    .name("idx_verification_token_expires_at")
                    .table(VerificationToken::Table)
                    .col(VerificationToken::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(VerificationToken::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum VerificationToken {
    Table,
    Token,
    AccountId,
    ExpiresAt,
    CreatedAt,
}

#[derive(Iden)]
enum Account {
    Table,
    Id,
}
