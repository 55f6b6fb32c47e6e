use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Refunds::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Refunds::Id).uuid().primary_key().not_null())
                    .col(ColumnDef::new(Refunds::PaymentId).uuid().not_null())
                    .col(ColumnDef::new(Refunds::OrderId).uuid().not_null())
                    .col(
                        ColumnDef::new(Refunds::Amount)
                            .decimal_len(19, 4)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Refunds::Status)
                            .string_len(20)
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Refunds::Kind).string_len(20).not_null())
                    .col(ColumnDef::new(Refunds::Reason).text().null())
                    .col(ColumnDef::new(Refunds::TransactionId).string().null())
                    .col(
                        ColumnDef::new(Refunds::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Refunds::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Refunds::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Refunds::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Refunds {
    Table,
    Id,
    PaymentId,
    OrderId,
    Amount,
    Status,
    Kind,
    Reason,
    TransactionId,
    CreatedAt,
    UpdatedAt,
    CompletedAt,
}
