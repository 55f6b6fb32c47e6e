use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Payments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Payments::Id)
                            .uuid()
                            .primary_key()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Payments::OrderId).uuid().not_null())
                    .col(
                        ColumnDef::new(Payments::Amount)
                            .decimal_len(19, 4)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Payments::Currency).string().not_null())
                    .col(
                        ColumnDef::new(Payments::Status)
                            .string_len(20)
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Payments::Method).string().null())
                    .col(ColumnDef::new(Payments::TransactionId).string().null())
                    .col(
                        ColumnDef::new(Payments::RefundedAmount)
                            .decimal_len(19, 4)
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Payments::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(Payments::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Payments::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Payments::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Payments {
    Table,
    Id,
    OrderId,
    Amount,
    Currency,
    Status,
    Method,
    TransactionId,
    RefundedAmount,
    ErrorMessage,
    CreatedAt,
    UpdatedAt,
}
