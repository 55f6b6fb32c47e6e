use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RefundItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RefundItems::Id)
                            .uuid()
                            .primary_key()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RefundItems::RefundId).uuid().not_null())
                    .col(ColumnDef::new(RefundItems::OrderItemId).uuid().not_null())
                    .col(ColumnDef::new(RefundItems::Quantity).integer().not_null())
                    .col(
                        ColumnDef::new(RefundItems::Amount)
                            .decimal_len(19, 4)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RefundItems::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RefundItems::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum RefundItems {
    Table,
    Id,
    RefundId,
    OrderItemId,
    Quantity,
    Amount,
    CreatedAt,
}
