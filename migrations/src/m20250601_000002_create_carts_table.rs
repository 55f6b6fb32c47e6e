use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Carts::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Carts::Id).uuid().primary_key().not_null())
                    .col(ColumnDef::new(Carts::SessionId).string().null())
                    .col(ColumnDef::new(Carts::CustomerId).uuid().null())
                    .col(
                        ColumnDef::new(Carts::Status)
                            .string_len(20)
                            .not_null()
                            .default("active"),
                    )
                    .col(ColumnDef::new(Carts::CouponId).uuid().null())
                    .col(ColumnDef::new(Carts::CouponCode).string().null())
                    .col(
                        ColumnDef::new(Carts::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Carts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Carts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Carts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Carts {
    Table,
    Id,
    SessionId,
    CustomerId,
    Status,
    CouponId,
    CouponCode,
    ExpiresAt,
    CreatedAt,
    UpdatedAt,
}
