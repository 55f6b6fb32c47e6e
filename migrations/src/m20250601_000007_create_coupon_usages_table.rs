use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CouponUsages::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CouponUsages::Id)
                            .uuid()
                            .primary_key()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CouponUsages::CouponId).uuid().not_null())
                    .col(ColumnDef::new(CouponUsages::OrderId).uuid().not_null())
                    .col(ColumnDef::new(CouponUsages::CustomerId).uuid().null())
                    .col(
                        ColumnDef::new(CouponUsages::DiscountAmount)
                            .decimal_len(19, 4)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CouponUsages::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CouponUsages::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum CouponUsages {
    Table,
    Id,
    CouponId,
    OrderId,
    CustomerId,
    DiscountAmount,
    CreatedAt,
}
