use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Orders::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                    .col(
                        ColumnDef::new(Orders::OrderNumber)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Orders::CustomerId).uuid().null())
                    .col(ColumnDef::new(Orders::CartId).uuid().null())
                    .col(
                        ColumnDef::new(Orders::Status)
                            .string_len(20)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Orders::PaymentStatus)
                            .string_len(20)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Orders::RefundStatus)
                            .string_len(20)
                            .not_null()
                            .default("none"),
                    )
                    .col(
                        ColumnDef::new(Orders::Currency)
                            .string()
                            .not_null()
                            .default("USD"),
                    )
                    .col(
                        ColumnDef::new(Orders::Subtotal)
                            .decimal_len(19, 4)
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Orders::DiscountTotal)
                            .decimal_len(19, 4)
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Orders::TaxTotal)
                            .decimal_len(19, 4)
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Orders::ShippingTotal)
                            .decimal_len(19, 4)
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Orders::TotalAmount)
                            .decimal_len(19, 4)
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Orders::CouponId).uuid().null())
                    .col(ColumnDef::new(Orders::CouponCode).string().null())
                    .col(
                        ColumnDef::new(Orders::ShippingMethod)
                            .string_len(20)
                            .not_null()
                            .default("standard"),
                    )
                    .col(ColumnDef::new(Orders::ShippingAddress).json().not_null())
                    .col(ColumnDef::new(Orders::BillingAddress).json().not_null())
                    .col(ColumnDef::new(Orders::Notes).text().null())
                    .col(
                        ColumnDef::new(Orders::Version)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Orders::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Orders::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Orders::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Orders {
    Table,
    Id,
    OrderNumber,
    CustomerId,
    CartId,
    Status,
    PaymentStatus,
    RefundStatus,
    Currency,
    Subtotal,
    DiscountTotal,
    TaxTotal,
    ShippingTotal,
    TotalAmount,
    CouponId,
    CouponCode,
    ShippingMethod,
    ShippingAddress,
    BillingAddress,
    Notes,
    Version,
    CreatedAt,
    UpdatedAt,
}
