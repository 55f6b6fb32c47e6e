use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Cart resolution by session or customer only needs active rows,
        // but partial indexes are not portable, so index the status column too.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_carts_session_status")
                    .table(Carts::Table)
                    .col(Carts::SessionId)
                    .col(Carts::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_carts_customer_status")
                    .table(Carts::Table)
                    .col(Carts::CustomerId)
                    .col(Carts::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_cart_items_cart_id")
                    .table(CartItems::Table)
                    .col(CartItems::CartId)
                    .to_owned(),
            )
            .await?;

        // Order history listings sort newest-first per customer.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_orders_customer_created")
                    .table(Orders::Table)
                    .col(Orders::CustomerId)
                    .col((Orders::CreatedAt, IndexOrder::Desc))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_order_items_order_id")
                    .table(OrderItems::Table)
                    .col(OrderItems::OrderId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_payments_order_status")
                    .table(Payments::Table)
                    .col(Payments::OrderId)
                    .col(Payments::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_refunds_payment_id")
                    .table(Refunds::Table)
                    .col(Refunds::PaymentId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_refunds_order_id")
                    .table(Refunds::Table)
                    .col(Refunds::OrderId)
                    .to_owned(),
            )
            .await?;

        // Per-customer redemption counting during coupon checks.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_coupon_usages_coupon_customer")
                    .table(CouponUsages::Table)
                    .col(CouponUsages::CouponId)
                    .col(CouponUsages::CustomerId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_coupon_usages_coupon_customer")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(Index::drop().name("idx_refunds_order_id").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_refunds_payment_id").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_payments_order_status").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_order_items_order_id").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_orders_customer_created").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_cart_items_cart_id").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_carts_customer_status").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_carts_session_status").to_owned())
            .await?;

        Ok(())
    }
}

// Table identifiers
#[derive(Iden)]
enum Carts {
    Table,
    SessionId,
    CustomerId,
    Status,
}

#[derive(Iden)]
enum CartItems {
    Table,
    CartId,
}

#[derive(Iden)]
enum Orders {
    Table,
    CustomerId,
    CreatedAt,
}

#[derive(Iden)]
enum OrderItems {
    Table,
    OrderId,
}

#[derive(Iden)]
enum Payments {
    Table,
    OrderId,
    Status,
}

#[derive(Iden)]
enum Refunds {
    Table,
    PaymentId,
    OrderId,
}

#[derive(Iden)]
enum CouponUsages {
    Table,
    CouponId,
    CustomerId,
}
