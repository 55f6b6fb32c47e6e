use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CartItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CartItems::Id)
                            .uuid()
                            .primary_key()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CartItems::CartId).uuid().not_null())
                    .col(ColumnDef::new(CartItems::ProductId).uuid().not_null())
                    .col(ColumnDef::new(CartItems::Quantity).integer().not_null())
                    .col(ColumnDef::new(CartItems::Configuration).json().not_null())
                    .col(
                        ColumnDef::new(CartItems::ConfigurationKey)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CartItems::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CartItems::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // One line per (cart, product, configuration); repeated adds merge
        manager
            .create_index(
                Index::create()
                    .name("uq_cart_items_cart_product_config")
                    .table(CartItems::Table)
                    .col(CartItems::CartId)
                    .col(CartItems::ProductId)
                    .col(CartItems::ConfigurationKey)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CartItems::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum CartItems {
    Table,
    Id,
    CartId,
    ProductId,
    Quantity,
    Configuration,
    ConfigurationKey,
    CreatedAt,
    UpdatedAt,
}
