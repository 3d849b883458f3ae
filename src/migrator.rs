use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20240101_000001_create_core_tables::Migration)]
    }
}

// Migration implementations

mod m20240101_000001_create_core_tables {
    use crate::entities::*;
    use sea_orm::{EntityName, EntityTrait, Schema};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_core_tables"
        }
    }

    async fn create_entity_table<E>(
        manager: &SchemaManager<'_>,
        schema: &Schema,
        entity: E,
    ) -> Result<(), DbErr>
    where
        E: EntityTrait,
    {
        manager
            .create_table(schema.create_table_from_entity(entity).if_not_exists().to_owned())
            .await
    }

    async fn drop_entity_table<E>(manager: &SchemaManager<'_>, entity: E) -> Result<(), DbErr>
    where
        E: EntityName + 'static,
    {
        manager
            .drop_table(Table::drop().table(entity).if_exists().to_owned())
            .await
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            // Catalog
            create_entity_table(manager, &schema, client::Entity).await?;
            create_entity_table(manager, &schema, vehicle::Entity).await?;
            create_entity_table(manager, &schema, employee::Entity).await?;
            create_entity_table(manager, &schema, service_item::Entity).await?;
            create_entity_table(manager, &schema, supplier::Entity).await?;

            // Inventory
            create_entity_table(manager, &schema, part::Entity).await?;
            create_entity_table(manager, &schema, inventory_movement::Entity).await?;
            create_entity_table(manager, &schema, inventory_alert::Entity).await?;

            // Work orders
            create_entity_table(manager, &schema, work_order::Entity).await?;
            create_entity_table(manager, &schema, work_order_service_line::Entity).await?;
            create_entity_table(manager, &schema, work_order_part_line::Entity).await?;
            create_entity_table(manager, &schema, work_order_note::Entity).await?;

            // Sales, cash and commissions
            create_entity_table(manager, &schema, sale::Entity).await?;
            create_entity_table(manager, &schema, sale_line::Entity).await?;
            create_entity_table(manager, &schema, cash_shift::Entity).await?;
            create_entity_table(manager, &schema, cash_alert::Entity).await?;
            create_entity_table(manager, &schema, payment::Entity).await?;
            create_entity_table(manager, &schema, sale_cancellation_detail::Entity).await?;
            create_entity_table(manager, &schema, commission_config::Entity).await?;
            create_entity_table(manager, &schema, accrued_commission::Entity).await?;

            // Accounts payable
            create_entity_table(manager, &schema, purchase_order::Entity).await?;
            create_entity_table(manager, &schema, purchase_order_line::Entity).await?;
            create_entity_table(manager, &schema, manual_payable::Entity).await?;
            create_entity_table(manager, &schema, payable_payment::Entity).await?;

            // Daily document numbering
            create_entity_table(manager, &schema, document_counter::Entity).await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_inventory_movements_part")
                        .table(inventory_movement::Entity)
                        .col(inventory_movement::Column::PartId)
                        .col(inventory_movement::Column::CreatedAt)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_inventory_alerts_part")
                        .table(inventory_alert::Entity)
                        .col(inventory_alert::Column::PartId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_payments_sale")
                        .table(payment::Entity)
                        .col(payment::Column::SaleId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_sale_lines_sale")
                        .table(sale_line::Entity)
                        .col(sale_line::Column::SaleId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_cash_shifts_opened_by_status")
                        .table(cash_shift::Entity)
                        .col(cash_shift::Column::OpenedBy)
                        .col(cash_shift::Column::Status)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            drop_entity_table(manager, document_counter::Entity).await?;
            drop_entity_table(manager, payable_payment::Entity).await?;
            drop_entity_table(manager, manual_payable::Entity).await?;
            drop_entity_table(manager, purchase_order_line::Entity).await?;
            drop_entity_table(manager, purchase_order::Entity).await?;
            drop_entity_table(manager, accrued_commission::Entity).await?;
            drop_entity_table(manager, commission_config::Entity).await?;
            drop_entity_table(manager, sale_cancellation_detail::Entity).await?;
            drop_entity_table(manager, payment::Entity).await?;
            drop_entity_table(manager, cash_alert::Entity).await?;
            drop_entity_table(manager, cash_shift::Entity).await?;
            drop_entity_table(manager, sale_line::Entity).await?;
            drop_entity_table(manager, sale::Entity).await?;
            drop_entity_table(manager, work_order_note::Entity).await?;
            drop_entity_table(manager, work_order_part_line::Entity).await?;
            drop_entity_table(manager, work_order_service_line::Entity).await?;
            drop_entity_table(manager, work_order::Entity).await?;
            drop_entity_table(manager, inventory_alert::Entity).await?;
            drop_entity_table(manager, inventory_movement::Entity).await?;
            drop_entity_table(manager, part::Entity).await?;
            drop_entity_table(manager, supplier::Entity).await?;
            drop_entity_table(manager, service_item::Entity).await?;
            drop_entity_table(manager, employee::Entity).await?;
            drop_entity_table(manager, vehicle::Entity).await?;
            drop_entity_table(manager, client::Entity).await
        }
    }
}
