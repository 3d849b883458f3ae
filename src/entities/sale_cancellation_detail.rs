use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Disposition of one product line of a cancelled sale.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sale_cancellation_details")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub sale_id: i32,
    pub sale_line_id: i32,
    pub part_id: i32,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub original_quantity: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub quantity_reusable: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub quantity_shrinkage: Decimal,
    /// Weighted-average cost at cancellation time.
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub unit_cost: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub shrinkage_cost: Decimal,
    pub reason: Option<String>,
    pub created_by: i32,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
