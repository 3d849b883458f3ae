use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "purchase_order_lines")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub purchase_order_id: i32,
    /// `None` for placeholder merchandise; a part is created on receipt.
    pub part_id: Option<i32>,
    pub description: String,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub quantity_requested: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub quantity_received: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub estimated_unit_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 2)))", nullable)]
    pub real_unit_price: Option<Decimal>,
}

impl Model {
    pub fn outstanding(&self) -> Decimal {
        self.quantity_requested - self.quantity_received
    }

    /// Real price when one was recorded at receipt, estimated otherwise.
    pub fn effective_unit_price(&self) -> Decimal {
        self.real_unit_price.unwrap_or(self.estimated_unit_price)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
