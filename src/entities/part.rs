use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// An inventory SKU. Stock is only ever written by the inventory engine.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "parts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub code: String,
    pub name: String,
    pub category: Option<String>,
    pub supplier_id: Option<i32>,
    /// Weighted-average unit cost.
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub purchase_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub sale_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub current_stock: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub min_stock: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub max_stock: Decimal,
    pub location_warehouse: Option<String>,
    pub location_zone: Option<String>,
    pub location_shelf: Option<String>,
    pub location_level: Option<String>,
    pub location_row: Option<String>,
    pub consumable: bool,
    pub active: bool,
    pub deleted: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl Model {
    /// Parts that may take part in a stock mutation.
    pub fn is_usable(&self) -> bool {
        self.active && !self.deleted
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
