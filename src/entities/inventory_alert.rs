use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum AlertKind {
    #[sea_orm(string_value = "LOW")]
    Low,
    #[sea_orm(string_value = "CRITICAL")]
    Critical,
    #[sea_orm(string_value = "OUT")]
    Out,
    #[sea_orm(string_value = "NO_MOVEMENT")]
    NoMovement,
    #[sea_orm(string_value = "OVERSTOCK")]
    Overstock,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Low => "LOW",
            AlertKind::Critical => "CRITICAL",
            AlertKind::Out => "OUT",
            AlertKind::NoMovement => "NO_MOVEMENT",
            AlertKind::Overstock => "OVERSTOCK",
        }
    }
}

/// At most one row per part has `resolved_at = NULL`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_alerts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub part_id: i32,
    pub kind: AlertKind,
    pub message: String,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub stock_snapshot: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub min_snapshot: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub max_snapshot: Decimal,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub resolved_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
