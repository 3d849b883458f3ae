use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum MovementKind {
    #[sea_orm(string_value = "ENTRY")]
    Entry,
    #[sea_orm(string_value = "EXIT")]
    Exit,
    #[sea_orm(string_value = "ADJUST+")]
    AdjustIn,
    #[sea_orm(string_value = "ADJUST-")]
    AdjustOut,
    #[sea_orm(string_value = "SHRINKAGE")]
    Shrinkage,
}

impl MovementKind {
    /// True for kinds that add stock.
    pub fn is_inbound(self) -> bool {
        matches!(self, MovementKind::Entry | MovementKind::AdjustIn)
    }

    /// Sign applied to the quantity when reconstructing stock from the ledger.
    pub fn signed(self, quantity: Decimal) -> Decimal {
        if self.is_inbound() {
            quantity
        } else {
            -quantity
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MovementKind::Entry => "ENTRY",
            MovementKind::Exit => "EXIT",
            MovementKind::AdjustIn => "ADJUST+",
            MovementKind::AdjustOut => "ADJUST-",
            MovementKind::Shrinkage => "SHRINKAGE",
        }
    }
}

/// Append-only stock ledger row.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_movements")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub part_id: i32,
    pub kind: MovementKind,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub quantity: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub unit_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub total_cost: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub stock_before: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 3)))")]
    pub stock_after: Decimal,
    pub reference: Option<String>,
    pub reason: Option<String>,
    pub user_id: Option<i32>,
    pub sale_id: Option<i32>,
    pub supplier_id: Option<i32>,
    pub attachment_url: Option<String>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
