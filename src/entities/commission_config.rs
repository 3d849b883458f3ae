use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum CommissionBasis {
    #[sea_orm(string_value = "LABOR")]
    Labor,
    #[sea_orm(string_value = "PARTS")]
    Parts,
    #[sea_orm(string_value = "SERVICES_SALE")]
    ServicesSale,
    #[sea_orm(string_value = "PRODUCTS_SALE")]
    ProductsSale,
}

impl CommissionBasis {
    pub fn as_str(self) -> &'static str {
        match self {
            CommissionBasis::Labor => "LABOR",
            CommissionBasis::Parts => "PARTS",
            CommissionBasis::ServicesSale => "SERVICES_SALE",
            CommissionBasis::ProductsSale => "PRODUCTS_SALE",
        }
    }
}

/// Rate valid on `[valid_from, valid_to)`; `valid_to = NULL` is the open row.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "commission_configs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub employee_id: i32,
    pub basis: CommissionBasis,
    #[sea_orm(column_type = "Decimal(Some((5, 2)))")]
    pub percentage: Decimal,
    pub valid_from: Date,
    pub valid_to: Option<Date>,
    pub created_by: i32,
    pub created_at: DateTimeUtc,
}

impl Model {
    pub fn covers(&self, day: Date) -> bool {
        self.valid_from <= day && self.valid_to.map_or(true, |to| day < to)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
