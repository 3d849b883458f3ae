use crate::{
    db::DbPool,
    entities::{
        accrued_commission::{self, Entity as AccruedCommission},
        commission_config::{self, CommissionBasis, Entity as CommissionConfig},
        employee::Entity as Employee,
        sale,
        sale_line::{self, Entity as SaleLine, LineKind},
        work_order::Entity as WorkOrder,
    },
    errors::ServiceError,
    money::money_round,
    services::Actor,
};
use chrono::{NaiveDate, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::{Validate, ValidationError};

fn validate_percentage(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO || *value > dec!(100) {
        return Err(ValidationError::new("percentage_out_of_range"));
    }
    Ok(())
}

/// New rate for an (employee, basis) pair, effective from `valid_from`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CommissionRate {
    pub employee_id: i32,
    pub basis: CommissionBasis,
    #[validate(custom = "validate_percentage")]
    pub percentage: Decimal,
    pub valid_from: NaiveDate,
}

/// Basis a sale line earns commission on. Lines copied from a work order pay
/// the order's technician; the rest pay the seller.
pub fn derive_basis(kind: LineKind, from_work_order: bool) -> CommissionBasis {
    match (kind, from_work_order) {
        (LineKind::Service, true) => CommissionBasis::Labor,
        (LineKind::Product, true) => CommissionBasis::Parts,
        (LineKind::Service, false) => CommissionBasis::ServicesSale,
        (LineKind::Product, false) => CommissionBasis::ProductsSale,
    }
}

#[derive(Clone)]
pub struct CommissionService {
    db_pool: Arc<DbPool>,
}

impl CommissionService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Closes the open row for the pair (if any) and opens a new one.
    ///
    /// Rows are history: a start date not after the open row's start is a conflict
    /// rather than an edit in place.
    #[instrument(skip(self))]
    pub async fn set_commission_rate(
        &self,
        actor: Actor,
        rate: CommissionRate,
    ) -> Result<commission_config::Model, ServiceError> {
        rate.validate()?;

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        Employee::find_by_id(rate.employee_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Employee", rate.employee_id))?;

        let open = CommissionConfig::find()
            .filter(commission_config::Column::EmployeeId.eq(rate.employee_id))
            .filter(commission_config::Column::Basis.eq(rate.basis))
            .filter(commission_config::Column::ValidTo.is_null())
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        if let Some(open) = open {
            if rate.valid_from <= open.valid_from {
                return Err(ServiceError::Conflict(format!(
                    "A {} rate for employee {} already starts on {}",
                    rate.basis.as_str(),
                    rate.employee_id,
                    open.valid_from
                )));
            }
            let mut closing: commission_config::ActiveModel = open.into();
            closing.valid_to = Set(Some(rate.valid_from));
            closing.update(&txn).await.map_err(ServiceError::db_error)?;
        }

        let created = commission_config::ActiveModel {
            employee_id: Set(rate.employee_id),
            basis: Set(rate.basis),
            percentage: Set(rate.percentage.round_dp(2)),
            valid_from: Set(rate.valid_from),
            valid_to: Set(None),
            created_by: Set(actor.id),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            employee_id = created.employee_id,
            basis = created.basis.as_str(),
            percentage = %created.percentage,
            "Commission rate set"
        );
        Ok(created)
    }

    /// Percentage in force for the pair on `day`; the latest start wins.
    pub async fn rate_for<C: ConnectionTrait>(
        conn: &C,
        employee_id: i32,
        basis: CommissionBasis,
        day: NaiveDate,
    ) -> Result<Option<Decimal>, ServiceError> {
        let row = CommissionConfig::find()
            .filter(commission_config::Column::EmployeeId.eq(employee_id))
            .filter(commission_config::Column::Basis.eq(basis))
            .filter(commission_config::Column::ValidFrom.lte(day))
            .filter(
                Condition::any()
                    .add(commission_config::Column::ValidTo.is_null())
                    .add(commission_config::Column::ValidTo.gt(day)),
            )
            .order_by_desc(commission_config::Column::ValidFrom)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(row.map(|r| r.percentage))
    }

    /// Accrues commissions for a sale that just reached PAID.
    ///
    /// Does nothing when the sale already has accruals.
    pub async fn accrue_for_sale<C: ConnectionTrait>(
        &self,
        conn: &C,
        sale: &sale::Model,
    ) -> Result<Vec<accrued_commission::Model>, ServiceError> {
        let existing = AccruedCommission::find()
            .filter(accrued_commission::Column::SaleId.eq(sale.id))
            .count(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if existing > 0 {
            return Ok(Vec::new());
        }

        let lines = SaleLine::find()
            .filter(sale_line::Column::SaleId.eq(sale.id))
            .order_by_asc(sale_line::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let sale_day = sale.sale_date.date_naive();
        let now = Utc::now();
        let mut technicians: HashMap<i32, Option<i32>> = HashMap::new();
        let mut accrued = Vec::new();

        for line in lines.into_iter().filter(|l| l.subtotal > Decimal::ZERO) {
            let basis = derive_basis(line.kind, line.origin_order_id.is_some());
            let employee_id = match line.origin_order_id {
                Some(order_id) => {
                    if !technicians.contains_key(&order_id) {
                        let technician = WorkOrder::find_by_id(order_id)
                            .one(conn)
                            .await
                            .map_err(ServiceError::db_error)?
                            .and_then(|o| o.technician_id);
                        technicians.insert(order_id, technician);
                    }
                    match technicians.get(&order_id).copied().flatten() {
                        Some(id) => id,
                        None => {
                            warn!(sale_id = sale.id, order_id, "Work order has no technician; line skipped");
                            continue;
                        }
                    }
                }
                None => sale.seller_id,
            };

            let percentage = match Self::rate_for(conn, employee_id, basis, sale_day).await? {
                Some(p) if p > Decimal::ZERO => p,
                _ => continue,
            };

            let row = accrued_commission::ActiveModel {
                sale_id: Set(sale.id),
                sale_line_id: Set(line.id),
                employee_id: Set(employee_id),
                basis: Set(basis),
                basis_amount: Set(line.subtotal),
                percentage: Set(percentage),
                amount: Set(money_round(line.subtotal * percentage / dec!(100))),
                sale_date: Set(sale_day),
                created_at: Set(now),
                ..Default::default()
            }
            .insert(conn)
            .await
            .map_err(ServiceError::db_error)?;
            accrued.push(row);
        }

        if !accrued.is_empty() {
            counter!("commissions.accrued", accrued.len() as u64);
        }
        Ok(accrued)
    }

    /// Deletes every accrual of the sale; returns how many rows went away.
    pub async fn remove_for_sale<C: ConnectionTrait>(
        conn: &C,
        sale_id: i32,
    ) -> Result<u64, ServiceError> {
        let result = AccruedCommission::delete_many()
            .filter(accrued_commission::Column::SaleId.eq(sale_id))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(result.rows_affected)
    }

    /// Deletes the accruals earned by specific lines of a sale.
    pub async fn remove_for_lines<C: ConnectionTrait>(
        conn: &C,
        sale_id: i32,
        line_ids: &[i32],
    ) -> Result<u64, ServiceError> {
        if line_ids.is_empty() {
            return Ok(0);
        }
        let result = AccruedCommission::delete_many()
            .filter(accrued_commission::Column::SaleId.eq(sale_id))
            .filter(accrued_commission::Column::SaleLineId.is_in(line_ids.to_vec()))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(result.rows_affected)
    }

    pub async fn accrued_for_sale(
        &self,
        sale_id: i32,
    ) -> Result<Vec<accrued_commission::Model>, ServiceError> {
        AccruedCommission::find()
            .filter(accrued_commission::Column::SaleId.eq(sale_id))
            .order_by_asc(accrued_commission::Column::Id)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    /// Rate history of an (employee, basis) pair, oldest first.
    pub async fn rate_history(
        &self,
        employee_id: i32,
        basis: CommissionBasis,
    ) -> Result<Vec<commission_config::Model>, ServiceError> {
        CommissionConfig::find()
            .filter(commission_config::Column::EmployeeId.eq(employee_id))
            .filter(commission_config::Column::Basis.eq(basis))
            .order_by_asc(commission_config::Column::ValidFrom)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }
}
