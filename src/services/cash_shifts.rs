use crate::{
    config::BusinessRules,
    db::DbPool,
    entities::{
        accrued_commission,
        cash_alert::{self, AlertLevel, CashAlertKind, Entity as CashAlert},
        cash_shift::{self, Entity as CashShift, ShiftStatus},
        payable_payment::{self, Entity as PayablePayment},
        payment::{self, Entity as Payment, PaymentMethod},
        sale::{self, Entity as Sale, SaleStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    money::{approx_eq, exceeds, money_round},
    services::{commissions::CommissionService, ensure_non_negative, ensure_positive, optional_text, Actor},
};
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Sum of the payments registered against a sale, rounded to cents.
pub async fn paid_amount<C: ConnectionTrait>(conn: &C, sale_id: i32) -> Result<Decimal, ServiceError> {
    let payments = Payment::find()
        .filter(payment::Column::SaleId.eq(sale_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(money_round(payments.iter().map(|p| p.amount).sum()))
}

/// The user's OPEN shift, locked for the rest of the transaction.
pub(crate) async fn open_shift_for<C: ConnectionTrait>(
    conn: &C,
    user_id: i32,
) -> Result<Option<cash_shift::Model>, ServiceError> {
    CashShift::find()
        .filter(cash_shift::Column::OpenedBy.eq(user_id))
        .filter(cash_shift::Column::Status.eq(ShiftStatus::Open))
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)
}

fn no_open_shift(user_id: i32) -> ServiceError {
    ServiceError::ValidationError(format!("User {} has no open cash shift", user_id))
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentOutcome {
    pub payment: payment::Model,
    pub sale: sale::Model,
    pub paid: Decimal,
    pub balance: Decimal,
    /// Rows accrued when this payment settled the sale.
    pub commissions: Vec<accrued_commission::Model>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShiftClosing {
    pub shift: cash_shift::Model,
    pub alert: Option<cash_alert::Model>,
}

/// Level of a close-out difference; `None` when the drawer balances.
pub fn difference_level(difference: Decimal, critical_threshold: Decimal) -> Option<AlertLevel> {
    if difference.is_zero() {
        None
    } else if difference.abs() >= critical_threshold {
        Some(AlertLevel::Critical)
    } else {
        Some(AlertLevel::Warning)
    }
}

/// Level of a shift that has been open for `elapsed`.
pub fn long_shift_level(elapsed: Duration, warning_hours: i64, critical_hours: i64) -> Option<AlertLevel> {
    if elapsed >= Duration::hours(critical_hours) {
        Some(AlertLevel::Critical)
    } else if elapsed >= Duration::hours(warning_hours) {
        Some(AlertLevel::Warning)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct CashShiftService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    rules: BusinessRules,
    commissions: CommissionService,
}

impl CashShiftService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        rules: BusinessRules,
        commissions: CommissionService,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            rules,
            commissions,
        }
    }

    pub async fn current_shift(&self, user_id: i32) -> Result<Option<cash_shift::Model>, ServiceError> {
        CashShift::find()
            .filter(cash_shift::Column::OpenedBy.eq(user_id))
            .filter(cash_shift::Column::Status.eq(ShiftStatus::Open))
            .one(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn open_shift(
        &self,
        actor: Actor,
        opening_amount: Decimal,
    ) -> Result<cash_shift::Model, ServiceError> {
        let opening_amount = money_round(opening_amount);
        ensure_non_negative(opening_amount, "opening_amount")?;

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        if let Some(open) = open_shift_for(&txn, actor.id).await? {
            return Err(ServiceError::Conflict(format!(
                "User {} already has shift {} open",
                actor.id, open.id
            )));
        }

        let shift = cash_shift::ActiveModel {
            opened_by: Set(actor.id),
            status: Set(ShiftStatus::Open),
            opening_amount: Set(opening_amount),
            opened_at: Set(Utc::now()),
            expected_amount: Set(None),
            closing_amount: Set(None),
            difference: Set(None),
            closed_by: Set(None),
            closed_at: Set(None),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(shift_id = shift.id, user_id = actor.id, "Cash shift opened");
        counter!("cash_shifts.opened", 1);
        self.event_sender
            .send_or_log(Event::CashShiftOpened(shift.id))
            .await;
        Ok(shift)
    }

    /// Takes a payment into the caller's open shift.
    ///
    /// When the payment settles the sale it becomes PAID and commissions are
    /// accrued in the same transaction.
    #[instrument(skip(self, reference))]
    pub async fn register_payment(
        &self,
        actor: Actor,
        sale_id: i32,
        method: PaymentMethod,
        amount: Decimal,
        reference: Option<String>,
    ) -> Result<PaymentOutcome, ServiceError> {
        let amount = money_round(amount);
        ensure_positive(amount, "amount")?;

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let shift = open_shift_for(&txn, actor.id)
            .await?
            .ok_or_else(|| no_open_shift(actor.id))?;

        let sale = Sale::find_by_id(sale_id)
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Sale", sale_id))?;
        if sale.status == SaleStatus::Cancelled {
            return Err(ServiceError::IllegalTransition(format!(
                "Sale {} is cancelled",
                sale_id
            )));
        }

        let already_paid = paid_amount(&txn, sale.id).await?;
        if exceeds(already_paid + amount, sale.total) {
            return Err(ServiceError::ValidationError(format!(
                "Overpayment: sale {} has a balance of {}",
                sale.id,
                money_round(sale.total - already_paid)
            )));
        }

        let payment = payment::ActiveModel {
            sale_id: Set(sale.id),
            shift_id: Set(shift.id),
            method: Set(method),
            amount: Set(amount),
            reference: Set(optional_text(reference.as_deref())),
            created_by: Set(actor.id),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        let paid = money_round(already_paid + amount);
        let old_status = sale.status;
        let (sale, commissions) = if approx_eq(paid, sale.total) && sale.status != SaleStatus::Paid {
            let mut active: sale::ActiveModel = sale.into();
            active.status = Set(SaleStatus::Paid);
            active.updated_at = Set(Utc::now());
            let sale = active.update(&txn).await.map_err(ServiceError::db_error)?;
            let commissions = self.commissions.accrue_for_sale(&txn, &sale).await?;
            (sale, commissions)
        } else {
            (sale, Vec::new())
        };

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            sale_id = sale.id,
            payment_id = payment.id,
            amount = %amount,
            paid = %paid,
            "Payment registered"
        );
        counter!("payments.registered", 1, "method" => method.as_str());

        self.event_sender
            .send_or_log(Event::PaymentRegistered {
                sale_id: sale.id,
                payment_id: payment.id,
                amount,
            })
            .await;
        if sale.status != old_status {
            self.event_sender
                .send_or_log(Event::SaleStatusChanged {
                    sale_id: sale.id,
                    old_status: old_status.as_str().to_string(),
                    new_status: sale.status.as_str().to_string(),
                })
                .await;
        }
        if !commissions.is_empty() {
            self.event_sender
                .send_or_log(Event::CommissionsAccrued {
                    sale_id: sale.id,
                    rows: commissions.len(),
                })
                .await;
        }

        let balance = money_round(sale.total - paid);
        Ok(PaymentOutcome {
            payment,
            sale,
            paid,
            balance,
            commissions,
        })
    }

    /// Closes the caller's shift against the counted drawer amount.
    ///
    /// The drawer should hold
    /// `expected = opening_amount + sum(CASH sale payments) - sum(CASH payable payments)`,
    /// counting only payments bound to this shift. CARD and TRANSFER payments
    /// never enter the drawer. `difference = counted - expected`.
    #[instrument(skip(self))]
    pub async fn close_shift(
        &self,
        actor: Actor,
        counted_amount: Decimal,
    ) -> Result<ShiftClosing, ServiceError> {
        let counted_amount = money_round(counted_amount);
        ensure_non_negative(counted_amount, "counted_amount")?;

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let shift = open_shift_for(&txn, actor.id)
            .await?
            .ok_or_else(|| no_open_shift(actor.id))?;

        let cash_in: Decimal = Payment::find()
            .filter(payment::Column::ShiftId.eq(shift.id))
            .filter(payment::Column::Method.eq(PaymentMethod::Cash))
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .iter()
            .map(|p| p.amount)
            .sum();
        let cash_out: Decimal = PayablePayment::find()
            .filter(payable_payment::Column::ShiftId.eq(shift.id))
            .filter(payable_payment::Column::Method.eq(PaymentMethod::Cash))
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .iter()
            .map(|p| p.amount)
            .sum();

        let expected = money_round(shift.opening_amount + cash_in - cash_out);
        let difference = money_round(counted_amount - expected);
        let now = Utc::now();

        let shift_id = shift.id;
        let mut active: cash_shift::ActiveModel = shift.into();
        active.status = Set(ShiftStatus::Closed);
        active.expected_amount = Set(Some(expected));
        active.closing_amount = Set(Some(counted_amount));
        active.difference = Set(Some(difference));
        active.closed_by = Set(Some(actor.id));
        active.closed_at = Set(Some(now));
        let shift = active.update(&txn).await.map_err(ServiceError::db_error)?;

        let alert = match difference_level(difference, self.rules.cash_difference_critical) {
            Some(level) => Some(
                cash_alert::ActiveModel {
                    shift_id: Set(shift_id),
                    kind: Set(CashAlertKind::Difference),
                    level: Set(level),
                    message: Set(format!(
                        "Shift {} closed with a difference of {} (expected {}, counted {})",
                        shift_id, difference, expected, counted_amount
                    )),
                    difference: Set(Some(difference)),
                    created_at: Set(now),
                    updated_at: Set(now),
                    resolved_at: Set(None),
                    ..Default::default()
                }
                .insert(&txn)
                .await
                .map_err(ServiceError::db_error)?,
            ),
            None => None,
        };

        let long_shift_alerts = CashAlert::find()
            .filter(cash_alert::Column::ShiftId.eq(shift_id))
            .filter(cash_alert::Column::Kind.eq(CashAlertKind::LongShift))
            .filter(cash_alert::Column::ResolvedAt.is_null())
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        for open in long_shift_alerts {
            let mut resolving: cash_alert::ActiveModel = open.into();
            resolving.resolved_at = Set(Some(now));
            resolving.updated_at = Set(now);
            resolving.update(&txn).await.map_err(ServiceError::db_error)?;
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        if alert.is_some() {
            warn!(shift_id, difference = %difference, "Cash shift closed with a difference");
        } else {
            info!(shift_id, "Cash shift closed balanced");
        }
        counter!("cash_shifts.closed", 1);

        self.event_sender
            .send_or_log(Event::CashShiftClosed {
                shift_id,
                difference,
            })
            .await;
        if let Some(alert) = &alert {
            self.event_sender
                .send_or_log(Event::CashAlertRaised {
                    shift_id,
                    kind: alert.kind.as_str().to_string(),
                    level: alert.level.as_str().to_string(),
                })
                .await;
        }

        Ok(ShiftClosing { shift, alert })
    }

    /// Raises or upgrades LONG_SHIFT alerts on shifts still open at `now`.
    ///
    /// Returns the alerts that were inserted or upgraded.
    #[instrument(skip(self))]
    pub async fn inspect_open_shifts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<cash_alert::Model>, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let shifts = CashShift::find()
            .filter(cash_shift::Column::Status.eq(ShiftStatus::Open))
            .order_by_asc(cash_shift::Column::Id)
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        gauge!("cash_shifts.open", shifts.len() as f64);

        let mut changed = Vec::new();
        for shift in shifts {
            let elapsed = now - shift.opened_at;
            let level = match long_shift_level(
                elapsed,
                self.rules.long_shift_warning_hours,
                self.rules.long_shift_critical_hours,
            ) {
                Some(level) => level,
                None => continue,
            };
            let message = format!(
                "Shift {} has been open for {} hours",
                shift.id,
                elapsed.num_hours()
            );

            let existing = CashAlert::find()
                .filter(cash_alert::Column::ShiftId.eq(shift.id))
                .filter(cash_alert::Column::Kind.eq(CashAlertKind::LongShift))
                .filter(cash_alert::Column::ResolvedAt.is_null())
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?;

            let alert = match existing {
                None => cash_alert::ActiveModel {
                    shift_id: Set(shift.id),
                    kind: Set(CashAlertKind::LongShift),
                    level: Set(level),
                    message: Set(message),
                    difference: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                    resolved_at: Set(None),
                    ..Default::default()
                }
                .insert(&txn)
                .await
                .map_err(ServiceError::db_error)?,
                Some(open) if open.level == AlertLevel::Warning && level == AlertLevel::Critical => {
                    let mut upgrading: cash_alert::ActiveModel = open.into();
                    upgrading.level = Set(AlertLevel::Critical);
                    upgrading.message = Set(message);
                    upgrading.updated_at = Set(now);
                    upgrading.update(&txn).await.map_err(ServiceError::db_error)?
                }
                Some(_) => continue,
            };
            changed.push(alert);
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        for alert in &changed {
            warn!(shift_id = alert.shift_id, level = alert.level.as_str(), "Long cash shift");
            self.event_sender
                .send_or_log(Event::CashAlertRaised {
                    shift_id: alert.shift_id,
                    kind: alert.kind.as_str().to_string(),
                    level: alert.level.as_str().to_string(),
                })
                .await;
        }
        Ok(changed)
    }

    /// Marks a cash alert as reviewed.
    #[instrument(skip(self))]
    pub async fn resolve_alert(&self, _actor: Actor, alert_id: i32) -> Result<cash_alert::Model, ServiceError> {
        let db = self.db_pool.as_ref();
        let alert = CashAlert::find_by_id(alert_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Cash alert", alert_id))?;
        if alert.resolved_at.is_some() {
            return Ok(alert);
        }
        let now = Utc::now();
        let mut active: cash_alert::ActiveModel = alert.into();
        active.resolved_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(db).await.map_err(ServiceError::db_error)
    }

    pub async fn alerts_for_shift(&self, shift_id: i32) -> Result<Vec<cash_alert::Model>, ServiceError> {
        CashAlert::find()
            .filter(cash_alert::Column::ShiftId.eq(shift_id))
            .order_by_asc(cash_alert::Column::Id)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn payments_for_sale(&self, sale_id: i32) -> Result<Vec<payment::Model>, ServiceError> {
        Payment::find()
            .filter(payment::Column::SaleId.eq(sale_id))
            .order_by_asc(payment::Column::Id)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }
}
