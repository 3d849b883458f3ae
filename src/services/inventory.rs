use crate::{
    config::BusinessRules,
    db::DbPool,
    entities::{
        inventory_alert::{self, AlertKind, Entity as InventoryAlert},
        inventory_movement::{self, Entity as InventoryMovement, MovementKind},
        part::{self, Entity as Part},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    money::{line_amount, money_round, stock_round, weighted_average_cost},
    services::{ensure_non_negative, ensure_positive, optional_text, require_text, Actor},
};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

/// Reference stamped on the movement that books a new part's opening stock.
pub const INITIAL_STOCK_REFERENCE: &str = "INITIAL";

/// Code given to parts created on the fly when placeholder merchandise is received.
pub const PLACEHOLDER_PART_CODE: &str = "PDTE EDITAR";

/// Five-level physical location of a part.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartLocation {
    pub warehouse: Option<String>,
    pub zone: Option<String>,
    pub shelf: Option<String>,
    pub level: Option<String>,
    pub row: Option<String>,
}

impl PartLocation {
    pub fn of(part: &part::Model) -> Self {
        Self {
            warehouse: part.location_warehouse.clone(),
            zone: part.location_zone.clone(),
            shelf: part.location_shelf.clone(),
            level: part.location_level.clone(),
            row: part.location_row.clone(),
        }
    }

    /// `warehouse / zone / shelf / level / row`, skipping unset levels.
    pub fn label(&self) -> String {
        [
            &self.warehouse,
            &self.zone,
            &self.shelf,
            &self.level,
            &self.row,
        ]
        .iter()
        .filter_map(|level| level.as_deref())
        .collect::<Vec<_>>()
        .join(" / ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct NewPart {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub category: Option<String>,
    pub supplier_id: Option<i32>,
    pub purchase_price: Decimal,
    pub sale_price: Decimal,
    /// Booked as an ENTRY movement referenced `INITIAL`.
    pub initial_stock: Decimal,
    pub min_stock: Decimal,
    pub max_stock: Decimal,
    #[serde(default)]
    pub location: PartLocation,
    #[serde(default)]
    pub consumable: bool,
}

/// Partial update; stock is deliberately absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct PartUpdate {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    pub category: Option<String>,
    pub supplier_id: Option<i32>,
    pub purchase_price: Option<Decimal>,
    pub sale_price: Option<Decimal>,
    pub min_stock: Option<Decimal>,
    pub max_stock: Option<Decimal>,
    pub location: Option<PartLocation>,
    pub consumable: Option<bool>,
    pub active: Option<bool>,
}

/// One stock mutation as requested by a command.
#[derive(Debug, Clone)]
pub struct MovementRequest {
    pub part_id: i32,
    pub kind: MovementKind,
    pub quantity: Decimal,
    /// Defaults to the part's current weighted-average cost.
    pub unit_price: Option<Decimal>,
    pub reference: Option<String>,
    pub reason: Option<String>,
    pub user_id: Option<i32>,
    pub sale_id: Option<i32>,
    pub supplier_id: Option<i32>,
    pub attachment_url: Option<String>,
    /// When false the caller evaluates alerts once its batch is complete.
    pub autocommit: bool,
}

impl MovementRequest {
    pub fn new(part_id: i32, kind: MovementKind, quantity: Decimal) -> Self {
        Self {
            part_id,
            kind,
            quantity,
            unit_price: None,
            reference: None,
            reason: None,
            user_id: None,
            sale_id: None,
            supplier_id: None,
            attachment_url: None,
            autocommit: true,
        }
    }

    pub fn with_unit_price(mut self, unit_price: Decimal) -> Self {
        self.unit_price = Some(unit_price);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn by_user(mut self, user_id: i32) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn for_sale(mut self, sale_id: i32) -> Self {
        self.sale_id = Some(sale_id);
        self
    }

    pub fn from_supplier(mut self, supplier_id: i32) -> Self {
        self.supplier_id = Some(supplier_id);
        self
    }

    pub fn deferred_alerts(mut self) -> Self {
        self.autocommit = false;
        self
    }
}

/// What alert evaluation did to a part's open alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertChange {
    Unchanged,
    /// A new alert was opened, or the open one changed kind.
    Raised(AlertKind),
    /// Same kind still applies; snapshot fields were refreshed.
    Refreshed(AlertKind),
    Resolved,
}

#[derive(Debug, Clone)]
pub struct MovementOutcome {
    pub movement: inventory_movement::Model,
    /// The part as written by the movement.
    pub part: part::Model,
    /// `None` when evaluation was deferred to the caller.
    pub alert: Option<AlertChange>,
}

/// Movements and alert changes accumulated by a composite command,
/// published once its transaction has committed.
#[derive(Debug, Default)]
pub struct StockBatch {
    pub movements: Vec<MovementOutcome>,
    pub alerts: Vec<(i32, AlertChange)>,
}

impl StockBatch {
    pub fn push(&mut self, outcome: MovementOutcome) {
        if let Some(change) = outcome.alert {
            self.alerts.push((outcome.part.id, change));
        }
        self.movements.push(outcome);
    }

    /// Parts whose alerts the caller still owes an evaluation.
    pub fn pending_parts(&self) -> BTreeSet<i32> {
        self.movements
            .iter()
            .filter(|m| m.alert.is_none())
            .map(|m| m.part.id)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.movements.is_empty() && self.alerts.is_empty()
    }
}

/// Alert kind that applies to a stock level, by precedence OUT > CRITICAL > LOW > OVERSTOCK.
///
/// LOW and CRITICAL need a positive minimum; OVERSTOCK needs a positive maximum.
pub fn classify_stock(
    stock: Decimal,
    min_stock: Decimal,
    max_stock: Decimal,
    low_stock_factor: Decimal,
) -> Option<AlertKind> {
    if stock <= Decimal::ZERO {
        return Some(AlertKind::Out);
    }
    if min_stock > Decimal::ZERO {
        if stock < min_stock {
            return Some(AlertKind::Critical);
        }
        if stock <= min_stock * low_stock_factor {
            return Some(AlertKind::Low);
        }
    }
    if max_stock > Decimal::ZERO && stock > max_stock {
        return Some(AlertKind::Overstock);
    }
    None
}

fn alert_message(part: &part::Model, kind: AlertKind) -> String {
    match kind {
        AlertKind::Out => format!("{} ({}) is out of stock", part.name, part.code),
        AlertKind::Critical => format!(
            "{} ({}) stock {} is below the minimum of {}",
            part.name, part.code, part.current_stock, part.min_stock
        ),
        AlertKind::Low => format!(
            "{} ({}) stock {} is close to the minimum of {}",
            part.name, part.code, part.current_stock, part.min_stock
        ),
        AlertKind::Overstock => format!(
            "{} ({}) stock {} exceeds the maximum of {}",
            part.name, part.code, part.current_stock, part.max_stock
        ),
        AlertKind::NoMovement => format!("{} ({}) has no recent movements", part.name, part.code),
    }
}

/// Sole writer of part stock and sole producer of movement rows.
#[derive(Clone)]
pub struct InventoryService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    rules: BusinessRules,
}

impl InventoryService {
    /// Creates a new inventory service instance
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>, rules: BusinessRules) -> Self {
        Self {
            db_pool,
            event_sender,
            rules,
        }
    }

    /// Loads a part holding an exclusive row lock until the transaction ends.
    pub(crate) async fn lock_part<C: ConnectionTrait>(
        conn: &C,
        part_id: i32,
    ) -> Result<part::Model, ServiceError> {
        Part::find_by_id(part_id)
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Part", part_id))
    }

    /// Books one movement against the caller's transaction.
    ///
    /// The part row stays locked until that transaction commits, so concurrent
    /// outbound movements on the same part are serialized.
    #[instrument(skip(self, conn), fields(part_id = request.part_id, kind = request.kind.as_str()))]
    pub async fn register_movement<C: ConnectionTrait>(
        &self,
        conn: &C,
        request: MovementRequest,
    ) -> Result<MovementOutcome, ServiceError> {
        let quantity = stock_round(request.quantity);
        ensure_positive(quantity, "quantity")?;

        let part = Self::lock_part(conn, request.part_id).await?;
        if !part.is_usable() {
            return Err(ServiceError::ValidationError(format!(
                "Part {} is inactive or deleted",
                part.code
            )));
        }

        let stock_before = part.current_stock;
        let stock_after = if request.kind.is_inbound() {
            stock_before + quantity
        } else {
            stock_before - quantity
        };
        if stock_after < Decimal::ZERO {
            return Err(ServiceError::InsufficientStock(format!(
                "Part {} has {} in stock, {} requested",
                part.code, stock_before, quantity
            )));
        }

        let unit_price = money_round(request.unit_price.unwrap_or(part.purchase_price));
        ensure_non_negative(unit_price, "unit_price")?;
        let total_cost = line_amount(quantity, unit_price);

        let purchase_price = if request.kind.is_inbound() && stock_after > Decimal::ZERO {
            weighted_average_cost(stock_before, part.purchase_price, quantity, unit_price)
        } else {
            part.purchase_price
        };

        let now = Utc::now();
        let movement = inventory_movement::ActiveModel {
            part_id: Set(part.id),
            kind: Set(request.kind),
            quantity: Set(quantity),
            unit_price: Set(unit_price),
            total_cost: Set(total_cost),
            stock_before: Set(stock_before),
            stock_after: Set(stock_after),
            reference: Set(request.reference),
            reason: Set(request.reason),
            user_id: Set(request.user_id),
            sale_id: Set(request.sale_id),
            supplier_id: Set(request.supplier_id),
            attachment_url: Set(request.attachment_url),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;

        let mut active: part::ActiveModel = part.into();
        active.current_stock = Set(stock_after);
        active.purchase_price = Set(purchase_price);
        active.updated_at = Set(now);
        let part = active.update(conn).await.map_err(ServiceError::db_error)?;

        let alert = if request.autocommit {
            Some(self.evaluate_alerts(conn, &part).await?)
        } else {
            None
        };

        counter!("inventory.movements", 1, "kind" => request.kind.as_str());

        Ok(MovementOutcome {
            movement,
            part,
            alert,
        })
    }

    /// Evaluates alerts for every part the batch touched with deferred evaluation.
    pub async fn settle_alerts<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut StockBatch,
    ) -> Result<(), ServiceError> {
        for part_id in batch.pending_parts() {
            let part = Part::find_by_id(part_id)
                .one(conn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| ServiceError::not_found("Part", part_id))?;
            let change = self.evaluate_alerts(conn, &part).await?;
            batch.alerts.push((part_id, change));
        }
        Ok(())
    }

    /// Opens, refreshes, converts or resolves the part's single open alert
    /// after its stock changed.
    pub async fn evaluate_alerts<C: ConnectionTrait>(
        &self,
        conn: &C,
        part: &part::Model,
    ) -> Result<AlertChange, ServiceError> {
        self.reconcile_alert(conn, part, true).await
    }

    async fn reconcile_alert<C: ConnectionTrait>(
        &self,
        conn: &C,
        part: &part::Model,
        after_movement: bool,
    ) -> Result<AlertChange, ServiceError> {
        let desired = if part.is_usable() {
            classify_stock(
                part.current_stock,
                part.min_stock,
                part.max_stock,
                self.rules.low_stock_factor,
            )
        } else {
            None
        };

        let open = InventoryAlert::find()
            .filter(inventory_alert::Column::PartId.eq(part.id))
            .filter(inventory_alert::Column::ResolvedAt.is_null())
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let now = Utc::now();
        match (open, desired) {
            (None, None) => Ok(AlertChange::Unchanged),
            (None, Some(kind)) => {
                inventory_alert::ActiveModel {
                    part_id: Set(part.id),
                    kind: Set(kind),
                    message: Set(alert_message(part, kind)),
                    stock_snapshot: Set(part.current_stock),
                    min_snapshot: Set(part.min_stock),
                    max_snapshot: Set(part.max_stock),
                    created_at: Set(now),
                    updated_at: Set(now),
                    resolved_at: Set(None),
                    ..Default::default()
                }
                .insert(conn)
                .await
                .map_err(ServiceError::db_error)?;
                Ok(AlertChange::Raised(kind))
            }
            (Some(alert), Some(kind)) => {
                let changed = alert.kind != kind;
                let mut active: inventory_alert::ActiveModel = alert.into();
                active.kind = Set(kind);
                active.message = Set(alert_message(part, kind));
                active.stock_snapshot = Set(part.current_stock);
                active.min_snapshot = Set(part.min_stock);
                active.max_snapshot = Set(part.max_stock);
                active.updated_at = Set(now);
                active.update(conn).await.map_err(ServiceError::db_error)?;
                Ok(if changed {
                    AlertChange::Raised(kind)
                } else {
                    AlertChange::Refreshed(kind)
                })
            }
            (Some(alert), None) => {
                // Only a movement clears a NO_MOVEMENT alert.
                if alert.kind == AlertKind::NoMovement && !after_movement {
                    return Ok(AlertChange::Unchanged);
                }
                let mut active: inventory_alert::ActiveModel = alert.into();
                active.resolved_at = Set(Some(now));
                active.updated_at = Set(now);
                active.update(conn).await.map_err(ServiceError::db_error)?;
                Ok(AlertChange::Resolved)
            }
        }
    }

    /// Publishes the events of a committed batch.
    pub async fn publish(&self, batch: StockBatch) {
        for outcome in &batch.movements {
            self.event_sender
                .send_or_log(Event::StockMovementRecorded {
                    part_id: outcome.part.id,
                    movement_id: outcome.movement.id,
                    kind: outcome.movement.kind.as_str().to_string(),
                    quantity: outcome.movement.quantity,
                    stock_after: outcome.movement.stock_after,
                })
                .await;
        }
        for (part_id, change) in batch.alerts {
            match change {
                AlertChange::Raised(kind) => {
                    counter!("inventory.alerts", 1, "kind" => kind.as_str());
                    self.event_sender
                        .send_or_log(Event::InventoryAlertRaised {
                            part_id,
                            kind: kind.as_str().to_string(),
                        })
                        .await;
                }
                AlertChange::Resolved => {
                    self.event_sender
                        .send_or_log(Event::InventoryAlertResolved { part_id })
                        .await;
                }
                AlertChange::Refreshed(_) | AlertChange::Unchanged => {}
            }
        }
    }

    /// Books a single movement in its own transaction.
    #[instrument(skip(self))]
    pub async fn record_movement(
        &self,
        actor: Actor,
        mut request: MovementRequest,
    ) -> Result<MovementOutcome, ServiceError> {
        request.autocommit = true;
        if request.user_id.is_none() {
            request.user_id = Some(actor.id);
        }

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let outcome = self.register_movement(&txn, request).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            part_id = outcome.part.id,
            movement_id = outcome.movement.id,
            stock_after = %outcome.movement.stock_after,
            "Inventory movement recorded"
        );

        let mut batch = StockBatch::default();
        batch.push(outcome.clone());
        self.publish(batch).await;
        Ok(outcome)
    }

    /// Moves the part to `target_stock` through an ADJUST+ or ADJUST- movement.
    #[instrument(skip(self))]
    pub async fn adjust_inventory(
        &self,
        actor: Actor,
        part_id: i32,
        target_stock: Decimal,
        reason: &str,
    ) -> Result<MovementOutcome, ServiceError> {
        let reason = require_text(reason, "reason")?;
        let target_stock = stock_round(target_stock);
        ensure_non_negative(target_stock, "target_stock")?;

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let part = Self::lock_part(&txn, part_id).await?;
        let delta = target_stock - part.current_stock;
        if delta.is_zero() {
            return Err(ServiceError::ValidationError(format!(
                "Part {} already has {} in stock",
                part.code, part.current_stock
            )));
        }
        let kind = if delta > Decimal::ZERO {
            MovementKind::AdjustIn
        } else {
            MovementKind::AdjustOut
        };

        let outcome = self
            .register_movement(
                &txn,
                MovementRequest::new(part_id, kind, delta.abs())
                    .with_reference("ADJUSTMENT")
                    .with_reason(reason)
                    .by_user(actor.id),
            )
            .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(part_id, target = %target_stock, "Inventory adjusted");

        let mut batch = StockBatch::default();
        batch.push(outcome.clone());
        self.publish(batch).await;
        Ok(outcome)
    }

    async fn ensure_code_free<C: ConnectionTrait>(conn: &C, code: &str) -> Result<(), ServiceError> {
        let taken = Part::find()
            .filter(part::Column::Code.eq(code))
            .filter(part::Column::Deleted.eq(false))
            .count(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if taken > 0 {
            return Err(ServiceError::Conflict(format!(
                "Part code {} already exists",
                code
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_part(&self, actor: Actor, input: NewPart) -> Result<part::Model, ServiceError> {
        input.validate()?;
        let code = require_text(&input.code, "code")?;
        let name = require_text(&input.name, "name")?;
        ensure_non_negative(input.purchase_price, "purchase_price")?;
        ensure_non_negative(input.sale_price, "sale_price")?;
        ensure_non_negative(input.initial_stock, "initial_stock")?;
        ensure_non_negative(input.min_stock, "min_stock")?;
        ensure_non_negative(input.max_stock, "max_stock")?;
        if input.max_stock > Decimal::ZERO && input.min_stock > input.max_stock {
            return Err(ServiceError::ValidationError(
                "min_stock cannot exceed max_stock".to_string(),
            ));
        }

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        Self::ensure_code_free(&txn, &code).await?;

        let now = Utc::now();
        let location = input.location;
        let part = part::ActiveModel {
            code: Set(code),
            name: Set(name),
            category: Set(optional_text(input.category.as_deref())),
            supplier_id: Set(input.supplier_id),
            purchase_price: Set(money_round(input.purchase_price)),
            sale_price: Set(money_round(input.sale_price)),
            current_stock: Set(Decimal::ZERO),
            min_stock: Set(stock_round(input.min_stock)),
            max_stock: Set(stock_round(input.max_stock)),
            location_warehouse: Set(optional_text(location.warehouse.as_deref())),
            location_zone: Set(optional_text(location.zone.as_deref())),
            location_shelf: Set(optional_text(location.shelf.as_deref())),
            location_level: Set(optional_text(location.level.as_deref())),
            location_row: Set(optional_text(location.row.as_deref())),
            consumable: Set(input.consumable),
            active: Set(true),
            deleted: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        let mut batch = StockBatch::default();
        let part = if input.initial_stock > Decimal::ZERO {
            let outcome = self
                .register_movement(
                    &txn,
                    MovementRequest::new(part.id, MovementKind::Entry, input.initial_stock)
                        .with_unit_price(part.purchase_price)
                        .with_reference(INITIAL_STOCK_REFERENCE)
                        .by_user(actor.id),
                )
                .await?;
            let part = outcome.part.clone();
            batch.push(outcome);
            part
        } else {
            part
        };

        txn.commit().await.map_err(ServiceError::db_error)?;
        info!(part_id = part.id, code = %part.code, "Part created");
        self.publish(batch).await;
        Ok(part)
    }

    /// Creates the part standing in for received placeholder merchandise.
    pub(crate) async fn create_placeholder_part<C: ConnectionTrait>(
        &self,
        conn: &C,
        description: &str,
        unit_price: Decimal,
        supplier_id: Option<i32>,
    ) -> Result<part::Model, ServiceError> {
        let taken: HashSet<String> = Part::find()
            .filter(part::Column::Code.starts_with(PLACEHOLDER_PART_CODE))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|p| p.code)
            .collect();
        let code = placeholder_code(&taken);

        let now = Utc::now();
        let part = part::ActiveModel {
            code: Set(code),
            name: Set(description.to_string()),
            category: Set(None),
            supplier_id: Set(supplier_id),
            purchase_price: Set(money_round(unit_price)),
            sale_price: Set(Decimal::ZERO),
            current_stock: Set(Decimal::ZERO),
            min_stock: Set(Decimal::ZERO),
            max_stock: Set(Decimal::ZERO),
            location_warehouse: Set(None),
            location_zone: Set(None),
            location_shelf: Set(None),
            location_level: Set(None),
            location_row: Set(None),
            consumable: Set(false),
            active: Set(true),
            deleted: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;

        warn!(part_id = part.id, code = %part.code, "Placeholder part created on receipt");
        Ok(part)
    }

    #[instrument(skip(self, update))]
    pub async fn update_part(
        &self,
        _actor: Actor,
        part_id: i32,
        update: PartUpdate,
    ) -> Result<part::Model, ServiceError> {
        update.validate()?;

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let part = Self::lock_part(&txn, part_id).await?;
        if part.deleted {
            return Err(ServiceError::ValidationError(format!(
                "Part {} is deleted",
                part.code
            )));
        }

        let min_stock = update.min_stock.map(stock_round).unwrap_or(part.min_stock);
        let max_stock = update.max_stock.map(stock_round).unwrap_or(part.max_stock);
        ensure_non_negative(min_stock, "min_stock")?;
        ensure_non_negative(max_stock, "max_stock")?;
        if max_stock > Decimal::ZERO && min_stock > max_stock {
            return Err(ServiceError::ValidationError(
                "min_stock cannot exceed max_stock".to_string(),
            ));
        }

        let mut active: part::ActiveModel = part.into();
        if let Some(name) = update.name.as_deref() {
            active.name = Set(require_text(name, "name")?);
        }
        if let Some(category) = update.category.as_deref() {
            active.category = Set(optional_text(Some(category)));
        }
        if let Some(supplier_id) = update.supplier_id {
            active.supplier_id = Set(Some(supplier_id));
        }
        if let Some(price) = update.purchase_price {
            ensure_non_negative(price, "purchase_price")?;
            active.purchase_price = Set(money_round(price));
        }
        if let Some(price) = update.sale_price {
            ensure_non_negative(price, "sale_price")?;
            active.sale_price = Set(money_round(price));
        }
        if let Some(location) = update.location {
            active.location_warehouse = Set(optional_text(location.warehouse.as_deref()));
            active.location_zone = Set(optional_text(location.zone.as_deref()));
            active.location_shelf = Set(optional_text(location.shelf.as_deref()));
            active.location_level = Set(optional_text(location.level.as_deref()));
            active.location_row = Set(optional_text(location.row.as_deref()));
        }
        if let Some(consumable) = update.consumable {
            active.consumable = Set(consumable);
        }
        if let Some(flag) = update.active {
            active.active = Set(flag);
        }
        active.min_stock = Set(min_stock);
        active.max_stock = Set(max_stock);
        active.updated_at = Set(Utc::now());
        let part = active.update(&txn).await.map_err(ServiceError::db_error)?;

        let change = self.reconcile_alert(&txn, &part, false).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        self.publish(StockBatch {
            movements: Vec::new(),
            alerts: vec![(part.id, change)],
        })
        .await;
        Ok(part)
    }

    /// Frees the code (`<code>_DEL_<id>`) and retires the part; history keeps pointing at it.
    #[instrument(skip(self))]
    pub async fn soft_delete_part(&self, _actor: Actor, part_id: i32) -> Result<part::Model, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let part = Self::lock_part(&txn, part_id).await?;
        if part.deleted {
            return Err(ServiceError::ValidationError(format!(
                "Part {} is already deleted",
                part.code
            )));
        }

        let code = format!("{}_DEL_{}", part.code, part.id);
        let mut active: part::ActiveModel = part.into();
        active.code = Set(code);
        active.deleted = Set(true);
        active.active = Set(false);
        active.updated_at = Set(Utc::now());
        let part = active.update(&txn).await.map_err(ServiceError::db_error)?;

        // Inactive parts resolve whatever alert was open.
        let change = self.reconcile_alert(&txn, &part, true).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(part_id, code = %part.code, "Part soft-deleted");
        self.publish(StockBatch {
            movements: Vec::new(),
            alerts: vec![(part.id, change)],
        })
        .await;
        Ok(part)
    }

    /// Flags stocked parts whose latest movement is older than the configured window.
    #[instrument(skip(self))]
    pub async fn scan_no_movement(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<inventory_alert::Model>, ServiceError> {
        let window = Duration::days(self.rules.no_movement_days);
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let parts = Part::find()
            .filter(part::Column::Active.eq(true))
            .filter(part::Column::Deleted.eq(false))
            .filter(part::Column::CurrentStock.gt(Decimal::ZERO))
            .order_by_asc(part::Column::Id)
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut raised = Vec::new();
        for part in parts {
            let has_open = InventoryAlert::find()
                .filter(inventory_alert::Column::PartId.eq(part.id))
                .filter(inventory_alert::Column::ResolvedAt.is_null())
                .count(&txn)
                .await
                .map_err(ServiceError::db_error)?
                > 0;
            if has_open {
                continue;
            }

            let last_activity = InventoryMovement::find()
                .filter(inventory_movement::Column::PartId.eq(part.id))
                .order_by_desc(inventory_movement::Column::CreatedAt)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .map(|m| m.created_at)
                .unwrap_or(part.created_at);

            if now - last_activity < window {
                continue;
            }

            let alert = inventory_alert::ActiveModel {
                part_id: Set(part.id),
                kind: Set(AlertKind::NoMovement),
                message: Set(format!(
                    "{} ({}) has had no movements since {}",
                    part.name,
                    part.code,
                    last_activity.format("%Y-%m-%d")
                )),
                stock_snapshot: Set(part.current_stock),
                min_snapshot: Set(part.min_stock),
                max_snapshot: Set(part.max_stock),
                created_at: Set(now),
                updated_at: Set(now),
                resolved_at: Set(None),
                ..Default::default()
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;
            raised.push(alert);
        }

        txn.commit().await.map_err(ServiceError::db_error)?;
        info!(count = raised.len(), "No-movement scan complete");

        self.publish(StockBatch {
            movements: Vec::new(),
            alerts: raised
                .iter()
                .map(|a| (a.part_id, AlertChange::Raised(AlertKind::NoMovement)))
                .collect(),
        })
        .await;
        Ok(raised)
    }

    pub async fn get_part(&self, part_id: i32) -> Result<part::Model, ServiceError> {
        Part::find_by_id(part_id)
            .one(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Part", part_id))
    }

    /// Movement ledger of a part, oldest first.
    pub async fn movements_for_part(
        &self,
        part_id: i32,
    ) -> Result<Vec<inventory_movement::Model>, ServiceError> {
        InventoryMovement::find()
            .filter(inventory_movement::Column::PartId.eq(part_id))
            .order_by_asc(inventory_movement::Column::Id)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn open_alert_for_part(
        &self,
        part_id: i32,
    ) -> Result<Option<inventory_alert::Model>, ServiceError> {
        InventoryAlert::find()
            .filter(inventory_alert::Column::PartId.eq(part_id))
            .filter(inventory_alert::Column::ResolvedAt.is_null())
            .one(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn open_alerts(&self) -> Result<Vec<inventory_alert::Model>, ServiceError> {
        InventoryAlert::find()
            .filter(inventory_alert::Column::ResolvedAt.is_null())
            .order_by_asc(inventory_alert::Column::PartId)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }
}

/// First free code of `PDTE EDITAR`, `PDTE EDITAR-1`, `PDTE EDITAR-2`, ...
fn placeholder_code(taken: &HashSet<String>) -> String {
    if !taken.contains(PLACEHOLDER_PART_CODE) {
        return PLACEHOLDER_PART_CODE.to_string();
    }
    (1..)
        .map(|n| format!("{}-{}", PLACEHOLDER_PART_CODE, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| PLACEHOLDER_PART_CODE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    #[rstest]
    #[case(dec!(0), dec!(5), dec!(20), Some(AlertKind::Out))]
    #[case(dec!(4), dec!(5), dec!(20), Some(AlertKind::Critical))]
    #[case(dec!(5), dec!(5), dec!(20), Some(AlertKind::Low))]
    #[case(dec!(6), dec!(5), dec!(20), Some(AlertKind::Low))]
    #[case(dec!(6.001), dec!(5), dec!(20), None)]
    #[case(dec!(21), dec!(5), dec!(20), Some(AlertKind::Overstock))]
    #[case(dec!(3), dec!(0), dec!(0), None)]
    #[case(dec!(0), dec!(0), dec!(0), Some(AlertKind::Out))]
    fn stock_classification(
        #[case] stock: Decimal,
        #[case] min: Decimal,
        #[case] max: Decimal,
        #[case] expected: Option<AlertKind>,
    ) {
        assert_eq!(classify_stock(stock, min, max, dec!(1.2)), expected);
    }

    #[test]
    fn placeholder_codes_take_the_first_free_suffix() {
        let mut taken = HashSet::new();
        assert_eq!(placeholder_code(&taken), "PDTE EDITAR");
        taken.insert("PDTE EDITAR".to_string());
        taken.insert("PDTE EDITAR-1".to_string());
        assert_eq!(placeholder_code(&taken), "PDTE EDITAR-2");
    }

    #[test]
    fn location_label_skips_unset_levels() {
        let location = PartLocation {
            warehouse: Some("A".into()),
            zone: None,
            shelf: Some("3".into()),
            level: Some("2".into()),
            row: None,
        };
        assert_eq!(location.label(), "A / 3 / 2");
    }

    #[test]
    fn batch_tracks_parts_with_deferred_alerts() {
        let now = Utc::now();
        let part = part::Model {
            id: 7,
            code: "FLT-1".into(),
            name: "Oil filter".into(),
            category: None,
            supplier_id: None,
            purchase_price: dec!(50),
            sale_price: dec!(80),
            current_stock: dec!(7),
            min_stock: dec!(0),
            max_stock: dec!(0),
            location_warehouse: None,
            location_zone: None,
            location_shelf: None,
            location_level: None,
            location_row: None,
            consumable: false,
            active: true,
            deleted: false,
            created_at: now,
            updated_at: now,
        };
        let movement = inventory_movement::Model {
            id: 1,
            part_id: 7,
            kind: MovementKind::Exit,
            quantity: dec!(3),
            unit_price: dec!(50),
            total_cost: dec!(150),
            stock_before: dec!(10),
            stock_after: dec!(7),
            reference: None,
            reason: None,
            user_id: None,
            sale_id: None,
            supplier_id: None,
            attachment_url: None,
            created_at: now,
        };
        let mut batch = StockBatch::default();
        batch.push(MovementOutcome {
            movement,
            part,
            alert: None,
        });
        assert_eq!(batch.pending_parts().into_iter().collect::<Vec<_>>(), vec![7]);
        assert!(batch.alerts.is_empty());
    }
}
