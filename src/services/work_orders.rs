pub mod state;

use crate::{
    db::DbPool,
    entities::{
        client::Entity as Client,
        employee::Entity as Employee,
        inventory_movement::MovementKind,
        part::Entity as Part,
        service_item::Entity as ServiceItem,
        vehicle::Entity as Vehicle,
        work_order::{self, Entity as WorkOrder, WorkOrderPriority, WorkOrderStatus},
        work_order_note::{self, Entity as WorkOrderNote},
        work_order_part_line::{self, Entity as WorkOrderPartLine},
        work_order_service_line::{self, Entity as WorkOrderServiceLine},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    money::{line_amount, money_round, stock_round},
    services::{
        cash_shifts::paid_amount,
        ensure_non_negative, ensure_positive,
        inventory::{InventoryService, MovementRequest, StockBatch},
        numbering::{conflict_on_duplicate, daily_prefix, next_work_order_number, WORK_ORDER_PREFIX},
        optional_text, require_text,
        sales::{is_settled, SalesService},
        Actor,
    },
};
use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use state::Action;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

pub const NOTE_CANCELLATION: &str = "CANCELLATION";
pub const NOTE_AUTH_REJECTED: &str = "AUTH_REJECTED";
pub const NOTE_TEXT: &str = "NOTE";

/// Labour line. Either references the service catalog or carries its own
/// description and price.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceLineInput {
    pub service_item_id: Option<i32>,
    pub description: Option<String>,
    pub quantity: Decimal,
    pub unit_price: Option<Decimal>,
}

impl ServiceLineInput {
    pub fn catalog(service_item_id: i32, quantity: Decimal) -> Self {
        Self {
            service_item_id: Some(service_item_id),
            quantity,
            ..Default::default()
        }
    }

    pub fn free_text(description: impl Into<String>, unit_price: Decimal) -> Self {
        Self {
            service_item_id: None,
            description: Some(description.into()),
            quantity: Decimal::ONE,
            unit_price: Some(unit_price),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartLineInput {
    pub part_id: i32,
    pub quantity: Decimal,
    /// Defaults to the part's sale price, or zero when the customer brings it.
    pub unit_price: Option<Decimal>,
    /// Defaults to the order's `customer_provides_parts`.
    pub customer_supplies: Option<bool>,
}

impl PartLineInput {
    pub fn new(part_id: i32, quantity: Decimal) -> Self {
        Self {
            part_id,
            quantity,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewWorkOrder {
    pub client_id: i32,
    pub vehicle_id: Option<i32>,
    pub priority: Option<WorkOrderPriority>,
    #[validate(length(min = 1, max = 2000))]
    pub initial_diagnosis: String,
    #[validate(length(min = 1, max = 2000))]
    pub customer_complaint: String,
    pub entry_date: Option<DateTime<Utc>>,
    pub promise_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub discount: Decimal,
    #[serde(default)]
    pub requires_authorization: bool,
    #[serde(default)]
    pub customer_provides_parts: bool,
    pub technician_id: Option<i32>,
    #[serde(default)]
    pub services: Vec<ServiceLineInput>,
    #[serde(default)]
    pub parts: Vec<PartLineInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelWorkOrder {
    pub reason: String,
    /// Return debited parts to stock when cancelling an order in process.
    #[serde(default)]
    pub return_parts: bool,
    /// Required when debited parts are kept.
    pub no_return_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkOrderDetail {
    pub order: work_order::Model,
    pub services: Vec<work_order_service_line::Model>,
    pub parts: Vec<work_order_part_line::Model>,
    pub notes: Vec<work_order_note::Model>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkOrderCancellation {
    pub order: work_order::Model,
    /// Part lines whose stock went back to inventory.
    pub returned_lines: Vec<i32>,
    /// Part lines kept without return.
    pub kept_lines: Vec<i32>,
    /// The linked sale after its order lines were removed.
    pub sale: Option<crate::entities::sale::Model>,
    pub sale_cancelled: bool,
    /// Payments on the sale beyond its remaining total.
    pub refund_due: Decimal,
}

struct PricedServiceLine {
    service_item_id: Option<i32>,
    description: String,
    quantity: Decimal,
    unit_price: Decimal,
}

struct PricedPartLine {
    part_id: i32,
    description: String,
    quantity: Decimal,
    unit_price: Decimal,
    customer_supplies: bool,
}

/// The work-order state machine and its line editing.
#[derive(Clone)]
pub struct WorkOrderService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    inventory: InventoryService,
    sales: SalesService,
}

impl WorkOrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        inventory: InventoryService,
        sales: SalesService,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            inventory,
            sales,
        }
    }

    async fn lock_order<C: ConnectionTrait>(conn: &C, order_id: i32) -> Result<work_order::Model, ServiceError> {
        WorkOrder::find_by_id(order_id)
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Work order", order_id))
    }

    async fn ensure_technician<C: ConnectionTrait>(conn: &C, employee_id: i32) -> Result<(), ServiceError> {
        let employee = Employee::find_by_id(employee_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Employee", employee_id))?;
        if !employee.active || !employee.is_technician {
            return Err(ServiceError::ValidationError(format!(
                "Employee {} is not an active technician",
                employee.name
            )));
        }
        Ok(())
    }

    async fn price_service_line<C: ConnectionTrait>(
        conn: &C,
        input: &ServiceLineInput,
    ) -> Result<PricedServiceLine, ServiceError> {
        let quantity = stock_round(input.quantity);
        ensure_positive(quantity, "quantity")?;

        let (description, unit_price) = match input.service_item_id {
            Some(item_id) => {
                let item = ServiceItem::find_by_id(item_id)
                    .one(conn)
                    .await
                    .map_err(ServiceError::db_error)?
                    .ok_or_else(|| ServiceError::not_found("Service item", item_id))?;
                if !item.active {
                    return Err(ServiceError::ValidationError(format!(
                        "Service {} is inactive",
                        item.name
                    )));
                }
                (
                    optional_text(input.description.as_deref()).unwrap_or(item.name),
                    input.unit_price.unwrap_or(item.price),
                )
            }
            None => {
                let description = require_text(
                    input.description.as_deref().unwrap_or_default(),
                    "service description",
                )?;
                let unit_price = input.unit_price.ok_or_else(|| {
                    ServiceError::ValidationError(
                        "A service line without a catalog item needs a price".to_string(),
                    )
                })?;
                (description, unit_price)
            }
        };

        let unit_price = money_round(unit_price);
        ensure_non_negative(unit_price, "unit_price")?;
        Ok(PricedServiceLine {
            service_item_id: input.service_item_id,
            description,
            quantity,
            unit_price,
        })
    }

    async fn price_part_line<C: ConnectionTrait>(
        conn: &C,
        input: &PartLineInput,
        customer_provides_parts: bool,
    ) -> Result<PricedPartLine, ServiceError> {
        let quantity = stock_round(input.quantity);
        ensure_positive(quantity, "quantity")?;

        let part = Part::find_by_id(input.part_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Part", input.part_id))?;
        if !part.is_usable() {
            return Err(ServiceError::ValidationError(format!(
                "Part {} is inactive or deleted",
                part.code
            )));
        }

        let customer_supplies = input.customer_supplies.unwrap_or(customer_provides_parts);
        let default_price = if customer_supplies {
            Decimal::ZERO
        } else {
            part.sale_price
        };
        let unit_price = money_round(input.unit_price.unwrap_or(default_price));
        ensure_non_negative(unit_price, "unit_price")?;

        Ok(PricedPartLine {
            part_id: part.id,
            description: part.name,
            quantity,
            unit_price,
            customer_supplies,
        })
    }

    async fn insert_service_line<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
        line: PricedServiceLine,
    ) -> Result<work_order_service_line::Model, ServiceError> {
        work_order_service_line::ActiveModel {
            work_order_id: Set(order_id),
            service_item_id: Set(line.service_item_id),
            description: Set(line.description),
            quantity: Set(line.quantity),
            unit_price: Set(line.unit_price),
            subtotal: Set(line_amount(line.quantity, line.unit_price)),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)
    }

    async fn insert_part_line<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
        line: PricedPartLine,
    ) -> Result<work_order_part_line::Model, ServiceError> {
        work_order_part_line::ActiveModel {
            work_order_id: Set(order_id),
            part_id: Set(line.part_id),
            description: Set(line.description),
            quantity: Set(line.quantity),
            unit_price: Set(line.unit_price),
            subtotal: Set(line_amount(line.quantity, line.unit_price)),
            customer_supplies: Set(line.customer_supplies),
            stock_debited: Set(false),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)
    }

    async fn service_lines<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
    ) -> Result<Vec<work_order_service_line::Model>, ServiceError> {
        WorkOrderServiceLine::find()
            .filter(work_order_service_line::Column::WorkOrderId.eq(order_id))
            .order_by_asc(work_order_service_line::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn part_lines<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
    ) -> Result<Vec<work_order_part_line::Model>, ServiceError> {
        WorkOrderPartLine::find()
            .filter(work_order_part_line::Column::WorkOrderId.eq(order_id))
            .order_by_asc(work_order_part_line::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Recomputes subtotals and total, re-checking the line and discount invariants.
    async fn recompute_totals<C: ConnectionTrait>(
        conn: &C,
        order: work_order::Model,
    ) -> Result<work_order::Model, ServiceError> {
        let services = Self::service_lines(conn, order.id).await?;
        let parts = Self::part_lines(conn, order.id).await?;
        if services.is_empty() && parts.is_empty() {
            return Err(ServiceError::ValidationError(
                "A work order needs at least one service or part line".to_string(),
            ));
        }

        let subtotal_services = money_round(services.iter().map(|l| l.subtotal).sum());
        let subtotal_parts = money_round(parts.iter().map(|l| l.subtotal).sum());
        if order.discount > subtotal_services + subtotal_parts {
            return Err(ServiceError::ValidationError(format!(
                "Discount {} exceeds the subtotal {}",
                order.discount,
                subtotal_services + subtotal_parts
            )));
        }
        let total = money_round(subtotal_services + subtotal_parts - order.discount);

        let mut active: work_order::ActiveModel = order.into();
        active.subtotal_services = Set(subtotal_services);
        active.subtotal_parts = Set(subtotal_parts);
        active.total = Set(total);
        active.updated_at = Set(Utc::now());
        active.update(conn).await.map_err(ServiceError::db_error)
    }

    async fn insert_note<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
        kind: &str,
        body: serde_json::Value,
        author_id: i32,
    ) -> Result<work_order_note::Model, ServiceError> {
        work_order_note::ActiveModel {
            work_order_id: Set(order_id),
            kind: Set(kind.to_string()),
            body: Set(body),
            author_id: Set(Some(author_id)),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)
    }

    async fn detail<C: ConnectionTrait>(conn: &C, order: work_order::Model) -> Result<WorkOrderDetail, ServiceError> {
        let services = Self::service_lines(conn, order.id).await?;
        let parts = Self::part_lines(conn, order.id).await?;
        let notes = WorkOrderNote::find()
            .filter(work_order_note::Column::WorkOrderId.eq(order.id))
            .order_by_asc(work_order_note::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(WorkOrderDetail {
            order,
            services,
            parts,
            notes,
        })
    }

    async fn publish_transition(&self, order_id: i32, old: WorkOrderStatus, new: WorkOrderStatus) {
        if old == new {
            return;
        }
        counter!("work_orders.transitions", 1, "to" => new.as_str());
        self.event_sender
            .send_or_log(Event::WorkOrderStatusChanged {
                work_order_id: order_id,
                old_status: old.as_str().to_string(),
                new_status: new.as_str().to_string(),
            })
            .await;
    }

    /// Locks the order, checks `action` against its status and lets `stamp`
    /// write the new state.
    async fn transition<F>(&self, order_id: i32, action: Action, stamp: F) -> Result<work_order::Model, ServiceError>
    where
        F: FnOnce(&work_order::Model, &mut work_order::ActiveModel) -> Result<(), ServiceError> + Send,
    {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        state::ensure(order.status, action)?;
        let old_status = order.status;

        let mut active: work_order::ActiveModel = order.clone().into();
        stamp(&order, &mut active)?;
        active.updated_at = Set(Utc::now());
        let order = active.update(&txn).await.map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order = %order.number, status = %order.status, "Work order updated");
        self.publish_transition(order.id, old_status, order.status).await;
        Ok(order)
    }

    #[instrument(skip(self, input), fields(client_id = input.client_id))]
    pub async fn create(&self, actor: Actor, input: NewWorkOrder) -> Result<WorkOrderDetail, ServiceError> {
        input.validate()?;
        let initial_diagnosis = require_text(&input.initial_diagnosis, "initial_diagnosis")?;
        let customer_complaint = require_text(&input.customer_complaint, "customer_complaint")?;
        if input.services.is_empty() && input.parts.is_empty() {
            return Err(ServiceError::ValidationError(
                "A work order needs at least one service or part line".to_string(),
            ));
        }
        let discount = money_round(input.discount);
        ensure_non_negative(discount, "discount")?;

        let now = Utc::now();
        let entry_date = input.entry_date.unwrap_or(now);
        if let Some(promise) = input.promise_date {
            if promise < entry_date {
                return Err(ServiceError::ValidationError(
                    "promise_date cannot be before entry_date".to_string(),
                ));
            }
        }

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let client = Client::find_by_id(input.client_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|c| !c.deleted)
            .ok_or_else(|| ServiceError::not_found("Client", input.client_id))?;
        if let Some(vehicle_id) = input.vehicle_id {
            let vehicle = Vehicle::find_by_id(vehicle_id)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .filter(|v| !v.deleted)
                .ok_or_else(|| ServiceError::not_found("Vehicle", vehicle_id))?;
            if vehicle.client_id != client.id {
                return Err(ServiceError::ValidationError(format!(
                    "Vehicle {} does not belong to client {}",
                    vehicle_id, client.id
                )));
            }
        }
        if let Some(technician_id) = input.technician_id {
            Self::ensure_technician(&txn, technician_id).await?;
        }

        let number = next_work_order_number(&txn, now.date_naive()).await?;
        let order = work_order::ActiveModel {
            number: Set(number),
            client_id: Set(client.id),
            vehicle_id: Set(input.vehicle_id),
            status: Set(WorkOrderStatus::Pending),
            priority: Set(input.priority.unwrap_or(WorkOrderPriority::Normal)),
            initial_diagnosis: Set(initial_diagnosis),
            customer_complaint: Set(customer_complaint),
            entry_date: Set(entry_date),
            promise_date: Set(input.promise_date),
            subtotal_services: Set(Decimal::ZERO),
            subtotal_parts: Set(Decimal::ZERO),
            discount: Set(discount),
            total: Set(Decimal::ZERO),
            requires_authorization: Set(input.requires_authorization),
            authorized: Set(false),
            customer_provides_parts: Set(input.customer_provides_parts),
            technician_id: Set(input.technician_id),
            created_by: Set(actor.id),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|e| conflict_on_duplicate(e, "work order number"))?;

        for line in &input.services {
            let priced = Self::price_service_line(&txn, line).await?;
            Self::insert_service_line(&txn, order.id, priced).await?;
        }
        for line in &input.parts {
            let priced = Self::price_part_line(&txn, line, input.customer_provides_parts).await?;
            Self::insert_part_line(&txn, order.id, priced).await?;
        }
        let order = Self::recompute_totals(&txn, order).await?;
        let detail = Self::detail(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order = %detail.order.number, total = %detail.order.total, "Work order created");
        counter!("work_orders.created", 1);
        self.event_sender
            .send_or_log(Event::WorkOrderCreated(detail.order.id))
            .await;
        Ok(detail)
    }

    /// Swaps every line of a PENDING order in one go.
    #[instrument(skip(self, services, parts))]
    pub async fn replace_lines(
        &self,
        _actor: Actor,
        order_id: i32,
        services: Vec<ServiceLineInput>,
        parts: Vec<PartLineInput>,
    ) -> Result<WorkOrderDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        state::ensure(order.status, Action::ReplaceLines)?;

        WorkOrderServiceLine::delete_many()
            .filter(work_order_service_line::Column::WorkOrderId.eq(order.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        WorkOrderPartLine::delete_many()
            .filter(work_order_part_line::Column::WorkOrderId.eq(order.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        for line in &services {
            let priced = Self::price_service_line(&txn, line).await?;
            Self::insert_service_line(&txn, order.id, priced).await?;
        }
        for line in &parts {
            let priced = Self::price_part_line(&txn, line, order.customer_provides_parts).await?;
            Self::insert_part_line(&txn, order.id, priced).await?;
        }
        let order = Self::recompute_totals(&txn, order).await?;
        let detail = Self::detail(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order = %detail.order.number, "Work order lines replaced");
        Ok(detail)
    }

    #[instrument(skip(self, input))]
    pub async fn add_service_line(
        &self,
        _actor: Actor,
        order_id: i32,
        input: ServiceLineInput,
    ) -> Result<WorkOrderDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        state::ensure(order.status, Action::EditLines)?;
        let priced = Self::price_service_line(&txn, &input).await?;
        Self::insert_service_line(&txn, order.id, priced).await?;
        let order = Self::recompute_totals(&txn, order).await?;
        let detail = Self::detail(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(detail)
    }

    #[instrument(skip(self))]
    pub async fn remove_service_line(
        &self,
        _actor: Actor,
        order_id: i32,
        line_id: i32,
    ) -> Result<WorkOrderDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        state::ensure(order.status, Action::EditLines)?;
        let line = WorkOrderServiceLine::find_by_id(line_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|l| l.work_order_id == order.id)
            .ok_or_else(|| ServiceError::not_found("Service line", line_id))?;
        line.delete(&txn).await.map_err(ServiceError::db_error)?;

        let order = Self::recompute_totals(&txn, order).await?;
        let detail = Self::detail(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(detail)
    }

    /// Adds a part line; on an order in process the stock leaves immediately.
    #[instrument(skip(self, input))]
    pub async fn add_part_line(
        &self,
        actor: Actor,
        order_id: i32,
        input: PartLineInput,
    ) -> Result<WorkOrderDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        state::ensure(order.status, Action::EditLines)?;
        let priced = Self::price_part_line(&txn, &input, order.customer_provides_parts).await?;
        let line = Self::insert_part_line(&txn, order.id, priced).await?;

        let mut batch = StockBatch::default();
        if order.status == WorkOrderStatus::InProcess && !line.customer_supplies {
            self.debit_line(&txn, &order, line, actor, &mut batch).await?;
        }
        self.inventory.settle_alerts(&txn, &mut batch).await?;

        let order = Self::recompute_totals(&txn, order).await?;
        let detail = Self::detail(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        self.inventory.publish(batch).await;
        Ok(detail)
    }

    /// Removes a part line, returning its stock if it had been debited.
    #[instrument(skip(self))]
    pub async fn remove_part_line(
        &self,
        actor: Actor,
        order_id: i32,
        line_id: i32,
    ) -> Result<WorkOrderDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        state::ensure(order.status, Action::EditLines)?;
        let line = WorkOrderPartLine::find_by_id(line_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|l| l.work_order_id == order.id)
            .ok_or_else(|| ServiceError::not_found("Part line", line_id))?;

        let mut batch = StockBatch::default();
        if line.stock_debited {
            let outcome = self
                .inventory
                .register_movement(
                    &txn,
                    MovementRequest::new(line.part_id, MovementKind::Entry, line.quantity)
                        .with_reference(order.number.clone())
                        .with_reason("Part removed from work order")
                        .by_user(actor.id)
                        .deferred_alerts(),
                )
                .await?;
            batch.push(outcome);
        }
        line.delete(&txn).await.map_err(ServiceError::db_error)?;
        self.inventory.settle_alerts(&txn, &mut batch).await?;

        let order = Self::recompute_totals(&txn, order).await?;
        let detail = Self::detail(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        self.inventory.publish(batch).await;
        Ok(detail)
    }

    /// EXIT at the part's weighted-average cost, then flag the line as debited.
    async fn debit_line<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: &work_order::Model,
        line: work_order_part_line::Model,
        actor: Actor,
        batch: &mut StockBatch,
    ) -> Result<(), ServiceError> {
        let outcome = self
            .inventory
            .register_movement(
                conn,
                MovementRequest::new(line.part_id, MovementKind::Exit, line.quantity)
                    .with_reference(order.number.clone())
                    .by_user(actor.id)
                    .deferred_alerts(),
            )
            .await?;
        batch.push(outcome);

        let mut active: work_order_part_line::ActiveModel = line.into();
        active.stock_debited = Set(true);
        active.update(conn).await.map_err(ServiceError::db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn mark_quotation_sent(&self, actor: Actor, order_id: i32) -> Result<work_order::Model, ServiceError> {
        self.transition(order_id, Action::SendQuotation, |order, active| {
            active.status = Set(state::quote_target(order.requires_authorization));
            active.quoted_by = Set(Some(actor.id));
            active.quoted_at = Set(Some(Utc::now()));
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn mark_waiting_parts(&self, _actor: Actor, order_id: i32) -> Result<work_order::Model, ServiceError> {
        self.transition(order_id, Action::WaitForParts, |_, active| {
            active.status = Set(WorkOrderStatus::WaitingParts);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn assign_technician(
        &self,
        _actor: Actor,
        order_id: i32,
        technician_id: i32,
    ) -> Result<work_order::Model, ServiceError> {
        Self::ensure_technician(self.db_pool.as_ref(), technician_id).await?;
        self.transition(order_id, Action::AssignTechnician, |_, active| {
            active.technician_id = Set(Some(technician_id));
            Ok(())
        })
        .await
    }

    /// Records the customer's answer to the quotation. Approval sends the order
    /// back to PENDING, ready to start; rejection cancels it.
    #[instrument(skip(self, reason))]
    pub async fn authorize(
        &self,
        actor: Actor,
        order_id: i32,
        approved: bool,
        reason: Option<String>,
    ) -> Result<work_order::Model, ServiceError> {
        let reason = optional_text(reason.as_deref());
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        state::ensure(order.status, Action::Authorize)?;
        if !order.requires_authorization {
            return Err(ServiceError::ValidationError(format!(
                "Work order {} does not require authorization",
                order.number
            )));
        }
        let old_status = order.status;
        let now = Utc::now();

        let mut active: work_order::ActiveModel = order.clone().into();
        active.authorized_by = Set(Some(actor.id));
        active.authorized_at = Set(Some(now));
        active.updated_at = Set(now);
        if approved {
            active.status = Set(WorkOrderStatus::Pending);
            active.authorized = Set(true);
        } else {
            let reason = reason.ok_or_else(|| {
                ServiceError::ValidationError("A rejection needs a reason".to_string())
            })?;
            active.status = Set(WorkOrderStatus::Cancelled);
            active.authorized = Set(false);
            active.cancelled_by = Set(Some(actor.id));
            active.cancelled_at = Set(Some(now));
            active.cancellation_reason = Set(Some(reason.clone()));
            Self::insert_note(
                &txn,
                order.id,
                NOTE_AUTH_REJECTED,
                json!({ "reason": reason, "previous_status": old_status.as_str() }),
                actor.id,
            )
            .await?;
        }
        let order = active.update(&txn).await.map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order = %order.number, approved, "Work order authorization recorded");
        self.publish_transition(order.id, old_status, order.status).await;
        Ok(order)
    }

    /// Starts work: every shop-stock part line leaves inventory at its
    /// weighted-average cost.
    #[instrument(skip(self))]
    pub async fn start(&self, actor: Actor, order_id: i32) -> Result<WorkOrderDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        state::ensure(order.status, Action::Start)?;
        if order.requires_authorization && !order.authorized {
            return Err(ServiceError::IllegalTransition(format!(
                "Work order {} is waiting for customer authorization",
                order.number
            )));
        }
        let technician_id = match order.technician_id {
            Some(id) => id,
            None if actor.is_technician => actor.id,
            None => {
                return Err(ServiceError::ValidationError(format!(
                    "Work order {} has no technician assigned",
                    order.number
                )))
            }
        };

        let mut batch = StockBatch::default();
        for line in Self::part_lines(&txn, order.id).await? {
            if line.customer_supplies || line.stock_debited {
                continue;
            }
            self.debit_line(&txn, &order, line, actor, &mut batch).await?;
        }
        self.inventory.settle_alerts(&txn, &mut batch).await?;

        let old_status = order.status;
        let now = Utc::now();
        let mut active: work_order::ActiveModel = order.into();
        active.status = Set(WorkOrderStatus::InProcess);
        active.technician_id = Set(Some(technician_id));
        active.started_by = Set(Some(actor.id));
        active.started_at = Set(Some(now));
        active.updated_at = Set(now);
        let order = active.update(&txn).await.map_err(ServiceError::db_error)?;
        let detail = Self::detail(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            order = %detail.order.number,
            movements = batch.movements.len(),
            "Work order started"
        );
        self.inventory.publish(batch).await;
        self.publish_transition(detail.order.id, old_status, detail.order.status)
            .await;
        Ok(detail)
    }

    #[instrument(skip(self))]
    pub async fn finish(&self, actor: Actor, order_id: i32) -> Result<work_order::Model, ServiceError> {
        self.transition(order_id, Action::Finish, |_, active| {
            active.status = Set(WorkOrderStatus::Completed);
            active.finished_by = Set(Some(actor.id));
            active.finished_at = Set(Some(Utc::now()));
            Ok(())
        })
        .await
    }

    /// Hands the vehicle back. The order's sale must be fully paid.
    #[instrument(skip(self))]
    pub async fn deliver(&self, actor: Actor, order_id: i32) -> Result<work_order::Model, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        state::ensure(order.status, Action::Deliver)?;
        let sale = SalesService::active_sale_for_order(&txn, order.id)
            .await?
            .ok_or_else(|| {
                ServiceError::IllegalTransition(format!(
                    "Work order {} has not been invoiced",
                    order.number
                ))
            })?;
        let paid = paid_amount(&txn, sale.id).await?;
        if !is_settled(sale.total, paid) {
            return Err(ServiceError::IllegalTransition(format!(
                "Work order {} has an outstanding balance of {}",
                order.number,
                money_round(sale.total - paid)
            )));
        }

        let old_status = order.status;
        let now = Utc::now();
        let mut active: work_order::ActiveModel = order.into();
        active.status = Set(WorkOrderStatus::Delivered);
        active.delivered_by = Set(Some(actor.id));
        active.delivered_at = Set(Some(now));
        active.updated_at = Set(now);
        let order = active.update(&txn).await.map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order = %order.number, "Work order delivered");
        self.publish_transition(order.id, old_status, order.status).await;
        Ok(order)
    }

    /// Cancels the order, settling debited parts and detaching its sale.
    #[instrument(skip(self, request))]
    pub async fn cancel(
        &self,
        actor: Actor,
        order_id: i32,
        request: CancelWorkOrder,
    ) -> Result<WorkOrderCancellation, ServiceError> {
        let reason = require_text(&request.reason, "reason")?;
        let no_return_reason = optional_text(request.no_return_reason.as_deref());

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        state::ensure(order.status, Action::Cancel)?;
        let old_status = order.status;

        let mut batch = StockBatch::default();
        let mut returned_lines = Vec::new();
        let mut kept = Vec::new();
        if order.status == WorkOrderStatus::InProcess {
            let debited: Vec<work_order_part_line::Model> = Self::part_lines(&txn, order.id)
                .await?
                .into_iter()
                .filter(|l| l.stock_debited && !l.customer_supplies)
                .collect();

            if request.return_parts {
                for line in debited {
                    let outcome = self
                        .inventory
                        .register_movement(
                            &txn,
                            MovementRequest::new(line.part_id, MovementKind::Entry, line.quantity)
                                .with_reference(order.number.clone())
                                .with_reason(format!("Work order cancelled: {}", reason))
                                .by_user(actor.id)
                                .deferred_alerts(),
                        )
                        .await?;
                    batch.push(outcome);
                    returned_lines.push(line.id);

                    let mut active: work_order_part_line::ActiveModel = line.into();
                    active.stock_debited = Set(false);
                    active.update(&txn).await.map_err(ServiceError::db_error)?;
                }
            } else if !debited.is_empty() {
                if no_return_reason.is_none() {
                    return Err(ServiceError::ValidationError(
                        "Keeping debited parts requires a no-return reason".to_string(),
                    ));
                }
                kept = debited;
            }
        }
        self.inventory.settle_alerts(&txn, &mut batch).await?;

        let detached = match SalesService::active_sale_for_order(&txn, order.id).await? {
            Some(sale) => Some(
                self.sales
                    .detach_order_lines(
                        &txn,
                        sale,
                        actor,
                        false,
                        &format!("Work order {} cancelled", order.number),
                    )
                    .await?,
            ),
            None => None,
        };

        let kept_parts: Vec<serde_json::Value> = kept
            .iter()
            .map(|l| json!({ "line_id": l.id, "part_id": l.part_id, "description": l.description, "quantity": l.quantity }))
            .collect();
        Self::insert_note(
            &txn,
            order.id,
            NOTE_CANCELLATION,
            json!({
                "reason": reason,
                "previous_status": old_status.as_str(),
                "returned_lines": returned_lines,
                "no_return_reason": if kept.is_empty() { None } else { no_return_reason },
                "kept_parts": kept_parts,
            }),
            actor.id,
        )
        .await?;

        let now = Utc::now();
        let mut active: work_order::ActiveModel = order.into();
        active.status = Set(WorkOrderStatus::Cancelled);
        active.cancelled_by = Set(Some(actor.id));
        active.cancelled_at = Set(Some(now));
        active.cancellation_reason = Set(Some(reason));
        active.updated_at = Set(now);
        let order = active.update(&txn).await.map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        if !kept.is_empty() {
            warn!(order = %order.number, kept = kept.len(), "Work order cancelled without returning parts");
        } else {
            info!(order = %order.number, "Work order cancelled");
        }
        self.inventory.publish(batch).await;
        self.publish_transition(order.id, old_status, order.status).await;

        let (sale, sale_cancelled, refund_due) = match detached {
            Some(detached) => {
                self.event_sender
                    .send_or_log(Event::SaleUpdated(detached.sale.id))
                    .await;
                if detached.sale.status != detached.previous_status {
                    self.event_sender
                        .send_or_log(Event::SaleStatusChanged {
                            sale_id: detached.sale.id,
                            old_status: detached.previous_status.as_str().to_string(),
                            new_status: detached.sale.status.as_str().to_string(),
                        })
                        .await;
                }
                if detached.refund_due > Decimal::ZERO {
                    self.event_sender
                        .send_or_log(Event::RefundDue {
                            sale_id: detached.sale.id,
                            amount: detached.refund_due,
                        })
                        .await;
                }
                (Some(detached.sale), detached.cancelled, detached.refund_due)
            }
            None => (None, false, Decimal::ZERO),
        };

        Ok(WorkOrderCancellation {
            order,
            returned_lines,
            kept_lines: kept.iter().map(|l| l.id).collect(),
            sale,
            sale_cancelled,
            refund_due,
        })
    }

    #[instrument(skip(self, text))]
    pub async fn add_note(
        &self,
        actor: Actor,
        order_id: i32,
        text: &str,
    ) -> Result<work_order_note::Model, ServiceError> {
        let text = require_text(text, "note")?;
        let db = self.db_pool.as_ref();
        WorkOrder::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Work order", order_id))?;
        Self::insert_note(db, order_id, NOTE_TEXT, json!({ "text": text }), actor.id).await
    }

    /// Hard delete of a cancelled order that no live sale references.
    #[instrument(skip(self))]
    pub async fn delete_work_order(&self, _actor: Actor, order_id: i32) -> Result<(), ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        state::ensure(order.status, Action::Delete)?;
        if let Some(sale) = SalesService::active_sale_for_order(&txn, order.id).await? {
            return Err(ServiceError::IllegalTransition(format!(
                "Work order {} is linked to sale {}",
                order.number, sale.id
            )));
        }

        WorkOrderServiceLine::delete_many()
            .filter(work_order_service_line::Column::WorkOrderId.eq(order.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        WorkOrderPartLine::delete_many()
            .filter(work_order_part_line::Column::WorkOrderId.eq(order.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        WorkOrderNote::delete_many()
            .filter(work_order_note::Column::WorkOrderId.eq(order.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        let number = order.number.clone();
        order.delete(&txn).await.map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order = %number, "Work order deleted");
        self.event_sender
            .send_or_log(Event::WorkOrderDeleted(order_id))
            .await;
        Ok(())
    }

    pub async fn get(&self, order_id: i32) -> Result<WorkOrderDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let order = WorkOrder::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Work order", order_id))?;
        Self::detail(db, order).await
    }

    pub async fn notes(&self, order_id: i32) -> Result<Vec<work_order_note::Model>, ServiceError> {
        WorkOrderNote::find()
            .filter(work_order_note::Column::WorkOrderId.eq(order_id))
            .order_by_asc(work_order_note::Column::Id)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    /// Orders numbered on `day`.
    pub async fn count_for_day(&self, day: NaiveDate) -> Result<u64, ServiceError> {
        let prefix = daily_prefix(WORK_ORDER_PREFIX, day);
        WorkOrder::find()
            .filter(work_order::Column::Number.starts_with(&prefix))
            .count(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn line_input_builders() {
        let labour = ServiceLineInput::free_text("Brake bleed", dec!(150));
        assert_eq!(labour.quantity, Decimal::ONE);
        assert_eq!(labour.unit_price, Some(dec!(150)));
        assert!(labour.service_item_id.is_none());

        let part = PartLineInput::new(3, dec!(2));
        assert_eq!(part.customer_supplies, None);
        assert_eq!(ServiceLineInput::catalog(9, dec!(1)).service_item_id, Some(9));
    }
}
