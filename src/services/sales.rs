use crate::{
    config::BusinessRules,
    db::DbPool,
    entities::{
        inventory_movement::MovementKind,
        part::Entity as Part,
        sale::{self, Entity as Sale, SaleStatus},
        sale_cancellation_detail::{self, Entity as SaleCancellationDetail},
        sale_line::{self, Entity as SaleLine, LineKind},
        service_item::Entity as ServiceItem,
        work_order::{self, Entity as WorkOrder, WorkOrderStatus},
        work_order_part_line::{self, Entity as WorkOrderPartLine},
        work_order_service_line::{self, Entity as WorkOrderServiceLine},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    money::{apply_invoice_factor, exceeds, line_amount, money_round, stock_round},
    services::{
        cash_shifts::paid_amount,
        commissions::CommissionService,
        ensure_non_negative, ensure_positive, optional_text, require_text,
        inventory::{InventoryService, MovementRequest, StockBatch},
        Actor,
    },
};
use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A line of a manual sale. `item_id` is a part for PRODUCT lines and a
/// labour catalog entry for SERVICE lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleLineInput {
    pub kind: LineKind,
    pub item_id: i32,
    pub quantity: Decimal,
    /// Defaults to the catalog sale price.
    pub unit_price: Option<Decimal>,
    pub description: Option<String>,
}

impl SaleLineInput {
    pub fn product(part_id: i32, quantity: Decimal) -> Self {
        Self {
            kind: LineKind::Product,
            item_id: part_id,
            quantity,
            unit_price: None,
            description: None,
        }
    }

    pub fn service(service_item_id: i32, quantity: Decimal) -> Self {
        Self {
            kind: LineKind::Service,
            item_id: service_item_id,
            quantity,
            unit_price: None,
            description: None,
        }
    }

    pub fn at_price(mut self, unit_price: Decimal) -> Self {
        self.unit_price = Some(unit_price);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSale {
    pub client_id: Option<i32>,
    pub invoice_required: bool,
    pub sale_date: Option<DateTime<Utc>>,
    pub lines: Vec<SaleLineInput>,
}

/// Edit of a sale. `lines` replaces every line not copied from a work order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaleUpdate {
    pub client_id: Option<i32>,
    pub invoice_required: Option<bool>,
    pub lines: Option<Vec<SaleLineInput>>,
}

/// What to do with one PRODUCT line of a sale being cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineDisposition {
    pub sale_line_id: i32,
    /// Returned to stock through an ENTRY movement.
    pub quantity_reusable: Decimal,
    /// Written off; recorded on the cancellation detail only.
    pub quantity_shrinkage: Decimal,
    pub shrinkage_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelSale {
    pub reason: String,
    #[serde(default)]
    pub dispositions: Vec<LineDisposition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaleDetail {
    pub sale: sale::Model,
    pub lines: Vec<sale_line::Model>,
    pub paid: Decimal,
    pub balance: Decimal,
}

impl SaleDetail {
    /// Fully paid: nothing is left to pay.
    pub fn is_settled(&self) -> bool {
        is_settled(self.sale.total, self.paid)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelledSale {
    pub sale: sale::Model,
    pub details: Vec<sale_cancellation_detail::Model>,
}

/// Result of removing a work order's lines from its sale.
#[derive(Debug, Clone)]
pub struct Detached {
    pub sale: sale::Model,
    pub previous_status: SaleStatus,
    /// The sale had nothing else on it and was cancelled.
    pub cancelled: bool,
    pub removed_commissions: u64,
    /// Paid beyond what is left to charge; owed back to the customer.
    pub refund_due: Decimal,
}

/// Nothing is left to pay. A zero total is settled without payments.
pub fn is_settled(total: Decimal, paid: Decimal) -> bool {
    !exceeds(total, paid)
}

/// Line data ready to insert.
#[derive(Debug, Clone)]
struct PricedLine {
    kind: LineKind,
    item_id: Option<i32>,
    description: String,
    quantity: Decimal,
    unit_price: Decimal,
    subtotal: Decimal,
    origin_order_id: Option<i32>,
    customer_supplied: bool,
}

#[derive(Clone)]
pub struct SalesService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    inventory: InventoryService,
    commissions: CommissionService,
    rules: BusinessRules,
}

impl SalesService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        inventory: InventoryService,
        commissions: CommissionService,
        rules: BusinessRules,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            inventory,
            commissions,
            rules,
        }
    }

    async fn lock_sale<C: ConnectionTrait>(conn: &C, sale_id: i32) -> Result<sale::Model, ServiceError> {
        Sale::find_by_id(sale_id)
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Sale", sale_id))
    }

    fn ensure_not_cancelled(sale: &sale::Model) -> Result<(), ServiceError> {
        if sale.status == SaleStatus::Cancelled {
            return Err(ServiceError::IllegalTransition(format!(
                "Sale {} is cancelled",
                sale.id
            )));
        }
        Ok(())
    }

    /// The non-cancelled sale of a work order, if any.
    pub async fn active_sale_for_order<C: ConnectionTrait>(
        conn: &C,
        work_order_id: i32,
    ) -> Result<Option<sale::Model>, ServiceError> {
        Sale::find()
            .filter(sale::Column::WorkOrderId.eq(work_order_id))
            .filter(sale::Column::Status.ne(SaleStatus::Cancelled))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn price_manual_lines<C: ConnectionTrait>(
        conn: &C,
        inputs: &[SaleLineInput],
    ) -> Result<Vec<PricedLine>, ServiceError> {
        if inputs.is_empty() {
            return Err(ServiceError::ValidationError(
                "A sale needs at least one line".to_string(),
            ));
        }

        let mut priced = Vec::with_capacity(inputs.len());
        for input in inputs {
            let quantity = stock_round(input.quantity);
            ensure_positive(quantity, "quantity")?;

            let (default_price, default_description) = match input.kind {
                LineKind::Product => {
                    let part = Part::find_by_id(input.item_id)
                        .one(conn)
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| ServiceError::not_found("Part", input.item_id))?;
                    if !part.is_usable() {
                        return Err(ServiceError::ValidationError(format!(
                            "Part {} is inactive or deleted",
                            part.code
                        )));
                    }
                    (part.sale_price, part.name)
                }
                LineKind::Service => {
                    let item = ServiceItem::find_by_id(input.item_id)
                        .one(conn)
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| ServiceError::not_found("Service item", input.item_id))?;
                    if !item.active {
                        return Err(ServiceError::ValidationError(format!(
                            "Service {} is inactive",
                            item.name
                        )));
                    }
                    (item.price, item.name)
                }
            };

            let unit_price = money_round(input.unit_price.unwrap_or(default_price));
            ensure_non_negative(unit_price, "unit_price")?;
            priced.push(PricedLine {
                kind: input.kind,
                item_id: Some(input.item_id),
                description: optional_text(input.description.as_deref())
                    .unwrap_or(default_description),
                quantity,
                unit_price,
                subtotal: line_amount(quantity, unit_price),
                origin_order_id: None,
                customer_supplied: false,
            });
        }
        Ok(priced)
    }

    /// Sale lines mirroring every line of a work order.
    async fn price_order_lines<C: ConnectionTrait>(
        conn: &C,
        order: &work_order::Model,
    ) -> Result<Vec<PricedLine>, ServiceError> {
        let services = WorkOrderServiceLine::find()
            .filter(work_order_service_line::Column::WorkOrderId.eq(order.id))
            .order_by_asc(work_order_service_line::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;
        let parts = WorkOrderPartLine::find()
            .filter(work_order_part_line::Column::WorkOrderId.eq(order.id))
            .order_by_asc(work_order_part_line::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut priced: Vec<PricedLine> = services
            .into_iter()
            .map(|line| PricedLine {
                kind: LineKind::Service,
                item_id: line.service_item_id,
                description: line.description,
                quantity: line.quantity,
                unit_price: line.unit_price,
                subtotal: line.subtotal,
                origin_order_id: Some(order.id),
                customer_supplied: false,
            })
            .collect();
        priced.extend(parts.into_iter().map(|line| PricedLine {
            kind: LineKind::Product,
            item_id: Some(line.part_id),
            description: line.description,
            quantity: line.quantity,
            unit_price: line.unit_price,
            subtotal: line.subtotal,
            origin_order_id: Some(order.id),
            customer_supplied: line.customer_supplies,
        }));
        Ok(priced)
    }

    async fn insert_lines<C: ConnectionTrait>(
        conn: &C,
        sale_id: i32,
        lines: Vec<PricedLine>,
    ) -> Result<Vec<sale_line::Model>, ServiceError> {
        let mut inserted = Vec::with_capacity(lines.len());
        for line in lines {
            let row = sale_line::ActiveModel {
                sale_id: Set(sale_id),
                kind: Set(line.kind),
                item_id: Set(line.item_id),
                description: Set(line.description),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                subtotal: Set(line.subtotal),
                origin_order_id: Set(line.origin_order_id),
                customer_supplied: Set(line.customer_supplied),
                ..Default::default()
            }
            .insert(conn)
            .await
            .map_err(ServiceError::db_error)?;
            inserted.push(row);
        }
        Ok(inserted)
    }

    /// Books one stock movement per stock-bearing PRODUCT line.
    async fn move_product_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        sale_id: i32,
        lines: &[sale_line::Model],
        kind: MovementKind,
        actor: Actor,
        batch: &mut StockBatch,
    ) -> Result<(), ServiceError> {
        for line in lines {
            if line.kind != LineKind::Product || line.customer_supplied {
                continue;
            }
            let part_id = match line.item_id {
                Some(id) => id,
                None => continue,
            };
            let outcome = self
                .inventory
                .register_movement(
                    conn,
                    MovementRequest::new(part_id, kind, line.quantity)
                        .with_reference(format!("SALE-{}", sale_id))
                        .for_sale(sale_id)
                        .by_user(actor.id)
                        .deferred_alerts(),
                )
                .await?;
            batch.push(outcome);
        }
        Ok(())
    }

    async fn lines_of<C: ConnectionTrait>(conn: &C, sale_id: i32) -> Result<Vec<sale_line::Model>, ServiceError> {
        SaleLine::find()
            .filter(sale_line::Column::SaleId.eq(sale_id))
            .order_by_asc(sale_line::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Recomputes subtotal and total from the current lines.
    async fn recompute_totals<C: ConnectionTrait>(
        &self,
        conn: &C,
        sale: sale::Model,
    ) -> Result<sale::Model, ServiceError> {
        let subtotal = money_round(
            Self::lines_of(conn, sale.id)
                .await?
                .iter()
                .map(|l| l.subtotal)
                .sum(),
        );
        let total = apply_invoice_factor(subtotal, sale.invoice_required, self.rules.iva_factor);
        let mut active: sale::ActiveModel = sale.into();
        active.subtotal = Set(subtotal);
        active.total = Set(total);
        active.updated_at = Set(Utc::now());
        active.update(conn).await.map_err(ServiceError::db_error)
    }

    /// Re-derives PAID/PENDING from payments after the total moved.
    ///
    /// Reaching PAID accrues commissions; leaving it deletes them.
    async fn sync_status<C: ConnectionTrait>(
        &self,
        conn: &C,
        sale: sale::Model,
        paid: Decimal,
    ) -> Result<sale::Model, ServiceError> {
        if sale.status == SaleStatus::Cancelled {
            return Ok(sale);
        }
        let target = if is_settled(sale.total, paid) {
            SaleStatus::Paid
        } else {
            SaleStatus::Pending
        };
        if target == sale.status {
            return Ok(sale);
        }

        let mut active: sale::ActiveModel = sale.into();
        active.status = Set(target);
        active.updated_at = Set(Utc::now());
        let sale = active.update(conn).await.map_err(ServiceError::db_error)?;

        match target {
            SaleStatus::Paid => {
                self.commissions.accrue_for_sale(conn, &sale).await?;
            }
            _ => {
                let removed = CommissionService::remove_for_sale(conn, sale.id).await?;
                if removed > 0 {
                    info!(sale_id = sale.id, removed, "Commissions withdrawn after sale edit");
                }
            }
        }
        Ok(sale)
    }

    async fn publish_status(&self, sale_id: i32, old: SaleStatus, new: SaleStatus) {
        if old != new {
            self.event_sender
                .send_or_log(Event::SaleStatusChanged {
                    sale_id,
                    old_status: old.as_str().to_string(),
                    new_status: new.as_str().to_string(),
                })
                .await;
        }
    }

    async fn detail<C: ConnectionTrait>(conn: &C, sale: sale::Model) -> Result<SaleDetail, ServiceError> {
        let lines = Self::lines_of(conn, sale.id).await?;
        let paid = paid_amount(conn, sale.id).await?;
        let balance = money_round(sale.total - paid);
        Ok(SaleDetail {
            sale,
            lines,
            paid,
            balance,
        })
    }

    /// Counter sale: every PRODUCT line leaves stock in the same transaction.
    #[instrument(skip(self, input))]
    pub async fn create_manual_sale(&self, actor: Actor, input: NewSale) -> Result<SaleDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let priced = Self::price_manual_lines(&txn, &input.lines).await?;
        let subtotal = money_round(priced.iter().map(|l| l.subtotal).sum());
        let total = apply_invoice_factor(subtotal, input.invoice_required, self.rules.iva_factor);
        let now = Utc::now();

        let sale = sale::ActiveModel {
            work_order_id: Set(None),
            client_id: Set(input.client_id),
            seller_id: Set(actor.id),
            status: Set(SaleStatus::Pending),
            subtotal: Set(subtotal),
            total: Set(total),
            invoice_required: Set(input.invoice_required),
            sale_date: Set(input.sale_date.unwrap_or(now)),
            cancelled_by: Set(None),
            cancelled_at: Set(None),
            cancellation_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        let lines = Self::insert_lines(&txn, sale.id, priced).await?;
        let sale = self.sync_status(&txn, sale, Decimal::ZERO).await?;
        let mut batch = StockBatch::default();
        self.move_product_stock(&txn, sale.id, &lines, MovementKind::Exit, actor, &mut batch)
            .await?;
        self.inventory.settle_alerts(&txn, &mut batch).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(sale_id = sale.id, total = %sale.total, "Manual sale created");
        counter!("sales.created", 1, "origin" => "manual");
        self.inventory.publish(batch).await;
        self.event_sender.send_or_log(Event::SaleCreated(sale.id)).await;
        self.publish_status(sale.id, SaleStatus::Pending, sale.status).await;

        Ok(SaleDetail {
            balance: sale.total,
            sale,
            lines,
            paid: Decimal::ZERO,
        })
    }

    async fn lock_invoiceable_order<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
    ) -> Result<work_order::Model, ServiceError> {
        let order = WorkOrder::find_by_id(order_id)
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Work order", order_id))?;
        if !matches!(order.status, WorkOrderStatus::Completed | WorkOrderStatus::Delivered) {
            return Err(ServiceError::IllegalTransition(format!(
                "Work order {} is {}; only COMPLETED or DELIVERED orders can be invoiced",
                order.number, order.status
            )));
        }
        if let Some(existing) = Self::active_sale_for_order(conn, order.id).await? {
            return Err(ServiceError::IllegalTransition(format!(
                "Work order {} already has sale {}",
                order.number, existing.id
            )));
        }
        Ok(order)
    }

    /// Invoices a finished work order. Stock was consumed when the order
    /// started, so no movement is booked here.
    #[instrument(skip(self))]
    pub async fn create_from_work_order(
        &self,
        actor: Actor,
        order_id: i32,
        invoice_required: bool,
    ) -> Result<SaleDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_invoiceable_order(&txn, order_id).await?;
        let priced = Self::price_order_lines(&txn, &order).await?;
        let subtotal = money_round(priced.iter().map(|l| l.subtotal).sum());
        let total = apply_invoice_factor(subtotal, invoice_required, self.rules.iva_factor);
        let now = Utc::now();

        let sale = sale::ActiveModel {
            work_order_id: Set(Some(order.id)),
            client_id: Set(Some(order.client_id)),
            seller_id: Set(actor.id),
            status: Set(SaleStatus::Pending),
            subtotal: Set(subtotal),
            total: Set(total),
            invoice_required: Set(invoice_required),
            sale_date: Set(now),
            cancelled_by: Set(None),
            cancelled_at: Set(None),
            cancellation_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;
        let lines = Self::insert_lines(&txn, sale.id, priced).await?;
        let sale = self.sync_status(&txn, sale, Decimal::ZERO).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(sale_id = sale.id, order = %order.number, total = %sale.total, "Sale created from work order");
        counter!("sales.created", 1, "origin" => "work_order");
        self.event_sender.send_or_log(Event::SaleCreated(sale.id)).await;
        self.publish_status(sale.id, SaleStatus::Pending, sale.status).await;

        Ok(SaleDetail {
            balance: sale.total,
            sale,
            lines,
            paid: Decimal::ZERO,
        })
    }

    /// Edits a sale. New manual lines replace the old ones through a
    /// compensating ENTRY followed by a fresh EXIT.
    #[instrument(skip(self, update))]
    pub async fn update_sale(
        &self,
        actor: Actor,
        sale_id: i32,
        update: SaleUpdate,
    ) -> Result<SaleDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let sale = Self::lock_sale(&txn, sale_id).await?;
        Self::ensure_not_cancelled(&sale)?;
        let previous_status = sale.status;

        let mut batch = StockBatch::default();
        if let Some(inputs) = update.lines.as_ref() {
            let old_lines: Vec<sale_line::Model> = Self::lines_of(&txn, sale.id)
                .await?
                .into_iter()
                .filter(|l| l.origin_order_id.is_none())
                .collect();
            let keeps_order_lines = sale.work_order_id.is_some();
            if inputs.is_empty() && !keeps_order_lines {
                return Err(ServiceError::ValidationError(
                    "A sale needs at least one line".to_string(),
                ));
            }

            self.move_product_stock(&txn, sale.id, &old_lines, MovementKind::Entry, actor, &mut batch)
                .await?;
            for line in old_lines {
                line.delete(&txn).await.map_err(ServiceError::db_error)?;
            }

            let priced = if inputs.is_empty() {
                Vec::new()
            } else {
                Self::price_manual_lines(&txn, inputs).await?
            };
            let new_lines = Self::insert_lines(&txn, sale.id, priced).await?;
            self.move_product_stock(&txn, sale.id, &new_lines, MovementKind::Exit, actor, &mut batch)
                .await?;
        }

        let mut active: sale::ActiveModel = sale.into();
        if let Some(flag) = update.invoice_required {
            active.invoice_required = Set(flag);
        }
        if let Some(client_id) = update.client_id {
            active.client_id = Set(Some(client_id));
        }
        active.updated_at = Set(Utc::now());
        let sale = active.update(&txn).await.map_err(ServiceError::db_error)?;
        let sale = self.recompute_totals(&txn, sale).await?;

        let paid = paid_amount(&txn, sale.id).await?;
        if exceeds(paid, sale.total) {
            return Err(ServiceError::ValidationError(format!(
                "New total {} is below the {} already paid",
                sale.total, paid
            )));
        }
        let sale = self.sync_status(&txn, sale, paid).await?;

        self.inventory.settle_alerts(&txn, &mut batch).await?;
        let detail = Self::detail(&txn, sale).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(sale_id, total = %detail.sale.total, balance = %detail.balance, "Sale updated");
        self.inventory.publish(batch).await;
        self.event_sender.send_or_log(Event::SaleUpdated(sale_id)).await;
        self.publish_status(sale_id, previous_status, detail.sale.status).await;
        Ok(detail)
    }

    /// Attaches a finished work order to an existing sale, copying its lines.
    #[instrument(skip(self))]
    pub async fn link_work_order(
        &self,
        _actor: Actor,
        sale_id: i32,
        order_id: i32,
    ) -> Result<SaleDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let sale = Self::lock_sale(&txn, sale_id).await?;
        Self::ensure_not_cancelled(&sale)?;
        if let Some(linked) = sale.work_order_id {
            return Err(ServiceError::IllegalTransition(format!(
                "Sale {} is already linked to work order {}",
                sale.id, linked
            )));
        }
        let previous_status = sale.status;

        let order = Self::lock_invoiceable_order(&txn, order_id).await?;
        let priced = Self::price_order_lines(&txn, &order).await?;
        Self::insert_lines(&txn, sale.id, priced).await?;

        let client_id = sale.client_id.unwrap_or(order.client_id);
        let mut active: sale::ActiveModel = sale.into();
        active.work_order_id = Set(Some(order.id));
        active.client_id = Set(Some(client_id));
        let sale = active.update(&txn).await.map_err(ServiceError::db_error)?;
        let sale = self.recompute_totals(&txn, sale).await?;
        let paid = paid_amount(&txn, sale.id).await?;
        let sale = self.sync_status(&txn, sale, paid).await?;

        let detail = Self::detail(&txn, sale).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(sale_id, order = %order.number, "Work order linked to sale");
        self.event_sender.send_or_log(Event::SaleUpdated(sale_id)).await;
        self.publish_status(sale_id, previous_status, detail.sale.status).await;
        Ok(detail)
    }

    /// Removes the work order's lines from the sale. Refuses when what is
    /// left would be below the amount already paid.
    #[instrument(skip(self))]
    pub async fn unlink_work_order(&self, actor: Actor, sale_id: i32) -> Result<SaleDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let sale = Self::lock_sale(&txn, sale_id).await?;
        Self::ensure_not_cancelled(&sale)?;
        if sale.work_order_id.is_none() {
            return Err(ServiceError::IllegalTransition(format!(
                "Sale {} is not linked to a work order",
                sale.id
            )));
        }

        let detached = self
            .detach_order_lines(&txn, sale, actor, true, "Work order unlinked from sale")
            .await?;
        let detail = Self::detail(&txn, detached.sale.clone()).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(sale_id, cancelled = detached.cancelled, "Work order unlinked");
        self.event_sender.send_or_log(Event::SaleUpdated(sale_id)).await;
        self.publish_status(sale_id, detached.previous_status, detail.sale.status)
            .await;
        Ok(detail)
    }

    /// Deletes the lines the linked work order contributed to `sale`.
    ///
    /// A sale left without lines is cancelled with `auto_reason`; otherwise the
    /// link is cleared and the total recomputed. `strict` refuses a total below
    /// what was paid; the non-strict form (used when the order itself is
    /// cancelled) never refuses.
    pub(crate) async fn detach_order_lines<C: ConnectionTrait>(
        &self,
        conn: &C,
        sale: sale::Model,
        actor: Actor,
        strict: bool,
        auto_reason: &str,
    ) -> Result<Detached, ServiceError> {
        let previous_status = sale.status;
        let order_id = match sale.work_order_id {
            Some(id) => id,
            None => {
                return Ok(Detached {
                    sale,
                    previous_status,
                    cancelled: false,
                    removed_commissions: 0,
                    refund_due: Decimal::ZERO,
                })
            }
        };

        let removed_ids: Vec<i32> = SaleLine::find()
            .filter(sale_line::Column::SaleId.eq(sale.id))
            .filter(sale_line::Column::OriginOrderId.eq(order_id))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|l| l.id)
            .collect();
        SaleLine::delete_many()
            .filter(sale_line::Column::Id.is_in(removed_ids.clone()))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        let remaining = Self::lines_of(conn, sale.id).await?;
        let paid = paid_amount(conn, sale.id).await?;

        if remaining.is_empty() {
            if strict && paid > Decimal::ZERO {
                return Err(ServiceError::ValidationError(format!(
                    "Sale {} would be left empty with {} already paid",
                    sale.id, paid
                )));
            }
            let removed_commissions = CommissionService::remove_for_sale(conn, sale.id).await?;
            let now = Utc::now();
            let mut active: sale::ActiveModel = sale.into();
            active.status = Set(SaleStatus::Cancelled);
            active.subtotal = Set(Decimal::ZERO);
            active.total = Set(Decimal::ZERO);
            active.cancelled_by = Set(Some(actor.id));
            active.cancelled_at = Set(Some(now));
            active.cancellation_reason = Set(Some(auto_reason.to_string()));
            active.updated_at = Set(now);
            let sale = active.update(conn).await.map_err(ServiceError::db_error)?;
            if paid > Decimal::ZERO {
                warn!(sale_id = sale.id, paid = %paid, "Sale cancelled with payments on record; refund due");
            }
            return Ok(Detached {
                sale,
                previous_status,
                cancelled: true,
                removed_commissions,
                refund_due: paid,
            });
        }

        let mut active: sale::ActiveModel = sale.into();
        active.work_order_id = Set(None);
        let sale = active.update(conn).await.map_err(ServiceError::db_error)?;
        let sale = self.recompute_totals(conn, sale).await?;
        if strict && exceeds(paid, sale.total) {
            return Err(ServiceError::ValidationError(format!(
                "New total {} is below the {} already paid",
                sale.total, paid
            )));
        }
        let removed_commissions =
            CommissionService::remove_for_lines(conn, sale.id, &removed_ids).await?;
        let sale = self.sync_status(conn, sale, paid).await?;
        let refund_due = if exceeds(paid, sale.total) {
            money_round(paid - sale.total)
        } else {
            Decimal::ZERO
        };
        if refund_due > Decimal::ZERO {
            warn!(sale_id = sale.id, paid = %paid, total = %sale.total, refund_due = %refund_due, "Sale overpaid after detaching work order");
        }
        Ok(Detached {
            sale,
            previous_status,
            cancelled: false,
            removed_commissions,
            refund_due,
        })
    }

    /// Cancels a sale. Every stock-bearing PRODUCT line needs a disposition
    /// splitting its quantity into reusable and shrinkage.
    #[instrument(skip(self, request))]
    pub async fn cancel_sale(
        &self,
        actor: Actor,
        sale_id: i32,
        request: CancelSale,
    ) -> Result<CancelledSale, ServiceError> {
        let reason = require_text(&request.reason, "reason")?;

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let sale = Self::lock_sale(&txn, sale_id).await?;
        Self::ensure_not_cancelled(&sale)?;
        let previous_status = sale.status;

        let stocked: Vec<sale_line::Model> = Self::lines_of(&txn, sale.id)
            .await?
            .into_iter()
            .filter(|l| l.kind == LineKind::Product && !l.customer_supplied && l.item_id.is_some())
            .collect();

        let mut dispositions: HashMap<i32, &LineDisposition> = HashMap::new();
        for disposition in &request.dispositions {
            if !stocked.iter().any(|l| l.id == disposition.sale_line_id) {
                return Err(ServiceError::ValidationError(format!(
                    "Line {} is not a stocked product line of sale {}",
                    disposition.sale_line_id, sale.id
                )));
            }
            if dispositions.insert(disposition.sale_line_id, disposition).is_some() {
                return Err(ServiceError::ValidationError(format!(
                    "Line {} has more than one disposition",
                    disposition.sale_line_id
                )));
            }
        }

        let now = Utc::now();
        let mut batch = StockBatch::default();
        let mut details = Vec::with_capacity(stocked.len());
        for line in &stocked {
            let disposition = dispositions.get(&line.id).ok_or_else(|| {
                ServiceError::ValidationError(format!(
                    "Missing disposition for line {} ({})",
                    line.id, line.description
                ))
            })?;
            let reusable = stock_round(disposition.quantity_reusable);
            let shrinkage = stock_round(disposition.quantity_shrinkage);
            ensure_non_negative(reusable, "quantity_reusable")?;
            ensure_non_negative(shrinkage, "quantity_shrinkage")?;
            if reusable + shrinkage != line.quantity {
                return Err(ServiceError::ValidationError(format!(
                    "Line {}: reusable {} + shrinkage {} must equal {}",
                    line.id, reusable, shrinkage, line.quantity
                )));
            }
            let shrinkage_reason = optional_text(disposition.shrinkage_reason.as_deref());
            if shrinkage > Decimal::ZERO && shrinkage_reason.is_none() {
                return Err(ServiceError::ValidationError(format!(
                    "Line {}: shrinkage requires a reason",
                    line.id
                )));
            }

            let part_id = line.item_id.unwrap_or_default();
            let part = InventoryService::lock_part(&txn, part_id).await?;
            let unit_cost = part.purchase_price;

            if reusable > Decimal::ZERO {
                let outcome = self
                    .inventory
                    .register_movement(
                        &txn,
                        MovementRequest::new(part_id, MovementKind::Entry, reusable)
                            .with_unit_price(unit_cost)
                            .with_reference(format!("CANCEL-SALE-{}", sale.id))
                            .with_reason(reason.clone())
                            .for_sale(sale.id)
                            .by_user(actor.id)
                            .deferred_alerts(),
                    )
                    .await?;
                batch.push(outcome);
            }

            let detail = sale_cancellation_detail::ActiveModel {
                sale_id: Set(sale.id),
                sale_line_id: Set(line.id),
                part_id: Set(part_id),
                original_quantity: Set(line.quantity),
                quantity_reusable: Set(reusable),
                quantity_shrinkage: Set(shrinkage),
                unit_cost: Set(unit_cost),
                shrinkage_cost: Set(line_amount(shrinkage, unit_cost)),
                reason: Set(shrinkage_reason),
                created_by: Set(actor.id),
                created_at: Set(now),
                ..Default::default()
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;
            details.push(detail);
        }

        let removed = CommissionService::remove_for_sale(&txn, sale.id).await?;

        let mut active: sale::ActiveModel = sale.into();
        active.status = Set(SaleStatus::Cancelled);
        active.cancelled_by = Set(Some(actor.id));
        active.cancelled_at = Set(Some(now));
        active.cancellation_reason = Set(Some(reason));
        active.updated_at = Set(now);
        let sale = active.update(&txn).await.map_err(ServiceError::db_error)?;

        self.inventory.settle_alerts(&txn, &mut batch).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            sale_id,
            lines = details.len(),
            commissions_removed = removed,
            "Sale cancelled"
        );
        counter!("sales.cancelled", 1);
        self.inventory.publish(batch).await;
        self.publish_status(sale_id, previous_status, sale.status).await;

        Ok(CancelledSale { sale, details })
    }

    pub async fn get_sale(&self, sale_id: i32) -> Result<SaleDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let sale = Sale::find_by_id(sale_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Sale", sale_id))?;
        Self::detail(db, sale).await
    }

    pub async fn cancellation_details(
        &self,
        sale_id: i32,
    ) -> Result<Vec<sale_cancellation_detail::Model>, ServiceError> {
        SaleCancellationDetail::find()
            .filter(sale_cancellation_detail::Column::SaleId.eq(sale_id))
            .order_by_asc(sale_cancellation_detail::Column::Id)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn settled_means_no_balance_left() {
        assert!(is_settled(dec!(200), dec!(200)));
        assert!(is_settled(dec!(200), dec!(199.995)));
        assert!(!is_settled(dec!(200), dec!(199.99)));
        assert!(is_settled(dec!(0), dec!(0)));
        assert!(!is_settled(dec!(0.01), dec!(0)));
    }

    #[test]
    fn line_input_builders() {
        let line = SaleLineInput::product(4, dec!(2)).at_price(dec!(80));
        assert_eq!(line.kind, LineKind::Product);
        assert_eq!(line.unit_price, Some(dec!(80)));
        assert_eq!(SaleLineInput::service(1, dec!(1)).kind, LineKind::Service);
    }
}
