use crate::{
    db::DbPool,
    entities::{
        inventory_movement::MovementKind,
        manual_payable::{self, Entity as ManualPayable, PayableStatus},
        part::Entity as Part,
        payable_payment::{self, Entity as PayablePayment, PaymentMethod},
        purchase_order::{self, Entity as PurchaseOrder, PurchaseOrderStatus},
        purchase_order_line::{self, Entity as PurchaseOrderLine},
        supplier::Entity as Supplier,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    money::{approx_eq, exceeds, line_amount, money_round, stock_round, MONEY_EPSILON},
    services::{
        cash_shifts::open_shift_for,
        ensure_non_negative, ensure_positive,
        inventory::{InventoryService, MovementRequest, StockBatch},
        numbering::{conflict_on_duplicate, next_purchase_order_number},
        optional_text, require_text, Actor,
    },
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Outbound channel that tells a supplier about a purchase order.
#[async_trait]
pub trait SupplierNotifier: Send + Sync {
    async fn purchase_order_sent(
        &self,
        order: &purchase_order::Model,
        lines: &[purchase_order_line::Model],
    ) -> Result<(), ServiceError>;
}

/// Notifier that only logs; used when no mail transport is configured.
pub struct LoggingSupplierNotifier;

#[async_trait]
impl SupplierNotifier for LoggingSupplierNotifier {
    async fn purchase_order_sent(
        &self,
        order: &purchase_order::Model,
        lines: &[purchase_order_line::Model],
    ) -> Result<(), ServiceError> {
        info!(
            order = %order.number,
            supplier_id = order.supplier_id,
            lines = lines.len(),
            "Purchase order sent to supplier"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurchaseOrderLineInput {
    /// `None` orders merchandise that has no part yet.
    pub part_id: Option<i32>,
    pub description: Option<String>,
    pub quantity: Decimal,
    /// Defaults to the part's current cost.
    pub estimated_unit_price: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPurchaseOrder {
    pub supplier_id: i32,
    pub promised_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub lines: Vec<PurchaseOrderLineInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub line_id: i32,
    pub quantity_received: Decimal,
    pub real_unit_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewManualPayable {
    pub supplier_id: Option<i32>,
    pub concept: String,
    pub amount: Decimal,
    pub reference_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseOrderDetail {
    pub order: purchase_order::Model,
    pub lines: Vec<purchase_order_line::Model>,
    /// Received quantities at their effective prices.
    pub owed: Decimal,
    pub paid: Decimal,
    pub balance: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub order: purchase_order::Model,
    /// The send committed but the supplier could not be notified.
    pub notification_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AgingBucket {
    Current,
    Days31To60,
    Over60,
}

impl AgingBucket {
    pub fn label(self) -> &'static str {
        match self {
            AgingBucket::Current => "0-30",
            AgingBucket::Days31To60 => "31-60",
            AgingBucket::Over60 => "61+",
        }
    }
}

/// Bucket for a payable `days` old.
pub fn bucket_for(days: i64) -> AgingBucket {
    if days <= 30 {
        AgingBucket::Current
    } else if days <= 60 {
        AgingBucket::Days31To60
    } else {
        AgingBucket::Over60
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PayableSource {
    PurchaseOrder(i32),
    Manual(i32),
}

#[derive(Debug, Clone, Serialize)]
pub struct AgingEntry {
    pub source: PayableSource,
    pub supplier_id: Option<i32>,
    pub description: String,
    pub reference_date: NaiveDate,
    pub days: i64,
    pub bucket: AgingBucket,
    pub balance: Decimal,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgingReport {
    pub entries: Vec<AgingEntry>,
    pub current: Decimal,
    pub days_31_to_60: Decimal,
    pub over_60: Decimal,
}

impl AgingReport {
    fn push(&mut self, entry: AgingEntry) {
        match entry.bucket {
            AgingBucket::Current => self.current += entry.balance,
            AgingBucket::Days31To60 => self.days_31_to_60 += entry.balance,
            AgingBucket::Over60 => self.over_60 += entry.balance,
        }
        self.entries.push(entry);
    }

    pub fn total(&self) -> Decimal {
        self.current + self.days_31_to_60 + self.over_60
    }
}

/// What the shop owes a supplier for the merchandise received so far.
pub fn amount_owed(lines: &[purchase_order_line::Model]) -> Decimal {
    money_round(
        lines
            .iter()
            .map(|l| line_amount(l.quantity_received, l.effective_unit_price()))
            .sum(),
    )
}

/// Purchase orders, supplier receipts and the payables ledger.
#[derive(Clone)]
pub struct PayablesService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    inventory: InventoryService,
    notifier: Arc<dyn SupplierNotifier>,
}

impl PayablesService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        inventory: InventoryService,
        notifier: Arc<dyn SupplierNotifier>,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            inventory,
            notifier,
        }
    }

    async fn lock_order<C: ConnectionTrait>(conn: &C, order_id: i32) -> Result<purchase_order::Model, ServiceError> {
        PurchaseOrder::find_by_id(order_id)
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Purchase order", order_id))
    }

    async fn lines_of<C: ConnectionTrait>(
        conn: &C,
        order_id: i32,
    ) -> Result<Vec<purchase_order_line::Model>, ServiceError> {
        PurchaseOrderLine::find()
            .filter(purchase_order_line::Column::PurchaseOrderId.eq(order_id))
            .order_by_asc(purchase_order_line::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn paid_for_order<C: ConnectionTrait>(conn: &C, order_id: i32) -> Result<Decimal, ServiceError> {
        let payments = PayablePayment::find()
            .filter(payable_payment::Column::PurchaseOrderId.eq(order_id))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(money_round(payments.iter().map(|p| p.amount).sum()))
    }

    async fn paid_for_manual<C: ConnectionTrait>(conn: &C, payable_id: i32) -> Result<Decimal, ServiceError> {
        let payments = PayablePayment::find()
            .filter(payable_payment::Column::ManualPayableId.eq(payable_id))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(money_round(payments.iter().map(|p| p.amount).sum()))
    }

    async fn detail<C: ConnectionTrait>(
        conn: &C,
        order: purchase_order::Model,
    ) -> Result<PurchaseOrderDetail, ServiceError> {
        let lines = Self::lines_of(conn, order.id).await?;
        let owed = amount_owed(&lines);
        let paid = Self::paid_for_order(conn, order.id).await?;
        Ok(PurchaseOrderDetail {
            order,
            lines,
            owed,
            paid,
            balance: money_round(owed - paid),
        })
    }

    async fn publish_transition(&self, order_id: i32, old: PurchaseOrderStatus, new: PurchaseOrderStatus) {
        if old == new {
            return;
        }
        self.event_sender
            .send_or_log(Event::PurchaseOrderStatusChanged {
                purchase_order_id: order_id,
                old_status: old.as_str().to_string(),
                new_status: new.as_str().to_string(),
            })
            .await;
    }

    #[instrument(skip(self, input), fields(supplier_id = input.supplier_id))]
    pub async fn create_purchase_order(
        &self,
        actor: Actor,
        input: NewPurchaseOrder,
    ) -> Result<PurchaseOrderDetail, ServiceError> {
        if input.lines.is_empty() {
            return Err(ServiceError::ValidationError(
                "A purchase order needs at least one line".to_string(),
            ));
        }

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let supplier = Supplier::find_by_id(input.supplier_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Supplier", input.supplier_id))?;
        if !supplier.active {
            return Err(ServiceError::ValidationError(format!(
                "Supplier {} is inactive",
                supplier.name
            )));
        }

        let mut priced = Vec::with_capacity(input.lines.len());
        for line in &input.lines {
            let quantity = stock_round(line.quantity);
            ensure_positive(quantity, "quantity")?;
            let (description, estimated) = match line.part_id {
                Some(part_id) => {
                    let part = Part::find_by_id(part_id)
                        .one(&txn)
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| ServiceError::not_found("Part", part_id))?;
                    if !part.is_usable() {
                        return Err(ServiceError::ValidationError(format!(
                            "Part {} is inactive or deleted",
                            part.code
                        )));
                    }
                    (
                        optional_text(line.description.as_deref()).unwrap_or(part.name),
                        line.estimated_unit_price.unwrap_or(part.purchase_price),
                    )
                }
                None => {
                    let description = require_text(
                        line.description.as_deref().unwrap_or_default(),
                        "description",
                    )?;
                    let estimated = line.estimated_unit_price.ok_or_else(|| {
                        ServiceError::ValidationError(format!(
                            "{} needs an estimated price",
                            description
                        ))
                    })?;
                    (description, estimated)
                }
            };
            let estimated = money_round(estimated);
            ensure_non_negative(estimated, "estimated_unit_price")?;
            priced.push((line.part_id, description, quantity, estimated));
        }
        let estimated_total = money_round(
            priced
                .iter()
                .map(|(_, _, quantity, price)| line_amount(*quantity, *price))
                .sum(),
        );

        let now = Utc::now();
        let number = next_purchase_order_number(&txn, now.date_naive()).await?;
        let order = purchase_order::ActiveModel {
            number: Set(number),
            supplier_id: Set(supplier.id),
            status: Set(PurchaseOrderStatus::Draft),
            estimated_total: Set(estimated_total),
            promised_date: Set(input.promised_date),
            attachment_url: Set(None),
            notes: Set(optional_text(input.notes.as_deref())),
            created_by: Set(actor.id),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|e| conflict_on_duplicate(e, "purchase order number"))?;

        for (part_id, description, quantity, estimated) in priced {
            purchase_order_line::ActiveModel {
                purchase_order_id: Set(order.id),
                part_id: Set(part_id),
                description: Set(description),
                quantity_requested: Set(quantity),
                quantity_received: Set(Decimal::ZERO),
                estimated_unit_price: Set(estimated),
                real_unit_price: Set(None),
                ..Default::default()
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        }

        let detail = Self::detail(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order = %detail.order.number, total = %estimated_total, "Purchase order created");
        counter!("purchase_orders.created", 1);
        Ok(detail)
    }

    /// DRAFT → SENT, then notifies the supplier. A failed notification does
    /// not undo the send; it is reported in the outcome.
    #[instrument(skip(self))]
    pub async fn send_purchase_order(&self, _actor: Actor, order_id: i32) -> Result<SendOutcome, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        if order.status != PurchaseOrderStatus::Draft {
            return Err(ServiceError::IllegalTransition(format!(
                "Purchase order {} is {}; only drafts can be sent",
                order.number,
                order.status.as_str()
            )));
        }
        let now = Utc::now();
        let mut active: purchase_order::ActiveModel = order.into();
        active.status = Set(PurchaseOrderStatus::Sent);
        active.sent_at = Set(Some(now));
        active.updated_at = Set(now);
        let order = active.update(&txn).await.map_err(ServiceError::db_error)?;
        let lines = Self::lines_of(&txn, order.id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        self.publish_transition(order.id, PurchaseOrderStatus::Draft, order.status)
            .await;

        let notification_error = match self.notifier.purchase_order_sent(&order, &lines).await {
            Ok(()) => None,
            Err(e) => {
                warn!(order = %order.number, error = %e, "Supplier notification failed");
                counter!("purchase_orders.notification_failures", 1);
                Some(e.to_string())
            }
        };
        Ok(SendOutcome {
            order,
            notification_error,
        })
    }

    #[instrument(skip(self))]
    pub async fn authorize_purchase_order(
        &self,
        actor: Actor,
        order_id: i32,
    ) -> Result<purchase_order::Model, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        if !matches!(order.status, PurchaseOrderStatus::Draft | PurchaseOrderStatus::Sent) {
            return Err(ServiceError::IllegalTransition(format!(
                "Purchase order {} is {}",
                order.number,
                order.status.as_str()
            )));
        }
        let old_status = order.status;
        let now = Utc::now();
        let mut active: purchase_order::ActiveModel = order.into();
        active.status = Set(PurchaseOrderStatus::Authorized);
        active.authorized_by = Set(Some(actor.id));
        active.authorized_at = Set(Some(now));
        active.updated_at = Set(now);
        let order = active.update(&txn).await.map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        self.publish_transition(order.id, old_status, order.status).await;
        Ok(order)
    }

    /// Books received merchandise. Each line enters stock at its real price
    /// when one was given, the estimate otherwise.
    #[instrument(skip(self, receipt))]
    pub async fn receive_purchase_order(
        &self,
        actor: Actor,
        order_id: i32,
        receipt: Vec<ReceiptLine>,
        attachment_url: Option<String>,
    ) -> Result<PurchaseOrderDetail, ServiceError> {
        if receipt.is_empty() {
            return Err(ServiceError::ValidationError(
                "A receipt needs at least one line".to_string(),
            ));
        }
        let attachment_url = optional_text(attachment_url.as_deref());

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        if !matches!(
            order.status,
            PurchaseOrderStatus::Sent
                | PurchaseOrderStatus::Authorized
                | PurchaseOrderStatus::PartialReceipt
        ) {
            return Err(ServiceError::IllegalTransition(format!(
                "Purchase order {} is {} and cannot receive merchandise",
                order.number,
                order.status.as_str()
            )));
        }

        let mut batch = StockBatch::default();
        for received in &receipt {
            let line = PurchaseOrderLine::find_by_id(received.line_id)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .filter(|l| l.purchase_order_id == order.id)
                .ok_or_else(|| ServiceError::not_found("Purchase order line", received.line_id))?;

            let quantity = stock_round(received.quantity_received);
            ensure_positive(quantity, "quantity_received")?;
            if quantity > line.outstanding() {
                return Err(ServiceError::ValidationError(format!(
                    "Line {}: receiving {} but only {} outstanding",
                    line.id,
                    quantity,
                    line.outstanding()
                )));
            }

            let real_unit_price = match received.real_unit_price.map(money_round) {
                Some(real) => {
                    ensure_non_negative(real, "real_unit_price")?;
                    if (real - line.estimated_unit_price).abs() >= MONEY_EPSILON {
                        Some(real)
                    } else {
                        line.real_unit_price
                    }
                }
                None => line.real_unit_price,
            };
            let unit_price = real_unit_price.unwrap_or(line.estimated_unit_price);

            let part_id = match line.part_id {
                Some(id) => id,
                None => {
                    self.inventory
                        .create_placeholder_part(&txn, &line.description, unit_price, Some(order.supplier_id))
                        .await?
                        .id
                }
            };

            let mut request = MovementRequest::new(part_id, MovementKind::Entry, quantity)
                .with_unit_price(unit_price)
                .with_reference(order.number.clone())
                .from_supplier(order.supplier_id)
                .by_user(actor.id)
                .deferred_alerts();
            request.attachment_url = attachment_url.clone();
            batch.push(self.inventory.register_movement(&txn, request).await?);

            let quantity_received = line.quantity_received + quantity;
            let mut active: purchase_order_line::ActiveModel = line.into();
            active.part_id = Set(Some(part_id));
            active.quantity_received = Set(quantity_received);
            active.real_unit_price = Set(real_unit_price);
            active.update(&txn).await.map_err(ServiceError::db_error)?;
        }
        self.inventory.settle_alerts(&txn, &mut batch).await?;

        let lines = Self::lines_of(&txn, order.id).await?;
        let requested: Decimal = lines.iter().map(|l| l.quantity_requested).sum();
        let received: Decimal = lines.iter().map(|l| l.quantity_received).sum();
        let status = if received >= requested {
            PurchaseOrderStatus::Received
        } else {
            PurchaseOrderStatus::PartialReceipt
        };

        let old_status = order.status;
        let now = Utc::now();
        let mut active: purchase_order::ActiveModel = order.into();
        active.status = Set(status);
        active.last_receipt_at = Set(Some(now));
        if attachment_url.is_some() {
            active.attachment_url = Set(attachment_url);
        }
        active.updated_at = Set(now);
        let order = active.update(&txn).await.map_err(ServiceError::db_error)?;
        let detail = Self::detail(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            order = %detail.order.number,
            status = detail.order.status.as_str(),
            owed = %detail.owed,
            "Purchase order receipt booked"
        );
        self.inventory.publish(batch).await;
        self.publish_transition(detail.order.id, old_status, detail.order.status)
            .await;
        Ok(detail)
    }

    #[instrument(skip(self))]
    pub async fn cancel_purchase_order(
        &self,
        _actor: Actor,
        order_id: i32,
    ) -> Result<purchase_order::Model, ServiceError> {
        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        if !matches!(
            order.status,
            PurchaseOrderStatus::Draft | PurchaseOrderStatus::Sent | PurchaseOrderStatus::Authorized
        ) {
            return Err(ServiceError::IllegalTransition(format!(
                "Purchase order {} is {} and cannot be cancelled",
                order.number,
                order.status.as_str()
            )));
        }
        let lines = Self::lines_of(&txn, order.id).await?;
        if lines.iter().any(|l| l.quantity_received > Decimal::ZERO) {
            return Err(ServiceError::IllegalTransition(format!(
                "Purchase order {} already received merchandise",
                order.number
            )));
        }

        let old_status = order.status;
        let now = Utc::now();
        let mut active: purchase_order::ActiveModel = order.into();
        active.status = Set(PurchaseOrderStatus::Cancelled);
        active.cancelled_at = Set(Some(now));
        active.updated_at = Set(now);
        let order = active.update(&txn).await.map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        self.publish_transition(order.id, old_status, order.status).await;
        Ok(order)
    }

    /// Stores the URL of the supplier's receipt document.
    #[instrument(skip(self))]
    pub async fn attach_document(
        &self,
        _actor: Actor,
        order_id: i32,
        url: &str,
    ) -> Result<purchase_order::Model, ServiceError> {
        let url = require_text(url, "url")?;
        let db = self.db_pool.as_ref();
        let order = PurchaseOrder::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Purchase order", order_id))?;
        let mut active: purchase_order::ActiveModel = order.into();
        active.attachment_url = Set(Some(url));
        active.updated_at = Set(Utc::now());
        active.update(db).await.map_err(ServiceError::db_error)
    }

    /// Cash payments are drawn from the payer's open shift when there is one.
    async fn shift_for_method<C: ConnectionTrait>(
        conn: &C,
        actor: Actor,
        method: PaymentMethod,
    ) -> Result<Option<i32>, ServiceError> {
        if method != PaymentMethod::Cash {
            return Ok(None);
        }
        Ok(open_shift_for(conn, actor.id).await?.map(|s| s.id))
    }

    async fn publish_payment(&self, payment: &payable_payment::Model) {
        counter!("payables.payments", 1, "method" => payment.method.as_str());
        self.event_sender
            .send_or_log(Event::PayablePaymentRegistered {
                payment_id: payment.id,
                amount: payment.amount,
            })
            .await;
    }

    #[instrument(skip(self, reference))]
    pub async fn register_purchase_order_payment(
        &self,
        actor: Actor,
        order_id: i32,
        method: PaymentMethod,
        amount: Decimal,
        reference: Option<String>,
    ) -> Result<payable_payment::Model, ServiceError> {
        let amount = money_round(amount);
        ensure_positive(amount, "amount")?;

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = Self::lock_order(&txn, order_id).await?;
        let owed = amount_owed(&Self::lines_of(&txn, order.id).await?);
        let paid = Self::paid_for_order(&txn, order.id).await?;
        if exceeds(paid + amount, owed) {
            return Err(ServiceError::ValidationError(format!(
                "Overpayment: purchase order {} has a balance of {}",
                order.number,
                money_round(owed - paid)
            )));
        }

        let payment = payable_payment::ActiveModel {
            purchase_order_id: Set(Some(order.id)),
            manual_payable_id: Set(None),
            method: Set(method),
            amount: Set(amount),
            reference: Set(optional_text(reference.as_deref())),
            shift_id: Set(Self::shift_for_method(&txn, actor, method).await?),
            created_by: Set(actor.id),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order = %order.number, amount = %amount, "Purchase order payment registered");
        self.publish_payment(&payment).await;
        Ok(payment)
    }

    #[instrument(skip(self, input))]
    pub async fn create_manual_payable(
        &self,
        actor: Actor,
        input: NewManualPayable,
    ) -> Result<manual_payable::Model, ServiceError> {
        let concept = require_text(&input.concept, "concept")?;
        let amount = money_round(input.amount);
        ensure_positive(amount, "amount")?;
        if let Some(due) = input.due_date {
            if due < input.reference_date {
                return Err(ServiceError::ValidationError(
                    "due_date cannot be before reference_date".to_string(),
                ));
            }
        }

        let db = self.db_pool.as_ref();
        if let Some(supplier_id) = input.supplier_id {
            Supplier::find_by_id(supplier_id)
                .one(db)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| ServiceError::not_found("Supplier", supplier_id))?;
        }

        let payable = manual_payable::ActiveModel {
            supplier_id: Set(input.supplier_id),
            concept: Set(concept),
            amount: Set(amount),
            reference_date: Set(input.reference_date),
            due_date: Set(input.due_date),
            status: Set(PayableStatus::Pending),
            created_by: Set(actor.id),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(ServiceError::db_error)?;

        info!(payable_id = payable.id, amount = %amount, "Manual payable created");
        Ok(payable)
    }

    #[instrument(skip(self, reference))]
    pub async fn register_manual_payment(
        &self,
        actor: Actor,
        payable_id: i32,
        method: PaymentMethod,
        amount: Decimal,
        reference: Option<String>,
    ) -> Result<payable_payment::Model, ServiceError> {
        let amount = money_round(amount);
        ensure_positive(amount, "amount")?;

        let db = self.db_pool.as_ref();
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let payable = ManualPayable::find_by_id(payable_id)
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Manual payable", payable_id))?;
        if payable.status == PayableStatus::Paid {
            return Err(ServiceError::IllegalTransition(format!(
                "Payable {} is already paid",
                payable.id
            )));
        }
        let paid = Self::paid_for_manual(&txn, payable.id).await?;
        if exceeds(paid + amount, payable.amount) {
            return Err(ServiceError::ValidationError(format!(
                "Overpayment: payable {} has a balance of {}",
                payable.id,
                money_round(payable.amount - paid)
            )));
        }

        let payment = payable_payment::ActiveModel {
            purchase_order_id: Set(None),
            manual_payable_id: Set(Some(payable.id)),
            method: Set(method),
            amount: Set(amount),
            reference: Set(optional_text(reference.as_deref())),
            shift_id: Set(Self::shift_for_method(&txn, actor, method).await?),
            created_by: Set(actor.id),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        if approx_eq(paid + amount, payable.amount) {
            let mut active: manual_payable::ActiveModel = payable.into();
            active.status = Set(PayableStatus::Paid);
            active.update(&txn).await.map_err(ServiceError::db_error)?;
        }
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(payable_id, amount = %amount, "Manual payable payment registered");
        self.publish_payment(&payment).await;
        Ok(payment)
    }

    /// Every payable with a balance, aged from its reference date.
    #[instrument(skip(self))]
    pub async fn aging_report(&self, today: NaiveDate) -> Result<AgingReport, ServiceError> {
        let db = self.db_pool.as_ref();
        let mut report = AgingReport::default();

        let orders = PurchaseOrder::find()
            .filter(purchase_order::Column::Status.ne(PurchaseOrderStatus::Cancelled))
            .filter(purchase_order::Column::LastReceiptAt.is_not_null())
            .order_by_asc(purchase_order::Column::Id)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;
        for order in orders {
            let reference_date = match order.last_receipt_at {
                Some(at) => at.date_naive(),
                None => continue,
            };
            let owed = amount_owed(&Self::lines_of(db, order.id).await?);
            let balance = money_round(owed - Self::paid_for_order(db, order.id).await?);
            if balance < MONEY_EPSILON {
                continue;
            }
            let days = (today - reference_date).num_days();
            report.push(AgingEntry {
                source: PayableSource::PurchaseOrder(order.id),
                supplier_id: Some(order.supplier_id),
                description: order.number,
                reference_date,
                days,
                bucket: bucket_for(days),
                balance,
            });
        }

        let payables = ManualPayable::find()
            .filter(manual_payable::Column::Status.eq(PayableStatus::Pending))
            .order_by_asc(manual_payable::Column::Id)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;
        for payable in payables {
            let balance = money_round(payable.amount - Self::paid_for_manual(db, payable.id).await?);
            if balance < MONEY_EPSILON {
                continue;
            }
            let days = (today - payable.reference_date).num_days();
            report.push(AgingEntry {
                source: PayableSource::Manual(payable.id),
                supplier_id: payable.supplier_id,
                description: payable.concept,
                reference_date: payable.reference_date,
                days,
                bucket: bucket_for(days),
                balance,
            });
        }

        Ok(report)
    }

    pub async fn get_purchase_order(&self, order_id: i32) -> Result<PurchaseOrderDetail, ServiceError> {
        let db = self.db_pool.as_ref();
        let order = PurchaseOrder::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Purchase order", order_id))?;
        Self::detail(db, order).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    #[rstest]
    #[case(0, AgingBucket::Current)]
    #[case(30, AgingBucket::Current)]
    #[case(31, AgingBucket::Days31To60)]
    #[case(60, AgingBucket::Days31To60)]
    #[case(61, AgingBucket::Over60)]
    fn aging_buckets(#[case] days: i64, #[case] expected: AgingBucket) {
        assert_eq!(bucket_for(days), expected);
    }

    #[test]
    fn owed_uses_real_price_when_recorded() {
        let line = |received, estimated, real| purchase_order_line::Model {
            id: 1,
            purchase_order_id: 1,
            part_id: Some(1),
            description: "Pads".into(),
            quantity_requested: dec!(10),
            quantity_received: received,
            estimated_unit_price: estimated,
            real_unit_price: real,
        };
        let lines = vec![
            line(dec!(6), dec!(100), Some(dec!(150))),
            line(dec!(2), dec!(10), None),
        ];
        assert_eq!(amount_owed(&lines), dec!(920));
    }
}
