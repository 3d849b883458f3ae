use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiving half of a bounded channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends after a committed change; a closed channel is logged and ignored.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Dropping domain event: {}", e);
        }
    }
}

// Domain events published after the owning transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    // Inventory events
    StockMovementRecorded {
        part_id: i32,
        movement_id: i32,
        kind: String,
        quantity: Decimal,
        stock_after: Decimal,
    },
    InventoryAlertRaised {
        part_id: i32,
        kind: String,
    },
    InventoryAlertResolved {
        part_id: i32,
    },

    // Work order events
    WorkOrderCreated(i32),
    WorkOrderStatusChanged {
        work_order_id: i32,
        old_status: String,
        new_status: String,
    },
    WorkOrderDeleted(i32),

    // Sale events
    SaleCreated(i32),
    SaleUpdated(i32),
    SaleStatusChanged {
        sale_id: i32,
        old_status: String,
        new_status: String,
    },
    PaymentRegistered {
        sale_id: i32,
        payment_id: i32,
        amount: Decimal,
    },
    CommissionsAccrued {
        sale_id: i32,
        rows: usize,
    },
    RefundDue {
        sale_id: i32,
        amount: Decimal,
    },

    // Cash shift events
    CashShiftOpened(i32),
    CashShiftClosed {
        shift_id: i32,
        difference: Decimal,
    },
    CashAlertRaised {
        shift_id: i32,
        kind: String,
        level: String,
    },

    // Accounts payable events
    PurchaseOrderStatusChanged {
        purchase_order_id: i32,
        old_status: String,
        new_status: String,
    },
    PayablePaymentRegistered {
        payment_id: i32,
        amount: Decimal,
    },
}

impl Event {
    /// Short stable name used in logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            Event::StockMovementRecorded { .. } => "stock_movement_recorded",
            Event::InventoryAlertRaised { .. } => "inventory_alert_raised",
            Event::InventoryAlertResolved { .. } => "inventory_alert_resolved",
            Event::WorkOrderCreated(_) => "work_order_created",
            Event::WorkOrderStatusChanged { .. } => "work_order_status_changed",
            Event::WorkOrderDeleted(_) => "work_order_deleted",
            Event::SaleCreated(_) => "sale_created",
            Event::SaleUpdated(_) => "sale_updated",
            Event::SaleStatusChanged { .. } => "sale_status_changed",
            Event::PaymentRegistered { .. } => "payment_registered",
            Event::CommissionsAccrued { .. } => "commissions_accrued",
            Event::RefundDue { .. } => "refund_due",
            Event::CashShiftOpened(_) => "cash_shift_opened",
            Event::CashShiftClosed { .. } => "cash_shift_closed",
            Event::CashAlertRaised { .. } => "cash_alert_raised",
            Event::PurchaseOrderStatusChanged { .. } => "purchase_order_status_changed",
            Event::PayablePaymentRegistered { .. } => "payable_payment_registered",
        }
    }
}

// Subscribers (an external notification channel, for instance) implement this.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

/// Drains the channel, logging every event and fanning it out to `handlers`.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Box<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::InventoryAlertRaised { part_id, kind } => {
                warn!(part_id, kind = %kind, "Inventory alert raised");
            }
            Event::CashAlertRaised {
                shift_id,
                kind,
                level,
            } => {
                warn!(shift_id, kind = %kind, level = %level, "Cash alert raised");
            }
            Event::RefundDue { sale_id, amount } => {
                warn!(sale_id, amount = %amount, "Refund due on sale");
            }
            other => {
                info!(event = other.name(), "Received event: {:?}", other);
            }
        }

        for handler in &handlers {
            if let Err(e) = handler.handle_event(event.clone()).await {
                error!("Event handler failed for {}: {}", event.name(), e);
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: Event) -> Result<(), String> {
            self.0
                .lock()
                .map_err(|e| e.to_string())?
                .push(event.name().to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_reach_handlers_in_order() {
        let (sender, rx) = EventSender::channel(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = tokio::spawn(process_events(rx, vec![Box::new(Recorder(seen.clone()))]));

        sender.send(Event::WorkOrderCreated(1)).await.unwrap();
        sender.send(Event::SaleCreated(2)).await.unwrap();
        drop(sender);
        worker.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["work_order_created".to_string(), "sale_created".to_string()]
        );
    }

    #[tokio::test]
    async fn send_or_log_tolerates_closed_channel() {
        let (sender, rx) = EventSender::channel(1);
        drop(rx);
        sender.send_or_log(Event::CashShiftOpened(3)).await;
        assert!(sender.send(Event::CashShiftOpened(3)).await.is_err());
    }
}
