use std::sync::Arc;

use crate::{
    config::BusinessRules,
    db::DbPool,
    events::EventSender,
    services::{
        cash_shifts::CashShiftService,
        catalog::CatalogService,
        commissions::CommissionService,
        documents::{DocumentRenderer, DocumentService, JsonDocumentRenderer},
        inventory::InventoryService,
        payables::{LoggingSupplierNotifier, PayablesService, SupplierNotifier},
        sales::SalesService,
        work_orders::WorkOrderService,
    },
};

/// Builds services that share one pool, one event channel and one rule set.
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    rules: BusinessRules,
}

impl ServiceFactory {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>, rules: BusinessRules) -> Self {
        Self {
            db_pool,
            event_sender,
            rules,
        }
    }

    pub fn inventory_service(&self) -> InventoryService {
        InventoryService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.rules.clone(),
        )
    }

    pub fn commission_service(&self) -> CommissionService {
        CommissionService::new(self.db_pool.clone())
    }

    pub fn cash_shift_service(&self) -> CashShiftService {
        CashShiftService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.rules.clone(),
            self.commission_service(),
        )
    }

    pub fn sales_service(&self) -> SalesService {
        SalesService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.inventory_service(),
            self.commission_service(),
            self.rules.clone(),
        )
    }

    pub fn work_order_service(&self) -> WorkOrderService {
        WorkOrderService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.inventory_service(),
            self.sales_service(),
        )
    }

    pub fn payables_service(&self, notifier: Arc<dyn SupplierNotifier>) -> PayablesService {
        PayablesService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.inventory_service(),
            notifier,
        )
    }

    pub fn catalog_service(&self) -> CatalogService {
        CatalogService::new(self.db_pool.clone())
    }

    pub fn document_service(&self, renderer: Arc<dyn DocumentRenderer>) -> DocumentService {
        DocumentService::new(
            self.db_pool.clone(),
            self.work_order_service(),
            self.sales_service(),
            renderer,
        )
    }

    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }

    pub fn rules(&self) -> &BusinessRules {
        &self.rules
    }
}

/// Every service the back office exposes, wired once.
#[derive(Clone)]
pub struct AppServices {
    pub inventory: InventoryService,
    pub commissions: CommissionService,
    pub cash_shifts: CashShiftService,
    pub sales: SalesService,
    pub work_orders: WorkOrderService,
    pub payables: PayablesService,
    pub catalog: CatalogService,
    pub documents: DocumentService,
}

impl AppServices {
    /// Wires the services with the logging supplier notifier and the JSON renderer.
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>, rules: BusinessRules) -> Self {
        Self::with_ports(
            db_pool,
            event_sender,
            rules,
            Arc::new(LoggingSupplierNotifier),
            Arc::new(JsonDocumentRenderer),
        )
    }

    pub fn with_ports(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        rules: BusinessRules,
        notifier: Arc<dyn SupplierNotifier>,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Self {
        let factory = ServiceFactory::new(db_pool, event_sender, rules);
        Self {
            inventory: factory.inventory_service(),
            commissions: factory.commission_service(),
            cash_shifts: factory.cash_shift_service(),
            sales: factory.sales_service(),
            work_orders: factory.work_order_service(),
            payables: factory.payables_service(notifier),
            catalog: factory.catalog_service(),
            documents: factory.document_service(renderer),
        }
    }
}
