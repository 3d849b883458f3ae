use crate::{
    db::DbPool,
    entities::{
        client::{self, Entity as Client},
        employee::Entity as Employee,
        part::{self, Entity as Part},
        vehicle::{self, Entity as Vehicle},
        work_order::{WorkOrderPriority, WorkOrderStatus},
    },
    errors::ServiceError,
    services::{
        inventory::PartLocation,
        sales::{SaleDetail, SalesService},
        work_orders::{WorkOrderDetail, WorkOrderService},
    },
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{error, instrument};

/// Days a quotation stays valid.
pub const QUOTATION_VALIDITY_DAYS: i64 = 15;

const QUOTATION_DISCLAIMERS: &[&str] = &[
    "Prices are valid for 15 days from the issue date.",
    "Hidden damage found during the repair will be quoted separately.",
    "Parts supplied by the customer carry no workshop warranty.",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyBlock {
    pub client_name: String,
    pub client_phone: Option<String>,
    pub vehicle: Option<String>,
    pub plate: Option<String>,
    pub vin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentLine {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub customer_supplied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotationData {
    pub number: String,
    pub issued_at: DateTime<Utc>,
    pub valid_days: i64,
    pub party: PartyBlock,
    pub customer_complaint: String,
    pub services: Vec<DocumentLine>,
    pub parts: Vec<DocumentLine>,
    pub subtotal_services: Decimal,
    pub subtotal_parts: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub disclaimers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSheetPart {
    pub code: String,
    pub description: String,
    pub quantity: Decimal,
    pub location: String,
    pub customer_supplied: bool,
}

/// Technician-facing: no prices, but where each part sits in the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSheetData {
    pub number: String,
    pub status: WorkOrderStatus,
    pub priority: WorkOrderPriority,
    pub technician: Option<String>,
    pub party: PartyBlock,
    pub customer_complaint: String,
    pub initial_diagnosis: String,
    pub promise_date: Option<DateTime<Utc>>,
    pub tasks: Vec<String>,
    pub parts: Vec<WorkSheetPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketData {
    pub sale_id: i32,
    pub sale_date: DateTime<Utc>,
    pub work_order_number: Option<String>,
    pub client_name: Option<String>,
    pub lines: Vec<DocumentLine>,
    pub subtotal: Decimal,
    pub invoice_required: bool,
    pub total: Decimal,
    pub paid: Decimal,
    pub balance: Decimal,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "document", rename_all = "snake_case")]
pub enum Document {
    Quotation(QuotationData),
    WorkSheet(WorkSheetData),
    Ticket(TicketData),
}

impl Document {
    pub fn name(&self) -> &'static str {
        match self {
            Document::Quotation(_) => "quotation",
            Document::WorkSheet(_) => "work_sheet",
            Document::Ticket(_) => "ticket",
        }
    }
}

/// Turns a data document into printable bytes.
pub trait DocumentRenderer: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn render(&self, document: &Document) -> Result<Vec<u8>, ServiceError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDocumentRenderer;

impl DocumentRenderer for JsonDocumentRenderer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn render(&self, document: &Document) -> Result<Vec<u8>, ServiceError> {
        serde_json::to_vec_pretty(document).map_err(|e| {
            ServiceError::ExternalServiceError(format!(
                "Failed to render {}: {}",
                document.name(),
                e
            ))
        })
    }
}

fn document_line(
    description: &str,
    quantity: Decimal,
    unit_price: Decimal,
    subtotal: Decimal,
    customer_supplied: bool,
) -> DocumentLine {
    DocumentLine {
        description: description.to_string(),
        quantity,
        unit_price,
        subtotal,
        customer_supplied,
    }
}

#[derive(Clone)]
pub struct DocumentService {
    db_pool: Arc<DbPool>,
    work_orders: WorkOrderService,
    sales: SalesService,
    renderer: Arc<dyn DocumentRenderer>,
}

impl DocumentService {
    pub fn new(
        db_pool: Arc<DbPool>,
        work_orders: WorkOrderService,
        sales: SalesService,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Self {
        Self {
            db_pool,
            work_orders,
            sales,
            renderer,
        }
    }

    async fn party(&self, client_id: i32, vehicle_id: Option<i32>) -> Result<PartyBlock, ServiceError> {
        let db = self.db_pool.as_ref();
        let client: client::Model = Client::find_by_id(client_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Client", client_id))?;

        let vehicle: Option<vehicle::Model> = match vehicle_id {
            Some(id) => Vehicle::find_by_id(id)
                .one(db)
                .await
                .map_err(ServiceError::db_error)?,
            None => None,
        };

        Ok(PartyBlock {
            client_name: client.name,
            client_phone: client.phone,
            vehicle: vehicle.as_ref().map(|v| match v.year {
                Some(year) => format!("{} {} {}", v.make, v.model, year),
                None => format!("{} {}", v.make, v.model),
            }),
            plate: vehicle.as_ref().and_then(|v| v.plate.clone()),
            vin: vehicle.and_then(|v| v.vin),
        })
    }

    fn priced_lines(detail: &WorkOrderDetail) -> (Vec<DocumentLine>, Vec<DocumentLine>) {
        let services = detail
            .services
            .iter()
            .map(|l| document_line(&l.description, l.quantity, l.unit_price, l.subtotal, false))
            .collect();
        let parts = detail
            .parts
            .iter()
            .map(|l| {
                document_line(
                    &l.description,
                    l.quantity,
                    l.unit_price,
                    l.subtotal,
                    l.customer_supplies,
                )
            })
            .collect();
        (services, parts)
    }

    /// Customer-facing quotation at sale prices.
    #[instrument(skip(self))]
    pub async fn quotation(&self, order_id: i32) -> Result<Document, ServiceError> {
        let detail = self.work_orders.get(order_id).await?;
        let party = self
            .party(detail.order.client_id, detail.order.vehicle_id)
            .await?;
        let (services, parts) = Self::priced_lines(&detail);
        let order = detail.order;

        Ok(Document::Quotation(QuotationData {
            number: order.number,
            issued_at: order.quoted_at.unwrap_or_else(Utc::now),
            valid_days: QUOTATION_VALIDITY_DAYS,
            party,
            customer_complaint: order.customer_complaint,
            services,
            parts,
            subtotal_services: order.subtotal_services,
            subtotal_parts: order.subtotal_parts,
            discount: order.discount,
            total: order.total,
            disclaimers: QUOTATION_DISCLAIMERS.iter().map(|s| s.to_string()).collect(),
        }))
    }

    #[instrument(skip(self))]
    pub async fn work_sheet(&self, order_id: i32) -> Result<Document, ServiceError> {
        let detail = self.work_orders.get(order_id).await?;
        let db = self.db_pool.as_ref();
        let party = self
            .party(detail.order.client_id, detail.order.vehicle_id)
            .await?;

        let technician = match detail.order.technician_id {
            Some(id) => Employee::find_by_id(id)
                .one(db)
                .await
                .map_err(ServiceError::db_error)?
                .map(|e| e.name),
            None => None,
        };

        let part_ids: Vec<i32> = detail.parts.iter().map(|l| l.part_id).collect();
        let catalog: HashMap<i32, part::Model> = if part_ids.is_empty() {
            HashMap::new()
        } else {
            Part::find()
                .filter(part::Column::Id.is_in(part_ids))
                .all(db)
                .await
                .map_err(ServiceError::db_error)?
                .into_iter()
                .map(|p| (p.id, p))
                .collect()
        };

        let parts = detail
            .parts
            .iter()
            .map(|line| {
                let part = catalog.get(&line.part_id);
                WorkSheetPart {
                    code: part.map(|p| p.code.clone()).unwrap_or_default(),
                    description: line.description.clone(),
                    quantity: line.quantity,
                    location: part
                        .map(|p| PartLocation::of(p).label())
                        .unwrap_or_default(),
                    customer_supplied: line.customer_supplies,
                }
            })
            .collect();

        let order = detail.order;
        Ok(Document::WorkSheet(WorkSheetData {
            number: order.number,
            status: order.status,
            priority: order.priority,
            technician,
            party,
            customer_complaint: order.customer_complaint,
            initial_diagnosis: order.initial_diagnosis,
            promise_date: order.promise_date,
            tasks: detail.services.into_iter().map(|s| s.description).collect(),
            parts,
        }))
    }

    /// Post-sale ticket with payment state and balance.
    #[instrument(skip(self))]
    pub async fn ticket(&self, sale_id: i32) -> Result<Document, ServiceError> {
        let SaleDetail {
            sale,
            lines,
            paid,
            balance,
        } = self.sales.get_sale(sale_id).await?;
        let db = self.db_pool.as_ref();

        let client_name = match sale.client_id {
            Some(id) => Client::find_by_id(id)
                .one(db)
                .await
                .map_err(ServiceError::db_error)?
                .map(|c| c.name),
            None => None,
        };
        let work_order_number = match sale.work_order_id {
            Some(id) => self.work_orders.get(id).await.ok().map(|d| d.order.number),
            None => None,
        };

        Ok(Document::Ticket(TicketData {
            sale_id: sale.id,
            sale_date: sale.sale_date,
            work_order_number,
            client_name,
            lines: lines
                .iter()
                .map(|l| {
                    document_line(
                        &l.description,
                        l.quantity,
                        l.unit_price,
                        l.subtotal,
                        l.customer_supplied,
                    )
                })
                .collect(),
            subtotal: sale.subtotal,
            invoice_required: sale.invoice_required,
            total: sale.total,
            paid,
            balance,
            status: sale.status.as_str().to_string(),
        }))
    }

    pub fn content_type(&self) -> &'static str {
        self.renderer.content_type()
    }

    /// Renders through the configured port. Domain state is never touched here.
    pub fn render(&self, document: &Document) -> Result<Vec<u8>, ServiceError> {
        self.renderer.render(document).map_err(|e| {
            error!(document = document.name(), error = %e, "Document rendering failed");
            as_external(e)
        })
    }
}

fn as_external(err: ServiceError) -> ServiceError {
    match err {
        ServiceError::ExternalServiceError(_) => err,
        other => ServiceError::ExternalServiceError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticket() -> Document {
        Document::Ticket(TicketData {
            sale_id: 7,
            sale_date: Utc::now(),
            work_order_number: Some("OT-20240105-0001".into()),
            client_name: Some("Rosa".into()),
            lines: vec![document_line("Oil change", dec!(1), dec!(350.00), dec!(350.00), false)],
            subtotal: dec!(350.00),
            invoice_required: false,
            total: dec!(350.00),
            paid: dec!(100.00),
            balance: dec!(250.00),
            status: "PENDING".into(),
        })
    }

    #[test]
    fn json_renderer_tags_the_document() {
        let bytes = JsonDocumentRenderer.render(&ticket()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["document"], "ticket");
        assert_eq!(value["balance"], "250.00");
    }

    struct FailingRenderer;

    impl DocumentRenderer for FailingRenderer {
        fn content_type(&self) -> &'static str {
            "application/pdf"
        }

        fn render(&self, _document: &Document) -> Result<Vec<u8>, ServiceError> {
            Err(ServiceError::InternalError("font missing".into()))
        }
    }

    #[test]
    fn renderer_failures_are_external() {
        let err = FailingRenderer.render(&ticket()).unwrap_err();
        let err = as_external(err);
        assert!(matches!(err, ServiceError::ExternalServiceError(ref m) if m.contains("font missing")));
        assert_eq!(FailingRenderer.content_type(), "application/pdf");
    }
}
