use crate::{
    db::DbPool,
    entities::{
        client::{self, Entity as Client},
        employee::{self, Entity as Employee},
        service_item::{self, Entity as ServiceItem},
        supplier::{self, Entity as Supplier},
        vehicle::{self, Entity as Vehicle},
    },
    errors::ServiceError,
    money::money_round,
    services::{ensure_non_negative, optional_text, require_text, Actor},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use validator::Validate;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct NewClient {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(max = 20))]
    pub tax_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ClientUpdate {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(max = 20))]
    pub tax_id: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct NewVehicle {
    pub client_id: i32,
    #[validate(length(min = 1, max = 80))]
    pub make: String,
    #[validate(length(min = 1, max = 80))]
    pub model: String,
    #[validate(range(min = 1900, max = 2100))]
    pub year: Option<i32>,
    #[validate(length(max = 17))]
    pub vin: Option<String>,
    #[validate(length(max = 16))]
    pub plate: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct NewSupplier {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
}

/// Reference data the engines point at: clients and their vehicles,
/// employees, the labour catalog and suppliers.
#[derive(Clone)]
pub struct CatalogService {
    db_pool: Arc<DbPool>,
}

impl CatalogService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self, input))]
    pub async fn create_client(&self, _actor: Actor, input: NewClient) -> Result<client::Model, ServiceError> {
        input.validate()?;
        let now = Utc::now();
        let client = client::ActiveModel {
            name: Set(require_text(&input.name, "name")?),
            phone: Set(optional_text(input.phone.as_deref())),
            email: Set(optional_text(input.email.as_deref())),
            tax_id: Set(optional_text(input.tax_id.as_deref())),
            active: Set(true),
            deleted: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(self.db_pool.as_ref())
        .await
        .map_err(ServiceError::db_error)?;

        info!(client_id = client.id, "Client created");
        Ok(client)
    }

    async fn live_client(&self, client_id: i32) -> Result<client::Model, ServiceError> {
        Client::find_by_id(client_id)
            .one(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)?
            .filter(|c| !c.deleted)
            .ok_or_else(|| ServiceError::not_found("Client", client_id))
    }

    #[instrument(skip(self, update))]
    pub async fn update_client(
        &self,
        _actor: Actor,
        client_id: i32,
        update: ClientUpdate,
    ) -> Result<client::Model, ServiceError> {
        update.validate()?;
        let client = self.live_client(client_id).await?;

        let mut active: client::ActiveModel = client.into();
        if let Some(name) = update.name.as_deref() {
            active.name = Set(require_text(name, "name")?);
        }
        if update.phone.is_some() {
            active.phone = Set(optional_text(update.phone.as_deref()));
        }
        if update.email.is_some() {
            active.email = Set(optional_text(update.email.as_deref()));
        }
        if update.tax_id.is_some() {
            active.tax_id = Set(optional_text(update.tax_id.as_deref()));
        }
        if let Some(flag) = update.active {
            active.active = Set(flag);
        }
        active.updated_at = Set(Utc::now());
        active
            .update(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn soft_delete_client(&self, _actor: Actor, client_id: i32) -> Result<client::Model, ServiceError> {
        let client = self.live_client(client_id).await?;
        let mut active: client::ActiveModel = client.into();
        active.deleted = Set(true);
        active.active = Set(false);
        active.updated_at = Set(Utc::now());
        let client = active
            .update(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)?;
        info!(client_id, "Client soft-deleted");
        Ok(client)
    }

    /// Registers a vehicle for an active client. A VIN must be unique among live vehicles.
    #[instrument(skip(self, input), fields(client_id = input.client_id))]
    pub async fn create_vehicle(&self, _actor: Actor, input: NewVehicle) -> Result<vehicle::Model, ServiceError> {
        input.validate()?;
        let client = self.live_client(input.client_id).await?;
        if !client.active {
            return Err(ServiceError::ValidationError(format!(
                "Client {} is inactive",
                client.name
            )));
        }

        let db = self.db_pool.as_ref();
        let vin = optional_text(input.vin.as_deref()).map(|v| v.to_uppercase());
        if let Some(vin) = vin.as_deref() {
            let taken = Vehicle::find()
                .filter(vehicle::Column::Vin.eq(vin))
                .filter(vehicle::Column::Deleted.eq(false))
                .count(db)
                .await
                .map_err(ServiceError::db_error)?;
            if taken > 0 {
                return Err(ServiceError::Conflict(format!(
                    "A vehicle with VIN {} already exists",
                    vin
                )));
            }
        }

        let now = Utc::now();
        let vehicle = vehicle::ActiveModel {
            client_id: Set(client.id),
            make: Set(require_text(&input.make, "make")?),
            model: Set(require_text(&input.model, "model")?),
            year: Set(input.year),
            vin: Set(vin),
            plate: Set(optional_text(input.plate.as_deref()).map(|p| p.to_uppercase())),
            deleted: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(ServiceError::db_error)?;

        info!(vehicle_id = vehicle.id, "Vehicle registered");
        Ok(vehicle)
    }

    /// Frees the VIN (`<vin>_DEL_<id>`) and hides the vehicle.
    #[instrument(skip(self))]
    pub async fn soft_delete_vehicle(&self, _actor: Actor, vehicle_id: i32) -> Result<vehicle::Model, ServiceError> {
        let db = self.db_pool.as_ref();
        let vehicle = Vehicle::find_by_id(vehicle_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|v| !v.deleted)
            .ok_or_else(|| ServiceError::not_found("Vehicle", vehicle_id))?;

        let vin = vehicle.vin.as_ref().map(|v| format!("{}_DEL_{}", v, vehicle.id));
        let mut active: vehicle::ActiveModel = vehicle.into();
        active.vin = Set(vin);
        active.deleted = Set(true);
        active.updated_at = Set(Utc::now());
        active.update(db).await.map_err(ServiceError::db_error)
    }

    pub async fn vehicles_for_client(&self, client_id: i32) -> Result<Vec<vehicle::Model>, ServiceError> {
        Vehicle::find()
            .filter(vehicle::Column::ClientId.eq(client_id))
            .filter(vehicle::Column::Deleted.eq(false))
            .order_by_asc(vehicle::Column::Id)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn create_employee(
        &self,
        _actor: Actor,
        name: &str,
        is_technician: bool,
    ) -> Result<employee::Model, ServiceError> {
        employee::ActiveModel {
            name: Set(require_text(name, "name")?),
            is_technician: Set(is_technician),
            active: Set(true),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(self.db_pool.as_ref())
        .await
        .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn deactivate_employee(&self, _actor: Actor, employee_id: i32) -> Result<employee::Model, ServiceError> {
        let db = self.db_pool.as_ref();
        let employee = Employee::find_by_id(employee_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Employee", employee_id))?;
        let mut active: employee::ActiveModel = employee.into();
        active.active = Set(false);
        active.update(db).await.map_err(ServiceError::db_error)
    }

    pub async fn technicians(&self) -> Result<Vec<employee::Model>, ServiceError> {
        Employee::find()
            .filter(employee::Column::IsTechnician.eq(true))
            .filter(employee::Column::Active.eq(true))
            .order_by_asc(employee::Column::Name)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self, description))]
    pub async fn create_service_item(
        &self,
        _actor: Actor,
        name: &str,
        description: Option<&str>,
        price: Decimal,
    ) -> Result<service_item::Model, ServiceError> {
        let price = money_round(price);
        ensure_non_negative(price, "price")?;
        service_item::ActiveModel {
            name: Set(require_text(name, "name")?),
            description: Set(optional_text(description)),
            price: Set(price),
            active: Set(true),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(self.db_pool.as_ref())
        .await
        .map_err(ServiceError::db_error)
    }

    pub async fn service_items(&self) -> Result<Vec<service_item::Model>, ServiceError> {
        ServiceItem::find()
            .filter(service_item::Column::Active.eq(true))
            .order_by_asc(service_item::Column::Name)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self, input))]
    pub async fn create_supplier(&self, _actor: Actor, input: NewSupplier) -> Result<supplier::Model, ServiceError> {
        input.validate()?;
        supplier::ActiveModel {
            name: Set(require_text(&input.name, "name")?),
            email: Set(optional_text(input.email.as_deref())),
            phone: Set(optional_text(input.phone.as_deref())),
            active: Set(true),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(self.db_pool.as_ref())
        .await
        .map_err(ServiceError::db_error)
    }

    pub async fn get_supplier(&self, supplier_id: i32) -> Result<supplier::Model, ServiceError> {
        Supplier::find_by_id(supplier_id)
            .one(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Supplier", supplier_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_email_is_validated() {
        let client = NewClient {
            name: "Rosa".into(),
            email: Some("not-an-email".into()),
            ..Default::default()
        };
        assert!(client.validate().is_err());
    }

    #[test]
    fn vehicle_year_range() {
        let vehicle = NewVehicle {
            client_id: 1,
            make: "Nissan".into(),
            model: "Tsuru".into(),
            year: Some(1850),
            ..Default::default()
        };
        assert!(vehicle.validate().is_err());
    }
}
