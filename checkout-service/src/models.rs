use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::*;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = crate::schema::products)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ProductRow {
    pub id: i64,
    pub name: String,
    pub price: BigDecimal,
    pub stock_quantity: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::products)]
pub struct NewProductRow {
    pub name: String,
    pub price: BigDecimal,
    pub stock_quantity: i32,
}

#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::products)]
pub struct ProductChangeset {
    pub name: Option<String>,
    pub price: Option<BigDecimal>,
    pub stock_quantity: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            price: row.price,
            stock_quantity: row.stock_quantity,
        }
    }
}

impl From<ProductRow> for ProductStock {
    fn from(row: ProductRow) -> Self {
        Self {
            product_id: row.id,
            name: row.name,
            price: row.price,
            stock_quantity: row.stock_quantity,
        }
    }
}

impl From<&NewProduct> for NewProductRow {
    fn from(product: &NewProduct) -> Self {
        Self {
            name: product.name.trim().to_string(),
            price: product.price.clone(),
            stock_quantity: product.stock_quantity,
        }
    }
}

impl From<&ProductPatch> for ProductChangeset {
    fn from(patch: &ProductPatch) -> Self {
        Self {
            name: patch.name.as_ref().map(|name| name.trim().to_string()),
            price: patch.price.clone(),
            stock_quantity: patch.stock_quantity,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::carts)]
pub struct NewCart {
    pub account_id: i64,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = crate::schema::cart_items)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CartItemRow {
    pub id: i64,
    pub cart_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::cart_items)]
pub struct NewCartItem {
    pub cart_id: i64,
    pub product_id: i64,
    pub quantity: i32,
}

pub fn cart_item_view(item: CartItemRow, product: ProductRow) -> CartItemView {
    let line_total = &product.price * BigDecimal::from(item.quantity);
    CartItemView {
        product_id: product.id,
        name: product.name,
        price: product.price,
        quantity: item.quantity,
        stock_quantity: product.stock_quantity,
        line_total,
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = crate::schema::order_requests)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OrderRequestRow {
    pub id: i64,
    pub account_id: i64,
    pub full_name: String,
    pub phone: String,
    pub email: String,
    pub delivery_type: String,
    pub pickup_point_id: Option<i64>,
    pub payment_method: String,
    pub comment: String,
    pub accept_terms: bool,
    pub cart_snapshot: serde_json::Value,
    pub total_amount: BigDecimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_requests)]
pub struct NewOrderRequestRow {
    pub account_id: i64,
    pub full_name: String,
    pub phone: String,
    pub email: String,
    pub delivery_type: String,
    pub pickup_point_id: Option<i64>,
    pub payment_method: String,
    pub comment: String,
    pub accept_terms: bool,
    pub cart_snapshot: serde_json::Value,
    pub total_amount: BigDecimal,
    pub status: String,
}

impl NewOrderRequestRow {
    pub fn new(request: &ReservationRequest, settlement: &Settlement) -> Result<Self, serde_json::Error> {
        let shipping = &request.shipping;
        Ok(Self {
            account_id: request.account_id,
            full_name: shipping.full_name.trim().to_string(),
            phone: shipping.phone.trim().to_string(),
            email: shipping.email.trim().to_string(),
            delivery_type: shipping.delivery_type.as_str().to_string(),
            pickup_point_id: shipping.pickup_point_id,
            payment_method: shipping.payment_method.as_str().to_string(),
            comment: shipping.comment.clone(),
            accept_terms: shipping.accept_terms,
            cart_snapshot: serde_json::to_value(&settlement.lines)?,
            total_amount: settlement.total_amount.clone(),
            status: OrderStatus::New.as_str().to_string(),
        })
    }
}

impl TryFrom<OrderRequestRow> for OrderRecord {
    type Error = StoreError;

    fn try_from(row: OrderRequestRow) -> Result<Self, Self::Error> {
        let corrupt = |what: String| StoreError::Corrupt(format!("order {}: {}", row.id, what));
        let shipping = ShippingInfo {
            full_name: row.full_name.clone(),
            phone: row.phone.clone(),
            email: row.email.clone(),
            delivery_type: row.delivery_type.parse().map_err(|e: ValidationError| corrupt(e.to_string()))?,
            pickup_point_id: row.pickup_point_id,
            payment_method: row.payment_method.parse().map_err(|e: ValidationError| corrupt(e.to_string()))?,
            comment: row.comment.clone(),
            accept_terms: row.accept_terms,
        };
        let status = row.status.parse().map_err(|e: StatusError| corrupt(e.to_string()))?;
        let cart_snapshot = serde_json::from_value(row.cart_snapshot.clone())?;

        Ok(Self {
            id: row.id,
            account_id: row.account_id,
            shipping,
            cart_snapshot,
            total_amount: row.total_amount,
            status,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl From<OutboxEvent> for DbOutboxEvent {
    fn from(event: OutboxEvent) -> Self {
        Self {
            id: event.id,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            event_data: event.event_data,
            processed: event.processed,
            created_at: event.created_at,
        }
    }
}

impl TryFrom<DbOutboxEvent> for EventEnvelope {
    type Error = serde_json::Error;

    fn try_from(row: DbOutboxEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            occurred_at: row.created_at,
            event: serde_json::from_value(row.event_data)?,
        })
    }
}
