use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AccountId, OrderId, OrderStatus, ProductId, Shortfall};

/// Domain events emitted explicitly by mutating operations and consumed by the
/// audit service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    OrderCreated {
        order_id: OrderId,
        account_id: AccountId,
        total_amount: BigDecimal,
        line_count: usize,
    },
    InsufficientStock {
        account_id: AccountId,
        shortfalls: Vec<Shortfall>,
    },
    OrderStatusChanged {
        order_id: OrderId,
        account_id: AccountId,
        actor_id: AccountId,
        from: OrderStatus,
        to: OrderStatus,
    },
    CartItemAdded {
        account_id: AccountId,
        product_id: ProductId,
        quantity: i32,
    },
    CartItemUpdated {
        account_id: AccountId,
        product_id: ProductId,
        quantity: i32,
    },
    CartItemRemoved {
        account_id: AccountId,
        product_id: ProductId,
    },
    ProductCreated {
        product_id: ProductId,
        actor_id: AccountId,
    },
    ProductUpdated {
        product_id: ProductId,
        actor_id: AccountId,
        stock_quantity: i32,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::OrderCreated { .. } => "order.created",
            DomainEvent::InsufficientStock { .. } => "order.insufficient_stock",
            DomainEvent::OrderStatusChanged { .. } => "order.status_changed",
            DomainEvent::CartItemAdded { .. } => "cart.item_added",
            DomainEvent::CartItemUpdated { .. } => "cart.item_updated",
            DomainEvent::CartItemRemoved { .. } => "cart.item_removed",
            DomainEvent::ProductCreated { .. } => "product.created",
            DomainEvent::ProductUpdated { .. } => "product.updated",
        }
    }

    /// `Entity:id` label of the record the event is about.
    pub fn aggregate_id(&self) -> String {
        match self {
            DomainEvent::OrderCreated { order_id, .. }
            | DomainEvent::OrderStatusChanged { order_id, .. } => format!("OrderRequest:{order_id}"),
            DomainEvent::InsufficientStock { account_id, .. } => format!("Account:{account_id}"),
            DomainEvent::CartItemAdded { account_id, product_id, .. }
            | DomainEvent::CartItemUpdated { account_id, product_id, .. }
            | DomainEvent::CartItemRemoved { account_id, product_id } => {
                format!("CartItem:{account_id}/{product_id}")
            }
            DomainEvent::ProductCreated { product_id, .. }
            | DomainEvent::ProductUpdated { product_id, .. } => format!("Product:{product_id}"),
        }
    }

    /// The account that caused the event.
    pub fn actor(&self) -> AccountId {
        match self {
            DomainEvent::OrderCreated { account_id, .. }
            | DomainEvent::InsufficientStock { account_id, .. }
            | DomainEvent::CartItemAdded { account_id, .. }
            | DomainEvent::CartItemUpdated { account_id, .. }
            | DomainEvent::CartItemRemoved { account_id, .. } => *account_id,
            DomainEvent::OrderStatusChanged { actor_id, .. }
            | DomainEvent::ProductCreated { actor_id, .. }
            | DomainEvent::ProductUpdated { actor_id, .. } => *actor_id,
        }
    }

    pub fn audit_action(&self) -> &'static str {
        match self {
            DomainEvent::OrderCreated { .. } => "create_order",
            DomainEvent::InsufficientStock { .. } => "checkout_rejected",
            DomainEvent::OrderStatusChanged { to, .. } => match to {
                OrderStatus::Confirmed => "confirm_order",
                OrderStatus::Declined => "decline_order",
                OrderStatus::Cancelled => "cancel_order",
                OrderStatus::New => "update_order",
            },
            DomainEvent::CartItemAdded { .. } => "add_to_cart",
            DomainEvent::CartItemUpdated { .. } => "update_cart",
            DomainEvent::CartItemRemoved { .. } => "remove_from_cart",
            DomainEvent::ProductCreated { .. } => "create",
            DomainEvent::ProductUpdated { .. } => "update",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(event: &DomainEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_id: event.aggregate_id(),
            event_type: event.event_type().to_string(),
            event_data: serde_json::to_value(event)?,
            processed: false,
            created_at: Utc::now(),
        })
    }
}

/// Wire format published to the events topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub event: DomainEvent,
}
