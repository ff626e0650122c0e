//! Storage seam for the storefront.
//!
//! [`postgres::PgStore`] is the production backend. Every mutating method
//! runs as a single transaction and writes its [`DomainEvent`] to the outbox
//! in that same transaction.

use async_trait::async_trait;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::PoolError;
use serde::Serialize;
use shared::*;
use thiserror::Error;

#[cfg(test)]
pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(String),
    /// Deadlock, serialization failure or lock timeout. Safe to retry the
    /// whole transaction.
    #[error("transient storage conflict: {0}")]
    Transient(String),
    #[error("database error: {0}")]
    Database(DieselError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match &err {
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, info) => {
                StoreError::Transient(info.message().to_string())
            }
            // Deadlocks and lock timeouts reach diesel as `Unknown`, so they are
            // told apart by message text. That text is only English while the
            // server runs with `lc_messages` set to `C` or `en_*`.
            DieselError::DatabaseError(_, info)
                if info.message().contains("deadlock detected")
                    || info.message().contains("lock timeout") =>
            {
                StoreError::Transient(info.message().to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}

impl From<bb8::RunError<PoolError>> for StoreError {
    fn from(err: bb8::RunError<PoolError>) -> Self {
        StoreError::Pool(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Rejected(#[from] ReservationError),
    #[error("invalid shipping details: {0}")]
    InvalidShipping(#[from] ValidationError),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CartError {
    #[error(transparent)]
    Rejected(#[from] CartRejection),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order {0} not found")]
    NotFound(OrderId),
    #[error(transparent)]
    Transition(#[from] StatusError),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("product {0} not found")]
    NotFound(ProductId),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

macro_rules! storage_from_diesel {
    ($($ty:ty),*) => {
        $(impl From<DieselError> for $ty {
            fn from(err: DieselError) -> Self {
                Self::Storage(err.into())
            }
        })*
    };
}

storage_from_diesel!(CheckoutError, CartError, OrderError, CatalogError);

impl From<serde_json::Error> for CheckoutError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.into())
    }
}

/// Who is moving an order and in which capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderActor {
    /// The owning account; only its own orders are visible.
    Owner(AccountId),
    /// Staff acting on any order.
    Staff(AccountId),
}

impl OrderActor {
    pub fn account_id(&self) -> AccountId {
        match self {
            OrderActor::Owner(id) | OrderActor::Staff(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrdersFeed {
    pub orders: Vec<OrderRecord>,
    pub last_id: OrderId,
}

pub const FEED_LIMIT: i64 = 10;

#[async_trait]
pub trait CheckoutStore: Send + Sync {
    async fn list_products(&self) -> Result<Vec<Product>, StoreError>;
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError>;
    async fn create_product(&self, actor: AccountId, product: &NewProduct) -> Result<Product, CatalogError>;
    /// Takes the product row lock, so edits serialize with checkouts.
    async fn update_product(
        &self,
        actor: AccountId,
        id: ProductId,
        patch: &ProductPatch,
    ) -> Result<Product, CatalogError>;

    /// Returns the account's cart, creating it on first access.
    async fn load_cart(&self, account_id: AccountId) -> Result<CartView, StoreError>;
    async fn add_to_cart(
        &self,
        account_id: AccountId,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<CartAddition, CartError>;
    async fn update_cart_item(
        &self,
        account_id: AccountId,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<CartUpdate, CartError>;
    async fn remove_cart_item(&self, account_id: AccountId, product_id: ProductId) -> Result<(), CartError>;

    /// Unlocked read of the current stock for the given products.
    async fn observe_stock(&self, ids: &[ProductId]) -> Result<Vec<ProductStock>, StoreError>;
    /// The atomic phase of a reservation: lock rows in ascending id order,
    /// re-validate, create the order, decrement stock, clear the cart.
    async fn commit_reservation(&self, request: &ReservationRequest) -> Result<PlacedOrder, CheckoutError>;

    async fn list_orders(&self, account_id: AccountId) -> Result<Vec<OrderRecord>, StoreError>;
    async fn orders_feed(&self, last_id: OrderId) -> Result<OrdersFeed, StoreError>;
    async fn order_status_counts(&self) -> Result<Vec<(OrderStatus, i64)>, StoreError>;
    async fn transition_order(
        &self,
        actor: OrderActor,
        order_id: OrderId,
        to: OrderStatus,
    ) -> Result<OrderRecord, OrderError>;

    /// Records an event outside of any other write.
    async fn record_event(&self, event: &DomainEvent) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database_error(kind: DatabaseErrorKind, message: &str) -> DieselError {
        DieselError::DatabaseError(kind, Box::new(message.to_string()))
    }

    #[test]
    fn lock_conflicts_are_transient() {
        let errors = [
            database_error(DatabaseErrorKind::Unknown, "deadlock detected"),
            database_error(
                DatabaseErrorKind::Unknown,
                "canceling statement due to lock timeout",
            ),
            database_error(
                DatabaseErrorKind::SerializationFailure,
                "could not serialize access due to concurrent update",
            ),
        ];

        for err in errors {
            let store_error = StoreError::from(err);
            assert!(store_error.is_transient(), "{store_error} should be retried");
        }
    }

    #[test]
    fn other_database_errors_are_not_retried() {
        let unique = StoreError::from(database_error(
            DatabaseErrorKind::UniqueViolation,
            "duplicate key value violates unique constraint",
        ));
        assert!(!unique.is_transient());
        assert!(matches!(unique, StoreError::Database(_)));

        let missing = StoreError::from(DieselError::NotFound);
        assert!(!missing.is_transient());
    }
}
