use shared::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::store::{CheckoutError, CheckoutStore};

/// Turns a cart into an order without ever overselling.
///
/// A lock-free pre-check rejects obviously short carts cheaply; the store's
/// atomic phase then re-validates against locked rows before anything is
/// written. Both phases use [`settle`], so they cannot disagree about what
/// "enough stock" means.
pub struct Reservations {
    store: Arc<dyn CheckoutStore>,
    retry_backoff: Duration,
}

impl Reservations {
    pub fn new(store: Arc<dyn CheckoutStore>, retry_backoff: Duration) -> Self {
        Self { store, retry_backoff }
    }

    /// Checks out the account's stored cart.
    pub async fn checkout(&self, account_id: AccountId, shipping: &ShippingInfo) -> Result<PlacedOrder, CheckoutError> {
        let cart = self.store.load_cart(account_id).await?;
        self.reserve_and_create_order(account_id, &cart.lines(), shipping).await
    }

    pub async fn reserve_and_create_order(
        &self,
        account_id: AccountId,
        cart_items: &[CartLine],
        shipping: &ShippingInfo,
    ) -> Result<PlacedOrder, CheckoutError> {
        let lines = merge_lines(cart_items)?;
        shipping.validate()?;

        let request = ReservationRequest {
            account_id,
            lines,
            shipping: shipping.clone(),
        };

        let observed = self.store.observe_stock(&request.product_ids()).await?;
        if let Err(rejection) = settle(&request.lines, &observed) {
            info!("Checkout for account {} rejected before locking: {}", account_id, rejection);
            self.note_rejection(account_id, &rejection).await;
            return Err(rejection.into());
        }

        match self.commit_with_retry(&request).await {
            Ok(placed) => {
                info!(
                    "Order {} placed for account {} ({} lines, total {})",
                    placed.order_id,
                    account_id,
                    placed.snapshot.len(),
                    placed.total_amount
                );
                Ok(placed)
            }
            Err(CheckoutError::Rejected(rejection)) => {
                info!("Checkout for account {} rejected under lock: {}", account_id, rejection);
                self.note_rejection(account_id, &rejection).await;
                Err(rejection.into())
            }
            Err(e) => {
                error!("Checkout for account {} failed: {}", account_id, e);
                Err(e)
            }
        }
    }

    async fn commit_with_retry(&self, request: &ReservationRequest) -> Result<PlacedOrder, CheckoutError> {
        match self.store.commit_reservation(request).await {
            Err(CheckoutError::Storage(e)) if e.is_transient() => {
                warn!(
                    "Transient conflict committing order for account {}, retrying in {:?}: {}",
                    request.account_id, self.retry_backoff, e
                );
                tokio::time::sleep(self.retry_backoff).await;
                self.store.commit_reservation(request).await
            }
            other => other,
        }
    }

    async fn note_rejection(&self, account_id: AccountId, rejection: &ReservationError) {
        let ReservationError::InsufficientStock(shortfalls) = rejection else {
            return;
        };
        let event = DomainEvent::InsufficientStock {
            account_id,
            shortfalls: shortfalls.clone(),
        };
        if let Err(e) = self.store.record_event(&event).await {
            warn!("Could not record insufficient stock event for account {}: {}", account_id, e);
        }
    }
}
