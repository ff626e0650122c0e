//! In-process store used by the test suite. Each product is its own
//! `tokio::sync::Mutex`, standing in for a Postgres row lock.

use async_trait::async_trait;
use chrono::Utc;
use shared::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Mutex as RowLock;

use super::*;

#[derive(Default)]
pub struct MemoryStore {
    products: RwLock<BTreeMap<ProductId, Arc<RowLock<Product>>>>,
    carts: Mutex<HashMap<AccountId, BTreeMap<ProductId, i32>>>,
    orders: Mutex<BTreeMap<OrderId, OrderRecord>>,
    events: Mutex<Vec<DomainEvent>>,
    next_product_id: AtomicI64,
    next_order_id: AtomicI64,
    transient_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_product(&self, name: &str, price: &str, stock_quantity: i32) -> ProductId {
        let id = self.next_product_id.fetch_add(1, Ordering::SeqCst) + 1;
        let product = Product {
            id,
            name: name.to_string(),
            price: price.parse().expect("valid price"),
            stock_quantity,
        };
        self.products
            .write()
            .unwrap()
            .insert(id, Arc::new(RowLock::new(product)));
        id
    }

    pub fn seed_cart(&self, account_id: AccountId, lines: &[(ProductId, i32)]) {
        let mut carts = self.carts.lock().unwrap();
        let cart = carts.entry(account_id).or_default();
        for (product_id, quantity) in lines {
            cart.insert(*product_id, *quantity);
        }
    }

    pub async fn stock_of(&self, id: ProductId) -> i32 {
        let row = self.row(id).expect("seeded product");
        let product = row.lock().await;
        product.stock_quantity
    }

    pub async fn catalog(&self) -> Vec<Product> {
        let rows: Vec<_> = self.products.read().unwrap().values().cloned().collect();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.lock().await.clone());
        }
        out
    }

    pub fn cart_lines(&self, account_id: AccountId) -> BTreeMap<ProductId, i32> {
        self.carts
            .lock()
            .unwrap()
            .get(&account_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        self.orders.lock().unwrap().values().cloned().collect()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }

    /// The next `count` reservation commits fail as if Postgres had detected
    /// a deadlock.
    pub fn fail_next_commits(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn row(&self, id: ProductId) -> Option<Arc<RowLock<Product>>> {
        self.products.read().unwrap().get(&id).cloned()
    }

    fn push_event(&self, event: DomainEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn snapshot_product(&self, id: ProductId) -> Option<Product> {
        match self.row(id) {
            Some(row) => Some(row.lock().await.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl CheckoutStore for MemoryStore {
    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        Ok(self.catalog().await)
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.snapshot_product(id).await)
    }

    async fn create_product(&self, actor: AccountId, product: &NewProduct) -> Result<Product, CatalogError> {
        product.validate()?;
        let price = product.price.to_string();
        let id = self.seed_product(product.name.trim(), &price, product.stock_quantity);
        self.push_event(DomainEvent::ProductCreated { product_id: id, actor_id: actor });
        self.snapshot_product(id).await.ok_or(CatalogError::NotFound(id))
    }

    async fn update_product(
        &self,
        actor: AccountId,
        id: ProductId,
        patch: &ProductPatch,
    ) -> Result<Product, CatalogError> {
        patch.validate()?;
        let row = self.row(id).ok_or(CatalogError::NotFound(id))?;
        let mut product = row.lock().await;
        patch.apply(&mut product);
        self.push_event(DomainEvent::ProductUpdated {
            product_id: id,
            actor_id: actor,
            stock_quantity: product.stock_quantity,
        });
        Ok(product.clone())
    }

    async fn load_cart(&self, account_id: AccountId) -> Result<CartView, StoreError> {
        let lines: Vec<(ProductId, i32)> = {
            let mut carts = self.carts.lock().unwrap();
            carts.entry(account_id).or_default().iter().map(|(p, q)| (*p, *q)).collect()
        };

        let mut items = Vec::with_capacity(lines.len());
        for (product_id, quantity) in lines {
            if let Some(product) = self.snapshot_product(product_id).await {
                let line_total = &product.price * bigdecimal::BigDecimal::from(quantity);
                items.push(CartItemView {
                    product_id,
                    name: product.name,
                    price: product.price,
                    quantity,
                    stock_quantity: product.stock_quantity,
                    line_total,
                });
            }
        }
        Ok(CartView::new(items))
    }

    async fn add_to_cart(
        &self,
        account_id: AccountId,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<CartAddition, CartError> {
        let available = self
            .snapshot_product(product_id)
            .await
            .ok_or(CartRejection::ProductNotFound(product_id))?
            .stock_quantity;

        let (addition, existed) = {
            let mut carts = self.carts.lock().unwrap();
            let cart = carts.entry(account_id).or_default();
            let in_cart = cart.get(&product_id).copied().unwrap_or(0);
            let addition = plan_add(product_id, available, in_cart, quantity)?;
            cart.insert(product_id, addition.quantity);
            (addition, in_cart > 0)
        };

        self.push_event(if existed {
            DomainEvent::CartItemUpdated { account_id, product_id, quantity: addition.quantity }
        } else {
            DomainEvent::CartItemAdded { account_id, product_id, quantity: addition.quantity }
        });
        Ok(addition)
    }

    async fn update_cart_item(
        &self,
        account_id: AccountId,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<CartUpdate, CartError> {
        let available = self
            .snapshot_product(product_id)
            .await
            .map(|product| product.stock_quantity)
            .unwrap_or(0);

        let update = {
            let mut carts = self.carts.lock().unwrap();
            let cart = carts.entry(account_id).or_default();
            if !cart.contains_key(&product_id) {
                return Err(CartRejection::NotInCart(product_id).into());
            }
            let update = plan_update(product_id, available, quantity);
            match update {
                CartUpdate::Set { quantity, .. } => {
                    cart.insert(product_id, quantity);
                }
                CartUpdate::Removed { .. } => {
                    cart.remove(&product_id);
                }
            }
            update
        };

        self.push_event(match update {
            CartUpdate::Set { quantity, .. } => DomainEvent::CartItemUpdated { account_id, product_id, quantity },
            CartUpdate::Removed { .. } => DomainEvent::CartItemRemoved { account_id, product_id },
        });
        Ok(update)
    }

    async fn remove_cart_item(&self, account_id: AccountId, product_id: ProductId) -> Result<(), CartError> {
        let removed = self
            .carts
            .lock()
            .unwrap()
            .get_mut(&account_id)
            .and_then(|cart| cart.remove(&product_id));
        if removed.is_none() {
            return Err(CartRejection::NotInCart(product_id).into());
        }
        self.push_event(DomainEvent::CartItemRemoved { account_id, product_id });
        Ok(())
    }

    async fn observe_stock(&self, ids: &[ProductId]) -> Result<Vec<ProductStock>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(product) = self.snapshot_product(*id).await {
                out.push(ProductStock {
                    product_id: product.id,
                    name: product.name,
                    price: product.price,
                    stock_quantity: product.stock_quantity,
                });
            }
        }
        Ok(out)
    }

    async fn commit_reservation(&self, request: &ReservationRequest) -> Result<PlacedOrder, CheckoutError> {
        if self.take_failure() {
            return Err(StoreError::Transient("deadlock detected".to_string()).into());
        }

        let rows: Vec<Arc<RowLock<Product>>> = {
            let products = self.products.read().unwrap();
            request
                .product_ids()
                .iter()
                .filter_map(|id| products.get(id).cloned())
                .collect()
        };

        // Ascending id order, one row at a time, yielding in between so
        // concurrent commits interleave.
        let mut guards = Vec::with_capacity(rows.len());
        for row in rows {
            guards.push(row.lock_owned().await);
            tokio::task::yield_now().await;
        }

        let stock: Vec<ProductStock> = guards
            .iter()
            .map(|product| ProductStock {
                product_id: product.id,
                name: product.name.clone(),
                price: product.price.clone(),
                stock_quantity: product.stock_quantity,
            })
            .collect();
        let settlement = settle(&request.lines, &stock)?;

        for guard in guards.iter_mut() {
            if let Some((_, quantity)) = settlement.decrements().find(|(id, _)| *id == guard.id) {
                guard.stock_quantity -= quantity;
            }
        }

        let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.orders.lock().unwrap().insert(
            order_id,
            OrderRecord {
                id: order_id,
                account_id: request.account_id,
                shipping: request.shipping.clone(),
                cart_snapshot: settlement.lines.clone(),
                total_amount: settlement.total_amount.clone(),
                status: OrderStatus::New,
                created_at: Utc::now(),
            },
        );
        self.carts.lock().unwrap().remove(&request.account_id);
        self.push_event(DomainEvent::OrderCreated {
            order_id,
            account_id: request.account_id,
            total_amount: settlement.total_amount.clone(),
            line_count: settlement.lines.len(),
        });

        Ok(PlacedOrder {
            order_id,
            total_amount: settlement.total_amount,
            snapshot: settlement.lines,
        })
    }

    async fn list_orders(&self, account_id: AccountId) -> Result<Vec<OrderRecord>, StoreError> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .values()
            .rev()
            .filter(|order| order.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn orders_feed(&self, last_id: OrderId) -> Result<OrdersFeed, StoreError> {
        let orders: Vec<OrderRecord> = self
            .orders
            .lock()
            .unwrap()
            .range(last_id + 1..)
            .rev()
            .take(FEED_LIMIT as usize)
            .map(|(_, order)| order.clone())
            .collect();
        let last_id = orders.iter().map(|order| order.id).max().unwrap_or(last_id);
        Ok(OrdersFeed { orders, last_id })
    }

    async fn order_status_counts(&self) -> Result<Vec<(OrderStatus, i64)>, StoreError> {
        let orders = self.orders.lock().unwrap();
        Ok(status_counts(orders.values().map(|order| (order.status, 1))))
    }

    async fn transition_order(
        &self,
        actor: OrderActor,
        order_id: OrderId,
        to: OrderStatus,
    ) -> Result<OrderRecord, OrderError> {
        let record = {
            let mut orders = self.orders.lock().unwrap();
            let order = orders.get_mut(&order_id).ok_or(OrderError::NotFound(order_id))?;
            if let OrderActor::Owner(owner) = actor {
                if order.account_id != owner {
                    return Err(OrderError::NotFound(order_id));
                }
            }
            let from = order.status;
            order.status = from.transition(to)?;
            (order.clone(), from)
        };

        let (record, from) = record;
        self.push_event(DomainEvent::OrderStatusChanged {
            order_id,
            account_id: record.account_id,
            actor_id: actor.account_id(),
            from,
            to: record.status,
        });
        Ok(record)
    }

    async fn record_event(&self, event: &DomainEvent) -> Result<(), StoreError> {
        self.push_event(event.clone());
        Ok(())
    }
}
