use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::*;
use std::time::Duration;
use tracing::{info, warn};

use super::*;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    lock_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: DbPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }
}

async fn insert_event(conn: &mut AsyncPgConnection, event: &DomainEvent) -> Result<(), StoreError> {
    let row = DbOutboxEvent::from(OutboxEvent::new(event)?);
    diesel::insert_into(outbox_events::table)
        .values(&row)
        .execute(conn)
        .await?;
    Ok(())
}

async fn cart_id(conn: &mut AsyncPgConnection, account_id: AccountId) -> QueryResult<i64> {
    diesel::insert_into(carts::table)
        .values(&NewCart { account_id })
        .on_conflict(carts::account_id)
        .do_nothing()
        .execute(conn)
        .await?;

    carts::table
        .filter(carts::account_id.eq(account_id))
        .select(carts::id)
        .first::<i64>(conn)
        .await
}

async fn find_product(conn: &mut AsyncPgConnection, id: ProductId) -> QueryResult<Option<ProductRow>> {
    products::table
        .find(id)
        .first::<ProductRow>(conn)
        .await
        .optional()
}

async fn cart_item(
    conn: &mut AsyncPgConnection,
    cart_id: i64,
    product_id: ProductId,
) -> QueryResult<Option<CartItemRow>> {
    cart_items::table
        .filter(cart_items::cart_id.eq(cart_id))
        .filter(cart_items::product_id.eq(product_id))
        .for_update()
        .first::<CartItemRow>(conn)
        .await
        .optional()
}

#[async_trait]
impl CheckoutStore for PgStore {
    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = products::table
            .order(products::id.asc())
            .load::<ProductRow>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(Product::from).collect())
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let mut conn = self.pool.get().await?;
        Ok(find_product(&mut conn, id).await?.map(Product::from))
    }

    async fn create_product(&self, actor: AccountId, product: &NewProduct) -> Result<Product, CatalogError> {
        product.validate()?;
        let new_row = NewProductRow::from(product);
        let mut conn = self.pool.get().await.map_err(StoreError::from)?;

        let created = conn
            .transaction::<_, CatalogError, _>(|conn| {
                Box::pin(async move {
                    let row = diesel::insert_into(products::table)
                        .values(&new_row)
                        .get_result::<ProductRow>(conn)
                        .await?;
                    insert_event(conn, &DomainEvent::ProductCreated { product_id: row.id, actor_id: actor }).await?;
                    Ok(Product::from(row))
                })
            })
            .await?;

        info!("Product {} created by account {}", created.id, actor);
        Ok(created)
    }

    async fn update_product(
        &self,
        actor: AccountId,
        id: ProductId,
        patch: &ProductPatch,
    ) -> Result<Product, CatalogError> {
        patch.validate()?;
        let changeset = ProductChangeset::from(patch);
        let mut conn = self.pool.get().await.map_err(StoreError::from)?;

        conn.transaction::<_, CatalogError, _>(|conn| {
            Box::pin(async move {
                products::table
                    .find(id)
                    .for_update()
                    .first::<ProductRow>(conn)
                    .await
                    .optional()?
                    .ok_or(CatalogError::NotFound(id))?;

                let row = diesel::update(products::table.find(id))
                    .set(&changeset)
                    .get_result::<ProductRow>(conn)
                    .await?;
                insert_event(
                    conn,
                    &DomainEvent::ProductUpdated {
                        product_id: id,
                        actor_id: actor,
                        stock_quantity: row.stock_quantity,
                    },
                )
                .await?;
                Ok(Product::from(row))
            })
        })
        .await
    }

    async fn load_cart(&self, account_id: AccountId) -> Result<CartView, StoreError> {
        let mut conn = self.pool.get().await?;
        let cart_id = cart_id(&mut conn, account_id).await?;

        let rows = cart_items::table
            .inner_join(products::table)
            .filter(cart_items::cart_id.eq(cart_id))
            .order(cart_items::added_at.asc())
            .load::<(CartItemRow, ProductRow)>(&mut conn)
            .await?;

        Ok(CartView::new(
            rows.into_iter()
                .map(|(item, product)| cart_item_view(item, product))
                .collect(),
        ))
    }

    async fn add_to_cart(
        &self,
        account_id: AccountId,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<CartAddition, CartError> {
        let mut conn = self.pool.get().await.map_err(StoreError::from)?;

        conn.transaction::<_, CartError, _>(|conn| {
            Box::pin(async move {
                let product = find_product(conn, product_id)
                    .await?
                    .ok_or(CartRejection::ProductNotFound(product_id))?;
                let cart_id = cart_id(conn, account_id).await?;
                let in_cart = cart_item(conn, cart_id, product_id)
                    .await?
                    .map(|item| item.quantity)
                    .unwrap_or(0);

                let addition = plan_add(product_id, product.stock_quantity, in_cart, quantity)?;

                diesel::insert_into(cart_items::table)
                    .values(&NewCartItem {
                        cart_id,
                        product_id,
                        quantity: addition.quantity,
                    })
                    .on_conflict((cart_items::cart_id, cart_items::product_id))
                    .do_update()
                    .set(cart_items::quantity.eq(addition.quantity))
                    .execute(conn)
                    .await?;

                let event = if in_cart == 0 {
                    DomainEvent::CartItemAdded { account_id, product_id, quantity: addition.quantity }
                } else {
                    DomainEvent::CartItemUpdated { account_id, product_id, quantity: addition.quantity }
                };
                insert_event(conn, &event).await?;
                Ok(addition)
            })
        })
        .await
    }

    async fn update_cart_item(
        &self,
        account_id: AccountId,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<CartUpdate, CartError> {
        let mut conn = self.pool.get().await.map_err(StoreError::from)?;

        conn.transaction::<_, CartError, _>(|conn| {
            Box::pin(async move {
                let cart_id = cart_id(conn, account_id).await?;
                let item = cart_item(conn, cart_id, product_id)
                    .await?
                    .ok_or(CartRejection::NotInCart(product_id))?;
                let available = find_product(conn, product_id)
                    .await?
                    .map(|product| product.stock_quantity)
                    .unwrap_or(0);

                let update = plan_update(product_id, available, quantity);
                let event = match update {
                    CartUpdate::Set { quantity, .. } => {
                        diesel::update(cart_items::table.find(item.id))
                            .set(cart_items::quantity.eq(quantity))
                            .execute(conn)
                            .await?;
                        DomainEvent::CartItemUpdated { account_id, product_id, quantity }
                    }
                    CartUpdate::Removed { .. } => {
                        diesel::delete(cart_items::table.find(item.id)).execute(conn).await?;
                        DomainEvent::CartItemRemoved { account_id, product_id }
                    }
                };
                insert_event(conn, &event).await?;
                Ok(update)
            })
        })
        .await
    }

    async fn remove_cart_item(&self, account_id: AccountId, product_id: ProductId) -> Result<(), CartError> {
        let mut conn = self.pool.get().await.map_err(StoreError::from)?;

        conn.transaction::<_, CartError, _>(|conn| {
            Box::pin(async move {
                let cart_id = cart_id(conn, account_id).await?;
                let deleted = diesel::delete(
                    cart_items::table
                        .filter(cart_items::cart_id.eq(cart_id))
                        .filter(cart_items::product_id.eq(product_id)),
                )
                .execute(conn)
                .await?;
                if deleted == 0 {
                    return Err(CartRejection::NotInCart(product_id).into());
                }
                insert_event(conn, &DomainEvent::CartItemRemoved { account_id, product_id }).await?;
                Ok(())
            })
        })
        .await
    }

    async fn observe_stock(&self, ids: &[ProductId]) -> Result<Vec<ProductStock>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = products::table
            .filter(products::id.eq_any(ids.to_vec()))
            .load::<ProductRow>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(ProductStock::from).collect())
    }

    async fn commit_reservation(&self, request: &ReservationRequest) -> Result<PlacedOrder, CheckoutError> {
        let request = request.clone();
        let lock_timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        let mut conn = self.pool.get().await.map_err(StoreError::from)?;

        conn.transaction::<_, CheckoutError, _>(|conn| {
            Box::pin(async move {
                diesel::sql_query(lock_timeout).execute(conn).await?;

                // ORDER BY id makes Postgres take the row locks in ascending id order.
                let locked = products::table
                    .filter(products::id.eq_any(request.product_ids()))
                    .order(products::id.asc())
                    .for_update()
                    .load::<ProductRow>(conn)
                    .await?;
                let stock: Vec<ProductStock> = locked.into_iter().map(ProductStock::from).collect();

                let settlement = settle(&request.lines, &stock)?;

                let order = diesel::insert_into(order_requests::table)
                    .values(&NewOrderRequestRow::new(&request, &settlement)?)
                    .get_result::<OrderRequestRow>(conn)
                    .await?;

                for (product_id, quantity) in settlement.decrements() {
                    diesel::update(products::table.find(product_id))
                        .set((
                            products::stock_quantity.eq(products::stock_quantity - quantity),
                            products::updated_at.eq(chrono::Utc::now()),
                        ))
                        .execute(conn)
                        .await?;
                }

                let cart = carts::table
                    .filter(carts::account_id.eq(request.account_id))
                    .select(carts::id)
                    .first::<i64>(conn)
                    .await
                    .optional()?;
                if let Some(cart_id) = cart {
                    diesel::delete(cart_items::table.filter(cart_items::cart_id.eq(cart_id)))
                        .execute(conn)
                        .await?;
                }

                insert_event(
                    conn,
                    &DomainEvent::OrderCreated {
                        order_id: order.id,
                        account_id: request.account_id,
                        total_amount: settlement.total_amount.clone(),
                        line_count: settlement.lines.len(),
                    },
                )
                .await?;

                Ok(PlacedOrder {
                    order_id: order.id,
                    total_amount: settlement.total_amount,
                    snapshot: settlement.lines,
                })
            })
        })
        .await
    }

    async fn list_orders(&self, account_id: AccountId) -> Result<Vec<OrderRecord>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = order_requests::table
            .filter(order_requests::account_id.eq(account_id))
            .order(order_requests::created_at.desc())
            .load::<OrderRequestRow>(&mut conn)
            .await?;
        rows.into_iter().map(OrderRecord::try_from).collect()
    }

    async fn orders_feed(&self, last_id: OrderId) -> Result<OrdersFeed, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = order_requests::table
            .filter(order_requests::id.gt(last_id))
            .order(order_requests::id.desc())
            .limit(FEED_LIMIT)
            .load::<OrderRequestRow>(&mut conn)
            .await?;

        let orders = rows
            .into_iter()
            .map(OrderRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let last_id = orders.iter().map(|order| order.id).max().unwrap_or(last_id);
        Ok(OrdersFeed { orders, last_id })
    }

    async fn order_status_counts(&self) -> Result<Vec<(OrderStatus, i64)>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = order_requests::table
            .group_by(order_requests::status)
            .select((order_requests::status, diesel::dsl::count_star()))
            .load::<(String, i64)>(&mut conn)
            .await?;

        let parsed = rows.into_iter().filter_map(|(status, total)| match status.parse::<OrderStatus>() {
            Ok(status) => Some((status, total)),
            Err(e) => {
                warn!("Skipping orders with unrecognised status: {}", e);
                None
            }
        });
        Ok(status_counts(parsed))
    }

    async fn transition_order(
        &self,
        actor: OrderActor,
        order_id: OrderId,
        to: OrderStatus,
    ) -> Result<OrderRecord, OrderError> {
        let mut conn = self.pool.get().await.map_err(StoreError::from)?;

        conn.transaction::<_, OrderError, _>(|conn| {
            Box::pin(async move {
                let row = order_requests::table
                    .find(order_id)
                    .for_update()
                    .first::<OrderRequestRow>(conn)
                    .await
                    .optional()?
                    .ok_or(OrderError::NotFound(order_id))?;
                if let OrderActor::Owner(owner) = actor {
                    if row.account_id != owner {
                        return Err(OrderError::NotFound(order_id));
                    }
                }

                let mut record = OrderRecord::try_from(row)?;
                let from = record.status;
                record.status = from.transition(to)?;

                diesel::update(order_requests::table.find(order_id))
                    .set(order_requests::status.eq(record.status.as_str()))
                    .execute(conn)
                    .await?;
                insert_event(
                    conn,
                    &DomainEvent::OrderStatusChanged {
                        order_id,
                        account_id: record.account_id,
                        actor_id: actor.account_id(),
                        from,
                        to: record.status,
                    },
                )
                .await?;
                Ok(record)
            })
        })
        .await
    }

    async fn record_event(&self, event: &DomainEvent) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        insert_event(&mut conn, event).await
    }
}
