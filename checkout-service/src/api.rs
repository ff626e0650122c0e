use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        FromRequest, FromRequestParts, Path, Query, Request, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use shared::*;
use std::sync::Arc;
use tracing::error;

use crate::reservation::Reservations;
use crate::store::{CartError, CatalogError, CheckoutError, CheckoutStore, OrderActor, OrderError, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CheckoutStore>,
    pub reservations: Arc<Reservations>,
}

/// Caller identity as forwarded by the gateway in `x-account-id` and `x-role`.
#[derive(Debug, Clone, Copy)]
pub struct Principal {
    pub account_id: AccountId,
    pub role: Role,
}

impl Principal {
    fn require(&self, action: Action) -> Result<(), ApiError> {
        authorize(self.role, action).map_err(ApiError::Forbidden)
    }

    fn order_actor(&self) -> OrderActor {
        if is_allowed(self.role, Action::ManageOrders) {
            OrderActor::Staff(self.account_id)
        } else {
            OrderActor::Owner(self.account_id)
        }
    }
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| parts.headers.get(name).and_then(|value| value.to_str().ok());

        let account_id = header("x-account-id")
            .and_then(|value| value.trim().parse::<AccountId>().ok())
            .ok_or(ApiError::Unauthenticated)?;
        let role = header("x-role")
            .ok_or(ApiError::Unauthenticated)?
            .trim()
            .parse::<Role>()
            .map_err(|_| ApiError::Unauthenticated)?;

        Ok(Self { account_id, role })
    }
}

/// `Json` whose rejections use the API's error body.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e: JsonRejection| ApiError::BadRequest(e.body_text()))?;
        Ok(Self(value))
    }
}

/// `Path` whose rejections use the API's error body.
pub struct ApiPath<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e: PathRejection| ApiError::BadRequest(e.body_text()))?;
        Ok(Self(value))
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    /// Body or path that could not be decoded.
    BadRequest(String),
    Forbidden(PolicyError),
    ProductNotFound(ProductId),
    Checkout(CheckoutError),
    Cart(CartError),
    Order(OrderError),
    Catalog(CatalogError),
    Storage(StoreError),
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        ApiError::Checkout(err)
    }
}

impl From<CartError> for ApiError {
    fn from(err: CartError) -> Self {
        ApiError::Cart(err)
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        ApiError::Order(err)
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        ApiError::Catalog(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Storage(err)
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

fn storage_error(err: &StoreError) -> Response {
    error!("Storage failure: {}", err);
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "storage_failure",
        "storage temporarily unavailable, try again",
    )
}

fn validation_error(err: &ValidationError) -> Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthenticated => json_error(
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                "x-account-id and x-role headers are required",
            ),
            ApiError::BadRequest(message) => json_error(StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::Forbidden(e) => json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string()),
            ApiError::ProductNotFound(id) => {
                json_error(StatusCode::NOT_FOUND, "product_not_found", format!("product {id} not found"))
            }
            ApiError::Checkout(CheckoutError::Rejected(rejection)) => match rejection {
                ReservationError::EmptyCart => {
                    json_error(StatusCode::UNPROCESSABLE_ENTITY, "empty_cart", rejection.to_string())
                }
                ReservationError::InvalidQuantity { .. } => {
                    json_error(StatusCode::BAD_REQUEST, "invalid_quantity", rejection.to_string())
                }
                ReservationError::TotalTooLarge { .. } => {
                    json_error(StatusCode::UNPROCESSABLE_ENTITY, "total_too_large", rejection.to_string())
                }
                ReservationError::InsufficientStock(ref shortfalls) => (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "error": "insufficient_stock",
                        "message": rejection.to_string(),
                        "details": shortfalls,
                    })),
                )
                    .into_response(),
            },
            ApiError::Checkout(CheckoutError::InvalidShipping(e)) => validation_error(&e),
            ApiError::Checkout(CheckoutError::Storage(e)) => storage_error(&e),
            ApiError::Cart(CartError::Rejected(rejection)) => {
                let (status, code) = match rejection {
                    CartRejection::ProductNotFound(_) => (StatusCode::NOT_FOUND, "product_not_found"),
                    CartRejection::NotInCart(_) => (StatusCode::NOT_FOUND, "not_in_cart"),
                    CartRejection::OutOfStock { .. } => (StatusCode::CONFLICT, "out_of_stock"),
                    CartRejection::AtMaximum { .. } => (StatusCode::CONFLICT, "cart_at_maximum"),
                };
                json_error(status, code, rejection.to_string())
            }
            ApiError::Cart(CartError::Storage(e)) => storage_error(&e),
            ApiError::Order(OrderError::NotFound(id)) => {
                json_error(StatusCode::NOT_FOUND, "order_not_found", format!("order {id} not found"))
            }
            ApiError::Order(OrderError::Transition(e)) => {
                json_error(StatusCode::CONFLICT, "illegal_transition", e.to_string())
            }
            ApiError::Order(OrderError::Storage(e)) => storage_error(&e),
            ApiError::Catalog(CatalogError::NotFound(id)) => {
                json_error(StatusCode::NOT_FOUND, "product_not_found", format!("product {id} not found"))
            }
            ApiError::Catalog(CatalogError::Invalid(e)) => validation_error(&e),
            ApiError::Catalog(CatalogError::Storage(e)) => storage_error(&e),
            ApiError::Storage(e) => storage_error(&e),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/products", get(list_products).post(create_product))
        .route("/products/:id", get(get_product).patch(update_product))
        .route("/cart", get(get_cart))
        .route("/cart/items", post(add_cart_item))
        .route("/cart/items/:product_id", put(update_cart_item).delete(remove_cart_item))
        .route("/checkout", post(checkout))
        .route("/orders", get(list_orders))
        .route("/orders/feed", get(orders_feed))
        .route("/orders/stats", get(order_stats))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/confirm", post(confirm_order))
        .route("/orders/:id/decline", post(decline_order))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}

/// The catalog is public; a caller that does identify itself is still held
/// to the policy table.
fn require_catalog_read(principal: Option<Principal>) -> Result<(), ApiError> {
    match principal {
        Some(principal) => principal.require(Action::ReadCatalog),
        None => Ok(()),
    }
}

async fn list_products(
    State(state): State<AppState>,
    principal: Option<Principal>,
) -> ApiResult<Json<Vec<Product>>> {
    require_catalog_read(principal)?;
    Ok(Json(state.store.list_products().await?))
}

async fn get_product(
    State(state): State<AppState>,
    principal: Option<Principal>,
    ApiPath(id): ApiPath<ProductId>,
) -> ApiResult<Json<Product>> {
    require_catalog_read(principal)?;
    let product = state.store.get_product(id).await?.ok_or(ApiError::ProductNotFound(id))?;
    Ok(Json(product))
}

async fn create_product(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(body): ApiJson<NewProduct>,
) -> ApiResult<(StatusCode, Json<Product>)> {
    principal.require(Action::WriteCatalog)?;
    let product = state.store.create_product(principal.account_id, &body).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

async fn update_product(
    State(state): State<AppState>,
    principal: Principal,
    ApiPath(id): ApiPath<ProductId>,
    ApiJson(patch): ApiJson<ProductPatch>,
) -> ApiResult<Json<Product>> {
    principal.require(Action::WriteCatalog)?;
    Ok(Json(state.store.update_product(principal.account_id, id, &patch).await?))
}

async fn get_cart(State(state): State<AppState>, principal: Principal) -> ApiResult<Json<CartView>> {
    principal.require(Action::UseCart)?;
    Ok(Json(state.store.load_cart(principal.account_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AddCartItemRequest {
    pub product_id: ProductId,
    #[serde(default = "one")]
    pub quantity: i32,
}

fn one() -> i32 {
    1
}

async fn add_cart_item(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(body): ApiJson<AddCartItemRequest>,
) -> ApiResult<Json<CartAddition>> {
    principal.require(Action::UseCart)?;
    let addition = state
        .store
        .add_to_cart(principal.account_id, body.product_id, body.quantity)
        .await?;
    Ok(Json(addition))
}

#[derive(Debug, Deserialize)]
pub struct UpdateCartItemRequest {
    pub quantity: i32,
}

async fn update_cart_item(
    State(state): State<AppState>,
    principal: Principal,
    ApiPath(product_id): ApiPath<ProductId>,
    ApiJson(body): ApiJson<UpdateCartItemRequest>,
) -> ApiResult<Json<CartUpdate>> {
    principal.require(Action::UseCart)?;
    let update = state
        .store
        .update_cart_item(principal.account_id, product_id, body.quantity)
        .await?;
    Ok(Json(update))
}

async fn remove_cart_item(
    State(state): State<AppState>,
    principal: Principal,
    ApiPath(product_id): ApiPath<ProductId>,
) -> ApiResult<StatusCode> {
    principal.require(Action::UseCart)?;
    state.store.remove_cart_item(principal.account_id, product_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn checkout(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(shipping): ApiJson<ShippingInfo>,
) -> ApiResult<(StatusCode, Json<PlacedOrder>)> {
    principal.require(Action::PlaceOrder)?;
    let placed = state.reservations.checkout(principal.account_id, &shipping).await?;
    Ok((StatusCode::CREATED, Json(placed)))
}

async fn list_orders(State(state): State<AppState>, principal: Principal) -> ApiResult<Json<Vec<OrderRecord>>> {
    principal.require(Action::ViewOwnOrders)?;
    Ok(Json(state.store.list_orders(principal.account_id).await?))
}

async fn cancel_order(
    State(state): State<AppState>,
    principal: Principal,
    ApiPath(id): ApiPath<OrderId>,
) -> ApiResult<Json<OrderRecord>> {
    principal.require(Action::CancelOwnOrder)?;
    // Cancelling is an owner action even for staff accounts.
    let actor = OrderActor::Owner(principal.account_id);
    Ok(Json(state.store.transition_order(actor, id, OrderStatus::Cancelled).await?))
}

async fn confirm_order(
    State(state): State<AppState>,
    principal: Principal,
    ApiPath(id): ApiPath<OrderId>,
) -> ApiResult<Json<OrderRecord>> {
    principal.require(Action::ManageOrders)?;
    Ok(Json(
        state
            .store
            .transition_order(principal.order_actor(), id, OrderStatus::Confirmed)
            .await?,
    ))
}

async fn decline_order(
    State(state): State<AppState>,
    principal: Principal,
    ApiPath(id): ApiPath<OrderId>,
) -> ApiResult<Json<OrderRecord>> {
    principal.require(Action::ManageOrders)?;
    Ok(Json(
        state
            .store
            .transition_order(principal.order_actor(), id, OrderStatus::Declined)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub last_id: Option<String>,
}

impl FeedQuery {
    /// A missing or malformed cursor starts the feed from the beginning.
    fn cursor(&self) -> OrderId {
        self.last_id
            .as_deref()
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }
}

async fn orders_feed(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<FeedQuery>,
) -> ApiResult<Json<crate::store::OrdersFeed>> {
    principal.require(Action::ViewOrdersFeed)?;
    Ok(Json(state.store.orders_feed(query.cursor()).await?))
}

#[derive(Debug, Serialize)]
pub struct StatusCount {
    pub status: OrderStatus,
    pub count: i64,
}

async fn order_stats(State(state): State<AppState>, principal: Principal) -> ApiResult<Json<Vec<StatusCount>>> {
    principal.require(Action::ManageOrders)?;
    let counts = state
        .store
        .order_status_counts()
        .await?
        .into_iter()
        .map(|(status, count)| StatusCount { status, count })
        .collect();
    Ok(Json(counts))
}
