use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod cart;
pub mod events;
pub mod policy;
pub mod reservation;

pub use cart::*;
pub use events::*;
pub use policy::*;
pub use reservation::*;

pub type ProductId = i64;
pub type AccountId = i64;
pub type OrderId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{field} must not be negative")]
    Negative { field: &'static str },
    #[error("{field} is too large")]
    TooLarge { field: &'static str },
    #[error("a pickup point must be selected for pickup-point delivery")]
    PickupPointRequired,
    #[error("the terms must be accepted")]
    TermsNotAccepted,
    #[error("unknown {kind}: {value}")]
    Unknown { kind: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryType {
    /// Collected from the warehouse.
    Pickup,
    /// Delivered to a pickup point ("ПВЗ").
    Pvz,
}

impl DeliveryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryType::Pickup => "pickup",
            DeliveryType::Pvz => "pvz",
        }
    }
}

impl FromStr for DeliveryType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pickup" => Ok(DeliveryType::Pickup),
            "pvz" => Ok(DeliveryType::Pvz),
            other => Err(ValidationError::Unknown {
                kind: "delivery type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CardNow,
    CardOnDelivery,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::CardNow => "card_now",
            PaymentMethod::CardOnDelivery => "card_on_delivery",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card_now" => Ok(PaymentMethod::CardNow),
            "card_on_delivery" => Ok(PaymentMethod::CardOnDelivery),
            other => Err(ValidationError::Unknown {
                kind: "payment method",
                value: other.to_string(),
            }),
        }
    }
}

/// Buyer-supplied checkout details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingInfo {
    pub full_name: String,
    pub phone: String,
    pub email: String,
    pub delivery_type: DeliveryType,
    #[serde(default)]
    pub pickup_point_id: Option<i64>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub accept_terms: bool,
}

impl ShippingInfo {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("full_name", &self.full_name),
            ("phone", &self.phone),
            ("email", &self.email),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::Missing { field });
            }
        }
        if self.delivery_type == DeliveryType::Pvz && self.pickup_point_id.is_none() {
            return Err(ValidationError::PickupPointRequired);
        }
        if !self.accept_terms {
            return Err(ValidationError::TermsNotAccepted);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Confirmed,
    Declined,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("order cannot move from {from} to {to}")]
    IllegalTransition { from: OrderStatus, to: OrderStatus },
    #[error("unknown order status: {0}")]
    Unknown(String),
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 4] = [
        OrderStatus::New,
        OrderStatus::Confirmed,
        OrderStatus::Declined,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Declined => "declined",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::New)
    }

    /// Only `new` orders move, and only into a terminal state.
    pub fn transition(self, to: OrderStatus) -> Result<OrderStatus, StatusError> {
        if self == OrderStatus::New && to.is_terminal() {
            Ok(to)
        } else {
            Err(StatusError::IllegalTransition { from: self, to })
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StatusError::Unknown(s.to_string()))
    }
}

/// Per-status order counts with every status present.
pub fn status_counts<I>(rows: I) -> Vec<(OrderStatus, i64)>
where
    I: IntoIterator<Item = (OrderStatus, i64)>,
{
    let mut counts: Vec<(OrderStatus, i64)> = OrderStatus::ALL.iter().map(|s| (*s, 0)).collect();
    for (status, total) in rows {
        if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == status) {
            entry.1 += total;
        }
    }
    counts
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: BigDecimal,
    pub stock_quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub price: BigDecimal,
    #[serde(default)]
    pub stock_quantity: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub price: Option<BigDecimal>,
    pub stock_quantity: Option<i32>,
}

/// Exclusive upper bound of `products.price`, a `NUMERIC(10, 2)` column.
pub const PRICE_LIMIT: i64 = 100_000_000;

fn check_price(price: &BigDecimal) -> Result<(), ValidationError> {
    if price < &BigDecimal::from(0) {
        return Err(ValidationError::Negative { field: "price" });
    }
    if price >= &BigDecimal::from(PRICE_LIMIT) {
        return Err(ValidationError::TooLarge { field: "price" });
    }
    Ok(())
}

fn check_stock(stock: i32) -> Result<(), ValidationError> {
    if stock < 0 {
        return Err(ValidationError::Negative { field: "stock_quantity" });
    }
    Ok(())
}

impl NewProduct {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Missing { field: "name" });
        }
        check_price(&self.price)?;
        check_stock(self.stock_quantity)
    }
}

impl ProductPatch {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(ValidationError::Missing { field: "name" });
            }
        }
        if let Some(price) = &self.price {
            check_price(price)?;
        }
        if let Some(stock) = self.stock_quantity {
            check_stock(stock)?;
        }
        Ok(())
    }

    pub fn apply(&self, product: &mut Product) {
        if let Some(name) = &self.name {
            product.name = name.clone();
        }
        if let Some(price) = &self.price {
            product.price = price.clone();
        }
        if let Some(stock) = self.stock_quantity {
            product.stock_quantity = stock;
        }
    }
}

/// A placed order as stored. Only `status` ever changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: OrderId,
    pub account_id: AccountId,
    pub shipping: ShippingInfo,
    pub cart_snapshot: Vec<SnapshotLine>,
    pub total_amount: BigDecimal,
    pub status: OrderStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shipping() -> ShippingInfo {
        ShippingInfo {
            full_name: "Ivan Petrov".to_string(),
            phone: "+7 900 000-00-00".to_string(),
            email: "ivan@example.com".to_string(),
            delivery_type: DeliveryType::Pickup,
            pickup_point_id: None,
            payment_method: PaymentMethod::CardNow,
            comment: String::new(),
            accept_terms: true,
        }
    }

    #[test]
    fn pickup_point_delivery_requires_a_point() {
        let mut info = shipping();
        info.delivery_type = DeliveryType::Pvz;
        assert_eq!(info.validate(), Err(ValidationError::PickupPointRequired));

        info.pickup_point_id = Some(3);
        assert_eq!(info.validate(), Ok(()));
    }

    #[test]
    fn terms_and_contact_fields_are_required() {
        let mut info = shipping();
        info.accept_terms = false;
        assert_eq!(info.validate(), Err(ValidationError::TermsNotAccepted));

        let mut info = shipping();
        info.phone = "   ".to_string();
        assert_eq!(info.validate(), Err(ValidationError::Missing { field: "phone" }));
    }

    #[test]
    fn only_new_orders_change_status() {
        assert_eq!(OrderStatus::New.transition(OrderStatus::Confirmed), Ok(OrderStatus::Confirmed));
        assert_eq!(OrderStatus::New.transition(OrderStatus::Cancelled), Ok(OrderStatus::Cancelled));
        assert!(OrderStatus::New.transition(OrderStatus::New).is_err());

        for terminal in [OrderStatus::Confirmed, OrderStatus::Declined, OrderStatus::Cancelled] {
            for to in OrderStatus::ALL {
                assert_eq!(
                    terminal.transition(to),
                    Err(StatusError::IllegalTransition { from: terminal, to })
                );
            }
        }
    }

    #[test]
    fn status_round_trips_through_its_column_value() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
        assert!("shipped".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn status_counts_are_zero_filled() {
        let counts = status_counts(vec![(OrderStatus::Confirmed, 4), (OrderStatus::New, 1)]);
        assert_eq!(
            counts,
            vec![
                (OrderStatus::New, 1),
                (OrderStatus::Confirmed, 4),
                (OrderStatus::Declined, 0),
                (OrderStatus::Cancelled, 0),
            ]
        );
    }

    #[test]
    fn product_patch_rejects_negative_values() {
        let patch = ProductPatch {
            stock_quantity: Some(-1),
            ..ProductPatch::default()
        };
        assert_eq!(patch.validate(), Err(ValidationError::Negative { field: "stock_quantity" }));

        let product = NewProduct {
            name: "Brake pad".to_string(),
            price: "-0.01".parse().unwrap(),
            stock_quantity: 1,
        };
        assert_eq!(product.validate(), Err(ValidationError::Negative { field: "price" }));
    }

    #[test]
    fn prices_must_fit_the_price_column() {
        let patch = ProductPatch {
            price: Some(BigDecimal::from(PRICE_LIMIT)),
            ..ProductPatch::default()
        };
        assert_eq!(patch.validate(), Err(ValidationError::TooLarge { field: "price" }));

        let patch = ProductPatch {
            price: Some("99999999.99".parse().unwrap()),
            ..ProductPatch::default()
        };
        assert_eq!(patch.validate(), Ok(()));
    }
}
