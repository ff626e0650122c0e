use bigdecimal::BigDecimal;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ProductId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CartRejection {
    #[error("product {0} not found")]
    ProductNotFound(ProductId),
    #[error("product {product_id} is out of stock")]
    OutOfStock { product_id: ProductId },
    #[error("cart already holds all {available} available units of product {product_id}")]
    AtMaximum { product_id: ProductId, available: i32 },
    #[error("product {0} is not in the cart")]
    NotInCart(ProductId),
}

/// Result of adding units of a product to a cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartAddition {
    pub product_id: ProductId,
    /// Units actually added, after clamping to stock.
    pub added: i32,
    /// Line quantity after the addition.
    pub quantity: i32,
    pub clamped: bool,
}

/// Decides how many units can be added given what is already in the cart.
/// Requests below one unit are treated as one.
pub fn plan_add(
    product_id: ProductId,
    available: i32,
    in_cart: i32,
    requested: i32,
) -> Result<CartAddition, CartRejection> {
    if available <= 0 {
        return Err(CartRejection::OutOfStock { product_id });
    }
    let max_addable = (available - in_cart).max(0);
    if max_addable == 0 {
        return Err(CartRejection::AtMaximum { product_id, available });
    }

    let requested = requested.max(1);
    let added = requested.min(max_addable);
    Ok(CartAddition {
        product_id,
        added,
        quantity: in_cart + added,
        clamped: added < requested,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CartUpdate {
    Set { product_id: ProductId, quantity: i32, clamped: bool },
    Removed { product_id: ProductId, out_of_stock: bool },
}

/// Decides the new line quantity for an explicit update.
pub fn plan_update(product_id: ProductId, available: i32, requested: i32) -> CartUpdate {
    if available <= 0 {
        return CartUpdate::Removed { product_id, out_of_stock: true };
    }
    let quantity = requested.min(available);
    if quantity <= 0 {
        return CartUpdate::Removed { product_id, out_of_stock: false };
    }
    CartUpdate::Set {
        product_id,
        quantity,
        clamped: requested > available,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItemView {
    pub product_id: ProductId,
    pub name: String,
    pub price: BigDecimal,
    pub quantity: i32,
    pub stock_quantity: i32,
    pub line_total: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartView {
    pub items: Vec<CartItemView>,
    pub total_quantity: i32,
    pub total_cost: BigDecimal,
}

impl CartView {
    pub fn new(items: Vec<CartItemView>) -> Self {
        let total_quantity = items.iter().map(|item| item.quantity).sum();
        let total_cost = items
            .iter()
            .fold(BigDecimal::zero(), |acc, item| acc + &item.line_total);
        Self {
            items,
            total_quantity,
            total_cost,
        }
    }

    pub fn lines(&self) -> Vec<crate::CartLine> {
        self.items
            .iter()
            .map(|item| crate::CartLine::new(item.product_id, item.quantity))
            .collect()
    }
}
