//! Stock validation shared by the advisory pre-check and the locked re-check.
//!
//! Both phases call [`settle`] with the same merged cart lines; only the stock
//! rows differ (observed without locks vs. held under `FOR UPDATE`).

use bigdecimal::BigDecimal;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::{AccountId, OrderId, ProductId, ShippingInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: ProductId,
    pub quantity: i32,
}

impl CartLine {
    pub fn new(product_id: ProductId, quantity: i32) -> Self {
        Self { product_id, quantity }
    }
}

/// A product row as seen by a stock check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductStock {
    pub product_id: ProductId,
    pub name: String,
    pub price: BigDecimal,
    pub stock_quantity: i32,
}

/// One frozen order line. Stored on the order and never re-read from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotLine {
    pub product_id: ProductId,
    pub name: String,
    pub quantity: i32,
    pub price: BigDecimal,
    pub line_total: BigDecimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub product_id: ProductId,
    pub requested: i32,
    pub available: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    #[error("cart is empty")]
    EmptyCart,
    #[error("invalid quantity {quantity} for product {product_id}")]
    InvalidQuantity { product_id: ProductId, quantity: i32 },
    #[error("insufficient stock for {} product(s)", .0.len())]
    InsufficientStock(Vec<Shortfall>),
    #[error("order total {total} exceeds the maximum order amount")]
    TotalTooLarge { total: BigDecimal },
}

/// Exclusive upper bound of `order_requests.total_amount`, a `NUMERIC(14, 2)`
/// column.
pub const ORDER_TOTAL_LIMIT: i64 = 1_000_000_000_000;

/// Everything the atomic phase needs, already merged and sorted by product id.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationRequest {
    pub account_id: AccountId,
    pub lines: Vec<CartLine>,
    pub shipping: ShippingInfo,
}

impl ReservationRequest {
    /// Product ids in lock order.
    pub fn product_ids(&self) -> Vec<ProductId> {
        self.lines.iter().map(|line| line.product_id).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub lines: Vec<SnapshotLine>,
    pub total_amount: BigDecimal,
}

impl Settlement {
    pub fn decrements(&self) -> impl Iterator<Item = (ProductId, i32)> + '_ {
        self.lines.iter().map(|line| (line.product_id, line.quantity))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: OrderId,
    pub total_amount: BigDecimal,
    pub snapshot: Vec<SnapshotLine>,
}

/// Merges duplicate products and sorts by ascending id, which is also the
/// row lock order.
pub fn merge_lines(lines: &[CartLine]) -> Result<Vec<CartLine>, ReservationError> {
    if lines.is_empty() {
        return Err(ReservationError::EmptyCart);
    }

    let mut merged: BTreeMap<ProductId, i32> = BTreeMap::new();
    for line in lines {
        if line.quantity < 1 {
            return Err(ReservationError::InvalidQuantity {
                product_id: line.product_id,
                quantity: line.quantity,
            });
        }
        let entry = merged.entry(line.product_id).or_insert(0);
        *entry = entry.checked_add(line.quantity).ok_or(ReservationError::InvalidQuantity {
            product_id: line.product_id,
            quantity: line.quantity,
        })?;
    }

    Ok(merged
        .into_iter()
        .map(|(product_id, quantity)| CartLine { product_id, quantity })
        .collect())
}

/// Validates every line against `stock` and, when all lines fit, prices the
/// order. A product missing from `stock` counts as zero available.
///
/// All shortfalls are reported, not just the first.
pub fn settle(lines: &[CartLine], stock: &[ProductStock]) -> Result<Settlement, ReservationError> {
    if lines.is_empty() {
        return Err(ReservationError::EmptyCart);
    }

    let rows: BTreeMap<ProductId, &ProductStock> =
        stock.iter().map(|row| (row.product_id, row)).collect();

    let mut shortfalls = Vec::new();
    let mut snapshot = Vec::with_capacity(lines.len());
    for line in lines {
        match rows.get(&line.product_id) {
            Some(row) if row.stock_quantity >= line.quantity => {
                let line_total = &row.price * BigDecimal::from(line.quantity);
                snapshot.push(SnapshotLine {
                    product_id: line.product_id,
                    name: row.name.clone(),
                    quantity: line.quantity,
                    price: row.price.clone(),
                    line_total,
                });
            }
            found => shortfalls.push(Shortfall {
                product_id: line.product_id,
                requested: line.quantity,
                available: found.map(|row| row.stock_quantity.max(0)).unwrap_or(0),
            }),
        }
    }

    if !shortfalls.is_empty() {
        return Err(ReservationError::InsufficientStock(shortfalls));
    }

    let total_amount = snapshot
        .iter()
        .fold(BigDecimal::zero(), |acc, line| acc + &line.line_total);
    if total_amount >= BigDecimal::from(ORDER_TOTAL_LIMIT) {
        return Err(ReservationError::TotalTooLarge { total: total_amount });
    }

    Ok(Settlement {
        lines: snapshot,
        total_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row(product_id: ProductId, price: &str, stock_quantity: i32) -> ProductStock {
        ProductStock {
            product_id,
            name: format!("part-{product_id}"),
            price: price.parse().unwrap(),
            stock_quantity,
        }
    }

    #[test]
    fn merge_sorts_and_sums_duplicates() {
        let merged = merge_lines(&[CartLine::new(9, 1), CartLine::new(2, 2), CartLine::new(9, 3)]).unwrap();
        assert_eq!(merged, vec![CartLine::new(2, 2), CartLine::new(9, 4)]);
    }

    #[test]
    fn merge_rejects_empty_and_non_positive() {
        assert_eq!(merge_lines(&[]), Err(ReservationError::EmptyCart));
        assert_eq!(
            merge_lines(&[CartLine::new(1, 0)]),
            Err(ReservationError::InvalidQuantity { product_id: 1, quantity: 0 })
        );
    }

    #[test]
    fn settle_prices_lines_and_total() {
        let lines = [CartLine::new(1, 2), CartLine::new(2, 1)];
        let stock = [row(1, "150.50", 5), row(2, "99.99", 1)];

        let settlement = settle(&lines, &stock).unwrap();

        assert_eq!(settlement.lines[0].line_total, "301.00".parse::<BigDecimal>().unwrap());
        assert_eq!(settlement.lines[1].name, "part-2");
        assert_eq!(settlement.total_amount, "400.99".parse::<BigDecimal>().unwrap());
        assert_eq!(settlement.decrements().collect::<Vec<_>>(), vec![(1, 2), (2, 1)]);
    }

    #[test]
    fn settle_reports_every_shortfall() {
        let lines = [CartLine::new(1, 3), CartLine::new(2, 1), CartLine::new(3, 4)];
        let stock = [row(1, "10", 2), row(2, "10", 1)];

        let err = settle(&lines, &stock).unwrap_err();

        assert_eq!(
            err,
            ReservationError::InsufficientStock(vec![
                Shortfall { product_id: 1, requested: 3, available: 2 },
                Shortfall { product_id: 3, requested: 4, available: 0 },
            ])
        );
    }

    #[test]
    fn oversized_totals_are_rejected_up_front() {
        let lines = [CartLine::new(1, 20_000)];
        let stock = [row(1, "99999999.99", i32::MAX)];

        let err = settle(&lines, &stock).unwrap_err();

        assert_eq!(
            err,
            ReservationError::TotalTooLarge { total: "1999999999800".parse().unwrap() }
        );
    }

    proptest! {
        #[test]
        fn settle_accepts_exactly_when_every_line_fits(
            demand in prop::collection::vec((1i64..6, 1i32..10), 1..8),
            stock_levels in prop::collection::vec(0i32..12, 6),
        ) {
            let lines: Vec<CartLine> = demand.iter().map(|(p, q)| CartLine::new(*p, *q)).collect();
            let lines = merge_lines(&lines).unwrap();
            let stock: Vec<ProductStock> = (1i64..6)
                .map(|p| row(p, "1.25", stock_levels[p as usize]))
                .collect();

            let fits = lines.iter().all(|l| l.quantity <= stock_levels[l.product_id as usize]);
            match settle(&lines, &stock) {
                Ok(settlement) => {
                    prop_assert!(fits);
                    let units: i32 = settlement.lines.iter().map(|l| l.quantity).sum();
                    prop_assert_eq!(settlement.total_amount, BigDecimal::from(units) * "1.25".parse::<BigDecimal>().unwrap());
                }
                Err(ReservationError::InsufficientStock(shortfalls)) => {
                    prop_assert!(!fits);
                    for s in shortfalls {
                        prop_assert!(s.requested > s.available);
                    }
                }
                Err(other) => prop_assert!(false, "unexpected error {other:?}"),
            }
        }
    }
}
