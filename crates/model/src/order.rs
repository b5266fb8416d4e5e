use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::Product;

/// Order — a settled cart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    /// Globally unique, generated before the order is persisted.
    pub id: String,
    pub user_id: i64,
    /// Σ unit price × quantity over all items.
    pub original_price: Decimal,
    /// Price actually charged after promotions.
    pub final_price: Decimal,
    /// Points redeemed against this order.
    pub used_points: i32,
    /// Promotions that took effect, in evaluation order.
    pub promotion_ids: Vec<i64>,
    pub items: Vec<OrderItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Empty order shell; prices and items are filled in during settlement.
    pub fn new(id: impl Into<String>, user_id: i64, used_points: i32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id,
            original_price: Decimal::ZERO,
            final_price: Decimal::ZERO,
            used_points,
            promotion_ids: Vec::new(),
            items: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Σ unit price × quantity of the item snapshots.
    pub fn items_total(&self) -> Decimal {
        self.items.iter().map(OrderItem::line_total).sum()
    }
}

/// OrderItem — product identity and price frozen at purchase time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderItem {
    pub order_id: String,
    pub product_id: i64,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl OrderItem {
    /// Copies the product's current name and price into a new item.
    pub fn snapshot(order_id: &str, product: &Product, quantity: i32) -> Self {
        Self {
            order_id: order_id.to_string(),
            product_id: product.id,
            name: product.name.clone(),
            unit_price: product.price,
            quantity,
        }
    }

    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}
