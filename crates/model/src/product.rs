use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Sale status of a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    /// Listed for sale.
    On,
    /// Withdrawn from sale.
    Down,
}

impl ProductStatus {
    pub fn code(self) -> i16 {
        match self {
            ProductStatus::On => 1,
            ProductStatus::Down => 2,
        }
    }
}

impl TryFrom<i16> for ProductStatus {
    type Error = ModelError;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ProductStatus::On),
            2 => Ok(ProductStatus::Down),
            _ => Err(ModelError::UnknownCode {
                kind: "product status",
                code,
            }),
        }
    }
}

/// Product — a sellable item and its current price.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub status: ProductStatus,
    /// Unit price in platform currency.
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stock record; only populated when explicitly requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Inventory>,
}

impl Product {
    pub fn is_available(&self) -> bool {
        self.status == ProductStatus::On
    }

    /// Units that can still be sold, zero when the inventory was not loaded.
    pub fn available_quantity(&self) -> i32 {
        self.inventory
            .as_ref()
            .map(|inv| inv.available_quantity)
            .unwrap_or(0)
    }

    /// On sale and at least one unit in stock.
    pub fn is_purchasable(&self) -> bool {
        self.is_available() && self.available_quantity() > 0
    }
}

/// Inventory — stock counters of one product.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inventory {
    pub id: i64,
    pub product_id: i64,
    pub total_quantity: i32,
    pub available_quantity: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(status: ProductStatus, available: Option<i32>) -> Product {
        let now = Utc::now();
        Product {
            id: 1,
            name: "tea".into(),
            status,
            price: Decimal::new(50, 0),
            created_at: now,
            updated_at: now,
            inventory: available.map(|available_quantity| Inventory {
                id: 1,
                product_id: 1,
                total_quantity: 10,
                available_quantity,
                created_at: now,
                updated_at: now,
            }),
        }
    }

    #[test]
    fn purchasable_requires_status_and_stock() {
        assert!(product(ProductStatus::On, Some(1)).is_purchasable());
        assert!(!product(ProductStatus::On, Some(0)).is_purchasable());
        assert!(!product(ProductStatus::Down, Some(5)).is_purchasable());
        assert!(!product(ProductStatus::On, None).is_purchasable());
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [ProductStatus::On, ProductStatus::Down] {
            assert_eq!(ProductStatus::try_from(status.code()).unwrap(), status);
        }
        assert!(ProductStatus::try_from(0).is_err());
    }
}
