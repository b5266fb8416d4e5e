//! Domain model for cart settlement.
//!
//! Plain data types shared by every layer: products and their inventory,
//! wallets, memberships, promotions with their pricing rules, and orders.
//! Nothing here performs I/O; the only behaviour is the pure pricing function
//! carried by each promotion payload and the arithmetic of delta operations.

mod member;
mod operation;
mod order;
mod product;
mod promotion;
mod wallet;

use std::collections::BTreeMap;

use thiserror::Error;

pub use member::{Member, MemberType};
pub use operation::{NumericOperation, Operation, PointOperation, QuantityOperation, TokenOperation};
pub use order::{Order, OrderItem};
pub use product::{Inventory, Product, ProductStatus};
pub use promotion::{
    Discount, ExtraDiscount, ExtraRequirement, MemberDiscount, PointsRedemption, PriceInput,
    Promotion, PromotionExtension, PromotionKind,
};
pub use rust_decimal::Decimal;
pub use wallet::Wallet;

/// Shopping cart: product id → requested quantity.
///
/// A `BTreeMap` keeps iteration (and therefore lock acquisition and item
/// order) ascending by product id.
pub type Cart = BTreeMap<i64, i32>;

/// Errors raised while decoding or validating model values.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A stored discriminant does not map to any known variant.
    #[error("unknown {kind} code: {code}")]
    UnknownCode { kind: &'static str, code: i16 },

    /// A promotion payload breaks one of its pricing rules.
    #[error("invalid promotion: {0}")]
    InvalidPromotion(String),

    /// The payload does not match the schema selected by its discriminant.
    #[error("malformed promotion payload: {0}")]
    Payload(#[from] serde_json::Error),
}
