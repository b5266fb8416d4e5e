use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Wallet — spendable balance of a user.
///
/// Both balances stay non-negative; they are only changed through
/// [`TokenOperation`](crate::TokenOperation) and
/// [`PointOperation`](crate::PointOperation) deltas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Wallet {
    pub id: i64,
    pub user_id: i64,
    /// Platform currency.
    pub token: Decimal,
    /// Platform points.
    pub points: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
