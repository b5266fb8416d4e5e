use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a delta applied to a stored quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericOperation {
    Add,
    Sub,
}

impl NumericOperation {
    /// Operator used when the delta is translated into a server-side update.
    pub fn sql_operator(self) -> &'static str {
        match self {
            NumericOperation::Add => "+",
            NumericOperation::Sub => "-",
        }
    }
}

/// A signed delta: direction plus non-negative magnitude.
///
/// Stored quantities are never overwritten with a value computed in memory;
/// they are adjusted by an `Operation` under the row lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation<T> {
    pub operation: NumericOperation,
    pub amount: T,
}

/// Stock delta.
pub type QuantityOperation = Operation<i32>;
/// Currency (token) delta.
pub type TokenOperation = Operation<Decimal>;
/// Points delta.
pub type PointOperation = Operation<i32>;

impl<T> Operation<T> {
    pub fn add(amount: T) -> Self {
        Self {
            operation: NumericOperation::Add,
            amount,
        }
    }

    pub fn sub(amount: T) -> Self {
        Self {
            operation: NumericOperation::Sub,
            amount,
        }
    }
}

impl Operation<i32> {
    /// Applies the delta to `current`; `None` on overflow.
    pub fn apply_to(&self, current: i32) -> Option<i32> {
        match self.operation {
            NumericOperation::Add => current.checked_add(self.amount),
            NumericOperation::Sub => current.checked_sub(self.amount),
        }
    }
}

impl Operation<Decimal> {
    /// Applies the delta to `current`; `None` on overflow.
    pub fn apply_to(&self, current: Decimal) -> Option<Decimal> {
        match self.operation {
            NumericOperation::Add => current.checked_add(self.amount),
            NumericOperation::Sub => current.checked_sub(self.amount),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quantity_delta_applies_in_both_directions() {
        assert_eq!(QuantityOperation::sub(2).apply_to(5), Some(3));
        assert_eq!(QuantityOperation::add(2).apply_to(5), Some(7));
        assert_eq!(QuantityOperation::sub(1).apply_to(i32::MIN), None);
    }

    #[test]
    fn token_delta_is_exact() {
        let op = TokenOperation::sub(dec!(0.1));
        assert_eq!(op.apply_to(dec!(0.3)), Some(dec!(0.2)));
    }

    #[test]
    fn sql_operator_matches_direction() {
        assert_eq!(NumericOperation::Add.sql_operator(), "+");
        assert_eq!(NumericOperation::Sub.sql_operator(), "-");
    }
}
