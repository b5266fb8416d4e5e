//! Query filters and update sets accepted by the [`Repository`](crate::Repository).
//!
//! Empty id lists mean "no filter". Updates refuse to run without a filter.

use chrono::{DateTime, Utc};
use model::{PointOperation, ProductStatus, PromotionKind, QuantityOperation, TokenOperation};
use rust_decimal::Decimal;

/// Row-lock strength requested by a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockMode {
    /// Plain snapshot read.
    #[default]
    None,
    /// Block until the rows can be locked.
    Exclusive,
    /// Fail immediately if any row is locked elsewhere.
    ExclusiveNoWait,
}

impl LockMode {
    pub fn is_locking(self) -> bool {
        self != LockMode::None
    }

    /// Locking clause appended to a `SELECT`.
    pub fn sql(self) -> &'static str {
        match self {
            LockMode::None => "",
            LockMode::Exclusive => "FOR UPDATE",
            LockMode::ExclusiveNoWait => "FOR UPDATE NOWAIT",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProductOptions {
    pub ids: Vec<i64>,
    /// Join the inventory row of each product.
    pub with_inventory: bool,
    pub lock: LockMode,
}

impl ProductOptions {
    pub fn by_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_inventory(mut self) -> Self {
        self.with_inventory = true;
        self
    }

    pub fn lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct InventoryOptions {
    pub product_ids: Vec<i64>,
    pub lock: LockMode,
}

impl InventoryOptions {
    pub fn by_product_ids(product_ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            product_ids: product_ids.into_iter().collect(),
            lock: LockMode::None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WalletOptions {
    pub ids: Vec<i64>,
    pub user_ids: Vec<i64>,
    pub lock: LockMode,
}

impl WalletOptions {
    pub fn by_id(id: i64) -> Self {
        Self {
            ids: vec![id],
            ..Self::default()
        }
    }

    pub fn by_user(user_id: i64) -> Self {
        Self {
            user_ids: vec![user_id],
            ..Self::default()
        }
    }

    pub fn lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    pub(crate) fn is_unfiltered(&self) -> bool {
        self.ids.is_empty() && self.user_ids.is_empty()
    }

    pub(crate) fn describe(&self) -> String {
        format!("ids={:?} user_ids={:?}", self.ids, self.user_ids)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemberOptions {
    pub user_ids: Vec<i64>,
}

impl MemberOptions {
    pub fn by_user(user_id: i64) -> Self {
        Self {
            user_ids: vec![user_id],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromotionOptions {
    pub ids: Vec<i64>,
    pub kinds: Vec<PromotionKind>,
    /// Keep promotions whose window contains this instant.
    pub active_at: Option<DateTime<Utc>>,
    /// With `active_at`, also keep default promotions regardless of window.
    pub include_default: bool,
}

impl PromotionOptions {
    /// Promotions of `kinds` running at `now`, plus the defaults.
    pub fn current(kinds: &[PromotionKind], now: DateTime<Utc>) -> Self {
        Self {
            ids: Vec::new(),
            kinds: kinds.to_vec(),
            active_at: Some(now),
            include_default: true,
        }
    }

    pub(crate) fn kind_codes(&self) -> Vec<i16> {
        self.kinds.iter().map(|kind| kind.code()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderOptions {
    pub ids: Vec<String>,
    pub user_ids: Vec<i64>,
}

impl OrderOptions {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            ids: vec![id.into()],
            user_ids: Vec::new(),
        }
    }
}

/// Plain column sets on a product. Stock lives in [`InventoryUpdates`].
#[derive(Debug, Clone, Default)]
pub struct ProductUpdates {
    pub name: Option<String>,
    pub status: Option<ProductStatus>,
    pub price: Option<Decimal>,
}

impl ProductUpdates {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.status.is_none() && self.price.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InventoryUpdates {
    pub total_quantity: Option<QuantityOperation>,
    pub available_quantity: Option<QuantityOperation>,
}

impl InventoryUpdates {
    /// Takes `quantity` units out of the sellable stock.
    pub fn sell(quantity: i32) -> Self {
        Self {
            total_quantity: None,
            available_quantity: Some(QuantityOperation::sub(quantity)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_quantity.is_none() && self.available_quantity.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WalletUpdates {
    pub token: Option<TokenOperation>,
    pub points: Option<PointOperation>,
}

impl WalletUpdates {
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.points.is_none()
    }
}
