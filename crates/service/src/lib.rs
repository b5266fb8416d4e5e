//! Business logic layer for cart settlement.
//!
//! This crate defines the [`SettlementService`] trait and its implementation
//! [`SettlementServiceImpl`], generic over any [`Database`] backend.
//!
//! # Flow
//! - [`SettlementService::calculate_shopping_cart`] prices a cart against an
//!   unlocked product snapshot.
//! - [`resolve_promotions`] selects one promotion per kind.
//! - [`apply_promotions`] runs the discount steps in fixed order.
//! - [`SettlementService::create_order`] debits the wallet, decrements stock
//!   and persists the order inside one transaction, with row locks taken in a
//!   canonical order. Failures roll everything back.

mod discount;
mod error;
mod metrics;
mod resolver;
mod transaction;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::{Cart, Decimal, Order, PriceInput, Product, Promotion, PromotionKind};
use repository::{
    Database, LockMode, MemberOptions, OrderOptions, ProductOptions, PromotionOptions,
    RepositoryError, with_transaction_until,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use discount::{DiscountOutcome, apply_promotions};
pub use error::{ErrorKind, ServiceError};
pub use metrics::SettlementMetrics;
pub use resolver::{ResolvedPromotions, resolve_promotions};
pub use transaction::SettlementState;

use transaction::{SettlementPlan, settle};

/// Pre-discount pricing of a cart.
#[derive(Debug, Clone, PartialEq)]
pub struct CartSettlement {
    /// Σ unit price × requested quantity.
    pub original_price: Decimal,
    /// Snapshots of the cart's products, ordered by id, with inventory.
    pub products: Vec<Product>,
}

/// A priced and discounted cart, before any lock is taken.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub settlement: CartSettlement,
    pub discount: DiscountOutcome,
}

/// Tuning of the order transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementOptions {
    /// `Exclusive` waits for contended rows, `ExclusiveNoWait` fails fast.
    pub lock_mode: LockMode,
    /// Upper bound for one settlement; exceeding it cancels the attempt.
    pub timeout: Option<Duration>,
}

impl Default for SettlementOptions {
    fn default() -> Self {
        Self {
            lock_mode: LockMode::Exclusive,
            timeout: None,
        }
    }
}

/// Settlement operations exposed to callers.
#[async_trait]
pub trait SettlementService: Send + Sync {
    /// Validates the cart against current product state and computes the
    /// original price. Side-effect free.
    ///
    /// # Errors
    /// [`ServiceError::InvalidInput`] for an empty cart or a quantity ≤ 0,
    /// [`ServiceError::NotFound`] when a product id does not resolve,
    /// [`ServiceError::ResourceUnavailable`] for off-sale or sold-out products.
    async fn calculate_shopping_cart(&self, cart: &Cart) -> Result<CartSettlement, ServiceError>;

    /// Promotions of every kind running at `now`, plus the defaults.
    async fn current_promotions(&self, now: DateTime<Utc>) -> Result<Vec<Promotion>, ServiceError>;

    /// Prices the cart and applies the promotions for this buyer without
    /// touching any balance.
    async fn quote_order(&self, user_id: i64, used_points: i32, cart: &Cart) -> Result<Quote, ServiceError>;

    /// Settles the cart into an order and returns the new order id.
    ///
    /// Cancelling `cancel` (or exceeding the configured timeout) before the
    /// transaction commits aborts the attempt and rolls back whatever it had
    /// done. A commit already under way is always completed.
    async fn create_order(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        used_points: i32,
        cart: Cart,
    ) -> Result<String, ServiceError>;

    async fn list_promotions(&self, options: &PromotionOptions) -> Result<Vec<Promotion>, ServiceError>;

    /// Validates and stores a promotion; returns its id.
    async fn create_promotion(&self, promotion: Promotion) -> Result<i64, ServiceError>;

    async fn get_order(&self, order_id: &str) -> Result<Order, ServiceError>;
}

/// [`SettlementService`] over a storage backend.
pub struct SettlementServiceImpl<D> {
    db: D,
    options: SettlementOptions,
    metrics: SettlementMetrics,
}

impl<D: Database> SettlementServiceImpl<D> {
    pub fn new(db: D, options: SettlementOptions, metrics: SettlementMetrics) -> Self {
        Self { db, options, metrics }
    }

    pub fn metrics(&self) -> &SettlementMetrics {
        &self.metrics
    }

    /// Resolves once the caller cancels or the configured deadline passes.
    async fn interrupted(&self, cancel: &CancellationToken) -> ServiceError {
        let deadline = async {
            match self.options.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => info!("Settlement cancelled by caller"),
            _ = deadline => warn!(timeout = ?self.options.timeout, "Settlement deadline exceeded"),
        }
        ServiceError::Cancelled
    }

    async fn run_settlement(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        used_points: i32,
        cart: Cart,
    ) -> Result<String, ServiceError> {
        let interrupt = self.interrupted(cancel);
        tokio::pin!(interrupt);

        let order_id = Uuid::new_v4().to_string();
        debug!(%order_id, state = %SettlementState::Started, "Settlement started");

        let quote = tokio::select! {
            biased;
            err = &mut interrupt => return Err(err),
            quote = self.quote_order(user_id, used_points, &cart) => quote?,
        };
        debug!(
            %order_id,
            state = %SettlementState::Discounted,
            original_price = %quote.settlement.original_price,
            final_price = %quote.discount.final_price,
            "Cart discounted"
        );

        let mut order = Order::new(order_id, user_id, used_points);
        order.original_price = quote.settlement.original_price;
        order.final_price = quote.discount.final_price;
        order.promotion_ids = quote.discount.promotion_ids;
        let quoted_prices: BTreeMap<i64, Decimal> = quote
            .settlement
            .products
            .iter()
            .map(|product| (product.id, product.price))
            .collect();

        let plan = SettlementPlan {
            order,
            cart,
            quoted_prices,
            lock: self.options.lock_mode,
        };
        // Cancellation only interrupts the locked work; the commit itself is
        // never abandoned halfway.
        with_transaction_until(&self.db, interrupt, move |tx| Box::pin(settle(tx, plan))).await
    }
}

#[async_trait]
impl<D: Database> SettlementService for SettlementServiceImpl<D> {
    #[instrument(skip(self, cart), fields(items = cart.len()))]
    async fn calculate_shopping_cart(&self, cart: &Cart) -> Result<CartSettlement, ServiceError> {
        if cart.is_empty() {
            return Err(ServiceError::InvalidInput("cart is empty".into()));
        }
        if let Some((product_id, quantity)) = cart.iter().find(|(_, quantity)| **quantity <= 0) {
            return Err(ServiceError::InvalidInput(format!(
                "quantity of product {product_id} must be positive, got {quantity}"
            )));
        }

        let products = self
            .db
            .list_products(&ProductOptions::by_ids(cart.keys().copied()).with_inventory())
            .await?;
        if products.is_empty() {
            let ids: Vec<i64> = cart.keys().copied().collect();
            return Err(ServiceError::not_found("product", format!("{ids:?}")));
        }

        let by_id: BTreeMap<i64, &Product> = products.iter().map(|p| (p.id, p)).collect();
        let mut original_price = Decimal::ZERO;
        for (&product_id, &quantity) in cart {
            let product = by_id
                .get(&product_id)
                .ok_or_else(|| ServiceError::not_found("product", product_id))?;
            if !product.is_available() {
                return Err(ServiceError::ResourceUnavailable(format!(
                    "product {product_id} is not on sale"
                )));
            }
            if product.available_quantity() <= 0 {
                return Err(ServiceError::ResourceUnavailable(format!(
                    "product {product_id} is sold out"
                )));
            }
            original_price += product.price * Decimal::from(quantity);
        }

        debug!(%original_price, state = %SettlementState::Priced, "Cart priced");
        Ok(CartSettlement {
            original_price,
            products,
        })
    }

    #[instrument(skip(self))]
    async fn current_promotions(&self, now: DateTime<Utc>) -> Result<Vec<Promotion>, ServiceError> {
        let options = PromotionOptions::current(&PromotionKind::ALL, now);
        Ok(self.db.list_promotions(&options).await?)
    }

    #[instrument(skip(self, cart))]
    async fn quote_order(&self, user_id: i64, used_points: i32, cart: &Cart) -> Result<Quote, ServiceError> {
        if used_points < 0 {
            return Err(ServiceError::InvalidInput(format!(
                "points to redeem must not be negative, got {used_points}"
            )));
        }
        let settlement = self.calculate_shopping_cart(cart).await?;

        let member = self.db.get_member(&MemberOptions::by_user(user_id)).await?;
        let now = Utc::now();
        let resolved = resolve_promotions(self.current_promotions(now).await?, now);
        let discount = apply_promotions(
            settlement.original_price,
            &resolved,
            &PriceInput { member, used_points },
        );

        Ok(Quote { settlement, discount })
    }

    #[instrument(skip(self, cancel, cart), fields(items = cart.len()))]
    async fn create_order(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        used_points: i32,
        cart: Cart,
    ) -> Result<String, ServiceError> {
        let started = Instant::now();
        let result = self.run_settlement(cancel, user_id, used_points, cart).await;

        match &result {
            Ok(order_id) => {
                self.metrics.record("committed", started.elapsed());
                info!(%order_id, state = %SettlementState::Committed, "Order settled");
            }
            Err(err) => {
                self.metrics.record(err.kind().as_str(), started.elapsed());
                warn!(error = %err, kind = %err.kind(), state = %SettlementState::Aborted, "Settlement aborted");
            }
        }
        result
    }

    #[instrument(skip(self))]
    async fn list_promotions(&self, options: &PromotionOptions) -> Result<Vec<Promotion>, ServiceError> {
        Ok(self.db.list_promotions(options).await?)
    }

    #[instrument(skip(self, promotion), fields(name = %promotion.name, kind = ?promotion.kind()))]
    async fn create_promotion(&self, promotion: Promotion) -> Result<i64, ServiceError> {
        promotion
            .validate()
            .map_err(|err| ServiceError::InvalidInput(err.to_string()))?;
        let id = self.db.create_promotion(&promotion).await?;
        info!(promotion_id = id, "Promotion created");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_order(&self, order_id: &str) -> Result<Order, ServiceError> {
        self.db
            .get_order(&OrderOptions::by_id(order_id))
            .await
            .map_err(|err| match err {
                RepositoryError::NotFound { .. } => ServiceError::not_found("order", order_id),
                other => other.into(),
            })
    }
}
