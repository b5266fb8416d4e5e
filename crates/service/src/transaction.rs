//! The order transaction: wallet debit, stock decrement and order insert as
//! one atomic unit.

use std::collections::BTreeMap;
use std::fmt;

use model::{Cart, Decimal, Order, OrderItem, PointOperation, Product, TokenOperation};
use repository::{
    InventoryOptions, InventoryUpdates, LockMode, ProductOptions, Repository, RepositoryError,
    WalletOptions, WalletUpdates,
};
use tracing::debug;

use crate::ServiceError;

/// Progress of one settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementState {
    Started,
    Priced,
    Discounted,
    Locking,
    Committed,
    Aborted,
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettlementState::Started => "started",
            SettlementState::Priced => "priced",
            SettlementState::Discounted => "discounted",
            SettlementState::Locking => "locking",
            SettlementState::Committed => "committed",
            SettlementState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Everything the transaction needs, owned so it can move into the
/// transaction callback.
#[derive(Debug)]
pub(crate) struct SettlementPlan {
    /// Priced and discounted, without items yet.
    pub order: Order,
    pub cart: Cart,
    /// Unit prices the quote was computed with.
    pub quoted_prices: BTreeMap<i64, Decimal>,
    pub lock: LockMode,
}

/// Runs the locked part of a settlement on `tx` and returns the order id.
///
/// The wallet row is locked first, then the product rows in ascending id
/// order. Any error leaves the caller to roll the transaction back.
pub(crate) async fn settle<R: Repository>(tx: &R, plan: SettlementPlan) -> Result<String, ServiceError> {
    let SettlementPlan {
        mut order,
        cart,
        quoted_prices,
        lock,
    } = plan;
    let user_id = order.user_id;
    let used_points = order.used_points;
    debug!(order_id = %order.id, state = %SettlementState::Locking, "Locking wallet");

    let wallet = tx
        .get_wallet(&WalletOptions::by_user(user_id).lock(lock))
        .await
        .map_err(|err| match err {
            RepositoryError::NotFound { .. } => ServiceError::not_found("wallet", user_id),
            other => other.into(),
        })?;

    if order.final_price < Decimal::ZERO {
        return Err(ServiceError::InvalidInput(format!(
            "discounted price {} is negative, too many points redeemed",
            order.final_price
        )));
    }
    if order.final_price > order.original_price {
        return Err(ServiceError::InvalidInput(format!(
            "promotions {:?} raise the price from {} to {}",
            order.promotion_ids, order.original_price, order.final_price
        )));
    }
    if order.final_price > wallet.token {
        return Err(ServiceError::InsufficientFunds(format!(
            "user {user_id} holds {} token, order costs {}",
            wallet.token, order.final_price
        )));
    }
    if used_points > 0 && used_points > wallet.points {
        return Err(ServiceError::InsufficientFunds(format!(
            "user {user_id} holds {} points, requested {used_points}",
            wallet.points
        )));
    }

    tx.update_wallet(
        &WalletOptions::by_id(wallet.id),
        &WalletUpdates {
            token: Some(TokenOperation::sub(order.final_price)),
            points: (used_points > 0).then(|| PointOperation::sub(used_points)),
        },
    )
    .await?;
    debug!(order_id = %order.id, wallet_id = wallet.id, "Wallet debited");

    let products: BTreeMap<i64, Product> = tx
        .list_products(&ProductOptions::by_ids(cart.keys().copied()).with_inventory().lock(lock))
        .await?
        .into_iter()
        .map(|product| (product.id, product))
        .collect();

    let mut lines = Vec::with_capacity(cart.len());
    for (&product_id, &requested) in &cart {
        let product = products
            .get(&product_id)
            .ok_or_else(|| ServiceError::not_found("product", product_id))?;
        if !product.is_available() {
            return Err(ServiceError::ResourceUnavailable(format!(
                "product {product_id} is not on sale"
            )));
        }
        let available = product.available_quantity();
        if available < requested {
            return Err(ServiceError::InsufficientStock {
                product_id,
                available,
                requested,
            });
        }
        if quoted_prices.get(&product_id) != Some(&product.price) {
            return Err(ServiceError::ResourceUnavailable(format!(
                "price of product {product_id} changed during checkout"
            )));
        }
        lines.push((product, requested));
    }

    for (product, quantity) in &lines {
        tx.update_inventory(
            &InventoryOptions::by_product_ids([product.id]),
            &InventoryUpdates::sell(*quantity),
        )
        .await?;
    }
    debug!(order_id = %order.id, items = lines.len(), "Stock decremented");

    order.items = lines
        .iter()
        .map(|(product, quantity)| OrderItem::snapshot(&order.id, product, *quantity))
        .collect();
    tx.create_order(&order).await?;

    Ok(order.id)
}

#[cfg(test)]
mod tests {
    use model::ProductStatus;
    use repository::{Database, MemoryDatabase, Transaction};
    use rust_decimal_macros::dec;

    use super::*;

    #[tokio::test]
    async fn price_above_original_is_rejected_before_any_write() {
        let db = MemoryDatabase::new();
        let product = db.add_product("kettle", ProductStatus::On, dec!(50), 10);
        db.add_wallet(1, dec!(1000), 0);

        let mut order = Order::new("markup", 1, 0);
        order.original_price = dec!(100);
        order.final_price = dec!(120);
        order.promotion_ids = vec![3];
        let plan = SettlementPlan {
            order,
            cart: Cart::from([(product, 2)]),
            quoted_prices: BTreeMap::from([(product, dec!(50))]),
            lock: LockMode::Exclusive,
        };

        let tx = db.begin().await.unwrap();
        let err = settle(&tx, plan).await.unwrap_err();
        assert!(
            matches!(&err, ServiceError::InvalidInput(message) if message.contains("[3]")),
            "unexpected error: {err}"
        );
        tx.rollback().await.unwrap();

        let wallet = db.get_wallet(&WalletOptions::by_user(1)).await.unwrap();
        assert_eq!(wallet.token, dec!(1000));
        assert!(db.orders().is_empty());
    }
}
