//! In-process implementation of the repository port.
//!
//! Committed rows live in plain maps behind one mutex. Every product row
//! (product + inventory) and wallet row has its own async mutex acting as the
//! row lock; a transaction keeps the guards it acquired until it commits,
//! rolls back or is dropped. Writes are staged inside the transaction and
//! become visible to other readers only at commit, all at once.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use model::{
    Inventory, Member, MemberType, Order, Product, ProductStatus, Promotion, Wallet,
};
use rust_decimal::Decimal;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::debug;

use crate::{
    Database, InventoryOptions, InventoryUpdates, LockMode, MemberOptions, OrderOptions,
    ProductOptions, ProductUpdates, PromotionOptions, Repository, RepositoryError, Transaction,
    WalletOptions, WalletUpdates,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Space {
    Product,
    Wallet,
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Space::Product => f.write_str("product"),
            Space::Wallet => f.write_str("wallet"),
        }
    }
}

type RowKey = (Space, i64);

#[derive(Debug, Default)]
struct Tables {
    /// Stored without their inventory.
    products: BTreeMap<i64, Product>,
    /// Keyed by product id.
    inventories: BTreeMap<i64, Inventory>,
    wallets: BTreeMap<i64, Wallet>,
    /// Keyed by user id.
    members: BTreeMap<i64, Member>,
    promotions: BTreeMap<i64, Promotion>,
    orders: BTreeMap<String, Order>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    rows: Mutex<HashMap<RowKey, Arc<RowLock<()>>>>,
}

impl Shared {
    fn row_lock(&self, key: RowKey) -> Arc<RowLock<()>> {
        lock(&self.rows).entry(key).or_default().clone()
    }
}

/// Thread-safe in-memory database.
///
/// Cloning yields another handle to the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin_tx(&self) -> MemoryTransaction {
        MemoryTransaction {
            shared: self.shared.clone(),
            state: Mutex::new(TxState::default()),
        }
    }

    /// Adds a product with `quantity` units in stock and returns its id.
    pub fn add_product(&self, name: &str, status: ProductStatus, price: Decimal, quantity: i32) -> i64 {
        let mut tables = lock(&self.shared.tables);
        let now = Utc::now();
        let id = tables.next_id();
        let inventory_id = tables.next_id();
        tables.products.insert(
            id,
            Product {
                id,
                name: name.to_string(),
                status,
                price,
                created_at: now,
                updated_at: now,
                inventory: None,
            },
        );
        tables.inventories.insert(
            id,
            Inventory {
                id: inventory_id,
                product_id: id,
                total_quantity: quantity,
                available_quantity: quantity,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// Opens a wallet for `user_id` and returns its id.
    pub fn add_wallet(&self, user_id: i64, token: Decimal, points: i32) -> i64 {
        let mut tables = lock(&self.shared.tables);
        let now = Utc::now();
        let id = tables.next_id();
        tables.wallets.insert(
            id,
            Wallet {
                id,
                user_id,
                token,
                points,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// Enrols `user_id` into a membership tier.
    pub fn add_member(&self, user_id: i64, member_type: MemberType, level: i16) -> i64 {
        let mut tables = lock(&self.shared.tables);
        let now = Utc::now();
        let id = tables.next_id();
        tables.members.insert(
            user_id,
            Member {
                id,
                user_id,
                member_type,
                level,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// Every committed order, ordered by id.
    pub fn orders(&self) -> Vec<Order> {
        lock(&self.shared.tables).orders.values().cloned().collect()
    }
}

/// Transaction over a [`MemoryDatabase`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    state: Mutex<TxState>,
}

#[derive(Default)]
struct TxState {
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    products: BTreeMap<i64, Product>,
    inventories: BTreeMap<i64, Inventory>,
    wallets: BTreeMap<i64, Wallet>,
    promotions: BTreeMap<i64, Promotion>,
    orders: BTreeMap<String, Order>,
}

impl MemoryTransaction {
    /// Acquires row locks in ascending key order. Rows already held by this
    /// transaction are skipped.
    async fn lock_rows(&self, space: Space, keys: &BTreeSet<i64>, mode: LockMode) -> Result<(), RepositoryError> {
        if !mode.is_locking() {
            return Ok(());
        }
        for &key in keys {
            let already_held = lock(&self.state).held.contains_key(&(space, key));
            if already_held {
                continue;
            }
            let row = self.shared.row_lock((space, key));
            let guard = match mode {
                LockMode::ExclusiveNoWait => row.try_lock_owned().map_err(|_| {
                    RepositoryError::LockNotAvailable(format!("{space} {key} is locked by another transaction"))
                })?,
                _ => row.lock_owned().await,
            };
            lock(&self.state).held.insert((space, key), guard);
        }
        Ok(())
    }

    fn product_ids(&self, filter: &[i64]) -> BTreeSet<i64> {
        let tables = lock(&self.shared.tables);
        if filter.is_empty() {
            tables.products.keys().copied().collect()
        } else {
            filter
                .iter()
                .copied()
                .filter(|id| tables.products.contains_key(id))
                .collect()
        }
    }

    fn wallet_ids(&self, options: &WalletOptions) -> BTreeSet<i64> {
        let tables = lock(&self.shared.tables);
        tables
            .wallets
            .values()
            .filter(|w| options.ids.is_empty() || options.ids.contains(&w.id))
            .filter(|w| options.user_ids.is_empty() || options.user_ids.contains(&w.user_id))
            .map(|w| w.id)
            .collect()
    }
}

#[async_trait]
impl Repository for MemoryTransaction {
    async fn list_products(&self, options: &ProductOptions) -> Result<Vec<Product>, RepositoryError> {
        let ids = self.product_ids(&options.ids);
        self.lock_rows(Space::Product, &ids, options.lock).await?;

        let tables = lock(&self.shared.tables);
        let state = lock(&self.state);
        let products = ids
            .iter()
            .filter_map(|id| {
                let mut product = state.products.get(id).or_else(|| tables.products.get(id)).cloned()?;
                if options.with_inventory {
                    let inventory = state
                        .inventories
                        .get(id)
                        .or_else(|| tables.inventories.get(id))
                        .cloned()?;
                    product.inventory = Some(inventory);
                }
                Some(product)
            })
            .collect();
        Ok(products)
    }

    async fn update_product(&self, options: &ProductOptions, updates: &ProductUpdates) -> Result<u64, RepositoryError> {
        if options.ids.is_empty() {
            return Err(RepositoryError::MissingFilter("product"));
        }
        if updates.is_empty() {
            return Ok(0);
        }
        let ids = self.product_ids(&options.ids);
        self.lock_rows(Space::Product, &ids, LockMode::Exclusive).await?;

        let tables = lock(&self.shared.tables);
        let mut state = lock(&self.state);
        let now = Utc::now();
        let mut touched = 0;
        for id in &ids {
            let Some(mut product) = state.products.get(id).or_else(|| tables.products.get(id)).cloned() else {
                continue;
            };
            if let Some(name) = &updates.name {
                product.name = name.clone();
            }
            if let Some(status) = updates.status {
                product.status = status;
            }
            if let Some(price) = updates.price {
                product.price = price;
            }
            product.updated_at = now;
            state.products.insert(*id, product);
            touched += 1;
        }
        Ok(touched)
    }

    async fn list_inventories(&self, options: &InventoryOptions) -> Result<Vec<Inventory>, RepositoryError> {
        let ids = self.product_ids(&options.product_ids);
        self.lock_rows(Space::Product, &ids, options.lock).await?;

        let tables = lock(&self.shared.tables);
        let state = lock(&self.state);
        Ok(ids
            .iter()
            .filter_map(|id| state.inventories.get(id).or_else(|| tables.inventories.get(id)).cloned())
            .collect())
    }

    async fn update_inventory(
        &self,
        options: &InventoryOptions,
        updates: &InventoryUpdates,
    ) -> Result<u64, RepositoryError> {
        if options.product_ids.is_empty() {
            return Err(RepositoryError::MissingFilter("inventory"));
        }
        if updates.is_empty() {
            return Ok(0);
        }
        let ids = self.product_ids(&options.product_ids);
        self.lock_rows(Space::Product, &ids, LockMode::Exclusive).await?;

        let tables = lock(&self.shared.tables);
        let mut state = lock(&self.state);
        let now = Utc::now();
        let mut changed = Vec::with_capacity(ids.len());
        for id in &ids {
            let Some(mut inventory) = state.inventories.get(id).or_else(|| tables.inventories.get(id)).cloned() else {
                continue;
            };
            if let Some(op) = &updates.total_quantity {
                inventory.total_quantity = op
                    .apply_to(inventory.total_quantity)
                    .filter(|quantity| *quantity >= 0)
                    .ok_or_else(|| {
                        RepositoryError::ConstraintViolation(format!("total_quantity of product {id} would become negative"))
                    })?;
            }
            if let Some(op) = &updates.available_quantity {
                inventory.available_quantity = op
                    .apply_to(inventory.available_quantity)
                    .filter(|quantity| *quantity >= 0)
                    .ok_or_else(|| {
                        RepositoryError::ConstraintViolation(format!(
                            "available_quantity of product {id} would become negative"
                        ))
                    })?;
            }
            inventory.updated_at = now;
            changed.push(inventory);
        }
        let touched = changed.len() as u64;
        for inventory in changed {
            state.inventories.insert(inventory.product_id, inventory);
        }
        Ok(touched)
    }

    async fn get_wallet(&self, options: &WalletOptions) -> Result<Wallet, RepositoryError> {
        if options.is_unfiltered() {
            return Err(RepositoryError::MissingFilter("wallet"));
        }
        let ids = self.wallet_ids(options);
        self.lock_rows(Space::Wallet, &ids, options.lock).await?;

        let tables = lock(&self.shared.tables);
        let state = lock(&self.state);
        ids.iter()
            .find_map(|id| state.wallets.get(id).or_else(|| tables.wallets.get(id)).cloned())
            .ok_or_else(|| RepositoryError::not_found("wallet", options.describe()))
    }

    async fn update_wallet(&self, options: &WalletOptions, updates: &WalletUpdates) -> Result<u64, RepositoryError> {
        if options.is_unfiltered() {
            return Err(RepositoryError::MissingFilter("wallet"));
        }
        if updates.is_empty() {
            return Ok(0);
        }
        let ids = self.wallet_ids(options);
        self.lock_rows(Space::Wallet, &ids, LockMode::Exclusive).await?;

        let tables = lock(&self.shared.tables);
        let mut state = lock(&self.state);
        let now = Utc::now();
        let mut changed = Vec::with_capacity(ids.len());
        for id in &ids {
            let Some(mut wallet) = state.wallets.get(id).or_else(|| tables.wallets.get(id)).cloned() else {
                continue;
            };
            if let Some(op) = &updates.token {
                wallet.token = op
                    .apply_to(wallet.token)
                    .filter(|token| *token >= Decimal::ZERO)
                    .ok_or_else(|| RepositoryError::ConstraintViolation(format!("token of wallet {id} would become negative")))?;
            }
            if let Some(op) = &updates.points {
                wallet.points = op
                    .apply_to(wallet.points)
                    .filter(|points| *points >= 0)
                    .ok_or_else(|| RepositoryError::ConstraintViolation(format!("points of wallet {id} would become negative")))?;
            }
            wallet.updated_at = now;
            changed.push(wallet);
        }
        let touched = changed.len() as u64;
        for wallet in changed {
            state.wallets.insert(wallet.id, wallet);
        }
        Ok(touched)
    }

    async fn get_member(&self, options: &MemberOptions) -> Result<Option<Member>, RepositoryError> {
        if options.user_ids.is_empty() {
            return Err(RepositoryError::MissingFilter("member"));
        }
        let tables = lock(&self.shared.tables);
        Ok(options
            .user_ids
            .iter()
            .find_map(|user_id| tables.members.get(user_id).cloned()))
    }

    async fn list_promotions(&self, options: &PromotionOptions) -> Result<Vec<Promotion>, RepositoryError> {
        let tables = lock(&self.shared.tables);
        let state = lock(&self.state);
        let mut promotions: BTreeMap<i64, Promotion> = tables.promotions.clone();
        promotions.extend(state.promotions.iter().map(|(id, p)| (*id, p.clone())));

        Ok(promotions
            .into_values()
            .filter(|p| options.ids.is_empty() || options.ids.contains(&p.id))
            .filter(|p| options.kinds.is_empty() || options.kinds.contains(&p.kind()))
            .filter(|p| match options.active_at {
                None => true,
                Some(now) => p.is_active_at(now) || (options.include_default && p.is_default),
            })
            .collect())
    }

    async fn create_promotion(&self, promotion: &Promotion) -> Result<i64, RepositoryError> {
        let id = lock(&self.shared.tables).next_id();
        let now = Utc::now();
        let mut stored = promotion.clone();
        stored.id = id;
        stored.created_at = now;
        stored.updated_at = now;
        lock(&self.state).promotions.insert(id, stored);
        Ok(id)
    }

    async fn create_order(&self, order: &Order) -> Result<(), RepositoryError> {
        if let Some(item) = order.items.iter().find(|item| item.quantity <= 0) {
            return Err(RepositoryError::ConstraintViolation(format!(
                "order item quantity must be positive, product {} has {}",
                item.product_id, item.quantity
            )));
        }
        if order.final_price < Decimal::ZERO || order.final_price > order.original_price {
            return Err(RepositoryError::ConstraintViolation(format!(
                "order {} final price {} is outside [0, {}]",
                order.id, order.final_price, order.original_price
            )));
        }
        let tables = lock(&self.shared.tables);
        let mut state = lock(&self.state);
        if tables.orders.contains_key(&order.id) || state.orders.contains_key(&order.id) {
            return Err(RepositoryError::AlreadyExists(format!("order {}", order.id)));
        }
        state.orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn get_order(&self, options: &OrderOptions) -> Result<Order, RepositoryError> {
        if options.ids.is_empty() && options.user_ids.is_empty() {
            return Err(RepositoryError::MissingFilter("order"));
        }
        let tables = lock(&self.shared.tables);
        let state = lock(&self.state);
        state
            .orders
            .values()
            .chain(tables.orders.values())
            .filter(|o| options.ids.is_empty() || options.ids.contains(&o.id))
            .filter(|o| options.user_ids.is_empty() || options.user_ids.contains(&o.user_id))
            .min_by(|a, b| a.id.cmp(&b.id))
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("order", format!("{:?}", options.ids)))
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self) -> Result<(), RepositoryError> {
        let TxState {
            held,
            products,
            inventories,
            wallets,
            promotions,
            orders,
        } = self.state.into_inner().unwrap_or_else(PoisonError::into_inner);

        {
            let mut tables = lock(&self.shared.tables);
            if let Some(id) = orders.keys().find(|id| tables.orders.contains_key(*id)) {
                return Err(RepositoryError::AlreadyExists(format!("order {id}")));
            }
            tables.products.extend(products);
            tables.inventories.extend(inventories);
            tables.wallets.extend(wallets);
            tables.promotions.extend(promotions);
            tables.orders.extend(orders);
        }

        // Row locks are released only after the writes are visible.
        debug!(locks = held.len(), "Memory transaction committed");
        drop(held);
        Ok(())
    }

    async fn rollback(self) -> Result<(), RepositoryError> {
        debug!("Memory transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, RepositoryError> {
        Ok(self.begin_tx())
    }
}

/// Outside a transaction every call commits on its own.
#[async_trait]
impl Repository for MemoryDatabase {
    async fn list_products(&self, options: &ProductOptions) -> Result<Vec<Product>, RepositoryError> {
        let tx = self.begin_tx();
        let products = tx.list_products(options).await?;
        tx.commit().await?;
        Ok(products)
    }

    async fn update_product(&self, options: &ProductOptions, updates: &ProductUpdates) -> Result<u64, RepositoryError> {
        let tx = self.begin_tx();
        let touched = tx.update_product(options, updates).await?;
        tx.commit().await?;
        Ok(touched)
    }

    async fn list_inventories(&self, options: &InventoryOptions) -> Result<Vec<Inventory>, RepositoryError> {
        let tx = self.begin_tx();
        let inventories = tx.list_inventories(options).await?;
        tx.commit().await?;
        Ok(inventories)
    }

    async fn update_inventory(
        &self,
        options: &InventoryOptions,
        updates: &InventoryUpdates,
    ) -> Result<u64, RepositoryError> {
        let tx = self.begin_tx();
        let touched = tx.update_inventory(options, updates).await?;
        tx.commit().await?;
        Ok(touched)
    }

    async fn get_wallet(&self, options: &WalletOptions) -> Result<Wallet, RepositoryError> {
        let tx = self.begin_tx();
        let wallet = tx.get_wallet(options).await?;
        tx.commit().await?;
        Ok(wallet)
    }

    async fn update_wallet(&self, options: &WalletOptions, updates: &WalletUpdates) -> Result<u64, RepositoryError> {
        let tx = self.begin_tx();
        let touched = tx.update_wallet(options, updates).await?;
        tx.commit().await?;
        Ok(touched)
    }

    async fn get_member(&self, options: &MemberOptions) -> Result<Option<Member>, RepositoryError> {
        self.begin_tx().get_member(options).await
    }

    async fn list_promotions(&self, options: &PromotionOptions) -> Result<Vec<Promotion>, RepositoryError> {
        self.begin_tx().list_promotions(options).await
    }

    async fn create_promotion(&self, promotion: &Promotion) -> Result<i64, RepositoryError> {
        let tx = self.begin_tx();
        let id = tx.create_promotion(promotion).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn create_order(&self, order: &Order) -> Result<(), RepositoryError> {
        let tx = self.begin_tx();
        tx.create_order(order).await?;
        tx.commit().await
    }

    async fn get_order(&self, options: &OrderOptions) -> Result<Order, RepositoryError> {
        self.begin_tx().get_order(options).await
    }
}
