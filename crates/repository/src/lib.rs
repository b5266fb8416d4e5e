//! # Data Repository Layer
//!
//! The storage port consumed by the settlement service: query options,
//! delta-based update sets, the [`Repository`] operations, and the
//! [`Database`]/[`Transaction`] pair that scopes them into an atomic unit.
//!
//! Two implementations are provided:
//! - [`PgDatabase`]: PostgreSQL through a `deadpool-postgres` pool, row locks
//!   via `SELECT ... FOR UPDATE [NOWAIT]`.
//! - [`MemoryDatabase`]: in-process tables with real per-row async locks,
//!   used by tests and the demo mode of the binary.

mod memory;
mod options;
mod postgres;

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use model::{Inventory, Member, ModelError, Order, Product, Promotion, Wallet};
use thiserror::Error;
use tokio_postgres::error::SqlState;
use tracing::{error, warn};

pub use memory::{MemoryDatabase, MemoryTransaction};
pub use options::{
    InventoryOptions, InventoryUpdates, LockMode, MemberOptions, OrderOptions, ProductOptions,
    ProductUpdates, PromotionOptions, WalletOptions, WalletUpdates,
};
pub use postgres::{PgDatabase, PgTransaction};

/// # RepositoryError
///
/// Error types that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// No row matched the filter.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Unique constraint violated (e.g. duplicate order id).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A check constraint rejected the write, e.g. a delta that would drive
    /// stock or balance below zero.
    #[error("constraint violated: {0}")]
    ConstraintViolation(String),

    /// A no-wait lock request hit a row held by another transaction.
    #[error("lock not available: {0}")]
    LockNotAvailable(String),

    /// The storage engine aborted this transaction to break a deadlock.
    #[error("deadlock detected")]
    Deadlock,

    /// An update or single-row read was issued without any row filter.
    #[error("{0} operation requires a row filter")]
    MissingFilter(&'static str),

    /// Database-related errors, wrapping the underlying PostgreSQL error.
    #[error("Database error: {0}")]
    Db(#[source] tokio_postgres::Error),

    /// Failed to obtain a connection from the pool.
    #[error("Pool error: {0}")]
    Pool(String),

    /// A stored value could not be decoded into the model.
    #[error("decode error: {0}")]
    Decode(#[from] ModelError),

    /// Unexpected failure, including panics inside a transaction.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RepositoryError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        RepositoryError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<tokio_postgres::Error> for RepositoryError {
    fn from(err: tokio_postgres::Error) -> Self {
        let Some(code) = err.code() else {
            return RepositoryError::Db(err);
        };
        let message = err
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_default();
        if *code == SqlState::UNIQUE_VIOLATION {
            RepositoryError::AlreadyExists(message)
        } else if *code == SqlState::CHECK_VIOLATION {
            RepositoryError::ConstraintViolation(message)
        } else if *code == SqlState::LOCK_NOT_AVAILABLE {
            RepositoryError::LockNotAvailable(message)
        } else if *code == SqlState::T_R_DEADLOCK_DETECTED {
            RepositoryError::Deadlock
        } else {
            RepositoryError::Db(err)
        }
    }
}

impl From<deadpool_postgres::PoolError> for RepositoryError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        RepositoryError::Pool(err.to_string())
    }
}

/// # Repository
///
/// Read/write operations shared by a plain database handle (each call runs on
/// its own) and by a [`Transaction`] (calls share one atomic unit).
///
/// Stock and balances are only changed through delta operations; lock modes
/// on reads only have lasting effect inside a transaction.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Products ordered by id, optionally joined with their inventory.
    async fn list_products(&self, options: &ProductOptions) -> Result<Vec<Product>, RepositoryError>;

    /// Sets name/status/price; returns the number of rows touched.
    async fn update_product(
        &self,
        options: &ProductOptions,
        updates: &ProductUpdates,
    ) -> Result<u64, RepositoryError>;

    /// Inventories ordered by product id.
    async fn list_inventories(
        &self,
        options: &InventoryOptions,
    ) -> Result<Vec<Inventory>, RepositoryError>;

    /// Applies quantity deltas; fails with `ConstraintViolation` when a
    /// quantity would become negative.
    async fn update_inventory(
        &self,
        options: &InventoryOptions,
        updates: &InventoryUpdates,
    ) -> Result<u64, RepositoryError>;

    /// The single wallet matching the filter, or `NotFound`.
    async fn get_wallet(&self, options: &WalletOptions) -> Result<Wallet, RepositoryError>;

    /// Applies token/points deltas; fails with `ConstraintViolation` when a
    /// balance would become negative.
    async fn update_wallet(
        &self,
        options: &WalletOptions,
        updates: &WalletUpdates,
    ) -> Result<u64, RepositoryError>;

    /// Membership of a user; `None` for non-members.
    async fn get_member(&self, options: &MemberOptions) -> Result<Option<Member>, RepositoryError>;

    /// Promotions ordered by id.
    async fn list_promotions(
        &self,
        options: &PromotionOptions,
    ) -> Result<Vec<Promotion>, RepositoryError>;

    /// Stores a promotion and returns its assigned id.
    async fn create_promotion(&self, promotion: &Promotion) -> Result<i64, RepositoryError>;

    /// Inserts the order together with its items.
    async fn create_order(&self, order: &Order) -> Result<(), RepositoryError>;

    /// Loads one order with its items.
    async fn get_order(&self, options: &OrderOptions) -> Result<Order, RepositoryError>;
}

/// An open unit of work. Consumed by `commit`/`rollback`; dropping it
/// without committing rolls it back.
#[async_trait]
pub trait Transaction: Repository + Sized {
    async fn commit(self) -> Result<(), RepositoryError>;
    async fn rollback(self) -> Result<(), RepositoryError>;
}

/// Entry point of a storage backend.
#[async_trait]
pub trait Database: Repository {
    type Tx: Transaction + 'static;

    async fn begin(&self) -> Result<Self::Tx, RepositoryError>;
}

/// Runs `f` inside a transaction.
///
/// The callback only borrows the transaction for a lifetime it cannot name,
/// so the handle cannot outlive the call. `Ok` commits; `Err` rolls back; a
/// panic inside the callback rolls back and is reported as
/// [`RepositoryError::Internal`].
///
/// ```rust,ignore
/// let id = with_transaction(&db, move |tx| {
///     Box::pin(async move {
///         tx.create_order(&order).await?;
///         Ok::<_, RepositoryError>(order.id)
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<D, T, E, F>(db: &D, f: F) -> Result<T, E>
where
    D: Database,
    E: From<RepositoryError>,
    F: for<'t> FnOnce(&'t D::Tx) -> BoxFuture<'t, Result<T, E>>,
{
    with_transaction_until(db, future::pending(), f).await
}

/// Like [`with_transaction`], but abandons the callback once `interrupt`
/// resolves, rolling back and returning the error it yields.
///
/// Only the callback is raced. Once it has returned, the commit or rollback
/// always runs to completion, so an interrupt can never report failure for
/// work that was committed.
pub async fn with_transaction_until<D, T, E, F, I>(db: &D, interrupt: I, f: F) -> Result<T, E>
where
    D: Database,
    E: From<RepositoryError>,
    F: for<'t> FnOnce(&'t D::Tx) -> BoxFuture<'t, Result<T, E>>,
    I: Future<Output = E>,
{
    let tx = db.begin().await?;
    let outcome = tokio::select! {
        biased;
        err = interrupt => {
            warn!("Transaction interrupted, rolling back");
            Ok(Err(err))
        }
        outcome = AssertUnwindSafe(f(&tx)).catch_unwind() => outcome,
    };

    match outcome {
        Ok(Ok(value)) => {
            tx.commit().await?;
            Ok(value)
        }
        Ok(Err(err)) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "Transaction callback panicked, rolling back");
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(RepositoryError::Internal(format!("transaction aborted by panic: {message}")).into())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
