mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{available, cart, settlement_service, settlement_service_with, wallet};
use model::ProductStatus;
use repository::{
    Database, LockMode, MemoryDatabase, ProductOptions, ProductUpdates, Repository, Transaction,
    WalletOptions,
};
use rust_decimal_macros::dec;
use service::{ErrorKind, ServiceError, SettlementOptions, SettlementService};
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stock_is_never_oversold() {
    const BUYERS: i64 = 12;
    const STOCK: i32 = 5;

    let db = MemoryDatabase::new();
    let product = db.add_product("limited", ProductStatus::On, dec!(10), STOCK);
    for user in 1..=BUYERS {
        db.add_wallet(user, dec!(100), 0);
    }
    let service = Arc::new(settlement_service(&db));

    let mut handles = Vec::new();
    for user in 1..=BUYERS {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            service.create_order(&cancel, user, 0, cart(&[(product, 1)])).await
        }));
    }

    let mut committed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => committed += 1,
            Err(err) => assert!(
                matches!(err.kind(), ErrorKind::InsufficientStock | ErrorKind::ResourceUnavailable),
                "unexpected error: {err}"
            ),
        }
    }

    assert_eq!(committed, STOCK);
    assert_eq!(available(&db, product).await, 0);
    assert_eq!(db.orders().len(), STOCK as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_never_overdraw() {
    let db = MemoryDatabase::new();
    let product = db.add_product("widget", ProductStatus::On, dec!(30), 100);
    db.add_wallet(1, dec!(100), 0);
    let service = Arc::new(settlement_service(&db));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                service.create_order(&cancel, 1, 0, cart(&[(product, 1)])).await
            })
        })
        .collect();

    let mut committed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => committed += 1,
            Err(err) => assert_eq!(err.kind(), ErrorKind::InsufficientFunds),
        }
    }

    assert_eq!(committed, 3);
    assert_eq!(wallet(&db, 1).await.token, dec!(10));
    assert_eq!(available(&db, product).await, 97);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_carts_do_not_deadlock() {
    let db = MemoryDatabase::new();
    let a = db.add_product("a", ProductStatus::On, dec!(1), 1000);
    let b = db.add_product("b", ProductStatus::On, dec!(1), 1000);
    for user in 1..=8 {
        db.add_wallet(user, dec!(1000), 0);
    }
    let service = Arc::new(settlement_service(&db));

    let handles: Vec<_> = (1..=8)
        .map(|user| {
            let service = service.clone();
            let lines = if user % 2 == 0 { [(a, 1), (b, 2)] } else { [(b, 2), (a, 1)] };
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                for _ in 0..5 {
                    service.create_order(&cancel, user, 0, cart(&lines)).await?;
                }
                Ok::<_, ServiceError>(())
            })
        })
        .collect();

    let all = wait_all(handles);
    tokio::time::timeout(Duration::from_secs(10), all)
        .await
        .expect("settlements deadlocked");

    assert_eq!(available(&db, a).await, 1000 - 40);
    assert_eq!(available(&db, b).await, 1000 - 80);
}

async fn wait_all(handles: Vec<tokio::task::JoinHandle<Result<(), ServiceError>>>) {
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn no_wait_mode_fails_fast_on_contention() {
    let db = MemoryDatabase::new();
    let product = db.add_product("kettle", ProductStatus::On, dec!(10), 10);
    db.add_wallet(1, dec!(100), 0);
    let service = settlement_service_with(
        &db,
        SettlementOptions {
            lock_mode: LockMode::ExclusiveNoWait,
            timeout: None,
        },
    );

    let holder = db.begin().await.unwrap();
    holder
        .get_wallet(&WalletOptions::by_user(1).lock(LockMode::Exclusive))
        .await
        .unwrap();

    let err = service
        .create_order(&CancellationToken::new(), 1, 0, cart(&[(product, 1)]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);

    drop(holder);
    service
        .create_order(&CancellationToken::new(), 1, 0, cart(&[(product, 1)]))
        .await
        .unwrap();
    assert_eq!(available(&db, product).await, 9);
}

#[tokio::test]
async fn deadline_cancels_a_blocked_settlement() {
    let db = MemoryDatabase::new();
    let product = db.add_product("kettle", ProductStatus::On, dec!(10), 10);
    db.add_wallet(1, dec!(100), 0);
    let service = settlement_service_with(
        &db,
        SettlementOptions {
            lock_mode: LockMode::Exclusive,
            timeout: Some(Duration::from_millis(50)),
        },
    );

    let holder = db.begin().await.unwrap();
    holder
        .get_wallet(&WalletOptions::by_user(1).lock(LockMode::Exclusive))
        .await
        .unwrap();

    let err = service
        .create_order(&CancellationToken::new(), 1, 0, cart(&[(product, 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Cancelled));
    holder.rollback().await.unwrap();

    assert_eq!(wallet(&db, 1).await.token, dec!(100));
    assert_eq!(available(&db, product).await, 10);
    assert!(db.orders().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_while_waiting_rolls_back() {
    let db = MemoryDatabase::new();
    let product = db.add_product("kettle", ProductStatus::On, dec!(10), 10);
    db.add_wallet(1, dec!(100), 0);
    let service = Arc::new(settlement_service(&db));

    let holder = db.begin().await.unwrap();
    holder
        .get_wallet(&WalletOptions::by_user(1).lock(LockMode::Exclusive))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let task = {
        let service = service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { service.create_order(&cancel, 1, 0, cart(&[(product, 1)])).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ServiceError::Cancelled));
    drop(holder);

    // Nothing from the cancelled attempt keeps the wallet locked.
    let next = db.begin().await.unwrap();
    next.get_wallet(&WalletOptions::by_user(1).lock(LockMode::ExclusiveNoWait))
        .await
        .unwrap();
    assert_eq!(available(&db, product).await, 10);
}

/// Holds the product row while a settlement quotes it, applies `updates` and
/// commits, then returns the settlement's outcome.
async fn settle_while_product_changes(
    db: &MemoryDatabase,
    product: i64,
    updates: ProductUpdates,
) -> Result<String, ServiceError> {
    let service = Arc::new(settlement_service(db));
    let by_id = ProductOptions::by_ids([product]);

    let holder = db.begin().await.unwrap();
    holder
        .list_products(&by_id.clone().lock(LockMode::Exclusive))
        .await
        .unwrap();

    let task = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .create_order(&CancellationToken::new(), 1, 0, cart(&[(product, 2)]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    holder.update_product(&by_id, &updates).await.unwrap();
    holder.commit().await.unwrap();
    task.await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn price_change_while_waiting_aborts_settlement() {
    let db = MemoryDatabase::new();
    let product = db.add_product("kettle", ProductStatus::On, dec!(50), 10);
    db.add_wallet(1, dec!(500), 0);

    let err = settle_while_product_changes(
        &db,
        product,
        ProductUpdates {
            price: Some(dec!(80)),
            ..ProductUpdates::default()
        },
    )
    .await
    .unwrap_err();

    assert!(
        matches!(&err, ServiceError::ResourceUnavailable(message) if message.contains("changed during checkout")),
        "unexpected error: {err}"
    );
    assert_eq!(wallet(&db, 1).await.token, dec!(500));
    assert_eq!(available(&db, product).await, 10);
    assert!(db.orders().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn product_taken_off_sale_while_waiting_aborts_settlement() {
    let db = MemoryDatabase::new();
    let product = db.add_product("kettle", ProductStatus::On, dec!(50), 10);
    db.add_wallet(1, dec!(500), 0);

    let err = settle_while_product_changes(
        &db,
        product,
        ProductUpdates {
            status: Some(ProductStatus::Down),
            ..ProductUpdates::default()
        },
    )
    .await
    .unwrap_err();

    assert!(
        matches!(&err, ServiceError::ResourceUnavailable(message) if message.contains("not on sale")),
        "unexpected error: {err}"
    );
    assert_eq!(wallet(&db, 1).await.token, dec!(500));
    assert_eq!(available(&db, product).await, 10);
    assert!(db.orders().is_empty());
}
