//! PostgreSQL implementation of the repository port.
//!
//! Reads with a [`LockMode`](crate::LockMode) append `FOR UPDATE [NOWAIT]`; rows are always
//! selected `ORDER BY id` so that concurrent lockers queue up in the same
//! order. Stock and balance updates are written as `column = column ± $n`
//! and rely on the table `CHECK (... >= 0)` constraints.

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use model::{
    Inventory, Member, MemberType, Order, OrderItem, Product, ProductStatus, Promotion,
    PromotionExtension, PromotionKind, Wallet,
};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};
use tracing::{debug, warn};

use crate::{
    Database, InventoryOptions, InventoryUpdates, MemberOptions, OrderOptions,
    ProductOptions, ProductUpdates, PromotionOptions, Repository, RepositoryError, Transaction,
    WalletOptions, WalletUpdates,
};

/// Pooled PostgreSQL database. Each call outside a transaction takes its own
/// connection from the pool.
#[derive(Clone)]
pub struct PgDatabase {
    pool: Pool,
}

impl PgDatabase {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// A transaction pinned to one pooled connection.
///
/// Dropping it without `commit`/`rollback` detaches the connection from the
/// pool and closes it, which makes the server abort the transaction.
pub struct PgTransaction {
    conn: Option<Object>,
}

impl PgTransaction {
    fn client(&self) -> Result<&Client, RepositoryError> {
        self.conn
            .as_deref()
            .map(|wrapper| &**wrapper)
            .ok_or_else(|| RepositoryError::Internal("transaction already finished".into()))
    }

    /// Runs `COMMIT` or `ROLLBACK`. The connection stays owned by the
    /// transaction until the statement has completed, so a transaction
    /// dropped mid-statement (or failing it) discards the connection instead
    /// of returning it to the pool in an unknown state.
    async fn finish(&mut self, statement: &str) -> Result<(), RepositoryError> {
        self.client()?.batch_execute(statement).await?;
        self.conn = None;
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("Transaction dropped while open, discarding its connection");
            drop(Object::take(conn));
        }
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(mut self) -> Result<(), RepositoryError> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self) -> Result<(), RepositoryError> {
        self.finish("ROLLBACK").await
    }
}

#[async_trait]
impl Database for PgDatabase {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<Self::Tx, RepositoryError> {
        let tx = PgTransaction {
            conn: Some(self.pool.get().await?),
        };
        tx.client()?.batch_execute("BEGIN").await?;
        debug!("Transaction started");
        Ok(tx)
    }
}

#[async_trait]
impl Repository for PgTransaction {
    async fn list_products(&self, options: &ProductOptions) -> Result<Vec<Product>, RepositoryError> {
        list_products(self.client()?, options).await
    }

    async fn update_product(&self, options: &ProductOptions, updates: &ProductUpdates) -> Result<u64, RepositoryError> {
        update_product(self.client()?, options, updates).await
    }

    async fn list_inventories(&self, options: &InventoryOptions) -> Result<Vec<Inventory>, RepositoryError> {
        list_inventories(self.client()?, options).await
    }

    async fn update_inventory(
        &self,
        options: &InventoryOptions,
        updates: &InventoryUpdates,
    ) -> Result<u64, RepositoryError> {
        update_inventory(self.client()?, options, updates).await
    }

    async fn get_wallet(&self, options: &WalletOptions) -> Result<Wallet, RepositoryError> {
        get_wallet(self.client()?, options).await
    }

    async fn update_wallet(&self, options: &WalletOptions, updates: &WalletUpdates) -> Result<u64, RepositoryError> {
        update_wallet(self.client()?, options, updates).await
    }

    async fn get_member(&self, options: &MemberOptions) -> Result<Option<Member>, RepositoryError> {
        get_member(self.client()?, options).await
    }

    async fn list_promotions(&self, options: &PromotionOptions) -> Result<Vec<Promotion>, RepositoryError> {
        list_promotions(self.client()?, options).await
    }

    async fn create_promotion(&self, promotion: &Promotion) -> Result<i64, RepositoryError> {
        create_promotion(self.client()?, promotion).await
    }

    async fn create_order(&self, order: &Order) -> Result<(), RepositoryError> {
        create_order(self.client()?, order).await
    }

    async fn get_order(&self, options: &OrderOptions) -> Result<Order, RepositoryError> {
        get_order(self.client()?, options).await
    }
}

#[async_trait]
impl Repository for PgDatabase {
    async fn list_products(&self, options: &ProductOptions) -> Result<Vec<Product>, RepositoryError> {
        let client = self.pool.get().await?;
        list_products(&client, options).await
    }

    async fn update_product(&self, options: &ProductOptions, updates: &ProductUpdates) -> Result<u64, RepositoryError> {
        let client = self.pool.get().await?;
        update_product(&client, options, updates).await
    }

    async fn list_inventories(&self, options: &InventoryOptions) -> Result<Vec<Inventory>, RepositoryError> {
        let client = self.pool.get().await?;
        list_inventories(&client, options).await
    }

    async fn update_inventory(
        &self,
        options: &InventoryOptions,
        updates: &InventoryUpdates,
    ) -> Result<u64, RepositoryError> {
        let client = self.pool.get().await?;
        update_inventory(&client, options, updates).await
    }

    async fn get_wallet(&self, options: &WalletOptions) -> Result<Wallet, RepositoryError> {
        let client = self.pool.get().await?;
        get_wallet(&client, options).await
    }

    async fn update_wallet(&self, options: &WalletOptions, updates: &WalletUpdates) -> Result<u64, RepositoryError> {
        let client = self.pool.get().await?;
        update_wallet(&client, options, updates).await
    }

    async fn get_member(&self, options: &MemberOptions) -> Result<Option<Member>, RepositoryError> {
        let client = self.pool.get().await?;
        get_member(&client, options).await
    }

    async fn list_promotions(&self, options: &PromotionOptions) -> Result<Vec<Promotion>, RepositoryError> {
        let client = self.pool.get().await?;
        list_promotions(&client, options).await
    }

    async fn create_promotion(&self, promotion: &Promotion) -> Result<i64, RepositoryError> {
        let client = self.pool.get().await?;
        create_promotion(&client, promotion).await
    }

    /// The order row and its items are written in one transaction.
    async fn create_order(&self, order: &Order) -> Result<(), RepositoryError> {
        let tx = self.begin().await?;
        tx.create_order(order).await?;
        tx.commit().await
    }

    async fn get_order(&self, options: &OrderOptions) -> Result<Order, RepositoryError> {
        let client = self.pool.get().await?;
        get_order(&client, options).await
    }
}

fn product_from_row(row: &Row) -> Result<Product, RepositoryError> {
    Ok(Product {
        id: row.get("id"),
        name: row.get("name"),
        status: ProductStatus::try_from(row.get::<_, i16>("status"))?,
        price: row.get("price"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        inventory: None,
    })
}

fn inventory_from_row(row: &Row) -> Inventory {
    Inventory {
        id: row.get("id"),
        product_id: row.get("product_id"),
        total_quantity: row.get("total_quantity"),
        available_quantity: row.get("available_quantity"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn wallet_from_row(row: &Row) -> Wallet {
    Wallet {
        id: row.get("id"),
        user_id: row.get("user_id"),
        token: row.get("token"),
        points: row.get("points"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn promotion_from_row(row: &Row) -> Result<Promotion, RepositoryError> {
    let kind = PromotionKind::try_from(row.get::<_, i16>("kind"))?;
    Ok(Promotion {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        extension: PromotionExtension::decode(kind, row.get("payload"))?,
        is_default: row.get("is_default"),
        start_at: row.get("start_at"),
        end_at: row.get("end_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

async fn list_products(client: &Client, options: &ProductOptions) -> Result<Vec<Product>, RepositoryError> {
    if !options.with_inventory {
        let query = format!(
            r#"
            SELECT id, name, status, price, created_at, updated_at
            FROM products
            WHERE cardinality($1::bigint[]) = 0 OR id = ANY($1)
            ORDER BY id
            {}
            "#,
            options.lock.sql()
        );
        let rows = client.query(query.as_str(), &[&options.ids]).await?;
        return rows.iter().map(product_from_row).collect();
    }

    let query = format!(
        r#"
        SELECT p.id, p.name, p.status, p.price, p.created_at, p.updated_at,
               i.id AS inventory_id, i.total_quantity, i.available_quantity,
               i.created_at AS inventory_created_at, i.updated_at AS inventory_updated_at
        FROM products p
        JOIN inventories i ON i.product_id = p.id
        WHERE cardinality($1::bigint[]) = 0 OR p.id = ANY($1)
        ORDER BY p.id
        {}
        "#,
        options.lock.sql()
    );
    let rows = client.query(query.as_str(), &[&options.ids]).await?;
    let mut products = Vec::with_capacity(rows.len());
    for row in rows {
        let mut product = product_from_row(&row)?;
        product.inventory = Some(Inventory {
            id: row.get("inventory_id"),
            product_id: product.id,
            total_quantity: row.get("total_quantity"),
            available_quantity: row.get("available_quantity"),
            created_at: row.get("inventory_created_at"),
            updated_at: row.get("inventory_updated_at"),
        });
        products.push(product);
    }
    Ok(products)
}

async fn update_product(
    client: &Client,
    options: &ProductOptions,
    updates: &ProductUpdates,
) -> Result<u64, RepositoryError> {
    if options.ids.is_empty() {
        return Err(RepositoryError::MissingFilter("product"));
    }
    if updates.is_empty() {
        return Ok(0);
    }
    let query = r#"
        UPDATE products
        SET name = COALESCE($2, name),
            status = COALESCE($3, status),
            price = COALESCE($4, price),
            updated_at = now()
        WHERE id = ANY($1)
    "#;
    let status = updates.status.map(ProductStatus::code);
    let touched = client
        .execute(query, &[&options.ids, &updates.name, &status, &updates.price])
        .await?;
    Ok(touched)
}

async fn list_inventories(client: &Client, options: &InventoryOptions) -> Result<Vec<Inventory>, RepositoryError> {
    let query = format!(
        r#"
        SELECT id, product_id, total_quantity, available_quantity, created_at, updated_at
        FROM inventories
        WHERE cardinality($1::bigint[]) = 0 OR product_id = ANY($1)
        ORDER BY product_id
        {}
        "#,
        options.lock.sql()
    );
    let rows = client.query(query.as_str(), &[&options.product_ids]).await?;
    Ok(rows.iter().map(inventory_from_row).collect())
}

async fn update_inventory(
    client: &Client,
    options: &InventoryOptions,
    updates: &InventoryUpdates,
) -> Result<u64, RepositoryError> {
    if options.product_ids.is_empty() {
        return Err(RepositoryError::MissingFilter("inventory"));
    }
    if updates.is_empty() {
        return Ok(0);
    }

    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&options.product_ids];
    let mut sets = vec!["updated_at = now()".to_string()];
    for (column, op) in [
        ("total_quantity", &updates.total_quantity),
        ("available_quantity", &updates.available_quantity),
    ] {
        if let Some(op) = op {
            params.push(&op.amount);
            sets.push(format!(
                "{column} = {column} {} ${}",
                op.operation.sql_operator(),
                params.len()
            ));
        }
    }

    let query = format!("UPDATE inventories SET {} WHERE product_id = ANY($1)", sets.join(", "));
    Ok(client.execute(query.as_str(), &params).await?)
}

async fn get_wallet(client: &Client, options: &WalletOptions) -> Result<Wallet, RepositoryError> {
    if options.is_unfiltered() {
        return Err(RepositoryError::MissingFilter("wallet"));
    }
    let query = format!(
        r#"
        SELECT id, user_id, token, points, created_at, updated_at
        FROM wallets
        WHERE (cardinality($1::bigint[]) = 0 OR id = ANY($1))
          AND (cardinality($2::bigint[]) = 0 OR user_id = ANY($2))
        ORDER BY id
        LIMIT 1
        {}
        "#,
        options.lock.sql()
    );
    let row = client.query_opt(query.as_str(), &[&options.ids, &options.user_ids]).await?;
    match row {
        Some(row) => Ok(wallet_from_row(&row)),
        None => Err(RepositoryError::not_found("wallet", options.describe())),
    }
}

async fn update_wallet(client: &Client, options: &WalletOptions, updates: &WalletUpdates) -> Result<u64, RepositoryError> {
    if options.is_unfiltered() {
        return Err(RepositoryError::MissingFilter("wallet"));
    }
    if updates.is_empty() {
        return Ok(0);
    }

    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&options.ids, &options.user_ids];
    let mut sets = vec!["updated_at = now()".to_string()];
    if let Some(op) = &updates.token {
        params.push(&op.amount);
        sets.push(format!("token = token {} ${}", op.operation.sql_operator(), params.len()));
    }
    if let Some(op) = &updates.points {
        params.push(&op.amount);
        sets.push(format!("points = points {} ${}", op.operation.sql_operator(), params.len()));
    }

    let query = format!(
        r#"
        UPDATE wallets SET {}
        WHERE (cardinality($1::bigint[]) = 0 OR id = ANY($1))
          AND (cardinality($2::bigint[]) = 0 OR user_id = ANY($2))
        "#,
        sets.join(", ")
    );
    Ok(client.execute(query.as_str(), &params).await?)
}

async fn get_member(client: &Client, options: &MemberOptions) -> Result<Option<Member>, RepositoryError> {
    if options.user_ids.is_empty() {
        return Err(RepositoryError::MissingFilter("member"));
    }
    let query = r#"
        SELECT id, user_id, member_type, level, created_at, updated_at
        FROM members
        WHERE user_id = ANY($1)
        ORDER BY user_id
        LIMIT 1
    "#;
    let Some(row) = client.query_opt(query, &[&options.user_ids]).await? else {
        return Ok(None);
    };
    Ok(Some(Member {
        id: row.get("id"),
        user_id: row.get("user_id"),
        member_type: MemberType::try_from(row.get::<_, i16>("member_type"))?,
        level: row.get("level"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }))
}

async fn list_promotions(client: &Client, options: &PromotionOptions) -> Result<Vec<Promotion>, RepositoryError> {
    let query = r#"
        SELECT id, name, description, kind, payload, is_default, start_at, end_at, created_at, updated_at
        FROM promotions
        WHERE (cardinality($1::bigint[]) = 0 OR id = ANY($1))
          AND (cardinality($2::smallint[]) = 0 OR kind = ANY($2))
          AND ($3::timestamptz IS NULL
               OR (start_at <= $3 AND $3 < end_at)
               OR ($4 AND is_default))
        ORDER BY id
    "#;
    let kinds = options.kind_codes();
    let rows = client
        .query(query, &[&options.ids, &kinds, &options.active_at, &options.include_default])
        .await?;
    rows.iter().map(promotion_from_row).collect()
}

async fn create_promotion(client: &Client, promotion: &Promotion) -> Result<i64, RepositoryError> {
    let query = r#"
        INSERT INTO promotions (name, description, kind, payload, is_default, start_at, end_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
    "#;
    let payload = promotion.extension.payload()?;
    let row = client
        .query_one(query, &[
            &promotion.name,
            &promotion.description,
            &promotion.kind().code(),
            &payload,
            &promotion.is_default,
            &promotion.start_at,
            &promotion.end_at,
        ])
        .await?;
    Ok(row.get("id"))
}

async fn create_order(client: &Client, order: &Order) -> Result<(), RepositoryError> {
    let query = r#"
        INSERT INTO orders (id, user_id, original_price, final_price, used_points, promotion_ids, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    "#;
    client
        .execute(query, &[
            &order.id,
            &order.user_id,
            &order.original_price,
            &order.final_price,
            &order.used_points,
            &order.promotion_ids,
            &order.created_at,
            &order.updated_at,
        ])
        .await?;

    let query = r#"
        INSERT INTO order_items (order_id, product_id, name, unit_price, quantity)
        VALUES ($1, $2, $3, $4, $5)
    "#;
    for item in &order.items {
        client
            .execute(query, &[&order.id, &item.product_id, &item.name, &item.unit_price, &item.quantity])
            .await?;
    }
    Ok(())
}

async fn get_order(client: &Client, options: &OrderOptions) -> Result<Order, RepositoryError> {
    if options.ids.is_empty() && options.user_ids.is_empty() {
        return Err(RepositoryError::MissingFilter("order"));
    }
    let query = r#"
        SELECT id, user_id, original_price, final_price, used_points, promotion_ids, created_at, updated_at
        FROM orders
        WHERE (cardinality($1::text[]) = 0 OR id = ANY($1))
          AND (cardinality($2::bigint[]) = 0 OR user_id = ANY($2))
        ORDER BY id
        LIMIT 1
    "#;
    let Some(row) = client.query_opt(query, &[&options.ids, &options.user_ids]).await? else {
        return Err(RepositoryError::not_found("order", format!("{:?}", options.ids)));
    };
    let id: String = row.get("id");

    let query = r#"
        SELECT product_id, name, unit_price, quantity
        FROM order_items
        WHERE order_id = $1
        ORDER BY product_id
    "#;
    let items = client
        .query(query, &[&id])
        .await?
        .iter()
        .map(|item| OrderItem {
            order_id: id.clone(),
            product_id: item.get("product_id"),
            name: item.get("name"),
            unit_price: item.get("unit_price"),
            quantity: item.get("quantity"),
        })
        .collect();

    Ok(Order {
        id: id.clone(),
        user_id: row.get("user_id"),
        original_price: row.get("original_price"),
        final_price: row.get("final_price"),
        used_points: row.get("used_points"),
        promotion_ids: row.get("promotion_ids"),
        items,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
