/// Cart Settlement CLI
///
/// Entry point of the settlement service. Settles carts into orders against
/// PostgreSQL (or a seeded in-memory database with `--demo`), lists the
/// promotions in effect and shows persisted orders.
///
/// # Architecture
///
/// - Repository layer for data access and row locking
/// - Service layer for pricing, promotions and the order transaction
/// - Metrics for settlement outcomes
///
mod demo;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use model::Cart;
use repository::{Database, LockMode, PgDatabase, PromotionOptions};
use serde_json::json;
use service::{SettlementMetrics, SettlementOptions, SettlementService, SettlementServiceImpl};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use app_config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "cashier", version, about = "Settle shopping carts into orders")]
struct Cli {
    /// Run against a seeded in-memory database instead of PostgreSQL.
    #[arg(long, global = true)]
    demo: bool,

    /// Print settlement metrics to stderr when done.
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending SQL migrations.
    Migrate,
    /// Settle a cart for a user.
    Settle {
        #[arg(long)]
        user: i64,
        /// Points to redeem.
        #[arg(long, default_value_t = 0)]
        points: i32,
        /// Cart line as PRODUCT_ID=QUANTITY; repeat for more lines.
        #[arg(long = "item", value_parser = parse_item, required = true)]
        items: Vec<(i64, i32)>,
        /// Only price the cart, do not place the order.
        #[arg(long)]
        quote: bool,
    },
    /// List promotions in effect now.
    Promotions {
        /// List every stored promotion instead.
        #[arg(long)]
        all: bool,
    },
    /// Show a persisted order.
    Order { id: String },
}

fn parse_item(raw: &str) -> Result<(i64, i32), String> {
    let (id, quantity) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected PRODUCT_ID=QUANTITY, got '{raw}'"))?;
    let id = id.trim().parse().map_err(|e| format!("invalid product id '{id}': {e}"))?;
    let quantity = quantity
        .trim()
        .parse()
        .map_err(|e| format!("invalid quantity '{quantity}': {e}"))?;
    Ok((id, quantity))
}

/// Merges repeated `--item` lines for the same product.
fn build_cart(items: Vec<(i64, i32)>) -> Result<Cart> {
    let mut cart = Cart::new();
    for (product_id, quantity) in items {
        let line = cart.entry(product_id).or_default();
        *line = line
            .checked_add(quantity)
            .with_context(|| format!("quantity of product {product_id} is too large"))?;
    }
    Ok(cart)
}

/// Initialize the tracing subscriber for logging. Logs go to stderr so that
/// command output on stdout stays machine-readable.
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let cli = Cli::parse();

    let config = AppConfig::load().context("Failed to load configuration")?;

    // Ctrl-C cancels a settlement that has not started committing; its
    // transaction rolls back.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                on_signal.cancel();
            }
            Err(err) => error!("Failed to listen for shutdown signal: {}", err),
        }
    });

    let options = SettlementOptions {
        lock_mode: if config.lock_no_wait {
            LockMode::ExclusiveNoWait
        } else {
            LockMode::Exclusive
        },
        timeout: config.settle_timeout(),
    };
    let metrics = SettlementMetrics::new().context("Failed to register metrics")?;

    if cli.demo {
        if matches!(cli.command, Command::Migrate) {
            bail!("migrate needs a PostgreSQL database, drop --demo");
        }
        let db = demo::seed().await?;
        let service = SettlementServiceImpl::new(db, options, metrics);
        return run(&service, cli.command, &cancel, cli.metrics).await;
    }

    let pool = db::init_db_pool(&config)?;
    if matches!(cli.command, Command::Migrate) {
        let mut client = pool
            .get()
            .await
            .context("Failed to get DB connection for migrations")?;
        let applied = db::run_migrations(&mut client, &config.migrations_dir).await?;
        info!(applied, "Migrations complete");
        return Ok(());
    }

    let service = SettlementServiceImpl::new(PgDatabase::new(pool), options, metrics);
    run(&service, cli.command, &cancel, cli.metrics).await
}

async fn run<D: Database>(
    service: &SettlementServiceImpl<D>,
    command: Command,
    cancel: &CancellationToken,
    print_metrics: bool,
) -> Result<()> {
    let outcome = execute(service, command, cancel).await;
    if print_metrics {
        eprintln!("{}", service.metrics().gather().context("Failed to encode metrics")?);
    }
    outcome
}

async fn execute<S: SettlementService>(service: &S, command: Command, cancel: &CancellationToken) -> Result<()> {
    match command {
        Command::Migrate => bail!("migrate is handled before the service starts"),
        Command::Settle {
            user,
            points,
            items,
            quote,
        } => {
            let cart = build_cart(items)?;

            if quote {
                let quote = service.quote_order(user, points, &cart).await?;
                print_json(&json!({
                    "original_price": quote.settlement.original_price,
                    "final_price": quote.discount.final_price,
                    "promotion_ids": quote.discount.promotion_ids,
                }))
            } else {
                let order_id = service.create_order(cancel, user, points, cart).await?;
                print_json(&service.get_order(&order_id).await?)
            }
        }
        Command::Promotions { all } => {
            let promotions = if all {
                service.list_promotions(&PromotionOptions::default()).await?
            } else {
                service.current_promotions(Utc::now()).await?
            };
            print_json(&promotions)
        }
        Command::Order { id } => print_json(&service.get_order(&id).await?),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cart_lines_parse() {
        assert_eq!(parse_item("12=3"), Ok((12, 3)));
        assert_eq!(parse_item(" 7 = 1 "), Ok((7, 1)));
        assert!(parse_item("12").is_err());
        assert!(parse_item("x=1").is_err());
    }

    #[test]
    fn repeated_lines_are_merged_without_overflow() {
        let cart = build_cart(vec![(1, 2), (2, 1), (1, 3)]).unwrap();
        assert_eq!(cart, Cart::from([(1, 5), (2, 1)]));

        let err = build_cart(vec![(1, i32::MAX), (1, 1)]).unwrap_err();
        assert!(err.to_string().contains("product 1"));
    }

    #[test]
    fn cli_accepts_repeated_items() {
        let cli = Cli::try_parse_from([
            "cashier", "--demo", "settle", "--user", "1", "--item", "1=2", "--item", "2=1",
        ])
        .unwrap();
        assert!(cli.demo);
        match cli.command {
            Command::Settle { user, items, points, quote } => {
                assert_eq!(user, 1);
                assert_eq!(points, 0);
                assert!(!quote);
                assert_eq!(items, vec![(1, 2), (2, 1)]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn demo_settlement_applies_seeded_promotions() {
        let db = demo::seed().await.unwrap();
        let service = SettlementServiceImpl::new(
            db,
            SettlementOptions::default(),
            SettlementMetrics::new().unwrap(),
        );
        let cart = Cart::from([(1, 2)]);

        // 100 * 0.92 = 92, - 10 * 0.1 = 91, - 5 = 86
        let quote = service.quote_order(1, 10, &cart).await.unwrap();
        assert_eq!(quote.discount.final_price, rust_decimal_macros::dec!(86));
        assert_eq!(quote.discount.promotion_ids.len(), 3);

        let order_id = service
            .create_order(&CancellationToken::new(), 1, 10, cart)
            .await
            .unwrap();
        let order = service.get_order(&order_id).await.unwrap();
        assert_eq!(order.final_price, rust_decimal_macros::dec!(86));
    }
}
