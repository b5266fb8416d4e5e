//! Seed data for `--demo` runs against the in-memory database.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use model::{
    Discount, ExtraDiscount, ExtraRequirement, MemberDiscount, MemberType, PointsRedemption,
    ProductStatus, Promotion, PromotionExtension,
};
use repository::{MemoryDatabase, Repository};
use rust_decimal_macros::dec;
use tracing::info;

/// Builds a small catalogue:
///
/// - three products, the filter papers being off sale
/// - user 1: VIP level 2, 1000 token, 20 points
/// - user 2: no membership, 30 token
/// - a default member discount, a running points campaign and an extra
///   discount for buyers redeeming at least 10 points
pub async fn seed() -> Result<MemoryDatabase> {
    let db = MemoryDatabase::new();

    let beans = db.add_product("Espresso beans 1kg", ProductStatus::On, dec!(50), 10);
    let grinder = db.add_product("Burr grinder", ProductStatus::On, dec!(120), 2);
    let papers = db.add_product("Filter papers", ProductStatus::Down, dec!(4.5), 100);

    db.add_wallet(1, dec!(1000), 20);
    db.add_member(1, MemberType::Vip, 2);
    db.add_wallet(2, dec!(30), 0);

    let now = Utc::now();
    let promotions = [
        promotion(
            "Member pricing",
            PromotionExtension::Member(MemberDiscount {
                ratios: HashMap::from([
                    (MemberType::Vip, HashMap::from([(1, dec!(0.95)), (2, dec!(0.92))])),
                    (MemberType::Pro, HashMap::from([(1, dec!(0.90))])),
                ]),
            }),
            true,
        ),
        promotion(
            "Points week",
            PromotionExtension::Points(PointsRedemption { ratio: dec!(0.1) }),
            false,
        ),
        promotion(
            "Big redeemer bonus",
            PromotionExtension::ExtraDiscount(ExtraDiscount {
                requirement: ExtraRequirement {
                    member_levels: None,
                    points: 10,
                },
                discount: Discount::Amount(dec!(5)),
            }),
            false,
        ),
    ];
    for mut promotion in promotions {
        promotion.start_at = now - Duration::days(1);
        promotion.end_at = now + Duration::days(6);
        db.create_promotion(&promotion)
            .await
            .with_context(|| format!("Failed to seed promotion {}", promotion.name))?;
    }

    info!(beans, grinder, papers, "Demo catalogue seeded");
    Ok(db)
}

fn promotion(name: &str, extension: PromotionExtension, is_default: bool) -> Promotion {
    let now = Utc::now();
    Promotion {
        id: 0,
        name: name.to_string(),
        description: String::new(),
        extension,
        is_default,
        start_at: now,
        end_at: now,
        created_at: now,
        updated_at: now,
    }
}
