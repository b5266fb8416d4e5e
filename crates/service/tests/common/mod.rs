#![allow(dead_code)]

use std::collections::HashMap;

use chrono::{Duration, Utc};
use model::{
    Cart, Decimal, MemberDiscount, MemberType, PointsRedemption, Promotion, PromotionExtension, Wallet,
};
use repository::{InventoryOptions, MemoryDatabase, Repository, WalletOptions};
use service::{SettlementMetrics, SettlementOptions, SettlementServiceImpl};

pub type Service = SettlementServiceImpl<MemoryDatabase>;

pub fn settlement_service(db: &MemoryDatabase) -> Service {
    settlement_service_with(db, SettlementOptions::default())
}

pub fn settlement_service_with(db: &MemoryDatabase, options: SettlementOptions) -> Service {
    SettlementServiceImpl::new(db.clone(), options, SettlementMetrics::new().unwrap())
}

pub fn cart(lines: &[(i64, i32)]) -> Cart {
    lines.iter().copied().collect()
}

/// A running promotion, or a default one whose own window lies in the past.
pub fn promotion(extension: PromotionExtension, is_default: bool) -> Promotion {
    let now = Utc::now();
    let (start_at, end_at) = if is_default {
        (now - Duration::days(30), now - Duration::days(29))
    } else {
        (now - Duration::hours(1), now + Duration::hours(1))
    };
    Promotion {
        id: 0,
        name: if is_default { "default".into() } else { "campaign".into() },
        description: String::new(),
        extension,
        is_default,
        start_at,
        end_at,
        created_at: now,
        updated_at: now,
    }
}

pub fn vip_discount(level: i16, ratio: Decimal) -> PromotionExtension {
    PromotionExtension::Member(MemberDiscount {
        ratios: HashMap::from([(MemberType::Vip, HashMap::from([(level, ratio)]))]),
    })
}

pub fn points_redemption(ratio: Decimal) -> PromotionExtension {
    PromotionExtension::Points(PointsRedemption { ratio })
}

pub async fn available(db: &MemoryDatabase, product_id: i64) -> i32 {
    db.list_inventories(&InventoryOptions::by_product_ids([product_id]))
        .await
        .unwrap()[0]
        .available_quantity
}

pub async fn wallet(db: &MemoryDatabase, user_id: i64) -> Wallet {
    db.get_wallet(&WalletOptions::by_user(user_id)).await.unwrap()
}
