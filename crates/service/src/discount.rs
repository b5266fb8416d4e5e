use model::{Decimal, PriceInput};
use tracing::debug;

use crate::ResolvedPromotions;

/// Result of running the resolved promotions over a price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscountOutcome {
    /// Not clamped; a negative value is rejected by the order transaction.
    pub final_price: Decimal,
    /// Promotions whose pricing function applied, in evaluation order.
    pub promotion_ids: Vec<i64>,
}

/// Applies the resolved promotions one after another, each step pricing the
/// output of the previous one.
pub fn apply_promotions(original: Decimal, resolved: &ResolvedPromotions, input: &PriceInput) -> DiscountOutcome {
    let mut price = original;
    let mut promotion_ids = Vec::with_capacity(resolved.len());

    for promotion in resolved.iter() {
        match promotion.extension.calculate_price(price, input) {
            Some(after) => {
                debug!(
                    promotion_id = promotion.id,
                    kind = ?promotion.kind(),
                    before = %price,
                    after = %after,
                    "Promotion applied"
                );
                price = after;
                promotion_ids.push(promotion.id);
            }
            None => debug!(promotion_id = promotion.id, kind = ?promotion.kind(), "Promotion not applicable"),
        }
    }

    DiscountOutcome {
        final_price: price,
        promotion_ids,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{Duration, Utc};
    use model::{
        Discount, ExtraDiscount, ExtraRequirement, Member, MemberDiscount, MemberType,
        PointsRedemption, Promotion, PromotionExtension,
    };
    use rust_decimal_macros::dec;

    use super::*;
    use crate::resolve_promotions;

    fn active(id: i64, extension: PromotionExtension) -> Promotion {
        let now = Utc::now();
        Promotion {
            id,
            name: format!("promotion {id}"),
            description: String::new(),
            extension,
            is_default: false,
            start_at: now - Duration::hours(1),
            end_at: now + Duration::hours(1),
            created_at: now,
            updated_at: now,
        }
    }

    fn vip(level: i16) -> Member {
        let now = Utc::now();
        Member {
            id: 1,
            user_id: 1,
            member_type: MemberType::Vip,
            level,
            created_at: now,
            updated_at: now,
        }
    }

    fn vip_ratios() -> PromotionExtension {
        PromotionExtension::Member(MemberDiscount {
            ratios: HashMap::from([(MemberType::Vip, HashMap::from([(2, dec!(0.92))]))]),
        })
    }

    #[test]
    fn no_promotions_keep_the_price() {
        let outcome = apply_promotions(dec!(100), &ResolvedPromotions::default(), &PriceInput::default());
        assert_eq!(outcome.final_price, dec!(100));
        assert!(outcome.promotion_ids.is_empty());
    }

    #[test]
    fn steps_compose_in_fixed_order() {
        let resolved = resolve_promotions(
            vec![
                active(3, PromotionExtension::ExtraDiscount(ExtraDiscount {
                    requirement: ExtraRequirement::default(),
                    discount: Discount::Amount(dec!(2)),
                })),
                active(2, PromotionExtension::Points(PointsRedemption { ratio: dec!(1.1) })),
                active(1, vip_ratios()),
            ],
            Utc::now(),
        );
        let input = PriceInput {
            member: Some(vip(2)),
            used_points: 5,
        };

        let outcome = apply_promotions(dec!(100), &resolved, &input);
        // 100 * 0.92 = 92, - 5 * 1.1 = 86.5, - 2 = 84.5
        assert_eq!(outcome.final_price, dec!(84.5));
        assert_eq!(outcome.promotion_ids, vec![1, 2, 3]);
    }

    #[test]
    fn skipped_steps_are_not_recorded() {
        let resolved = resolve_promotions(
            vec![
                active(1, vip_ratios()),
                active(2, PromotionExtension::Points(PointsRedemption { ratio: dec!(1.1) })),
            ],
            Utc::now(),
        );
        let input = PriceInput {
            member: Some(vip(1)),
            used_points: 0,
        };

        let outcome = apply_promotions(dec!(100), &resolved, &input);
        assert_eq!(outcome.final_price, dec!(100));
        assert!(outcome.promotion_ids.is_empty());
    }

    #[test]
    fn results_are_deterministic() {
        let resolved = resolve_promotions(
            vec![active(2, PromotionExtension::Points(PointsRedemption { ratio: dec!(0.01) }))],
            Utc::now(),
        );
        let input = PriceInput {
            member: None,
            used_points: 333,
        };
        let first = apply_promotions(dec!(10.10), &resolved, &input);
        for _ in 0..100 {
            assert_eq!(apply_promotions(dec!(10.10), &resolved, &input), first);
        }
        assert_eq!(first.final_price, dec!(6.77));
    }

    #[test]
    fn final_price_is_not_clamped() {
        let resolved = resolve_promotions(
            vec![active(2, PromotionExtension::Points(PointsRedemption { ratio: dec!(10) }))],
            Utc::now(),
        );
        let input = PriceInput {
            member: None,
            used_points: 20,
        };
        assert_eq!(apply_promotions(dec!(50), &resolved, &input).final_price, dec!(-150));
    }
}
