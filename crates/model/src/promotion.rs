use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Member, MemberType, ModelError};

/// Promotion category.
///
/// The derived ordering equals [`PromotionKind::ALL`], the order in which
/// promotions are evaluated against an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionKind {
    /// Member-tier multiplier.
    Member,
    /// Points redeemed for currency.
    Points,
    /// Extra discount for eligible buyers.
    ExtraDiscount,
}

impl PromotionKind {
    /// Fixed evaluation order. Each step consumes the previous step's price.
    pub const ALL: [PromotionKind; 3] = [
        PromotionKind::Member,
        PromotionKind::Points,
        PromotionKind::ExtraDiscount,
    ];

    pub fn code(self) -> i16 {
        match self {
            PromotionKind::Member => 1,
            PromotionKind::Points => 2,
            PromotionKind::ExtraDiscount => 3,
        }
    }
}

impl TryFrom<i16> for PromotionKind {
    type Error = ModelError;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(PromotionKind::Member),
            2 => Ok(PromotionKind::Points),
            3 => Ok(PromotionKind::ExtraDiscount),
            _ => Err(ModelError::UnknownCode {
                kind: "promotion kind",
                code,
            }),
        }
    }
}

/// Buyer-specific inputs to the pricing functions.
#[derive(Debug, Clone, Default)]
pub struct PriceInput {
    /// `None` for users without membership.
    pub member: Option<Member>,
    /// Points the buyer asked to redeem.
    pub used_points: i32,
}

/// Promotion — a pricing rule with an activity window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Promotion {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub extension: PromotionExtension,
    /// Fallback for its category when no time-bound promotion is running.
    pub is_default: bool,
    /// Inclusive start of the active window.
    pub start_at: DateTime<Utc>,
    /// Exclusive end of the active window.
    pub end_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Promotion {
    pub fn kind(&self) -> PromotionKind {
        self.extension.kind()
    }

    /// `start_at <= now < end_at`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.start_at <= now && now < self.end_at
    }

    /// Checks the window and the payload rules.
    pub fn validate(&self) -> Result<(), ModelError> {
        if !self.is_default && self.start_at >= self.end_at {
            return Err(ModelError::InvalidPromotion(format!(
                "promotion window is empty: {} >= {}",
                self.start_at, self.end_at
            )));
        }
        self.extension.validate()
    }
}

/// Category-specific parameters of a promotion.
///
/// The variant is the discriminant: it decides which schema the stored
/// payload is decoded with and which pricing function runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum PromotionExtension {
    Member(MemberDiscount),
    Points(PointsRedemption),
    ExtraDiscount(ExtraDiscount),
}

impl PromotionExtension {
    pub fn kind(&self) -> PromotionKind {
        match self {
            PromotionExtension::Member(_) => PromotionKind::Member,
            PromotionExtension::Points(_) => PromotionKind::Points,
            PromotionExtension::ExtraDiscount(_) => PromotionKind::ExtraDiscount,
        }
    }

    /// Decodes a stored payload with the schema selected by `kind`.
    pub fn decode(kind: PromotionKind, payload: serde_json::Value) -> Result<Self, ModelError> {
        Ok(match kind {
            PromotionKind::Member => PromotionExtension::Member(serde_json::from_value(payload)?),
            PromotionKind::Points => PromotionExtension::Points(serde_json::from_value(payload)?),
            PromotionKind::ExtraDiscount => {
                PromotionExtension::ExtraDiscount(serde_json::from_value(payload)?)
            }
        })
    }

    /// Encodes the variant's parameters without the discriminant.
    pub fn payload(&self) -> Result<serde_json::Value, ModelError> {
        Ok(match self {
            PromotionExtension::Member(ext) => serde_json::to_value(ext)?,
            PromotionExtension::Points(ext) => serde_json::to_value(ext)?,
            PromotionExtension::ExtraDiscount(ext) => serde_json::to_value(ext)?,
        })
    }

    /// Price after this promotion, or `None` if it does not apply.
    pub fn calculate_price(&self, before: Decimal, input: &PriceInput) -> Option<Decimal> {
        match self {
            PromotionExtension::Member(ext) => ext.calculate_price(before, input),
            PromotionExtension::Points(ext) => ext.calculate_price(before, input),
            PromotionExtension::ExtraDiscount(ext) => ext.calculate_price(before, input),
        }
    }

    /// Rejects parameters that could raise a price.
    pub fn validate(&self) -> Result<(), ModelError> {
        match self {
            PromotionExtension::Member(ext) => ext.validate(),
            PromotionExtension::Points(ext) => ext.validate(),
            PromotionExtension::ExtraDiscount(ext) => ext.validate(),
        }
    }
}

fn check_ratio(what: &str, ratio: Decimal) -> Result<(), ModelError> {
    if ratio < Decimal::ZERO || ratio > Decimal::ONE {
        return Err(ModelError::InvalidPromotion(format!(
            "{what} must be within [0, 1], got {ratio}"
        )));
    }
    Ok(())
}

/// Multiplier per (member type, level).
///
/// ```text
/// vip 1 -> 0.95
/// vip 2 -> 0.92
/// pro 1 -> 0.80
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemberDiscount {
    pub ratios: HashMap<MemberType, HashMap<i16, Decimal>>,
}

impl MemberDiscount {
    fn calculate_price(&self, before: Decimal, input: &PriceInput) -> Option<Decimal> {
        let member = input.member.as_ref()?;
        let ratio = self.ratios.get(&member.member_type)?.get(&member.level)?;
        Some(before * ratio)
    }

    fn validate(&self) -> Result<(), ModelError> {
        for (member_type, levels) in &self.ratios {
            for (level, ratio) in levels {
                check_ratio(&format!("{member_type:?} level {level} ratio"), *ratio)?;
            }
        }
        Ok(())
    }
}

/// Conversion of redeemed points into currency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PointsRedemption {
    /// Currency credited per point.
    pub ratio: Decimal,
}

impl PointsRedemption {
    /// Does not check the buyer's points balance; that happens under the
    /// wallet lock during settlement.
    fn calculate_price(&self, before: Decimal, input: &PriceInput) -> Option<Decimal> {
        if input.used_points <= 0 {
            return None;
        }
        Some(before - self.ratio * Decimal::from(input.used_points))
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.ratio < Decimal::ZERO {
            return Err(ModelError::InvalidPromotion(format!(
                "points ratio must not be negative, got {}",
                self.ratio
            )));
        }
        Ok(())
    }
}

/// Discount granted to buyers meeting a requirement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtraDiscount {
    #[serde(default)]
    pub requirement: ExtraRequirement,
    pub discount: Discount,
}

/// Eligibility for an [`ExtraDiscount`]. Every configured condition must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtraRequirement {
    /// Allowed levels per member type; `None` means membership is not required.
    #[serde(default)]
    pub member_levels: Option<HashMap<MemberType, Vec<i16>>>,
    /// Minimum points the buyer must redeem; `0` means no requirement.
    #[serde(default)]
    pub points: i32,
}

/// How an extra discount changes the price.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Discount {
    /// Multiply by the rate (0.9 = 10% off).
    Rate(Decimal),
    /// Subtract a flat amount.
    Amount(Decimal),
}

impl ExtraDiscount {
    fn is_eligible(&self, input: &PriceInput) -> bool {
        if let Some(member_levels) = &self.requirement.member_levels {
            let Some(member) = &input.member else {
                return false;
            };
            let allowed = member_levels
                .get(&member.member_type)
                .is_some_and(|levels| levels.contains(&member.level));
            if !allowed {
                return false;
            }
        }
        if self.requirement.points > 0 && input.used_points < self.requirement.points {
            return false;
        }
        true
    }

    fn calculate_price(&self, before: Decimal, input: &PriceInput) -> Option<Decimal> {
        if !self.is_eligible(input) {
            return None;
        }
        Some(match self.discount {
            Discount::Rate(rate) => before * rate,
            Discount::Amount(amount) => before - amount,
        })
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.requirement.points < 0 {
            return Err(ModelError::InvalidPromotion(format!(
                "points requirement must not be negative, got {}",
                self.requirement.points
            )));
        }
        match self.discount {
            Discount::Rate(rate) => check_ratio("discount rate", rate),
            Discount::Amount(amount) if amount < Decimal::ZERO => Err(
                ModelError::InvalidPromotion(format!("discount amount must not be negative, got {amount}")),
            ),
            Discount::Amount(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn member(member_type: MemberType, level: i16) -> Member {
        let now = Utc::now();
        Member {
            id: 1,
            user_id: 1,
            member_type,
            level,
            created_at: now,
            updated_at: now,
        }
    }

    fn vip_discount() -> PromotionExtension {
        let mut vip = HashMap::new();
        vip.insert(1, dec!(0.95));
        vip.insert(2, dec!(0.92));
        let mut ratios = HashMap::new();
        ratios.insert(MemberType::Vip, vip);
        PromotionExtension::Member(MemberDiscount { ratios })
    }

    #[test]
    fn member_discount_uses_tier_and_level() {
        let ext = vip_discount();
        let input = PriceInput {
            member: Some(member(MemberType::Vip, 2)),
            used_points: 0,
        };
        assert_eq!(ext.calculate_price(dec!(100), &input), Some(dec!(92.00)));
    }

    #[test]
    fn member_discount_skips_unknown_level_and_non_members() {
        let ext = vip_discount();
        let unknown_level = PriceInput {
            member: Some(member(MemberType::Vip, 9)),
            used_points: 0,
        };
        let other_tier = PriceInput {
            member: Some(member(MemberType::Pro, 1)),
            used_points: 0,
        };
        assert_eq!(ext.calculate_price(dec!(100), &unknown_level), None);
        assert_eq!(ext.calculate_price(dec!(100), &other_tier), None);
        assert_eq!(ext.calculate_price(dec!(100), &PriceInput::default()), None);
    }

    #[test]
    fn points_redemption_subtracts_ratio_times_points() {
        let ext = PromotionExtension::Points(PointsRedemption { ratio: dec!(1.1) });
        let input = PriceInput {
            member: None,
            used_points: 5,
        };
        assert_eq!(ext.calculate_price(dec!(100), &input), Some(dec!(94.5)));
        assert_eq!(ext.calculate_price(dec!(100), &PriceInput::default()), None);
    }

    #[test]
    fn extra_discount_checks_member_levels() {
        let mut levels = HashMap::new();
        levels.insert(MemberType::Pro, vec![3, 1, 2]);
        let ext = PromotionExtension::ExtraDiscount(ExtraDiscount {
            requirement: ExtraRequirement {
                member_levels: Some(levels),
                points: 0,
            },
            discount: Discount::Amount(dec!(10)),
        });

        let pro_two = PriceInput {
            member: Some(member(MemberType::Pro, 2)),
            used_points: 0,
        };
        let pro_four = PriceInput {
            member: Some(member(MemberType::Pro, 4)),
            used_points: 0,
        };
        assert_eq!(ext.calculate_price(dec!(50), &pro_two), Some(dec!(40)));
        assert_eq!(ext.calculate_price(dec!(50), &pro_four), None);
        assert_eq!(ext.calculate_price(dec!(50), &PriceInput::default()), None);
    }

    #[test]
    fn extra_discount_checks_minimum_points() {
        let ext = PromotionExtension::ExtraDiscount(ExtraDiscount {
            requirement: ExtraRequirement {
                member_levels: None,
                points: 10,
            },
            discount: Discount::Rate(dec!(0.9)),
        });
        let few = PriceInput {
            member: None,
            used_points: 9,
        };
        let enough = PriceInput {
            member: None,
            used_points: 10,
        };
        assert_eq!(ext.calculate_price(dec!(200), &few), None);
        assert_eq!(ext.calculate_price(dec!(200), &enough), Some(dec!(180.0)));
    }

    #[test]
    fn payload_is_decoded_by_discriminant() {
        let payload = serde_json::json!({ "ratios": { "vip": { "2": "0.92" } } });
        let ext = PromotionExtension::decode(PromotionKind::Member, payload.clone()).unwrap();
        assert_eq!(ext.kind(), PromotionKind::Member);
        assert_eq!(ext.payload().unwrap(), payload);

        let err = PromotionExtension::decode(PromotionKind::Points, payload).unwrap_err();
        assert!(matches!(err, ModelError::Payload(_)));
    }

    #[test]
    fn validation_rejects_price_raising_parameters() {
        let raising = PromotionExtension::ExtraDiscount(ExtraDiscount {
            requirement: ExtraRequirement::default(),
            discount: Discount::Rate(dec!(1.2)),
        });
        assert!(raising.validate().is_err());

        let negative = PromotionExtension::Points(PointsRedemption { ratio: dec!(-1) });
        assert!(negative.validate().is_err());

        assert!(vip_discount().validate().is_ok());
    }

    #[test]
    fn kind_order_matches_evaluation_order() {
        let mut kinds = PromotionKind::ALL.to_vec();
        kinds.sort();
        assert_eq!(kinds, PromotionKind::ALL.to_vec());
    }
}
