//! Promotion selection: at most one promotion per kind.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use model::{Promotion, PromotionKind};
use tracing::{debug, warn};

/// Promotions selected for one settlement, keyed by kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedPromotions {
    slots: BTreeMap<PromotionKind, Promotion>,
}

impl ResolvedPromotions {
    pub fn get(&self, kind: PromotionKind) -> Option<&Promotion> {
        self.slots.get(&kind)
    }

    /// Selected promotions in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = &Promotion> {
        PromotionKind::ALL
            .into_iter()
            .filter_map(move |kind| self.slots.get(&kind))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Picks, for each kind in [`PromotionKind::ALL`], the promotion running at
/// `now`, falling back to the default one.
///
/// Expired non-default promotions are ignored, and so are promotions whose
/// payload fails validation, since those could raise the price. When the data
/// holds two candidates for the same slot the lowest id is kept.
pub fn resolve_promotions(mut promotions: Vec<Promotion>, now: DateTime<Utc>) -> ResolvedPromotions {
    promotions.sort_by_key(|p| p.id);

    let mut processing = BTreeMap::new();
    let mut defaults = BTreeMap::new();
    for promotion in promotions {
        if let Err(err) = promotion.extension.validate() {
            warn!(promotion_id = promotion.id, error = %err, "Skipping invalid promotion");
            continue;
        }
        if promotion.is_default {
            keep_first(&mut defaults, promotion, "default");
        } else if promotion.is_active_at(now) {
            keep_first(&mut processing, promotion, "processing");
        }
    }

    let mut slots = BTreeMap::new();
    for kind in PromotionKind::ALL {
        let selected = processing.remove(&kind).or_else(|| defaults.remove(&kind));
        if let Some(promotion) = selected {
            debug!(kind = ?kind, promotion_id = promotion.id, is_default = promotion.is_default, "Promotion selected");
            slots.insert(kind, promotion);
        }
    }
    ResolvedPromotions { slots }
}

fn keep_first(slots: &mut BTreeMap<PromotionKind, Promotion>, promotion: Promotion, group: &str) {
    let kind = promotion.kind();
    match slots.get(&kind) {
        Some(kept) => warn!(
            kind = ?kind,
            group,
            kept = kept.id,
            ignored = promotion.id,
            "Several promotions compete for one slot"
        ),
        None => {
            slots.insert(kind, promotion);
        }
    }
}
