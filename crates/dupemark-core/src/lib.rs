//! Core domain model for dupemark: listings, canonical pairs, match types.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dupemark-core";

/// Immutable snapshot of one crawled marketplace posting.
///
/// Created by ingestion; the detection core only ever reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Platform-assigned item number, unique within the store.
    pub item_id: String,
    pub seller_id: String,
    pub seller_name: String,
    pub title: String,
    pub description: String,
    pub category: String,
    /// Opaque display string exactly as shown on the platform ("RM 1,200").
    pub price: String,
    /// Photo URLs in listing order; may be empty.
    pub image_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Canonical unordered pair of item ids.
///
/// The two ids are stored in lexicographic order so each unordered pair has
/// exactly one representation; `new` rejects self-pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    #[serde(rename = "item_id_1")]
    low: String,
    #[serde(rename = "item_id_2")]
    high: String,
}

impl PairKey {
    pub fn new(a: &str, b: &str) -> Option<Self> {
        match a.cmp(b) {
            Ordering::Less => Some(Self {
                low: a.to_string(),
                high: b.to_string(),
            }),
            Ordering::Greater => Some(Self {
                low: b.to_string(),
                high: a.to_string(),
            }),
            Ordering::Equal => None,
        }
    }

    pub fn first(&self) -> &str {
        &self.low
    }

    pub fn second(&self) -> &str {
        &self.high
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.low, self.high)
    }
}

/// Which signal drove a match decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchReason {
    /// Category similarity also cleared the 50% bar.
    #[serde(rename = "category_sim>50")]
    CategorySim,
    /// Title or description similarity alone cleared the bar.
    #[serde(rename = "title_desc_sim>50")]
    TitleDescSim,
    /// Only the visual signal cleared its threshold.
    #[serde(rename = "image_sim")]
    ImageSim,
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            MatchReason::CategorySim => "category_sim>50",
            MatchReason::TitleDescSim => "title_desc_sim>50",
            MatchReason::ImageSim => "image_sim",
        };
        f.write_str(tag)
    }
}

impl FromStr for MatchReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Older rows may carry a stray space before the comparison.
        match s.trim().replace(' ', "").as_str() {
            "category_sim>50" => Ok(MatchReason::CategorySim),
            "title_desc_sim>50" => Ok(MatchReason::TitleDescSim),
            "image_sim" => Ok(MatchReason::ImageSim),
            other => Err(format!("unknown match reason tag: {other}")),
        }
    }
}

/// A computed, not-yet-persisted duplicate hypothesis for one pair.
///
/// Similarity fields are percentages in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    #[serde(flatten)]
    pub pair: PairKey,
    pub reason: MatchReason,
    pub details_highest_sim: f64,
    pub images_highest_sim: Option<f64>,
}

/// Persisted, score-accumulating record for one canonical pair.
///
/// `details_highest_sim` and `images_highest_sim` only ever move upward
/// across runs; `is_verified` is owned by downstream moderation and is never
/// set true by the detection core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePairRecord {
    #[serde(flatten)]
    pub pair: PairKey,
    pub reason: MatchReason,
    pub details_highest_sim: f64,
    pub images_highest_sim: Option<f64>,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
}

/// A connected component of accepted pairs: listings believed to represent
/// the same real-world item. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub members: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_canonical() {
        let forward = PairKey::new("itm-2", "itm-10").expect("distinct ids");
        let reverse = PairKey::new("itm-10", "itm-2").expect("distinct ids");
        assert_eq!(forward, reverse);
        assert_eq!(forward.first(), "itm-10");
        assert_eq!(forward.second(), "itm-2");
    }

    #[test]
    fn pair_key_rejects_self_pair() {
        assert!(PairKey::new("itm-7", "itm-7").is_none());
    }

    #[test]
    fn reason_tags_round_trip() {
        for reason in [
            MatchReason::CategorySim,
            MatchReason::TitleDescSim,
            MatchReason::ImageSim,
        ] {
            let tag = reason.to_string();
            assert_eq!(tag.parse::<MatchReason>().expect("known tag"), reason);
        }
    }

    #[test]
    fn reason_parse_tolerates_legacy_spacing() {
        assert_eq!(
            "title_desc_sim >50".parse::<MatchReason>().expect("legacy tag"),
            MatchReason::TitleDescSim
        );
        assert!("images_sim>90".parse::<MatchReason>().is_err());
    }

    #[test]
    fn pair_key_serializes_with_item_id_columns() {
        let pair = PairKey::new("a", "b").expect("distinct ids");
        let json = serde_json::to_value(&pair).expect("serialize");
        assert_eq!(json["item_id_1"], "a");
        assert_eq!(json["item_id_2"], "b");
    }
}
