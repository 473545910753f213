//! Trust scoring for discovered providers.
//!
//! Signals and their points:
//! - best provenance tier: up to 30
//! - each additional source reporting the server: +10
//! - stars: 20 / 15 / 10 / 5 at 10000 / 1000 / 100 / 1
//! - passed security scan: +5
//! - documentation present: +5
//!
//! The total is clamped to 100. Every signal is monotone in the inputs, so
//! adding an observation never lowers a score.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::types::ProvenanceTag;

pub const MAX_TRUST_SCORE: u32 = 100;

const MULTI_SOURCE_BONUS: u32 = 10;
const SECURITY_SCAN_BONUS: u32 = 5;
const DOCUMENTATION_BONUS: u32 = 5;

/// (min stars, points), highest first.
const STARS_THRESHOLDS: [(u64, u32); 4] = [(10_000, 20), (1_000, 15), (100, 10), (1, 5)];

/// (min score, level), highest first.
const TRUST_LEVEL_THRESHOLDS: [(u32, TrustLevel); 3] = [
    (80, TrustLevel::Official),
    (60, TrustLevel::Verified),
    (40, TrustLevel::Community),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Official,
    Verified,
    Community,
    Unknown,
}

impl TrustLevel {
    pub fn for_score(score: u32) -> Self {
        TRUST_LEVEL_THRESHOLDS
            .iter()
            .find(|(min, _)| score >= *min)
            .map(|(_, level)| *level)
            .unwrap_or(TrustLevel::Unknown)
    }
}

/// Points awarded per signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustBreakdown {
    pub source_base: u32,
    pub multi_source_bonus: u32,
    pub stars: u32,
    pub security_scan: u32,
    pub documentation: u32,
}

impl TrustBreakdown {
    /// `provenance` sets the tier base; `source_count` is the number of
    /// distinct sources that reported the server, whatever their tier.
    pub fn compute(
        provenance: &BTreeSet<ProvenanceTag>,
        source_count: usize,
        stars: Option<u64>,
        security_scan: Option<bool>,
        has_documentation: bool,
    ) -> Self {
        let sources = source_count.max(provenance.len());
        let extra_sources = u32::try_from(sources.saturating_sub(1)).unwrap_or(u32::MAX);
        Self {
            source_base: provenance.iter().map(|s| s.weight()).max().unwrap_or(0),
            multi_source_bonus: extra_sources.saturating_mul(MULTI_SOURCE_BONUS),
            stars: stars_points(stars),
            security_scan: if security_scan == Some(true) {
                SECURITY_SCAN_BONUS
            } else {
                0
            },
            documentation: if has_documentation {
                DOCUMENTATION_BONUS
            } else {
                0
            },
        }
    }

    /// Sum of all signals, clamped to 100.
    pub fn score(&self) -> u32 {
        self.source_base
            .saturating_add(self.multi_source_bonus)
            .saturating_add(self.stars)
            .saturating_add(self.security_scan)
            .saturating_add(self.documentation)
            .min(MAX_TRUST_SCORE)
    }
}

fn stars_points(stars: Option<u64>) -> u32 {
    let Some(stars) = stars else {
        return 0;
    };
    STARS_THRESHOLDS
        .iter()
        .find(|(min, _)| stars >= *min)
        .map(|(_, points)| *points)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[ProvenanceTag]) -> BTreeSet<ProvenanceTag> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_single_official_source() {
        let official = tags(&[ProvenanceTag::OfficialRegistry]);
        let b = TrustBreakdown::compute(&official, 1, None, None, false);
        assert_eq!(b.score(), 30);
        assert_eq!(TrustLevel::for_score(b.score()), TrustLevel::Unknown);
    }

    #[test]
    fn test_all_signals() {
        let b = TrustBreakdown::compute(
            &tags(&[ProvenanceTag::OfficialRegistry, ProvenanceTag::FederatedIndex]),
            2,
            Some(1_500),
            Some(true),
            true,
        );
        assert_eq!(b.source_base, 30);
        assert_eq!(b.multi_source_bonus, 10);
        assert_eq!(b.stars, 15);
        assert_eq!(b.score(), 65);
        assert_eq!(TrustLevel::for_score(b.score()), TrustLevel::Verified);
    }

    #[test]
    fn test_clamped_to_max() {
        let b = TrustBreakdown::compute(
            &tags(&[
                ProvenanceTag::OfficialRegistry,
                ProvenanceTag::FederatedIndex,
                ProvenanceTag::CuratedList,
                ProvenanceTag::Crawl,
            ]),
            4,
            Some(50_000),
            Some(true),
            true,
        );
        assert_eq!(b.score(), MAX_TRUST_SCORE);
        assert_eq!(TrustLevel::for_score(b.score()), TrustLevel::Official);
    }

    #[test]
    fn test_failed_scan_and_zero_stars_score_nothing() {
        let crawl = tags(&[ProvenanceTag::Crawl]);
        let b = TrustBreakdown::compute(&crawl, 1, Some(0), Some(false), false);
        assert_eq!(b.stars, 0);
        assert_eq!(b.security_scan, 0);
        assert_eq!(b.score(), 15);
    }

    #[test]
    fn test_star_buckets() {
        assert_eq!(stars_points(Some(10_000)), 20);
        assert_eq!(stars_points(Some(9_999)), 15);
        assert_eq!(stars_points(Some(100)), 10);
        assert_eq!(stars_points(Some(1)), 5);
        assert_eq!(stars_points(None), 0);
    }

    #[test]
    fn test_adding_a_source_never_lowers_the_score() {
        let all = [
            ProvenanceTag::OfficialRegistry,
            ProvenanceTag::FederatedIndex,
            ProvenanceTag::CuratedList,
            ProvenanceTag::Crawl,
        ];
        for first in all {
            for second in all {
                let before =
                    TrustBreakdown::compute(&tags(&[first]), 1, Some(10), None, false).score();
                let after =
                    TrustBreakdown::compute(&tags(&[first, second]), 2, Some(10), None, false)
                        .score();
                assert!(after >= before, "{first} + {second}: {after} < {before}");
            }
        }
    }

    #[test]
    fn test_same_tier_sources_earn_corroboration() {
        let index = tags(&[ProvenanceTag::FederatedIndex]);
        let one = TrustBreakdown::compute(&index, 1, None, None, false);
        let two = TrustBreakdown::compute(&index, 2, None, None, false);
        assert_eq!(one.multi_source_bonus, 0);
        assert_eq!(two.source_base, 25);
        assert_eq!(two.multi_source_bonus, 10);
        assert_eq!(two.score(), 35);
    }
}
