//! Safety guard — vetoes replicated updates that look like data loss
//!
//! A corrupted or malicious peer message arriving as a full-document
//! replacement can silently wipe large portions of session data. Before a
//! candidate document replaces the local one, the guard computes per
//! collection churn and fails closed when it exceeds policy.
//!
//! Thresholds are tunable heuristics, not protocol invariants, so they
//! live in config rather than as hard-coded constants.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::document::{CollectionKey, Document};

/// Guard policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Collections smaller than this are exempt: normal churn on a
    /// two-item list is indistinguishable from data loss.
    #[serde(default = "default_min_considered")]
    pub min_considered: usize,

    /// Maximum size-weighted mean churn percentage before the update is
    /// rejected.
    #[serde(default = "default_max_overall_pct")]
    pub max_overall_pct: f64,

    /// Stricter per-collection ceilings for especially sensitive
    /// collections, so a targeted wipe cannot hide inside a large,
    /// mostly-unchanged document.
    #[serde(default = "default_category_limits")]
    pub category_limits: BTreeMap<CollectionKey, f64>,
}

fn default_min_considered() -> usize {
    10
}

fn default_max_overall_pct() -> f64 {
    60.0
}

fn default_category_limits() -> BTreeMap<CollectionKey, f64> {
    let mut limits = BTreeMap::new();
    limits.insert(CollectionKey::Roster, 70.0);
    limits
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            min_considered: default_min_considered(),
            max_overall_pct: default_max_overall_pct(),
            category_limits: default_category_limits(),
        }
    }
}

/// Churn measurement for one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryMetric {
    pub key: CollectionKey,
    pub old_count: usize,
    pub new_count: usize,
    pub diff_pct: f64,
    /// Whether this collection met the size floor and contributed to the
    /// overall score.
    pub considered: bool,
}

/// Result of evaluating a candidate document.
#[derive(Debug, Clone)]
pub struct GuardVerdict {
    pub safe: bool,
    /// Size-weighted mean churn across considered collections.
    pub score: f64,
    pub metrics: Vec<CategoryMetric>,
    /// Populated on rejection, naming the offending collection(s) and
    /// percentages.
    pub reason: Option<String>,
}

/// Evaluate whether replacing `previous` with `candidate` is safe.
pub fn evaluate(config: &GuardConfig, previous: &Document, candidate: &Document) -> GuardVerdict {
    let mut metrics = Vec::with_capacity(CollectionKey::ALL.len());
    let mut weighted_sum = 0.0;
    let mut weight_total = 0usize;

    for key in CollectionKey::ALL {
        let old_count = previous.collection_len(key);
        let new_count = candidate.collection_len(key);
        let diff_pct = if old_count == 0 {
            if new_count > 0 {
                100.0
            } else {
                0.0
            }
        } else {
            (new_count.abs_diff(old_count) as f64) / (old_count as f64) * 100.0
        };
        let considered = old_count >= config.min_considered;
        if considered {
            weighted_sum += diff_pct * old_count as f64;
            weight_total += old_count;
        }
        metrics.push(CategoryMetric {
            key,
            old_count,
            new_count,
            diff_pct,
            considered,
        });
    }

    // Nothing met the size floor: unconditionally safe.
    if weight_total == 0 {
        return GuardVerdict {
            safe: true,
            score: 0.0,
            metrics,
            reason: None,
        };
    }

    let score = weighted_sum / weight_total as f64;
    let mut reasons = Vec::new();

    if score > config.max_overall_pct {
        // The rejection reason always names a collection, so the dominant
        // contributor (by weighted churn) is appended to the overall score.
        let dominant = metrics
            .iter()
            .filter(|m| m.considered)
            .max_by(|a, b| {
                (a.diff_pct * a.old_count as f64).total_cmp(&(b.diff_pct * b.old_count as f64))
            });
        let detail = dominant
            .map(|m| {
                format!(
                    ", led by {} ({:.1}%, {} -> {} entities)",
                    m.key.name(),
                    m.diff_pct,
                    m.old_count,
                    m.new_count
                )
            })
            .unwrap_or_default();
        reasons.push(format!(
            "overall churn {:.1}% exceeds limit {:.1}%{}",
            score, config.max_overall_pct, detail
        ));
    }

    // Sensitive collections get their own ceiling independent of the
    // weighted mean.
    for metric in metrics.iter().filter(|m| m.considered) {
        if let Some(&limit) = config.category_limits.get(&metric.key) {
            if metric.diff_pct > limit {
                reasons.push(format!(
                    "{} churn {:.1}% exceeds limit {:.1}% ({} -> {} entities)",
                    metric.key.name(),
                    metric.diff_pct,
                    limit,
                    metric.old_count,
                    metric.new_count
                ));
            }
        }
    }

    GuardVerdict {
        safe: reasons.is_empty(),
        score,
        metrics,
        reason: if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("; "))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Collection, Entity};

    fn doc(counts: &[(CollectionKey, usize)]) -> Document {
        let mut doc = Document::new("test");
        for &(key, n) in counts {
            let mut c = Collection::default();
            for i in 0..n {
                c.upsert(Entity::new(format!("{}-{}", key.name(), i)));
            }
            doc.collections.insert(key, c);
        }
        doc
    }

    #[test]
    fn small_collections_always_safe() {
        let config = GuardConfig::default();
        let prev = doc(&[(CollectionKey::Catalog, 9), (CollectionKey::Roster, 5)]);
        let wiped = doc(&[]);
        let verdict = evaluate(&config, &prev, &wiped);
        assert!(verdict.safe);
        assert_eq!(verdict.score, 0.0);
    }

    #[test]
    fn emptying_large_collection_is_unsafe() {
        let config = GuardConfig::default();
        let prev = doc(&[(CollectionKey::Catalog, 20)]);
        let wiped = doc(&[]);
        let verdict = evaluate(&config, &prev, &wiped);
        assert!(!verdict.safe);
        let catalog = verdict
            .metrics
            .iter()
            .find(|m| m.key == CollectionKey::Catalog)
            .unwrap();
        assert_eq!(catalog.diff_pct, 100.0);
        assert!(verdict.reason.unwrap().contains("overall churn"));
    }

    #[test]
    fn moderate_removal_stays_safe() {
        // 7 of 20 removed: 35% churn, below the 60% ceiling.
        let config = GuardConfig::default();
        let prev = doc(&[(CollectionKey::Catalog, 20)]);
        let cand = doc(&[(CollectionKey::Catalog, 13)]);
        let verdict = evaluate(&config, &prev, &cand);
        assert!(verdict.safe);
        assert!((verdict.score - 35.0).abs() < 0.01);
    }

    #[test]
    fn heavy_removal_is_unsafe_with_named_reason() {
        // 13 of 20 removed: 65% churn.
        let config = GuardConfig::default();
        let prev = doc(&[(CollectionKey::Catalog, 20)]);
        let cand = doc(&[(CollectionKey::Catalog, 7)]);
        let verdict = evaluate(&config, &prev, &cand);
        assert!(!verdict.safe);
        let reason = verdict.reason.unwrap();
        assert!(reason.contains("65.0%"));
        // Catalog has no per-category ceiling, but the reason must still
        // name the collection responsible for the overall score.
        assert!(reason.contains("catalog"));
        assert!(reason.contains("20 -> 7"));
    }

    #[test]
    fn overall_reason_names_dominant_collection() {
        // Two considered collections, only one heavily churned: the
        // reason names the heavy one.
        let config = GuardConfig::default();
        let prev = doc(&[
            (CollectionKey::Catalog, 40),
            (CollectionKey::Handouts, 10),
        ]);
        let cand = doc(&[
            (CollectionKey::Catalog, 2),
            (CollectionKey::Handouts, 9),
        ]);
        let verdict = evaluate(&config, &prev, &cand);
        assert!(!verdict.safe);
        let reason = verdict.reason.unwrap();
        assert!(reason.contains("led by catalog"));
    }

    #[test]
    fn roster_ceiling_trips_independently() {
        // Huge journal keeps the weighted mean low, but the roster wipe
        // must still be caught by its own 70% ceiling.
        let config = GuardConfig::default();
        let prev = doc(&[
            (CollectionKey::Journal, 500),
            (CollectionKey::Roster, 10),
        ]);
        let mut cand = doc(&[(CollectionKey::Journal, 500)]);
        cand.collections
            .insert(CollectionKey::Roster, Collection::default());
        let verdict = evaluate(&config, &prev, &cand);
        assert!(verdict.score < config.max_overall_pct);
        assert!(!verdict.safe);
        assert!(verdict.reason.unwrap().contains("roster"));
    }

    #[test]
    fn growth_counts_as_churn_symmetrically() {
        let config = GuardConfig::default();
        let prev = doc(&[(CollectionKey::Catalog, 10)]);
        let cand = doc(&[(CollectionKey::Catalog, 30)]);
        let verdict = evaluate(&config, &prev, &cand);
        // +200% churn on the only considered collection.
        assert!(!verdict.safe);
    }

    #[test]
    fn empty_previous_is_unconditionally_safe() {
        let config = GuardConfig::default();
        let prev = Document::new("fresh");
        let cand = doc(&[(CollectionKey::Catalog, 50)]);
        assert!(evaluate(&config, &prev, &cand).safe);
    }
}
