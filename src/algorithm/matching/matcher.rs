//! Greedy 1:1 caliper matching on the logit propensity
//!
//! Treated subjects are visited once each. A subject is paired with its
//! nearest control when that control is within the caliper and has not been
//! claimed yet; otherwise it stays unmatched. There is no fallback to the
//! second-nearest control.

use std::time::Instant;

use log::{debug, info};
use rustc_hash::FxHashSet;

use crate::algorithm::matching::control_data::ControlIndex;
use crate::algorithm::matching::types::{MatchedPair, ScoredSubject};
use crate::config::{MatchingConfig, TreatedOrder};
use crate::utils::logging::{create_main_progress_bar, finish_progress_bar};
use crate::utils::stats;

/// Caliper for a run: `multiplier` times the population SD of every logit
///
/// Both arms contribute. With no subjects at all the caliper is 0.
#[must_use]
pub fn compute_caliper(
    treated: &[ScoredSubject],
    controls: &[ScoredSubject],
    multiplier: f64,
) -> f64 {
    let logits: Vec<f64> = treated
        .iter()
        .chain(controls)
        .map(|s| s.logit_propensity)
        .collect();
    multiplier * stats::population_std(&logits)
}

/// Result of one matching pass
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    /// Accepted pairs in the order they were formed
    pub pairs: Vec<MatchedPair>,
    /// Caliper in force
    pub caliper: f64,
    /// Treated subjects whose nearest control was farther than the caliper
    pub outside_caliper: usize,
    /// Treated subjects whose nearest control was already claimed
    pub nearest_consumed: usize,
}

impl MatchOutcome {
    /// Number of treated subjects left without a partner
    #[must_use]
    pub const fn unmatched(&self) -> usize {
        self.outside_caliper + self.nearest_consumed
    }
}

/// Greedy nearest-neighbour matcher without replacement
#[derive(Debug, Clone)]
pub struct CaliperMatcher {
    caliper_multiplier: f64,
    treated_order: TreatedOrder,
    show_progress: bool,
}

impl CaliperMatcher {
    /// Create a matcher from matching configuration
    #[must_use]
    pub const fn new(config: &MatchingConfig) -> Self {
        Self {
            caliper_multiplier: config.caliper_multiplier,
            treated_order: config.treated_order,
            show_progress: config.show_progress,
        }
    }

    /// Pair treated subjects with controls
    ///
    /// Both slices must be in table order: ties between equidistant controls
    /// go to the one listed first.
    #[must_use]
    pub fn match_subjects(
        &self,
        treated: &[ScoredSubject],
        controls: &[ScoredSubject],
    ) -> MatchOutcome {
        let start = Instant::now();
        let caliper = compute_caliper(treated, controls, self.caliper_multiplier);
        info!(
            "Matching {} treated subjects against {} controls (caliper {caliper:.4})",
            treated.len(),
            controls.len()
        );

        let index = ControlIndex::new(controls);
        let order = self.visit_order(treated);

        let pb = create_main_progress_bar(
            order.len() as u64,
            Some("Caliper matching"),
            self.show_progress,
        );

        let mut consumed = FxHashSet::with_capacity_and_hasher(treated.len(), Default::default());
        let mut pairs = Vec::with_capacity(treated.len().min(controls.len()));
        let mut outside_caliper = 0;
        let mut nearest_consumed = 0;

        for (visited, subject) in order.into_iter().enumerate() {
            pb.inc(1);
            if visited % 100 == 0 {
                pb.set_message(format!("Found {} matches", pairs.len()));
            }

            let Some(nearest) = index.nearest(subject.logit_propensity) else {
                outside_caliper += 1;
                continue;
            };

            if nearest.distance > caliper {
                outside_caliper += 1;
                continue;
            }

            if !consumed.insert(nearest.person_id) {
                nearest_consumed += 1;
                continue;
            }

            pairs.push(MatchedPair {
                user_person_id: subject.person_id,
                nonuser_person_id: nearest.person_id,
                ps_distance: nearest.distance,
            });
        }

        finish_progress_bar(&pb, Some("Matching complete"));

        debug!(
            "Matching pass took {:.2?}: {} outside caliper, {} lost to an already claimed control",
            start.elapsed(),
            outside_caliper,
            nearest_consumed
        );

        MatchOutcome {
            pairs,
            caliper,
            outside_caliper,
            nearest_consumed,
        }
    }

    fn visit_order<'a>(&self, treated: &'a [ScoredSubject]) -> Vec<&'a ScoredSubject> {
        let mut order: Vec<&ScoredSubject> = treated.iter().collect();
        if self.treated_order == TreatedOrder::PersonId {
            order.sort_by_key(|s| s.person_id);
        }
        order
    }
}
