//! Control pool index for nearest-neighbour lookups
//!
//! Controls are kept as a struct-of-arrays sorted by logit propensity so a
//! nearest-neighbour query is a binary search plus a look at both sides.

use crate::algorithm::matching::types::ScoredSubject;

/// Nearest control to a query value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Control subject
    pub person_id: i64,
    /// Row of the control in the original control table
    pub position: usize,
    /// Absolute logit distance to the query
    pub distance: f64,
}

/// Controls sorted by `(logit, original position)`
#[derive(Debug, Clone, Default)]
pub struct ControlIndex {
    logits: Vec<f64>,
    person_ids: Vec<i64>,
    positions: Vec<usize>,
}

impl ControlIndex {
    /// Build an index over controls given in table order
    #[must_use]
    pub fn new(controls: &[ScoredSubject]) -> Self {
        let mut order: Vec<usize> = (0..controls.len()).collect();
        order.sort_by(|&a, &b| {
            controls[a]
                .logit_propensity
                .total_cmp(&controls[b].logit_propensity)
                .then(a.cmp(&b))
        });

        let mut logits = Vec::with_capacity(controls.len());
        let mut person_ids = Vec::with_capacity(controls.len());
        let mut positions = Vec::with_capacity(controls.len());
        for i in order {
            logits.push(controls[i].logit_propensity);
            person_ids.push(controls[i].person_id);
            positions.push(i);
        }

        Self {
            logits,
            person_ids,
            positions,
        }
    }

    /// Nearest control by absolute logit distance, consumed or not
    ///
    /// Ties on distance go to the control that comes first in the original
    /// control table.
    #[must_use]
    pub fn nearest(&self, target: f64) -> Option<Neighbor> {
        if self.is_empty() {
            return None;
        }

        let split = self.logits.partition_point(|&logit| logit < target);

        let above = (split < self.len()).then_some(split);
        let below = (split > 0).then(|| self.run_start(split - 1));

        let best = match (below, above) {
            (Some(lo), Some(hi)) => {
                let d_lo = (target - self.logits[lo]).abs();
                let d_hi = (self.logits[hi] - target).abs();
                if d_lo < d_hi || (d_lo == d_hi && self.positions[lo] < self.positions[hi]) {
                    lo
                } else {
                    hi
                }
            }
            (Some(lo), None) => lo,
            (None, Some(hi)) => hi,
            (None, None) => return None,
        };

        Some(self.neighbor(best, target))
    }

    /// First sorted slot holding the same logit as slot `i`
    fn run_start(&self, i: usize) -> usize {
        let value = self.logits[i];
        self.logits[..i].partition_point(|&logit| logit < value)
    }

    fn neighbor(&self, slot: usize, target: f64) -> Neighbor {
        Neighbor {
            person_id: self.person_ids[slot],
            position: self.positions[slot],
            distance: (self.logits[slot] - target).abs(),
        }
    }

    /// Number of controls in the index
    #[must_use]
    pub fn len(&self) -> usize {
        self.logits.len()
    }

    /// Whether the index holds no controls
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logits.is_empty()
    }
}
