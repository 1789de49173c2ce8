//! Improved-policy extraction and move choice from root visit counts.
//!
//! After the driver stops, the visit distribution over the root's
//! children becomes (a) the training target `pi` over the full action
//! space and (b) the played move, either by argmax or sampled with
//! temperature during the opening phase.

use rand::Rng;

use crate::config::MctsConfig;
use crate::node::{NodeId, Status};
use crate::tree::ChildStat;

/// Result of turning root visit counts into a policy and a move.
pub(crate) struct Extraction {
    /// Dense distribution over the action space; zero on unvisited and
    /// illegal actions.
    pub pi: Vec<f32>,
    /// Per-child policy mass, for writing back into the tree.
    pub per_child: Vec<(NodeId, f32)>,
    /// Chosen action index; `None` means resign (no playable child).
    pub chosen: Option<i32>,
}

pub(crate) fn extract<R: Rng>(
    children: &[ChildStat],
    action_space: usize,
    move_number: usize,
    config: &MctsConfig,
    rng: &mut R,
) -> Extraction {
    let mut pi = vec![0.0f32; action_space];

    let active: Vec<&ChildStat> = children
        .iter()
        .filter(|c| c.status == Status::Active && c.mv >= 0 && (c.mv as usize) < action_space)
        .collect();
    if active.is_empty() {
        return Extraction {
            pi,
            per_child: Vec::new(),
            chosen: None,
        };
    }

    let opening = move_number < config.random_count;
    let tau = if opening { config.random_temperature } else { 1.0 };
    let tau_denom = if config.legacy_pi_denominator {
        config.random_temperature
    } else {
        tau
    };

    let denom: f32 = children
        .iter()
        .filter(|c| c.status != Status::Invalid)
        .map(|c| (c.visits as f32).powf(1.0 / tau_denom))
        .sum();

    let mut per_child = Vec::with_capacity(active.len());
    if denom > 0.0 && denom.is_finite() {
        for child in &active {
            let mass = (child.visits as f32).powf(1.0 / tau) / denom;
            pi[child.mv as usize] = mass;
            per_child.push((child.id, mass));
        }
    } else {
        // No visits anywhere (a zero-simulation search): answer from the
        // priors, which were normalized at expansion.
        for child in &active {
            pi[child.mv as usize] = child.prior;
            per_child.push((child.id, child.prior));
        }
    }

    // Children arrive in prior-descending insertion order, so a stable
    // sort keeps the higher-prior child first among equals.
    let mut ranked = active;
    ranked.sort_by(|a, b| {
        pi[b.mv as usize]
            .partial_cmp(&pi[a.mv as usize])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let chosen = if opening {
        sample_by_visits(&ranked, tau, config.random_min_visits, rng)
    } else {
        Some(ranked[0].mv)
    };

    Extraction {
        pi,
        per_child,
        chosen,
    }
}

/// Sample a child proportionally to `visits^(1/tau)` by inverting the
/// cumulative distribution with one uniform draw. Children under the
/// `min_visits` floor are excluded unless that would exclude everyone.
fn sample_by_visits<R: Rng>(
    ranked: &[&ChildStat],
    tau: f32,
    min_visits: Option<u32>,
    rng: &mut R,
) -> Option<i32> {
    let floor = min_visits.unwrap_or(0);
    let mut pool: Vec<&&ChildStat> = ranked.iter().filter(|c| c.visits >= floor).collect();
    if pool.is_empty() {
        pool = ranked.iter().collect();
    }

    let weights: Vec<f32> = pool
        .iter()
        .map(|c| (c.visits as f32).powf(1.0 / tau))
        .collect();
    let total: f32 = weights.iter().sum();
    if !(total > 0.0 && total.is_finite()) {
        return Some(ranked[0].mv);
    }

    let draw: f32 = rng.gen();
    let mut accum = 0.0f32;
    for (child, weight) in pool.iter().zip(&weights) {
        accum += weight / total;
        if draw < accum {
            return Some(child.mv);
        }
    }
    pool.last().map(|c| c.mv)
}
