//! Search configuration.

use std::time::Duration;

use thiserror::Error;

use crate::tree::MAX_TREE_SIZE;

/// How a search is budgeted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchMode {
    /// Training: a fixed number of simulations, with Dirichlet exploration
    /// noise mixed into the root priors.
    SelfPlay { num_simulations: u32 },
    /// Match play: simulations run until either the iteration budget or
    /// the wall-clock deadline is exhausted, whichever comes first. No
    /// exploration noise.
    MatchPlay { budget: u32, timeout: Duration },
}

/// Rejected configurations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("puct must be finite and > 0, got {0}")]
    InvalidPuct(f32),

    #[error("random_temperature must be finite and > 0, got {0}")]
    InvalidTemperature(f32),

    #[error("max_depth must be >= 1")]
    InvalidMaxDepth,

    #[error("match-play budget must be >= 1")]
    InvalidBudget,

    #[error("match-play timeout must be non-zero")]
    InvalidTimeout,

    #[error("num_workers must be >= 1 when set")]
    InvalidWorkerCount,

    #[error("max_tree_size must be >= 1")]
    InvalidTreeSize,

    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Tunables for the search engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MctsConfig {
    /// PUCT exploration constant. Typical range 1.0 - 1.5.
    pub puct: f32,

    /// Budget shape: fixed simulations (self-play) or budget + deadline
    /// (match play).
    pub mode: SearchMode,

    /// Simulations deeper than this return a draw value.
    pub max_depth: u32,

    /// While the game's move number is below this, moves are sampled with
    /// temperature instead of taken by argmax.
    pub random_count: usize,

    /// Sampling temperature for the opening phase. Must be positive.
    pub random_temperature: f32,

    /// When set, children with fewer visits are not candidates for
    /// temperature sampling (they keep their place in the improved
    /// policy).
    pub random_min_visits: Option<u32>,

    /// Reproduce the lineage's policy normalization, where the denominator
    /// exponent is always `1/random_temperature` regardless of the phase.
    /// With it off the improved policy always sums to 1.
    pub legacy_pi_denominator: bool,

    /// Hard cap on live tree nodes; expansion stops beyond it.
    pub max_tree_size: usize,

    /// Worker threads for the parallel driver. Defaults to available
    /// hardware parallelism.
    pub num_workers: Option<usize>,
}

impl Default for MctsConfig {
    fn default() -> Self {
        Self {
            puct: 1.25,
            mode: SearchMode::SelfPlay {
                num_simulations: 800,
            },
            max_depth: 512,
            random_count: 30,
            random_temperature: 1.0,
            random_min_visits: None,
            legacy_pi_denominator: false,
            max_tree_size: MAX_TREE_SIZE,
            num_workers: None,
        }
    }
}

impl MctsConfig {
    /// Training configuration: fixed simulation count, noisy root,
    /// temperature sampling for the opening.
    pub fn for_self_play(num_simulations: u32) -> Self {
        Self {
            mode: SearchMode::SelfPlay { num_simulations },
            ..Self::default()
        }
    }

    /// Match-play configuration: budgeted, deadline-bound, no noise, no
    /// temperature sampling.
    pub fn for_match_play(budget: u32, timeout: Duration) -> Self {
        Self {
            mode: SearchMode::MatchPlay { budget, timeout },
            random_count: 0,
            ..Self::default()
        }
    }

    /// A small, single-worker configuration for deterministic tests.
    pub fn for_testing() -> Self {
        Self {
            mode: SearchMode::SelfPlay {
                num_simulations: 64,
            },
            random_count: 0,
            num_workers: Some(1),
            ..Self::default()
        }
    }

    pub fn with_puct(mut self, puct: f32) -> Self {
        self.puct = puct;
        self
    }

    pub fn with_simulations(mut self, num_simulations: u32) -> Self {
        self.mode = SearchMode::SelfPlay { num_simulations };
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_random_count(mut self, random_count: usize) -> Self {
        self.random_count = random_count;
        self
    }

    pub fn with_temperature(mut self, random_temperature: f32) -> Self {
        self.random_temperature = random_temperature;
        self
    }

    pub fn with_random_min_visits(mut self, floor: u32) -> Self {
        self.random_min_visits = Some(floor);
        self
    }

    pub fn with_legacy_pi_denominator(mut self) -> Self {
        self.legacy_pi_denominator = true;
        self
    }

    pub fn with_max_tree_size(mut self, max_tree_size: usize) -> Self {
        self.max_tree_size = max_tree_size;
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    /// Reject configurations the engine cannot run with. A zero
    /// simulation count is allowed: the search then answers from the
    /// root priors alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.puct.is_finite() || self.puct <= 0.0 {
            return Err(ConfigError::InvalidPuct(self.puct));
        }
        if !self.random_temperature.is_finite() || self.random_temperature <= 0.0 {
            return Err(ConfigError::InvalidTemperature(self.random_temperature));
        }
        if self.max_depth == 0 {
            return Err(ConfigError::InvalidMaxDepth);
        }
        if self.max_tree_size == 0 {
            return Err(ConfigError::InvalidTreeSize);
        }
        if let SearchMode::MatchPlay { budget, timeout } = self.mode {
            if budget == 0 {
                return Err(ConfigError::InvalidBudget);
            }
            if timeout.is_zero() {
                return Err(ConfigError::InvalidTimeout);
            }
        }
        if self.num_workers == Some(0) {
            return Err(ConfigError::InvalidWorkerCount);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MctsConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_simulations_is_accepted() {
        let config = MctsConfig::for_self_play(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_puct_is_rejected() {
        let config = MctsConfig::default().with_puct(0.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPuct(_))
        ));
        let config = MctsConfig::default().with_puct(f32::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_temperature_is_rejected() {
        let config = MctsConfig::default().with_temperature(0.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTemperature(_))
        ));
    }

    #[test]
    fn match_play_needs_budget_and_timeout() {
        let config = MctsConfig::for_match_play(0, Duration::from_millis(100));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBudget)));

        let config = MctsConfig::for_match_play(100, Duration::ZERO);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTimeout)));

        let config = MctsConfig::for_match_play(100, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = MctsConfig::default().with_workers(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWorkerCount)
        ));
    }

    #[test]
    fn builders_compose() {
        let config = MctsConfig::for_self_play(128)
            .with_puct(1.5)
            .with_random_count(8)
            .with_temperature(0.8)
            .with_workers(2);
        assert_eq!(
            config.mode,
            SearchMode::SelfPlay {
                num_simulations: 128
            }
        );
        assert!((config.puct - 1.5).abs() < 1e-6);
        assert_eq!(config.random_count, 8);
        assert_eq!(config.num_workers, Some(2));
    }
}
