//! The search engine: simulation pipeline, root management, and the
//! parallel driver.
//!
//! A simulation is one recursive pass of expand-or-select, then backup:
//! the recursion carries a private clone of the game state down the tree,
//! and each frame folds the returned value into the child it descended
//! into, negating at every level for the zero-sum backup. Workers share
//! the tree; the only decorrelation between them is the root noise, so
//! two workers may well walk the same path. Between searches the engine
//! tries to carry the subtree of the played move forward as the new root.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use ponder_core::{Game, Winner};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Gamma};
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, MctsConfig, SearchMode};
use crate::evaluator::{Evaluation, Evaluator, EvaluatorError};
use crate::node::NodeId;
use crate::policy;
use crate::tree::Tree;

/// Root-noise mixing weight.
const DIRICHLET_EPSILON: f32 = 0.25;
/// Dirichlet concentration for root exploration noise.
const DIRICHLET_ALPHA: f32 = 0.3;

/// Errors that abort a search.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),

    #[error("search tree corrupt: {0}")]
    CorruptTree(&'static str),
}

/// What the engine wants to do with the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision<M> {
    Play(M),
    Resign,
}

/// Counters from one search.
#[derive(Debug, Clone, Copy)]
pub struct SearchStats {
    /// Completed simulations.
    pub iterations: u32,
    /// Arena slots in use after the search (live or free-listed).
    pub nodes: usize,
    pub elapsed: Duration,
}

/// A chosen move plus the improved policy it was chosen from.
#[derive(Debug, Clone)]
pub struct SearchOutcome<M> {
    pub decision: Decision<M>,
    /// Visit-count policy over the full action space.
    pub pi: Vec<f32>,
    pub stats: SearchStats,
}

/// Parallel PUCT search over a shared arena tree.
pub struct Mcts<G: Game, E: Evaluator<G>> {
    config: MctsConfig,
    evaluator: E,
    tree: Tree,
    pool: ThreadPool,
    current: G,
    /// State as of the end of the previous search; the anchor for tree
    /// reuse.
    prev: Option<G>,
    running: AtomicBool,
    /// Per-search Dirichlet sample over the action space (self-play).
    dirichlet: Vec<f32>,
    /// Improved policy of the most recent search.
    policies: Option<Vec<f32>>,
    rng: ChaCha20Rng,
}

impl<G: Game, E: Evaluator<G>> Mcts<G, E> {
    pub fn new(state: G, config: MctsConfig, evaluator: E) -> Result<Self, ConfigError> {
        Self::with_rng(state, config, evaluator, ChaCha20Rng::from_entropy())
    }

    /// Deterministic construction for tests and reproducible self-play.
    pub fn with_seed(
        state: G,
        config: MctsConfig,
        evaluator: E,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        Self::with_rng(state, config, evaluator, ChaCha20Rng::seed_from_u64(seed))
    }

    fn with_rng(
        state: G,
        config: MctsConfig,
        evaluator: E,
        rng: ChaCha20Rng,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let workers = config.num_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let pool = ThreadPoolBuilder::new().num_threads(workers).build()?;
        let tree = Tree::new(state.action_space(), config.max_tree_size);
        Ok(Self {
            config,
            evaluator,
            tree,
            pool,
            current: state,
            prev: None,
            running: AtomicBool::new(false),
            dirichlet: Vec::new(),
            policies: None,
            rng,
        })
    }

    /// Replace the position to search from. Tree reuse still applies when
    /// the new position is a continuation of the previously searched one.
    pub fn set_state(&mut self, state: G) {
        self.current = state;
    }

    pub fn state(&self) -> &G {
        &self.current
    }

    /// Arena slots allocated so far.
    pub fn nodes(&self) -> usize {
        self.tree.len()
    }

    /// Improved policy from the most recent search, if any.
    pub fn policies(&self) -> Option<&[f32]> {
        self.policies.as_deref()
    }

    /// The search tree, for inspection.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Forget everything: the engine behaves as freshly constructed.
    pub fn reset(&mut self) {
        self.tree.clear();
        self.prev = None;
        self.policies = None;
        self.dirichlet.clear();
    }

    /// Run one full search from the current state: advance or rebuild the
    /// root, fan simulations out over the worker pool, then extract the
    /// improved policy and a move.
    pub fn search(&mut self) -> Result<SearchOutcome<G::Move>, SearchError> {
        let started = Instant::now();
        let action_space = self.current.action_space();

        if self.current.outcome().is_some() {
            debug!(
                move_number = self.current.move_number(),
                "searching a finished game, resigning"
            );
            let pi = vec![0.0; action_space];
            self.policies = Some(pi.clone());
            return Ok(SearchOutcome {
                decision: Decision::Resign,
                pi,
                stats: SearchStats {
                    iterations: 0,
                    nodes: self.tree.len(),
                    elapsed: started.elapsed(),
                },
            });
        }

        self.prepare_root()?;
        let iterations = self.run_simulations()?;

        let children = self.tree.child_stats(self.tree.root());
        let extraction = policy::extract(
            &children,
            action_space,
            self.current.move_number(),
            &self.config,
            &mut self.rng,
        );
        self.tree.assign_pi(&extraction.per_child);
        self.policies = Some(extraction.pi.clone());
        self.prev = Some(self.current.clone());

        let stats = SearchStats {
            iterations,
            nodes: self.tree.len(),
            elapsed: started.elapsed(),
        };
        debug!(
            move_number = self.current.move_number(),
            iterations = stats.iterations,
            nodes = stats.nodes,
            active = self.tree.node_count(),
            "search complete"
        );

        let decision = match extraction.chosen {
            Some(index) => {
                let mv = self
                    .current
                    .nn_to_move(index as usize)
                    .ok_or(SearchError::CorruptTree("chosen action index does not decode"))?;
                Decision::Play(mv)
            }
            None => Decision::Resign,
        };

        Ok(SearchOutcome {
            decision,
            pi: extraction.pi,
            stats,
        })
    }

    fn is_self_play(&self) -> bool {
        matches!(self.config.mode, SearchMode::SelfPlay { .. })
    }

    /// Start-of-search housekeeping: recycle last turn's discards, carry
    /// the played subtree forward or build a fresh root, refresh the noise
    /// vector, and make sure the root is expanded and visited once.
    fn prepare_root(&mut self) -> Result<(), SearchError> {
        self.tree.drain_freeables();

        let reused = self.try_advance_root();
        if !reused || self.tree.root().is_none() {
            self.tree.fresh_root();
        }
        let root = self.tree.root();
        self.tree.reset_node_count(self.tree.count_active(root));
        self.prev = None;

        if self.is_self_play() {
            self.sample_dirichlet();
        }

        if !self.tree.has_children(root) {
            let value = self.expand_and_simulate(root, &self.current)?;
            self.tree.update(root, value);
        } else if self.is_self_play() {
            // Reused root: surviving children keep their visit statistics
            // but get this search's exploration noise mixed into their
            // priors.
            self.tree
                .perturb_priors(root, &self.dirichlet, DIRICHLET_EPSILON);
        }
        Ok(())
    }

    /// Try to move the root to the position in `self.current` by rewinding
    /// it to the previously searched state and replaying the moves between
    /// them, promoting the matching child at each step. Returns false when
    /// the positions do not connect or a played move has no subtree.
    fn try_advance_root(&self) -> bool {
        if self.tree.root().is_none() {
            return false;
        }
        let Some(prev) = self.prev.as_ref() else {
            return false;
        };

        let Some(depth) = self
            .current
            .move_number()
            .checked_sub(prev.move_number())
        else {
            trace!("state rewound past the previous search, rebuilding root");
            return false;
        };

        let mut replay = self.current.clone();
        for _ in 0..depth {
            replay.undo_last();
        }
        if !replay.state_eq(prev) {
            return false;
        }

        for _ in 0..depth {
            replay.fwd();
            let Some(mv) = replay.last_move() else {
                return false;
            };
            let index = replay.move_to_nn(mv) as i32;
            let Some(next_root) = self.tree.find_child(self.tree.root(), index) else {
                trace!(mv = index, "played move has no subtree, rebuilding root");
                return false;
            };
            self.tree.promote_root(next_root);
        }

        replay.move_number() == self.current.move_number() && replay.state_eq(&self.current)
    }

    /// Draw this search's Dirichlet(alpha) noise vector over the action
    /// space, via normalized Gamma variates.
    fn sample_dirichlet(&mut self) {
        let action_space = self.current.action_space();
        let gamma = Gamma::new(f64::from(DIRICHLET_ALPHA), 1.0).expect("alpha > 0");
        let draws: Vec<f64> = (0..action_space)
            .map(|_| gamma.sample(&mut self.rng))
            .collect();
        let sum: f64 = draws.iter().sum();

        let mut sample = vec![0.0f32; action_space];
        if sum > 0.0 && sum.is_finite() {
            for (slot, draw) in sample.iter_mut().zip(&draws) {
                *slot = (draw / sum) as f32;
            }
        }
        self.dirichlet = sample;
    }

    /// Fan simulations out over the worker pool until the budget is spent,
    /// the deadline passes, or an evaluator failure stops the search.
    fn run_simulations(&self) -> Result<u32, SearchError> {
        let completed = AtomicU32::new(0);
        let failure: Mutex<Option<EvaluatorError>> = Mutex::new(None);
        self.running.store(true, Ordering::SeqCst);

        match self.config.mode {
            SearchMode::SelfPlay { num_simulations } => {
                if num_simulations == 0 {
                    self.running.store(false, Ordering::SeqCst);
                    return Ok(0);
                }
                let next = AtomicU32::new(0);
                self.pool.broadcast(|_| {
                    while self.running.load(Ordering::Relaxed) {
                        if next.fetch_add(1, Ordering::Relaxed) >= num_simulations {
                            break;
                        }
                        match self.simulate() {
                            Ok(()) => {
                                completed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                self.record_failure(&failure, err);
                                break;
                            }
                        }
                    }
                });
            }
            SearchMode::MatchPlay { budget, timeout } => {
                let deadline = Instant::now() + timeout;
                self.pool.broadcast(|_| {
                    while self.running.load(Ordering::Relaxed) {
                        if Instant::now() >= deadline {
                            // First worker past the deadline cancels the
                            // rest; in-flight simulations unwind at their
                            // next recursion step.
                            self.running.store(false, Ordering::SeqCst);
                            break;
                        }
                        match self.simulate() {
                            Ok(()) => {
                                if completed.fetch_add(1, Ordering::Relaxed) + 1 >= budget {
                                    self.running.store(false, Ordering::SeqCst);
                                    break;
                                }
                            }
                            Err(err) => {
                                self.record_failure(&failure, err);
                                break;
                            }
                        }
                    }
                });
            }
        }
        self.running.store(false, Ordering::SeqCst);

        let failure = failure
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = failure {
            return Err(err.into());
        }
        Ok(completed.load(Ordering::Relaxed))
    }

    fn record_failure(&self, slot: &Mutex<Option<EvaluatorError>>, err: EvaluatorError) {
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// One simulation: walk a private state clone from the root, then fold
    /// the returned value into the root so its visit count stays ahead of
    /// its children's.
    fn simulate(&self) -> Result<(), EvaluatorError> {
        let mut state = self.current.clone();
        let root = self.tree.root();
        let value = self.pipeline(&mut state, root, 0)?;
        self.tree.update(root, -value);
        Ok(())
    }

    /// Expand-or-select, then recurse, then back up.
    ///
    /// The return value is from the perspective of the player whose move
    /// led into `node`; each frame updates the child it descended into
    /// with the child's value and hands the negation up.
    fn pipeline(&self, state: &mut G, node: NodeId, depth: u32) -> Result<f32, EvaluatorError> {
        if !self.running.load(Ordering::Relaxed) {
            return Ok(0.0);
        }
        if depth > self.config.max_depth {
            return Ok(0.0);
        }

        if let Some(winner) = state.outcome() {
            return Ok(match winner {
                Winner::Draw => 0.0,
                w if w.is(state.turn()) => -1.0,
                _ => 1.0,
            });
        }

        if !self.tree.has_children(node) {
            if self.tree.at_capacity() {
                return Ok(0.0);
            }
            let value = self.expand_and_simulate(node, state)?;
            return Ok(-value);
        }

        let Some(child) = self.tree.select_child(node, self.config.puct, 0.0) else {
            // Every child pruned or reclaimed under us: nothing to descend
            // into, score the frontier as a draw.
            return Ok(0.0);
        };

        let index = self.tree.move_of(child);
        let mv = usize::try_from(index)
            .ok()
            .and_then(|i| state.nn_to_move(i));
        let Some(mv) = mv.filter(|&mv| state.check(mv)) else {
            warn!(
                mv = index,
                depth, "selection proposed an unplayable move, scoring the path as a draw"
            );
            self.tree.update(child, 0.0);
            return Ok(0.0);
        };

        state.apply(mv);
        let value = self.pipeline(state, child, depth + 1)?;
        self.tree.update(child, value);
        Ok(-value)
    }

    /// Evaluate `state`, attach one child per legal move with normalized
    /// priors (noised at a self-play root), and hand the evaluation value
    /// back for backup. An unknown (NaN) value scores as a draw without
    /// expanding; an empty legal set leaves the node childless.
    fn expand_and_simulate(&self, node: NodeId, state: &G) -> Result<f32, EvaluatorError> {
        let Evaluation { policy, value } = self.evaluator.infer(state)?;
        if value.is_nan() {
            trace!(
                move_number = state.move_number(),
                "evaluator returned no value, scoring as draw without expansion"
            );
            return Ok(0.0);
        }
        let value = value.clamp(-1.0, 1.0);

        let action_space = state.action_space();
        let mut pairs: Vec<(i32, f32)> = Vec::with_capacity(action_space);
        let mut legal_sum = 0.0f32;
        for index in 0..action_space {
            let Some(mv) = state.nn_to_move(index) else {
                continue;
            };
            if !state.check(mv) {
                continue;
            }
            let score = policy.get(index).copied().unwrap_or(0.0).max(0.0);
            pairs.push((index as i32, score));
            legal_sum += score;
        }
        if pairs.is_empty() {
            return Ok(value);
        }

        if legal_sum > f32::MIN_POSITIVE {
            for pair in &mut pairs {
                pair.1 /= legal_sum;
            }
        } else {
            // The evaluator put no mass on any legal move.
            let uniform = 1.0 / pairs.len() as f32;
            for pair in &mut pairs {
                pair.1 = uniform;
            }
        }

        if self.is_self_play() && node == self.tree.root() {
            for pair in &mut pairs {
                let eta = self.dirichlet.get(pair.0 as usize).copied().unwrap_or(0.0);
                pair.1 = (1.0 - DIRICHLET_EPSILON) * pair.1 + DIRICHLET_EPSILON * eta;
            }
        }

        pairs.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        if !self.tree.expand(node, &pairs) {
            trace!(node = node.0, "lost the expansion race, keeping the evaluation");
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::UniformEvaluator;
    use crate::MctsConfig;
    use games_tictactoe::TicTacToe;
    use ponder_core::Game;

    #[test]
    fn basic_search_returns_a_legal_move() {
        let mut engine = Mcts::with_seed(
            TicTacToe::new(),
            MctsConfig::for_testing(),
            UniformEvaluator::new(),
            42,
        )
        .unwrap();

        let outcome = engine.search().unwrap();
        match outcome.decision {
            Decision::Play(mv) => assert!(mv < 9),
            Decision::Resign => panic!("resigned the opening position"),
        }
        assert!(outcome.stats.iterations > 0);
        let total: f32 = outcome.pi.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn evaluator_error_aborts_the_search() {
        struct Failing;
        impl Evaluator<TicTacToe> for Failing {
            fn infer(&self, _: &TicTacToe) -> Result<Evaluation, EvaluatorError> {
                Err(EvaluatorError::Inference("backend gone".into()))
            }
        }

        let mut engine =
            Mcts::with_seed(TicTacToe::new(), MctsConfig::for_testing(), Failing, 42).unwrap();
        let err = engine.search().unwrap_err();
        assert!(matches!(err, SearchError::Evaluator(_)));
    }

    #[test]
    fn search_finds_the_winning_move() {
        // X at 0, 1; O at 3, 4. X to move: cell 2 wins on the spot.
        let state = TicTacToe::from_moves(&[0, 3, 1, 4]);
        let mut engine = Mcts::with_seed(
            state,
            MctsConfig::for_testing().with_simulations(400),
            UniformEvaluator::new(),
            42,
        )
        .unwrap();

        let outcome = engine.search().unwrap();
        assert_eq!(outcome.decision, Decision::Play(2));

        // The winning child's value converges toward a sure win.
        let root = engine.tree().root();
        let winning = engine.tree().find_child(root, 2).unwrap();
        assert!(engine.tree().qsa(winning) > 0.8);
        assert!(engine.tree().visits(winning) > 100);
    }

    #[test]
    fn parallel_search_matches_the_game_contract() {
        let mut engine = Mcts::with_seed(
            TicTacToe::new(),
            MctsConfig::for_self_play(256).with_workers(4),
            UniformEvaluator::new(),
            7,
        )
        .unwrap();
        let outcome = engine.search().unwrap();
        let Decision::Play(mv) = outcome.decision else {
            panic!("resigned the opening position");
        };
        assert!(TicTacToe::new().check(mv));
        assert_eq!(outcome.stats.iterations, 256);
    }

    #[test]
    fn root_visits_dominate_child_visits() {
        let mut engine = Mcts::with_seed(
            TicTacToe::new(),
            MctsConfig::for_testing().with_simulations(200),
            UniformEvaluator::new(),
            11,
        )
        .unwrap();
        engine.search().unwrap();

        let tree = engine.tree();
        let root = tree.root();
        let child_sum: u32 = tree
            .children(root)
            .iter()
            .map(|&kid| tree.visits(kid))
            .sum();
        assert!(tree.visits(root) >= 1 + child_sum);
    }
}
