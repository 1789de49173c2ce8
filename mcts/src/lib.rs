//! Parallel Monte Carlo Tree Search guided by an external evaluator.
//!
//! An AlphaZero-style search for two-player, perfect-information,
//! zero-sum turn games: given a game state and an evaluator mapping
//! states to (policy, value) pairs, the engine explores the game tree
//! under a PUCT selection rule, accumulates visit statistics, and returns
//! a move together with an improved policy distribution over the root's
//! legal moves.
//!
//! # Overview
//!
//! Each simulation runs one recursive pass over the shared tree:
//!
//! 1. **Expand**: at an unexpanded leaf, query the evaluator and attach
//!    one child per legal move, priors normalized (and noised at the root
//!    during self-play)
//! 2. **Select**: otherwise pick the child maximizing
//!    `Q + puct * P * sqrt(N_parent) / (1 + N)` and recurse into it with a
//!    private clone of the game state
//! 3. **Backup**: fold the returned value into the child, negating at
//!    each level for the zero-sum backup
//!
//! Simulations fan out over a worker pool. Nodes live in an
//! arena indexed by [`NodeId`]; structural mutation takes one
//! readers-writer lock, per-node statistics are atomics. Across turns the
//! subtree of the played move is carried forward as the new root and the
//! discarded siblings are recycled through a free list.
//!
//! # Usage
//!
//! ```rust
//! use games_tictactoe::TicTacToe;
//! use mcts::{Decision, Mcts, MctsConfig, UniformEvaluator};
//!
//! let config = MctsConfig::for_self_play(128).with_workers(2);
//! let mut engine = Mcts::new(TicTacToe::new(), config, UniformEvaluator::new()).unwrap();
//!
//! let outcome = engine.search().unwrap();
//! match outcome.decision {
//!     Decision::Play(mv) => println!("play {mv}, policy {:?}", outcome.pi),
//!     Decision::Resign => println!("no playable move"),
//! }
//! ```
//!
//! # Modes
//!
//! [`SearchMode::SelfPlay`] runs a fixed simulation count with Dirichlet
//! exploration noise at the root and temperature-sampled moves for the
//! opening (training data generation). [`SearchMode::MatchPlay`] runs
//! against an iteration budget and a wall-clock deadline with neither
//! noise nor sampling.

pub mod config;
pub mod evaluator;
pub mod node;
mod policy;
pub mod search;
pub mod tree;

pub use config::{ConfigError, MctsConfig, SearchMode};
pub use evaluator::{Evaluation, Evaluator, EvaluatorError, UniformEvaluator};
pub use node::{NodeId, Status};
pub use search::{Decision, Mcts, SearchError, SearchOutcome, SearchStats};
pub use tree::{Tree, MAX_TREE_SIZE};
