//! The evaluator seam: state in, (policy, value) out.
//!
//! In a full system this is a neural network's policy/value head. The
//! engine only needs the [`Evaluator`] trait; [`UniformEvaluator`] is the
//! model-free stand-in used by tests and benches.

use ponder_core::Game;
use thiserror::Error;

/// Errors surfaced by an evaluator. Any error aborts the search that
/// triggered it.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("state not evaluable: {0}")]
    InvalidState(String),
}

/// One evaluation of a game state.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Non-negative score per action index. Entries for illegal moves are
    /// ignored; legal entries are renormalized by the expander.
    pub policy: Vec<f32>,

    /// Expected outcome in [-1, 1] for the side to move, or NaN when the
    /// evaluator cannot judge the state (treated as a draw, without
    /// expansion).
    pub value: f32,
}

/// A stateless position evaluator shared by all search workers.
pub trait Evaluator<G: Game>: Send + Sync {
    fn infer(&self, state: &G) -> Result<Evaluation, EvaluatorError>;
}

/// Equal probability on every legal move, neutral value.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformEvaluator;

impl UniformEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl<G: Game> Evaluator<G> for UniformEvaluator {
    fn infer(&self, state: &G) -> Result<Evaluation, EvaluatorError> {
        let action_space = state.action_space();
        let mut policy = vec![0.0; action_space];

        let legal: Vec<usize> = (0..action_space)
            .filter(|&i| state.nn_to_move(i).is_some_and(|mv| state.check(mv)))
            .collect();

        if !legal.is_empty() {
            let prob = 1.0 / legal.len() as f32;
            for i in legal {
                policy[i] = prob;
            }
        }

        Ok(Evaluation { policy, value: 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use games_tictactoe::TicTacToe;

    #[test]
    fn uniform_over_legal_moves() {
        let state = TicTacToe::from_moves(&[4, 0]);
        let eval = UniformEvaluator::new().infer(&state).unwrap();

        // Seven empty cells remain.
        let expected = 1.0 / 7.0;
        for (i, &p) in eval.policy.iter().enumerate() {
            if i == 4 || i == 0 {
                assert!(p.abs() < 1e-6);
            } else {
                assert!((p - expected).abs() < 1e-6);
            }
        }
        assert!(eval.value.abs() < 1e-6);
    }

    #[test]
    fn finished_game_gets_empty_policy() {
        let state = TicTacToe::from_moves(&[0, 3, 1, 4, 2]);
        let eval = UniformEvaluator::new().infer(&state).unwrap();
        assert!(eval.policy.iter().all(|p| p.abs() < 1e-6));
    }
}
