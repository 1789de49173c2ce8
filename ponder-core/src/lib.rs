//! Game capability traits for the ponder search engine.
//!
//! This crate defines the seam between the search engine and a concrete
//! game: the [`Game`] trait plus the small shared types ([`Player`],
//! [`Winner`]) describing two-player, perfect-information, zero-sum turn
//! games with terminal rewards in {-1, 0, +1}.
//!
//! Games implement [`Game`] with their own state and move types; the
//! engine only ever talks to states through this trait, cloning them for
//! private per-simulation use.

mod game;

pub use game::{Game, Player, Winner};
