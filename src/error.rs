use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`StateMachine`](crate::StateMachine) or
/// [`Heuristic`](crate::Heuristic) implementation, usually the symptom of a malformed game
/// definition.
#[derive(Debug, Error)]
pub enum GameError {
    /// A role was offered no move in a state that is not terminal.
    #[error("role {role} has no legal moves in a non-terminal state")]
    NoLegalMoves {
        /// The role without moves.
        role: usize,
    },

    /// The transition function rejected a joint move.
    #[error("illegal joint move: {0}")]
    IllegalJointMove(String),

    /// No goal value is defined for a role in a terminal state.
    #[error("goal value unavailable for role {role}")]
    GoalUnavailable {
        /// The role without a goal.
        role: usize,
    },

    /// Any other inconsistency in the game definition.
    #[error("malformed game definition: {0}")]
    Malformed(String),
}

/// Errors returned across the [`SearchEngine`](crate::SearchEngine) boundary.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The game implementation failed.
    #[error("game error: {0}")]
    Game(#[from] GameError),

    /// An operation needs a prior `setup` or `start_search`.
    #[error("no search has been started")]
    NotSetUp,

    /// The searching role has nothing to choose at the root.
    #[error("no legal move is available for the searching role")]
    NoMoveAvailable,

    /// A rollout worker thread could not be started.
    #[error("failed to spawn rollout worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// The driver loop saw no heartbeat for too long.
    #[error("search made no progress for {silent_for:?}")]
    Stalled {
        /// Time since the last heartbeat.
        silent_for: Duration,
    },
}
