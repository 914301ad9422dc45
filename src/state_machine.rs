use std::fmt::Debug;
use std::hash::Hash;

use rand::seq::SliceRandom;
use rand::RngCore;

use crate::error::GameError;

/// The outcome of a single randomized playout.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthCharge {
    /// Goal value reached by each role, in `0.0..=100.0`.
    pub scores: Vec<f64>,
    /// Number of joint moves played before the playout stopped.
    pub length: usize,
    /// `false` if the playout was cut off before reaching a terminal state.
    pub terminal: bool,
}

/// Requires implementation by the user in order to provide the rules of the game.
///
/// Roles are identified by their index in `0..role_count()`.  Every role submits a move in every
/// non-terminal state (turn-based games give the idle roles a single "noop" move), and the game
/// advances by applying the joint move of all roles at once.  The search folds roles with a
/// single legal move automatically, so turn-based games produce one tree level per real choice.
///
/// The methods take `&mut self` because rule evaluators commonly keep scratch state between
/// queries.  The engine clones the state machine once per rollout worker, so no implementation
/// needs to be `Sync`.
///
/// # Implementation Note
///
/// `State` is used as the key of the transposition index.  Two states that compare equal are
/// treated as the same position and share a single tree node, so any history that matters to the
/// rules (e.g. repetition counters) must be part of the state.
pub trait StateMachine: Clone + Send + 'static {
    /// A type that completely describes the state of the game.
    type State: Clone + Eq + Hash + Debug + Send + 'static;
    /// A single role's move.
    type Move: Clone + Eq + Hash + Debug + Send + 'static;

    /// Number of roles in the game.
    fn role_count(&self) -> usize;

    /// `true` if the game is over in `state`.
    fn is_terminal(&mut self, state: &Self::State) -> Result<bool, GameError>;

    /// The legal moves of `role` in a non-terminal `state`; never empty for a well-formed game.
    fn legal_moves(&mut self, state: &Self::State, role: usize)
        -> Result<Vec<Self::Move>, GameError>;

    /// Apply one move per role, indexed by role.
    fn next_state(
        &mut self,
        state: &Self::State,
        joint_move: &[Self::Move],
    ) -> Result<Self::State, GameError>;

    /// The goal value of `role` in `state`, in `0..=100`.
    fn goal_value(&mut self, state: &Self::State, role: usize) -> Result<u32, GameError>;

    /// Play uniformly random joint moves from `state` until a terminal state is reached or
    /// `cutoff` joint moves have been played.
    ///
    /// A cut-off playout is scored with the goal values of the state it stopped in, falling back
    /// to a neutral 50 for roles whose goal is not defined there.  Implementations with a faster
    /// native playout should override this method.
    fn depth_charge(
        &mut self,
        state: &Self::State,
        cutoff: usize,
        rng: &mut dyn RngCore,
    ) -> Result<DepthCharge, GameError> {
        let n_roles = self.role_count();
        let mut current = state.clone();
        let mut joint = Vec::with_capacity(n_roles);
        let mut length = 0;

        let terminal = loop {
            if self.is_terminal(&current)? {
                break true;
            }
            if length >= cutoff {
                break false;
            }

            joint.clear();
            for role in 0..n_roles {
                let moves = self.legal_moves(&current, role)?;
                let m = moves
                    .choose(rng)
                    .ok_or(GameError::NoLegalMoves { role })?
                    .clone();
                joint.push(m);
            }
            current = self.next_state(&current, &joint)?;
            length += 1;
        };

        let scores = (0..n_roles)
            .map(|role| match self.goal_value(&current, role) {
                Ok(g) => Ok(f64::from(g.min(100))),
                Err(_) if !terminal => Ok(50.0),
                Err(e) => Err(e),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DepthCharge {
            scores,
            length,
            terminal,
        })
    }
}

/// Information about the node being created, passed to [`Heuristic::static_value`].
#[derive(Debug, Clone, Copy)]
pub struct HeuristicContext<'a> {
    /// Distance of the parent from the root plus one.
    pub depth: u32,
    /// The role whose choice led to the new node.
    pub deciding_role: usize,
    /// The parent's current average score per role.
    pub parent_scores: &'a [f64],
}

/// A static estimate of a state's value used to seed a new node.
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicEstimate {
    /// Estimated score per role, in `0.0..=100.0`.
    pub scores: Vec<f64>,
    /// How many playouts the estimate is worth.  A weight of `0` disables seeding.
    pub weight: u32,
}

/// A static evaluation plugin consulted once per new non-terminal node, before any playout
/// results exist for it.
pub trait Heuristic<S>: Send {
    /// An estimate for a newly created node holding `state`, or `None` to leave the node
    /// unseeded.
    fn static_value(
        &mut self,
        state: &S,
        context: HeuristicContext<'_>,
    ) -> Result<Option<HeuristicEstimate>, GameError>;
}

/// A [`Heuristic`] that never provides an estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHeuristic;

impl<S> Heuristic<S> for NoHeuristic {
    fn static_value(
        &mut self,
        _state: &S,
        _context: HeuristicContext<'_>,
    ) -> Result<Option<HeuristicEstimate>, GameError> {
        Ok(None)
    }
}
