//! A pooled and pipelined implementation of [Monte Carlo tree
//! search](https://en.wikipedia.org/wiki/Monte_Carlo_tree_search) (MCTS) for general game
//! playing.
//!
//! # Features
//!
//! - **_Recombining:_** different sequences of moves that reach the same state share a single
//! node, so the search graph is a [directed acyclic
//! graph](https://en.wikipedia.org/wiki/Directed_acyclic_graph) rather than a tree.  When the root
//! advances, the part of the graph that is still reachable is kept and everything else is freed.
//!
//! - **_Any number of roles:_** every role moves in every state, and roles with a single legal
//! move are folded into the joint move automatically.  Turn-based games therefore produce one
//! level per real decision, while simultaneous moves are split into one level per choosing role.
//!
//! - **_Bounded memory:_** nodes and edges live in fixed-capacity [`SlotPool`]s addressed by
//! generation-checked references.  When a pool runs low the least promising subtrees are trimmed
//! and their slots recycled; references still held by in-flight work simply stop resolving.
//!
//! - **_Pipelined:_** a single tree thread selects and expands leaves and hands rollouts to a pool
//! of worker threads through bounded per-worker rings.  Each worker plays out games on a private
//! copy of the [`StateMachine`], so the rules need no synchronization.
//!
//! - **_Solving:_** positions whose value is known exactly are marked complete and the knowledge
//! is propagated upwards, including a floor analysis for simultaneous moves.  Averages that were
//! built from samples are corrected once the exact value is known.
//!
//! - **_Safe:_** the library is written entirely in safe Rust.
//!
//! # Usage
//!
//! Using this library mainly requires implementing the [`StateMachine`] trait for a game, and
//! optionally a [`Heuristic`] that seeds new nodes with a static estimate.  Searching is driven
//! through the [`SearchEngine`].
//!
//! ```no_run
//! use ggp_mcts::prelude::*;
//! use std::time::{Duration, Instant};
//!
//! /// Two roles take turns removing one or two stones; whoever takes the last stone wins.
//! #[derive(Clone, Debug)]
//! struct Nim;
//!
//! #[derive(Clone, Debug, PartialEq, Eq, Hash)]
//! struct Pile {
//!     stones: u32,
//!     to_move: usize,
//! }
//!
//! impl StateMachine for Nim {
//!     type State = Pile;
//!     type Move = u32;
//!
//!     fn role_count(&self) -> usize {
//!         2
//!     }
//!
//!     fn is_terminal(&mut self, state: &Pile) -> Result<bool, GameError> {
//!         Ok(state.stones == 0)
//!     }
//!
//!     fn legal_moves(&mut self, state: &Pile, role: usize) -> Result<Vec<u32>, GameError> {
//!         if role != state.to_move {
//!             return Ok(vec![0]);
//!         }
//!         Ok((1..=state.stones.min(2)).collect())
//!     }
//!
//!     fn next_state(&mut self, state: &Pile, joint_move: &[u32]) -> Result<Pile, GameError> {
//!         Ok(Pile {
//!             stones: state.stones - joint_move[state.to_move],
//!             to_move: 1 - state.to_move,
//!         })
//!     }
//!
//!     fn goal_value(&mut self, state: &Pile, role: usize) -> Result<u32, GameError> {
//!         Ok(if role == state.to_move { 0 } else { 100 })
//!     }
//! }
//!
//! # fn main() -> Result<(), SearchError> {
//! let start = Pile { stones: 20, to_move: 0 };
//! let mut engine = SearchEngine::new(SearchConfig::default());
//! engine.setup(Nim, start.clone(), NoHeuristic, PoolSizes::default())?;
//!
//! let deadline = Instant::now() + Duration::from_millis(100);
//! engine.start_search(deadline, start)?;
//! engine.search_until(deadline)?;
//! dbg!(engine.root_info());
//! println!("take {}", engine.get_best_move(0)?);
//! # Ok(())
//! # }
//! ```
//!
//! Logging goes through [`tracing`](https://docs.rs/tracing); the crate never installs a
//! subscriber itself.

// Helpful references:
// https://hal.inria.fr/inria-00164003/document (UCB1-tuned)
// https://www.aaai.org/Papers/AAAI/2008/AAAI08-041.pdf (MCTS solver)

#![forbid(unsafe_code)]
#![warn(
    rust_2018_idioms,
    missing_debug_implementations,
    missing_docs,
    broken_intra_doc_links
)]

mod config;
mod engine;
mod error;
mod pipeline;
mod pool;
mod request;
mod score_vector;
mod state_machine;
mod tree;
mod unique_heap;
mod worker;

#[doc(inline)]
pub use prelude::*;

#[doc(hidden)]
pub mod prelude {
    pub use crate::config::{PoolSizes, SearchConfig, TerminalBonus};
    pub use crate::engine::{
        SearchControl, SearchEngine, SearchOutcome, SearchSnapshot, SearchStats,
    };
    pub use crate::error::{GameError, SearchError};
    pub use crate::pipeline::{Backoff, Pipeline, PipelineShard};
    pub use crate::pool::{PoolStats, Reset, SlotPool, SlotRef};
    pub use crate::request::RolloutRequest;
    pub use crate::score_vector::ScoreVectorStore;
    pub use crate::state_machine::{
        DepthCharge, Heuristic, HeuristicContext, HeuristicEstimate, NoHeuristic, StateMachine,
    };
    pub use crate::tree::{
        EdgeRef, MoveInfo, NodeInfo, NodeRef, RootBinding, SearchTree, TreeCounters, TreePath,
    };
    pub use crate::worker::{Rollout, RolloutWorker};
}
