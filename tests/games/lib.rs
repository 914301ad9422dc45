//! Small games exercising [`ggp_mcts`](../ggp_mcts/index.html) through its public interface.
//!
//! Each game is tiny enough to be solved outright, and each stresses one part of the search:
//!
//! - [`Corridor`]: a single role has to find the one path that scores 100.
//! - [`Duel`]: the opening move can win on the spot, so the root is solved after one iteration.
//! - [`Diamond`]: every route to a cell reaches the same state, so the graph recombines heavily.
//! - [`Matching`]: both roles move at once; the value of the game comes from the floor analysis.
//! - [`Trio`]: three roles move at once, so the last role's floor spans both earlier roles.
//! - [`Bluff`]: a simultaneous game whose value depends on how much the floor is weighted.
//! - [`Race`]: a larger turn-based race used for threaded search, trimming and whole games.
//!   [`RaceLead`] is a static heuristic for it.

use ggp_mcts::prelude::*;

/// Moves of the [`Corridor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    Forward,
    Back,
    Quit,
}

/// A position in the [`Corridor`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Walk {
    pub pos: u32,
    pub steps: u32,
    pub quit: bool,
}

/// A single role walks a corridor of `length` cells and has exactly `length` steps.  Reaching the
/// end scores 100; quitting or running out of steps scores in proportion to the distance covered.
#[derive(Clone, Debug)]
pub struct Corridor {
    pub length: u32,
}

impl StateMachine for Corridor {
    type State = Walk;
    type Move = Step;

    fn role_count(&self) -> usize {
        1
    }

    fn is_terminal(&mut self, state: &Walk) -> Result<bool, GameError> {
        Ok(state.quit || state.steps >= self.length)
    }

    fn legal_moves(&mut self, state: &Walk, _role: usize) -> Result<Vec<Step>, GameError> {
        let mut moves = vec![Step::Forward, Step::Quit];
        if state.pos > 0 {
            moves.push(Step::Back);
        }
        Ok(moves)
    }

    fn next_state(&mut self, state: &Walk, joint_move: &[Step]) -> Result<Walk, GameError> {
        let mut next = state.clone();
        match joint_move.first() {
            Some(Step::Forward) => next.pos += 1,
            Some(Step::Back) if state.pos > 0 => next.pos -= 1,
            Some(Step::Quit) => next.quit = true,
            _ => return Err(GameError::IllegalJointMove(format!("{:?}", joint_move))),
        }
        next.steps += 1;
        Ok(next)
    }

    fn goal_value(&mut self, state: &Walk, _role: usize) -> Result<u32, GameError> {
        if state.pos >= self.length {
            Ok(100)
        } else {
            Ok(state.pos * 50 / self.length)
        }
    }
}

/// Moves of the [`Duel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Gambit {
    Win,
    Lose,
    Long,
    Take(u32),
    Wait,
}

/// States of the [`Duel`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DuelState {
    Opening,
    Sprint { remaining: u32, to_move: usize },
    Over { winner: usize },
}

/// Role 0 opens by winning, losing, or starting a countdown of `length` in which the roles take
/// turns removing one or two and the role that reaches zero wins.
#[derive(Clone, Debug)]
pub struct Duel {
    pub length: u32,
}

impl StateMachine for Duel {
    type State = DuelState;
    type Move = Gambit;

    fn role_count(&self) -> usize {
        2
    }

    fn is_terminal(&mut self, state: &DuelState) -> Result<bool, GameError> {
        Ok(matches!(state, DuelState::Over { .. }))
    }

    fn legal_moves(&mut self, state: &DuelState, role: usize) -> Result<Vec<Gambit>, GameError> {
        Ok(match *state {
            DuelState::Opening if role == 0 => vec![Gambit::Win, Gambit::Lose, Gambit::Long],
            DuelState::Sprint { remaining, to_move } if role == to_move => {
                (1..=remaining.min(2)).map(Gambit::Take).collect()
            }
            DuelState::Over { .. } => Vec::new(),
            _ => vec![Gambit::Wait],
        })
    }

    fn next_state(
        &mut self,
        state: &DuelState,
        joint_move: &[Gambit],
    ) -> Result<DuelState, GameError> {
        let illegal = || GameError::IllegalJointMove(format!("{:?}", joint_move));
        match *state {
            DuelState::Opening => match joint_move.first() {
                Some(Gambit::Win) => Ok(DuelState::Over { winner: 0 }),
                Some(Gambit::Lose) => Ok(DuelState::Over { winner: 1 }),
                Some(Gambit::Long) => Ok(DuelState::Sprint {
                    remaining: self.length,
                    to_move: 1,
                }),
                _ => Err(illegal()),
            },
            DuelState::Sprint { remaining, to_move } => match joint_move.get(to_move) {
                Some(Gambit::Take(n)) if *n >= 1 && *n <= remaining => {
                    if *n == remaining {
                        Ok(DuelState::Over { winner: to_move })
                    } else {
                        Ok(DuelState::Sprint {
                            remaining: remaining - n,
                            to_move: 1 - to_move,
                        })
                    }
                }
                _ => Err(illegal()),
            },
            DuelState::Over { .. } => Err(illegal()),
        }
    }

    fn goal_value(&mut self, state: &DuelState, role: usize) -> Result<u32, GameError> {
        match state {
            DuelState::Over { winner } => Ok(if *winner == role { 100 } else { 0 }),
            _ => Err(GameError::GoalUnavailable { role }),
        }
    }
}

/// Moves of the [`Diamond`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Heading {
    Right,
    Up,
}

/// A cell of the [`Diamond`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
}

/// A single role walks from `(0, 0)` to `(size, size)` moving right or up.  Every route scores
/// 50, and every route through a cell shares that cell's node.
#[derive(Clone, Debug)]
pub struct Diamond {
    pub size: u32,
}

impl StateMachine for Diamond {
    type State = Cell;
    type Move = Heading;

    fn role_count(&self) -> usize {
        1
    }

    fn is_terminal(&mut self, state: &Cell) -> Result<bool, GameError> {
        Ok(state.x >= self.size && state.y >= self.size)
    }

    fn legal_moves(&mut self, state: &Cell, _role: usize) -> Result<Vec<Heading>, GameError> {
        let mut moves = Vec::with_capacity(2);
        if state.x < self.size {
            moves.push(Heading::Right);
        }
        if state.y < self.size {
            moves.push(Heading::Up);
        }
        Ok(moves)
    }

    fn next_state(&mut self, state: &Cell, joint_move: &[Heading]) -> Result<Cell, GameError> {
        match joint_move.first() {
            Some(Heading::Right) if state.x < self.size => Ok(Cell {
                x: state.x + 1,
                ..*state
            }),
            Some(Heading::Up) if state.y < self.size => Ok(Cell {
                y: state.y + 1,
                ..*state
            }),
            _ => Err(GameError::IllegalJointMove(format!("{:?}", joint_move))),
        }
    }

    fn goal_value(&mut self, _state: &Cell, _role: usize) -> Result<u32, GameError> {
        Ok(50)
    }
}

/// Moves of [`Matching`]: role 0 picks `A` or `B`, role 1 picks `X` or `Y`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pick {
    A,
    B,
    X,
    Y,
}

/// States of [`Matching`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    Open,
    Revealed(Pick, Pick),
}

/// A one-shot simultaneous game.  Role 1 scores 60 for `(A, X)`, 40 for `(A, Y)`, 70 for `(B, X)`
/// and 30 for `(B, Y)`; role 0 scores the rest of 100.  `X` dominates for role 1, and against it
/// `A` is role 0's better answer, so the game is worth `[40, 60]`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Matching;

impl Matching {
    fn payoff(first: Pick, second: Pick) -> Option<u32> {
        match (first, second) {
            (Pick::A, Pick::X) => Some(60),
            (Pick::A, Pick::Y) => Some(40),
            (Pick::B, Pick::X) => Some(70),
            (Pick::B, Pick::Y) => Some(30),
            _ => None,
        }
    }
}

impl StateMachine for Matching {
    type State = Table;
    type Move = Pick;

    fn role_count(&self) -> usize {
        2
    }

    fn is_terminal(&mut self, state: &Table) -> Result<bool, GameError> {
        Ok(matches!(state, Table::Revealed(..)))
    }

    fn legal_moves(&mut self, state: &Table, role: usize) -> Result<Vec<Pick>, GameError> {
        Ok(match (state, role) {
            (Table::Revealed(..), _) => Vec::new(),
            (Table::Open, 0) => vec![Pick::A, Pick::B],
            (Table::Open, _) => vec![Pick::X, Pick::Y],
        })
    }

    fn next_state(&mut self, state: &Table, joint_move: &[Pick]) -> Result<Table, GameError> {
        match (state, joint_move) {
            (Table::Open, [first, second]) if Self::payoff(*first, *second).is_some() => {
                Ok(Table::Revealed(*first, *second))
            }
            _ => Err(GameError::IllegalJointMove(format!("{:?}", joint_move))),
        }
    }

    fn goal_value(&mut self, state: &Table, role: usize) -> Result<u32, GameError> {
        let second = match state {
            Table::Revealed(first, second) => Self::payoff(*first, *second),
            Table::Open => None,
        }
        .ok_or(GameError::GoalUnavailable { role })?;
        Ok(if role == 1 { second } else { 100 - second })
    }
}

/// Three roles raise hand `0` or `1` at once.  Role 0's hand is `A` or `B`, role 1's hand changes
/// nothing and role 2's hand is `X` or `Y`.  Role 2 scores 80 for `(A, X)`, 60 for `(A, Y)`, 10
/// for `(B, X)` and 70 for `(B, Y)`, so `Y` is its safe hand.  Against `Y` role 0 prefers `A`
/// (40 over 35), and the game is worth `[40, 50, 60]`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Trio;

impl Trio {
    fn payoff(hands: [u32; 3]) -> [u32; 3] {
        match (hands[0], hands[2]) {
            (0, 0) => [30, 50, 80],
            (0, _) => [40, 50, 60],
            (_, 0) => [20, 50, 10],
            _ => [35, 50, 70],
        }
    }
}

impl StateMachine for Trio {
    type State = Option<[u32; 3]>;
    type Move = u32;

    fn role_count(&self) -> usize {
        3
    }

    fn is_terminal(&mut self, state: &Self::State) -> Result<bool, GameError> {
        Ok(state.is_some())
    }

    fn legal_moves(&mut self, state: &Self::State, _role: usize) -> Result<Vec<u32>, GameError> {
        Ok(if state.is_some() { Vec::new() } else { vec![0, 1] })
    }

    fn next_state(
        &mut self,
        state: &Self::State,
        joint_move: &[u32],
    ) -> Result<Self::State, GameError> {
        match (state, joint_move) {
            (None, [a, b, c]) if *a < 2 && *b < 2 && *c < 2 => Ok(Some([*a, *b, *c])),
            _ => Err(GameError::IllegalJointMove(format!("{:?}", joint_move))),
        }
    }

    fn goal_value(&mut self, state: &Self::State, role: usize) -> Result<u32, GameError> {
        state
            .map(|hands| Self::payoff(hands)[role])
            .ok_or(GameError::GoalUnavailable { role })
    }
}

/// Role 0 picks `0` (A) or `1` (B) while role 1 picks `0` (X) or `1` (Y).  `X` scores role 1 0
/// against `A` and 100 against `B`; `Y` always scores 40.  Role 0 scores the rest of 100.  A
/// cautious role 1 settles for `Y` and the game is worth `[60, 40]`; one that only looks at the
/// average gambles on `X`, which `A` punishes, and the game is worth `[100, 0]`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bluff;

impl StateMachine for Bluff {
    type State = Option<[u32; 2]>;
    type Move = u32;

    fn role_count(&self) -> usize {
        2
    }

    fn is_terminal(&mut self, state: &Self::State) -> Result<bool, GameError> {
        Ok(state.is_some())
    }

    fn legal_moves(&mut self, state: &Self::State, _role: usize) -> Result<Vec<u32>, GameError> {
        Ok(if state.is_some() { Vec::new() } else { vec![0, 1] })
    }

    fn next_state(
        &mut self,
        state: &Self::State,
        joint_move: &[u32],
    ) -> Result<Self::State, GameError> {
        match (state, joint_move) {
            (None, [a, b]) if *a < 2 && *b < 2 => Ok(Some([*a, *b])),
            _ => Err(GameError::IllegalJointMove(format!("{:?}", joint_move))),
        }
    }

    fn goal_value(&mut self, state: &Self::State, role: usize) -> Result<u32, GameError> {
        let second = match state {
            Some([0, 0]) => 0,
            Some([_, 0]) => 100,
            Some(_) => 40,
            None => return Err(GameError::GoalUnavailable { role }),
        };
        Ok(if role == 1 { second } else { 100 - second })
    }
}

/// A position in the [`Race`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Runners {
    pub pos: [u32; 2],
    pub to_move: usize,
}

/// Two runners take turns advancing one to three cells; the first to reach `length` wins.  The
/// idle runner plays `0`.
#[derive(Clone, Debug)]
pub struct Race {
    pub length: u32,
}

impl StateMachine for Race {
    type State = Runners;
    type Move = u32;

    fn role_count(&self) -> usize {
        2
    }

    fn is_terminal(&mut self, state: &Runners) -> Result<bool, GameError> {
        Ok(state.pos.iter().any(|p| *p >= self.length))
    }

    fn legal_moves(&mut self, state: &Runners, role: usize) -> Result<Vec<u32>, GameError> {
        if role == state.to_move {
            Ok(vec![1, 2, 3])
        } else {
            Ok(vec![0])
        }
    }

    fn next_state(&mut self, state: &Runners, joint_move: &[u32]) -> Result<Runners, GameError> {
        let mover = state.to_move;
        let stride = match joint_move.get(mover) {
            Some(s) if (1..=3).contains(s) => *s,
            _ => return Err(GameError::IllegalJointMove(format!("{:?}", joint_move))),
        };
        let mut next = *state;
        next.pos[mover] = (state.pos[mover] + stride).min(self.length);
        next.to_move = 1 - mover;
        Ok(next)
    }

    fn goal_value(&mut self, state: &Runners, role: usize) -> Result<u32, GameError> {
        if state.pos[role] >= self.length {
            Ok(100)
        } else if state.pos[1 - role] >= self.length {
            Ok(0)
        } else {
            Err(GameError::GoalUnavailable { role })
        }
    }
}

/// Scores a [`Race`] position by the runners' lead, worth `weight` playouts.
#[derive(Clone, Debug)]
pub struct RaceLead {
    pub weight: u32,
}

impl Heuristic<Runners> for RaceLead {
    fn static_value(
        &mut self,
        state: &Runners,
        _context: HeuristicContext<'_>,
    ) -> Result<Option<HeuristicEstimate>, GameError> {
        let lead = f64::from(state.pos[0]) - f64::from(state.pos[1]);
        let first = (50.0 + 5.0 * lead).max(0.0).min(100.0);
        Ok(Some(HeuristicEstimate {
            scores: vec![first, 100.0 - first],
            weight: self.weight,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::time::{Duration, Instant};

    fn setup<G, H>(
        config: SearchConfig,
        sm: G,
        start: G::State,
        heuristic: H,
    ) -> SearchEngine<G, H>
    where
        G: StateMachine,
        H: Heuristic<G::State>,
    {
        let pool_sizes = config.pool_sizes;
        let mut engine = SearchEngine::new(config);
        engine.setup(sm, start.clone(), heuristic, pool_sizes).unwrap();
        engine
            .start_search(Instant::now() + Duration::from_secs(20), start)
            .unwrap();
        engine
    }

    fn solve<G: StateMachine>(sm: G, start: G::State) -> SearchEngine<G, NoHeuristic> {
        solve_with(SearchConfig::for_testing(), sm, start)
    }

    fn solve_with<G: StateMachine>(
        config: SearchConfig,
        sm: G,
        start: G::State,
    ) -> SearchEngine<G, NoHeuristic> {
        let mut engine = setup(config, sm, start, NoHeuristic);
        assert_eq!(engine.search().unwrap(), SearchOutcome::Solved);
        engine.tree().unwrap().check_invariants();
        engine
    }

    #[test]
    fn test_corridor_single_path() {
        let mut engine = solve(Corridor { length: 6 }, Walk::default());

        let root = engine.root_info().unwrap();
        assert!(root.complete);
        assert_eq!(root.scores, vec![100.0]);
        assert_eq!(engine.get_best_move(0).unwrap(), Step::Forward);
    }

    #[test]
    fn test_duel_immediate_win() {
        let mut engine = setup(
            SearchConfig::for_testing(),
            Duel { length: 30 },
            DuelState::Opening,
            NoHeuristic,
        );

        assert!(engine.grow_tree().unwrap());
        assert!(engine.stats().rollouts <= 1);
        assert_eq!(engine.root_info().unwrap().scores, vec![100.0, 0.0]);
        assert_eq!(engine.get_best_move(0).unwrap(), Gambit::Win);
        assert_eq!(engine.get_best_move(1).unwrap(), Gambit::Wait);

        // searching a solved root returns at once
        assert_eq!(engine.search().unwrap(), SearchOutcome::Solved);
    }

    #[test]
    fn test_diamond_transpositions() {
        let size = 3;
        let engine = solve(Diamond { size }, Cell::default());
        let tree = engine.tree().unwrap();

        assert_eq!(engine.root_info().unwrap().scores, vec![50.0]);

        // one node per cell, one edge per legal move
        let cells = (size + 1) * (size + 1);
        let moves = 2 * size * size + 2 * size;
        assert_eq!(tree.node_pool_stats().in_use, cells as usize);
        assert_eq!(tree.edge_pool_stats().in_use, moves as usize);

        let root = tree.root().unwrap();
        let right_up = tree
            .child_by_move(root, &Heading::Right)
            .and_then(|n| tree.child_by_move(n, &Heading::Up));
        let up_right = tree
            .child_by_move(root, &Heading::Up)
            .and_then(|n| tree.child_by_move(n, &Heading::Right));
        assert!(right_up.is_some());
        assert_eq!(right_up, up_right);
        assert_eq!(right_up, tree.lookup_transposition(&Cell { x: 1, y: 1 }));
    }

    #[test]
    fn test_simultaneous_floor() {
        let mut engine = solve(Matching, Table::Open);

        let root = engine.root_info().unwrap();
        assert_eq!(root.scores, vec![40.0, 60.0]);
        assert_eq!(engine.get_best_move(0).unwrap(), Pick::A);
        assert_eq!(engine.get_best_move(1).unwrap(), Pick::X);

        // role 0 chooses first; role 1 chooses in one intermediate level per move of role 0
        let moves = engine.child_infos();
        assert_eq!(moves.len(), 2);
        assert!(moves
            .iter()
            .all(|m| m.node.as_ref().map_or(false, |n| n.complete && n.children == 2)));
    }

    #[test]
    fn test_three_role_floor_spans_earlier_roles() {
        let mut engine = solve(Trio, None);

        // role 2 cannot see role 0's hand, so it keeps to the hand that is safe against both
        assert_eq!(engine.root_info().unwrap().scores, vec![40.0, 50.0, 60.0]);
        assert_eq!(engine.get_best_move(0).unwrap(), 0);
    }

    #[test]
    fn test_floor_weight_changes_outcome() {
        let cautious = solve(Bluff, None);
        assert_eq!(cautious.root_info().unwrap().scores, vec![60.0, 40.0]);

        let mut bold = solve_with(SearchConfig::for_testing().with_floor_weight(0.0), Bluff, None);
        assert_eq!(bold.root_info().unwrap().scores, vec![100.0, 0.0]);
        assert_eq!(bold.get_best_move(0).unwrap(), 0);
    }

    #[test]
    fn test_race_multi_thread() {
        let config = SearchConfig::default()
            .with_workers(2)
            .with_seed(7)
            .with_pool_sizes(50_000, 200_000, 100);
        let mut engine = setup(config, Race { length: 40 }, Runners::default(), NoHeuristic);

        let outcome = engine
            .search_until(Instant::now() + Duration::from_millis(300))
            .unwrap();
        assert_ne!(outcome, SearchOutcome::Stopped);

        let stats = engine.stats();
        assert!(stats.rollouts > 0);
        assert_eq!(stats.failed_rollouts, 0);
        assert!((1..=3).contains(&engine.get_best_move(0).unwrap()));
        assert_eq!(engine.get_best_move(1).unwrap(), 0);

        engine.stop();
        engine.tree().unwrap().check_invariants();
        print!("\n{:?}", engine.stats());
    }

    #[test]
    fn test_race_trims_to_fit() {
        let config = SearchConfig::for_testing().with_pool_sizes(200, 800, 20);
        let mut engine = setup(config, Race { length: 30 }, Runners::default(), NoHeuristic);

        for _ in 0..3_000 {
            if engine.grow_tree().unwrap() {
                break;
            }
        }

        let stats = engine.stats();
        assert!(stats.trims > 0);
        assert!(stats.nodes_in_use <= 200);
        let tree = engine.tree().unwrap();
        assert!(tree.edge_pool_stats().in_use <= 800);
        tree.check_invariants();
        assert!((1..=3).contains(&engine.get_best_move(0).unwrap()));
    }

    #[test]
    fn test_race_full_game() {
        let mut sm = Race { length: 20 };
        let mut state = Runners::default();
        let mut rng = StdRng::seed_from_u64(11);

        let config = SearchConfig::for_testing();
        let pool_sizes = config.pool_sizes;
        let mut engine = SearchEngine::new(config);
        engine
            .setup(sm.clone(), state, NoHeuristic, pool_sizes)
            .unwrap();

        let mut turns = 0;
        while !sm.is_terminal(&state).unwrap() {
            let binding = engine
                .start_search(Instant::now() + Duration::from_millis(25), state)
                .unwrap();
            if turns > 0 {
                // every successor of the previous root was created when it was expanded
                assert!(matches!(binding, RootBinding::Reused { .. }));
            }
            engine.search().unwrap();

            // role 0 follows the search, role 1 plays at random
            let joint = if state.to_move == 0 {
                vec![engine.get_best_move(0).unwrap(), 0]
            } else {
                let moves = sm.legal_moves(&state, 1).unwrap();
                vec![0, *moves.choose(&mut rng).unwrap()]
            };
            state = sm.next_state(&state, &joint).unwrap();
            turns += 1;
            assert!(turns <= 40);
        }

        engine.tree().unwrap().check_invariants();
        assert_eq!(sm.goal_value(&state, 0).unwrap(), 100);
    }

    #[test]
    fn test_heuristic_seeds_new_nodes() {
        let weight = 5;
        let mut engine = setup(
            SearchConfig::for_testing(),
            Race { length: 30 },
            Runners::default(),
            RaceLead { weight },
        );

        assert!(!engine.grow_tree().unwrap());
        let moves = engine.child_infos();
        assert_eq!(moves.len(), 3);

        let updates = moves
            .iter()
            .map(|m| m.node.as_ref().unwrap().updates)
            .collect::<Vec<_>>();
        assert!(updates.iter().all(|u| *u >= u64::from(weight)));
        // the seeds plus the one rollout
        assert_eq!(updates.iter().sum::<u64>(), 3 * u64::from(weight) + 1);

        // children without a rollout still carry their seed exactly
        for m in &moves {
            let node = m.node.as_ref().unwrap();
            assert!(node.heuristic_seeded);
            if node.updates == u64::from(weight) {
                let expected = 50.0 + 5.0 * f64::from(m.mv);
                assert!((node.scores[0] - expected).abs() < 1e-9);
            }
        }
    }
}
