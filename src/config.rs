//! Search configuration parameters.

use std::time::Duration;

/// Capacities of the slot pools backing the search graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSizes {
    /// Maximum number of live tree nodes.
    pub nodes: usize,
    /// Maximum number of live tree edges.
    pub edges: usize,
    /// Trimming starts once fewer than this many slots remain free in either pool.
    pub low_water_mark: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            nodes: 200_000,
            edges: 1_000_000,
            low_water_mark: 200,
        }
    }
}

/// Adjustments blended into the goal values of terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TerminalBonus {
    /// Subtracted from every role that does not hold the unique top goal.
    pub win: f64,
    /// Added to every role when all roles finish with the same goal (multi-role games only).
    pub draw: f64,
}

/// Configuration for a [`SearchEngine`](crate::SearchEngine).
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Capacities of the node and edge pools.
    pub pool_sizes: PoolSizes,

    /// Number of rollout worker threads.  With `0` every rollout is executed inline by the tree
    /// thread, which makes a search fully reproducible for a given `seed`.
    pub worker_count: usize,

    /// Maximum number of in-flight rollout requests per worker shard.
    pub pipeline_capacity: usize,

    /// Multiplier on the UCT exploration term.
    pub exploration_bias: f64,

    /// Upper bound of the random perturbation used to break selection ties.  Scores are
    /// normalized to 0..1 during selection, so this must stay far below 0.01.
    pub tie_break_noise: f64,

    /// Independent playouts averaged into each rollout result.
    pub sample_size: usize,

    /// Playouts are abandoned (and scored from the last state reached) after this many moves.
    pub rollout_depth_limit: usize,

    /// Down-weight playouts that are much longer than the running average playout length.
    pub playout_length_decay: bool,

    /// Before sampling, check whether a single move from the rollout state reaches a terminal
    /// state that is an outright win for the mover.
    pub greedy_terminal_check: bool,

    /// Adjustments applied to the goal values of terminal states.
    pub terminal_bonus: TerminalBonus,

    /// Weight of the worst case against the average when completing a simultaneous-move level
    /// (the default is a 100:1 blend).
    pub simultaneous_floor_weight: f64,

    /// How long a waiting thread spins before it starts yielding its time slice.
    pub spin_limit: Duration,

    /// Sleep increment of the driver loop while yielded or waiting.
    pub idle_sleep: Duration,

    /// Upper bound on trimming passes performed in one iteration.
    pub max_trims_per_iteration: usize,

    /// Seed for the tree thread's and the workers' random number generators.
    pub seed: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            pool_sizes: PoolSizes::default(),
            worker_count: 2,
            pipeline_capacity: 64,
            exploration_bias: 1.0,
            tie_break_noise: 1e-6,
            sample_size: 1,
            rollout_depth_limit: 1_000,
            playout_length_decay: true,
            greedy_terminal_check: true,
            terminal_bonus: TerminalBonus::default(),
            simultaneous_floor_weight: 100.0,
            spin_limit: Duration::from_millis(1),
            idle_sleep: Duration::from_millis(1),
            max_trims_per_iteration: 16,
            seed: None,
        }
    }
}

impl SearchConfig {
    /// A small, deterministic configuration: rollouts run inline on the tree thread.
    pub fn for_testing() -> Self {
        Self {
            pool_sizes: PoolSizes {
                nodes: 10_000,
                edges: 40_000,
                low_water_mark: 50,
            },
            worker_count: 0,
            pipeline_capacity: 4,
            seed: Some(0),
            ..Self::default()
        }
    }

    /// Builder pattern: set the pool capacities.
    pub fn with_pool_sizes(mut self, nodes: usize, edges: usize, low_water_mark: usize) -> Self {
        self.pool_sizes = PoolSizes {
            nodes,
            edges,
            low_water_mark,
        };
        self
    }

    /// Builder pattern: set the number of rollout workers.
    pub fn with_workers(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    /// Builder pattern: set the per-shard pipeline capacity.
    pub fn with_pipeline_capacity(mut self, n: usize) -> Self {
        self.pipeline_capacity = n;
        self
    }

    /// Builder pattern: set the exploration bias.
    pub fn with_exploration_bias(mut self, c: f64) -> Self {
        self.exploration_bias = c;
        self
    }

    /// Builder pattern: set the number of playouts per rollout request.
    pub fn with_sample_size(mut self, n: usize) -> Self {
        self.sample_size = n;
        self
    }

    /// Builder pattern: set the terminal bonuses.
    pub fn with_terminal_bonus(mut self, win: f64, draw: f64) -> Self {
        self.terminal_bonus = TerminalBonus { win, draw };
        self
    }

    /// Builder pattern: set the weight of the worst case in simultaneous-move floor analysis.
    pub fn with_floor_weight(mut self, weight: f64) -> Self {
        self.simultaneous_floor_weight = weight;
        self
    }

    /// Builder pattern: set the rng seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.worker_count.max(1)
    }
}
