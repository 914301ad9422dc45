//! Per-role score statistics stored in one contiguous buffer per moment.
//!
//! Every tree node needs a running mean and a running mean-of-squares for each role.  Rather than
//! giving each node two small heap-allocated vectors, the store keeps two flat buffers indexed by
//! `slot * roles + role`, where `slot` is the node's pool index.  Since pool slots are recycled,
//! the store never grows past the node pool's capacity.

/// Running first and second moments of every role's score, one vector per node pool slot.
#[derive(Debug, Clone)]
pub struct ScoreVectorStore {
    roles: usize,
    averages: Vec<f64>,
    squares: Vec<f64>,
}

impl ScoreVectorStore {
    /// Zeroed storage for `slots` vectors of `roles` scores.
    pub fn new(roles: usize, slots: usize) -> Self {
        assert!(roles > 0, "a game must have at least one role");
        Self {
            roles,
            averages: vec![0.0; roles * slots],
            squares: vec![0.0; roles * slots],
        }
    }

    /// Scores per vector.
    pub fn roles(&self) -> usize {
        self.roles
    }

    fn range(&self, slot: usize) -> std::ops::Range<usize> {
        let start = slot * self.roles;
        start..start + self.roles
    }

    /// Mean score of `role` at `slot`.
    pub fn average(&self, slot: usize, role: usize) -> f64 {
        debug_assert!(role < self.roles);
        self.averages[slot * self.roles + role]
    }

    /// Mean squared score of `role` at `slot`.
    pub fn average_squared(&self, slot: usize, role: usize) -> f64 {
        debug_assert!(role < self.roles);
        self.squares[slot * self.roles + role]
    }

    /// Mean scores of every role at `slot`.
    pub fn averages(&self, slot: usize) -> &[f64] {
        &self.averages[self.range(slot)]
    }

    /// Mean squared scores of every role at `slot`.
    pub fn squares(&self, slot: usize) -> &[f64] {
        &self.squares[self.range(slot)]
    }

    /// Overwrite the mean score of `role` at `slot`.
    pub fn set_average(&mut self, slot: usize, role: usize, value: f64) {
        debug_assert!(role < self.roles);
        self.averages[slot * self.roles + role] = value;
    }

    /// Overwrite the mean squared score of `role` at `slot`.
    pub fn set_average_squared(&mut self, slot: usize, role: usize, value: f64) {
        debug_assert!(role < self.roles);
        self.squares[slot * self.roles + role] = value;
    }

    /// Overwrite both moments of a slot with an exact score vector.
    pub fn set_exact(&mut self, slot: usize, scores: &[f64]) {
        debug_assert_eq!(scores.len(), self.roles);
        let range = self.range(slot);
        for (role, (avg, sq)) in self.averages[range.clone()]
            .iter_mut()
            .zip(&mut self.squares[range])
            .enumerate()
        {
            *avg = scores[role];
            *sq = scores[role] * scores[role];
        }
    }

    /// Overwrite both moments of a slot.
    pub fn set(&mut self, slot: usize, averages: &[f64], squares: &[f64]) {
        let range = self.range(slot);
        self.averages[range.clone()].copy_from_slice(averages);
        self.squares[range].copy_from_slice(squares);
    }

    /// Fold one sample (with its own squared term) into the running means of a slot that has
    /// already absorbed `weight_so_far` samples, giving the new sample `weight`.
    pub fn accumulate(
        &mut self,
        slot: usize,
        averages: &[f64],
        squares: &[f64],
        weight_so_far: f64,
        weight: f64,
    ) {
        debug_assert_eq!(averages.len(), self.roles);
        let total = weight_so_far + weight;
        if total <= 0.0 {
            return;
        }
        let range = self.range(slot);
        for (role, (avg, sq)) in self.averages[range.clone()]
            .iter_mut()
            .zip(&mut self.squares[range])
            .enumerate()
        {
            *avg = (*avg * weight_so_far + averages[role] * weight) / total;
            *sq = (*sq * weight_so_far + squares[role] * weight) / total;
        }
    }

    /// Zero the vectors at `slot`.
    pub fn reset(&mut self, slot: usize) {
        let range = self.range(slot);
        self.averages[range.clone()].iter_mut().for_each(|v| *v = 0.0);
        self.squares[range].iter_mut().for_each(|v| *v = 0.0);
    }
}
