use rand::seq::SliceRandom;
use rand_core::RngCore;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("No methods to schedule")]
    NoMethods,
}

/// A `Scheduler` decides which method the engine invokes next.
///
/// Methods are identified by their index in the schema's method list.
pub trait Scheduler: Send + Sync {
    /// Selects the index of the next method to invoke.
    fn next(&mut self, rng: &mut dyn RngCore) -> Result<usize, SchedulerError>;

    /// Number of complete passes over the method list so far.
    fn passes(&self) -> u64;
}

/// Visits methods in a fresh random permutation each pass, so every method is
/// attempted exactly once per pass before any method repeats.
#[derive(Debug, Clone)]
pub struct ShuffleScheduler {
    order: Vec<usize>,
    cursor: usize,
    passes: u64,
}

impl ShuffleScheduler {
    pub fn new(method_count: usize) -> Self {
        Self {
            order: (0..method_count).collect(),
            cursor: method_count,
            passes: 0,
        }
    }
}

impl Scheduler for ShuffleScheduler {
    fn next(&mut self, rng: &mut dyn RngCore) -> Result<usize, SchedulerError> {
        if self.order.is_empty() {
            return Err(SchedulerError::NoMethods);
        }
        if self.cursor == self.order.len() {
            self.order.shuffle(rng);
            self.cursor = 0;
        }
        let index = self.order[self.cursor];
        self.cursor += 1;
        if self.cursor == self.order.len() {
            self.passes += 1;
        }
        Ok(index)
    }

    fn passes(&self) -> u64 {
        self.passes
    }
}
