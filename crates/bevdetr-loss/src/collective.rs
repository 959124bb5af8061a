//! Cross-worker reduction used to normalize losses by the global object count.
//!
//! Process-group setup is owned by the training launcher; the loss engine only needs a
//! blocking all-reduce of one scalar. [`SingleProcess`] covers non-distributed runs and
//! [`InProcessGroup`] connects workers living in threads of the same process.

use std::{
    fmt,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use thiserror::Error;

/// Failure of a collective operation. Fatal for the current step.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectiveError {
    /// Not every worker reached the reduction before the timeout elapsed.
    #[error("all-reduce timed out after {timeout:?}: {arrived} of {world_size} workers arrived")]
    Timeout {
        timeout: Duration,
        arrived: usize,
        world_size: usize,
    },

    /// Another worker panicked while holding the group state.
    #[error("collective group state is poisoned")]
    Poisoned,

    /// The contributed value cannot be reduced.
    #[error("cannot reduce non-finite value {value}")]
    NonFinite { value: f64 },
}

/// A specialized `Result` type for collective operations.
pub type CollectiveResult<T> = Result<T, CollectiveError>;

/// Blocking scalar collectives over a fixed group of workers.
pub trait Collective: fmt::Debug + Send + Sync {
    /// Number of participating workers.
    fn world_size(&self) -> usize;

    /// Sum `value` over every worker. Blocks until all workers contributed.
    fn all_reduce_sum(&self, value: f64) -> CollectiveResult<f64>;

    /// Average `value` over every worker.
    fn all_reduce_mean(&self, value: f64) -> CollectiveResult<f64> {
        let world_size = self.world_size().max(1) as f64;
        Ok(self.all_reduce_sum(value)? / world_size)
    }
}

/// The non-distributed context: a world of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, value: f64) -> CollectiveResult<f64> {
        Ok(value)
    }
}

#[derive(Debug, Default)]
struct Round {
    generation: u64,
    arrived: usize,
    sum: f64,
    result: f64,
}

#[derive(Debug)]
struct Shared {
    round: Mutex<Round>,
    all_arrived: Condvar,
}

/// One worker's handle on a group of threads that reduce through shared memory.
///
/// Every handle must call [`Collective::all_reduce_sum`] the same number of times; each
/// call is a barrier over all handles of the group.
#[derive(Debug, Clone)]
pub struct InProcessGroup {
    shared: Arc<Shared>,
    rank: usize,
    world_size: usize,
    timeout: Duration,
}

impl InProcessGroup {
    /// Create the handles of a group of `world_size` workers, one per rank.
    ///
    /// # Panics
    ///
    /// Panics if `world_size` is zero.
    pub fn new(world_size: usize, timeout: Duration) -> Vec<Self> {
        assert!(world_size > 0, "InProcessGroup needs at least one worker");

        let shared = Arc::new(Shared {
            round: Mutex::new(Round::default()),
            all_arrived: Condvar::new(),
        });

        (0..world_size)
            .map(|rank| Self {
                shared: Arc::clone(&shared),
                rank,
                world_size,
                timeout,
            })
            .collect()
    }

    /// Rank of this handle within the group.
    pub const fn rank(&self) -> usize {
        self.rank
    }
}

impl Collective for InProcessGroup {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, value: f64) -> CollectiveResult<f64> {
        if !value.is_finite() {
            return Err(CollectiveError::NonFinite { value });
        }

        let mut round = self
            .shared
            .round
            .lock()
            .map_err(|_| CollectiveError::Poisoned)?;

        round.sum += value;
        round.arrived += 1;
        let generation = round.generation;

        if round.arrived == self.world_size {
            round.result = round.sum;
            round.sum = 0.0;
            round.arrived = 0;
            round.generation = round.generation.wrapping_add(1);
            self.shared.all_arrived.notify_all();
            return Ok(round.result);
        }

        let (mut round, wait) = self
            .shared
            .all_arrived
            .wait_timeout_while(round, self.timeout, |round| round.generation == generation)
            .map_err(|_| CollectiveError::Poisoned)?;

        if wait.timed_out() && round.generation == generation {
            let arrived = round.arrived;
            // Withdraw so a later round does not see this contribution twice.
            round.sum -= value;
            round.arrived -= 1;
            tracing::warn!(rank = self.rank, arrived, "all-reduce timed out");
            return Err(CollectiveError::Timeout {
                timeout: self.timeout,
                arrived,
                world_size: self.world_size,
            });
        }

        Ok(round.result)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn single_process_is_identity() {
        let collective = SingleProcess;

        assert_eq!(collective.world_size(), 1);
        assert_eq!(collective.all_reduce_sum(7.0), Ok(7.0));
        assert_eq!(collective.all_reduce_mean(7.0), Ok(7.0));
    }

    #[test]
    fn in_process_group_sums_across_threads() {
        let handles = InProcessGroup::new(3, Duration::from_secs(5));

        let workers = handles
            .into_iter()
            .map(|handle| {
                thread::spawn(move || {
                    let first = handle.all_reduce_sum(handle.rank() as f64 + 1.0);
                    let second = handle.all_reduce_mean(10.0);
                    (first, second)
                })
            })
            .collect::<Vec<_>>();

        for worker in workers {
            let (first, second) = worker.join().expect("worker thread panicked");
            assert_eq!(first, Ok(6.0));
            assert_eq!(second, Ok(10.0));
        }
    }

    #[test]
    fn in_process_group_times_out_without_peers() {
        let mut handles = InProcessGroup::new(2, Duration::from_millis(20));
        let lonely = handles.remove(0);

        match lonely.all_reduce_sum(1.0) {
            Err(CollectiveError::Timeout {
                arrived,
                world_size,
                ..
            }) => {
                assert_eq!(arrived, 1);
                assert_eq!(world_size, 2);
            }
            other => panic!("Expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn in_process_group_rejects_non_finite_values() {
        let handles = InProcessGroup::new(1, Duration::from_millis(20));

        assert!(matches!(
            handles[0].all_reduce_sum(f64::NAN),
            Err(CollectiveError::NonFinite { .. })
        ));
    }
}
