//! In-process worker group, one thread per rank.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::{Communicator, SharedCommunicator};
use crate::error::{LearnerError, Result};

#[derive(Debug, Default)]
struct Round {
    slots: Vec<Option<Vec<u8>>>,
    arrived: usize,
    result: Option<Arc<Vec<Vec<u8>>>>,
    departed: usize,
    closed: bool,
}

#[derive(Debug)]
struct Rendezvous {
    world_size: usize,
    round: Mutex<Round>,
    cond: Condvar,
}

impl Rendezvous {
    fn lock(&self) -> Result<MutexGuard<'_, Round>> {
        self.round
            .lock()
            .map_err(|_| LearnerError::Collective("worker group state poisoned".into()))
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Round>) -> Result<MutexGuard<'a, Round>> {
        self.cond
            .wait(guard)
            .map_err(|_| LearnerError::Collective("worker group state poisoned".into()))
    }
}

/// Communicator for one rank of an in-process worker group.
///
/// Dropping a communicator closes the group: peers blocked in a collective fail
/// instead of waiting forever.
#[derive(Debug)]
pub struct InMemoryCommunicator {
    rank: usize,
    shared: Arc<Rendezvous>,
}

impl InMemoryCommunicator {
    /// Create the communicators of a group of `world_size` workers.
    pub fn group(world_size: usize) -> Vec<InMemoryCommunicator> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Rendezvous {
            world_size,
            round: Mutex::new(Round { slots: vec![None; world_size], ..Default::default() }),
            cond: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| InMemoryCommunicator { rank, shared: Arc::clone(&shared) })
            .collect()
    }
}

impl Communicator for InMemoryCommunicator {
    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn allgather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let shared = &self.shared;
        let peer_left = || LearnerError::Collective("a worker left the group".into());

        let mut round = shared.lock()?;
        // The previous round is still being read by slower workers.
        while round.result.is_some() && !round.closed {
            round = shared.wait(round)?;
        }
        if round.closed {
            return Err(peer_left());
        }

        round.slots[self.rank] = Some(data.to_vec());
        round.arrived += 1;
        if round.arrived == shared.world_size {
            let gathered = round.slots.iter_mut().map(|s| s.take().unwrap_or_default()).collect();
            round.result = Some(Arc::new(gathered));
            round.arrived = 0;
            shared.cond.notify_all();
        } else {
            loop {
                if round.result.is_some() {
                    break;
                }
                if round.closed {
                    return Err(peer_left());
                }
                round = shared.wait(round)?;
            }
        }

        let out = round.result.as_ref().map(|r| r.as_ref().clone()).unwrap_or_default();
        round.departed += 1;
        if round.departed == shared.world_size {
            round.departed = 0;
            round.result = None;
            shared.cond.notify_all();
        }
        Ok(out)
    }
}

impl Drop for InMemoryCommunicator {
    fn drop(&mut self) {
        if let Ok(mut round) = self.shared.round.lock() {
            round.closed = true;
        }
        self.shared.cond.notify_all();
    }
}

/// Run `f` once per rank on its own thread and collect the results by rank.
///
/// A panic on any worker is resumed on the caller after all threads finish.
pub fn run_distributed<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(SharedCommunicator) -> T + Sync,
{
    let comms = InMemoryCommunicator::group(world_size);
    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = &f;
                scope.spawn(move || f(Arc::new(comm)))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload)))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allgather_orders_by_rank() {
        let results = run_distributed(3, |comm| {
            let mine = vec![comm.rank() as u8; comm.rank() + 1];
            comm.allgather(&mine).unwrap()
        });
        for gathered in results {
            assert_eq!(gathered, vec![vec![0], vec![1, 1], vec![2, 2, 2]]);
        }
    }

    #[test]
    fn repeated_collectives_stay_in_step() {
        let results = run_distributed(4, |comm| {
            let mut total = 0.0;
            for round in 0..20 {
                let mut v = [comm.rank() as f64 + round as f64];
                comm.allreduce_sum(&mut v).unwrap();
                total += v[0];
            }
            total
        });
        // Each round sums 0+1+2+3 + 4*round.
        let expected: f64 = (0..20).map(|r| 6.0 + 4.0 * r as f64).sum();
        assert!(results.iter().all(|&t| t == expected));
    }

    #[test]
    fn broadcast_from_root() {
        let results = run_distributed(3, |comm| {
            let mut buf = if comm.rank() == 2 { b"hello".to_vec() } else { Vec::new() };
            comm.broadcast(&mut buf, 2).unwrap();
            buf
        });
        assert!(results.iter().all(|b| b == b"hello"));
    }

    #[test]
    fn dropped_peer_fails_collective() {
        let results = run_distributed(2, |comm| {
            if comm.rank() == 1 {
                return true;
            }
            comm.barrier().is_err()
        });
        assert!(results[0]);
    }
}
