//! Collective communication between workers training one model.
//!
//! Every worker owns a [`Communicator`]. Collective calls block until all workers
//! of the group reach the same call; workers must therefore issue collectives in the
//! same order. The single-process case uses [`NoopCommunicator`], in which every
//! collective is the identity.

mod in_memory;

pub use in_memory::{InMemoryCommunicator, run_distributed};

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{LearnerError, Result};

/// Transport used by the learner to keep workers consistent.
pub trait Communicator: Send + Sync + Debug {
    fn world_size(&self) -> usize;

    fn rank(&self) -> usize;

    /// Gather `data` from every worker, indexed by rank.
    fn allgather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Element-wise sum across workers. Summation runs in rank order on every
    /// worker, so the result is bit-identical everywhere.
    fn allreduce_sum(&self, values: &mut [f64]) -> Result<()> {
        if self.world_size() == 1 {
            return Ok(());
        }
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let gathered = self.allgather(&bytes)?;
        values.iter_mut().for_each(|v| *v = 0.0);
        for part in &gathered {
            let decoded = decode_f64(part)?;
            if decoded.len() != values.len() {
                return Err(LearnerError::Collective(format!(
                    "allreduce length mismatch: expected {}, got {}",
                    values.len(),
                    decoded.len()
                )));
            }
            for (v, d) in values.iter_mut().zip(decoded) {
                *v += d;
            }
        }
        Ok(())
    }

    /// Replace `data` on every worker with the buffer of `root`.
    fn broadcast(&self, data: &mut Vec<u8>, root: usize) -> Result<()> {
        if self.world_size() == 1 {
            return Ok(());
        }
        let payload: &[u8] = if self.rank() == root { data.as_slice() } else { &[] };
        let mut gathered = self.allgather(payload)?;
        if root >= gathered.len() {
            return Err(LearnerError::Collective(format!("broadcast root {root} out of range")));
        }
        *data = std::mem::take(&mut gathered[root]);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.allgather(&[]).map(|_| ())
    }

    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }
}

/// Communicator for a single process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCommunicator;

impl Communicator for NoopCommunicator {
    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn allgather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(vec![data.to_vec()])
    }
}

/// Shared handle used by learners.
pub type SharedCommunicator = Arc<dyn Communicator>;

/// Default single-process communicator.
pub fn local() -> SharedCommunicator {
    Arc::new(NoopCommunicator)
}

/// Threads each worker may use when `world_size` workers share one host.
pub fn worker_local_threads(world_size: usize) -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (cores / world_size.max(1)).max(1)
}

// =============================================================================
// Helpers
// =============================================================================

pub(crate) fn encode_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(LearnerError::Collective("truncated f32 buffer".into()));
    }
    Ok(bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
}

fn decode_f64(bytes: &[u8]) -> Result<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(LearnerError::Collective("truncated f64 buffer".into()));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

const STATUS_OK: u8 = 1;
const STATUS_ERR: u8 = 0;

/// Run `f` on rank 0 only and broadcast its result.
///
/// Used for label-dependent computations when labels may be held by rank 0 alone,
/// or when every worker must persist bit-identical values. A failure on rank 0 is
/// reported on every worker.
pub fn apply_with_labels(
    comm: &dyn Communicator,
    f: impl FnOnce() -> Result<Vec<f32>>,
) -> Result<Vec<f32>> {
    if !comm.is_distributed() {
        return f();
    }
    let mut buf = Vec::new();
    if comm.rank() == 0 {
        match f() {
            Ok(values) => {
                buf.push(STATUS_OK);
                buf.extend(encode_f32(&values));
            }
            Err(err) => {
                buf.push(STATUS_ERR);
                buf.extend(err.to_string().into_bytes());
            }
        }
    }
    comm.broadcast(&mut buf, 0)?;
    match buf.split_first() {
        Some((&STATUS_OK, payload)) => decode_f32(payload),
        Some((_, msg)) => Err(LearnerError::Collective(format!(
            "rank 0 failed: {}",
            String::from_utf8_lossy(msg)
        ))),
        None => Err(LearnerError::Collective("empty broadcast from rank 0".into())),
    }
}

/// Fail unless every worker passes the same `fingerprint`.
pub fn check_consistent(comm: &dyn Communicator, what: &str, fingerprint: &[u8]) -> Result<()> {
    if !comm.is_distributed() {
        return Ok(());
    }
    let gathered = comm.allgather(fingerprint)?;
    match gathered.iter().position(|g| g.as_slice() != gathered[0].as_slice()) {
        Some(rank) => Err(LearnerError::compatibility(format!(
            "{what} differs between rank 0 and rank {rank}"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_collectives_are_identity() {
        let comm = NoopCommunicator;
        let mut values = [1.5, 2.5];
        comm.allreduce_sum(&mut values).unwrap();
        assert_eq!(values, [1.5, 2.5]);

        let mut buf = vec![7u8];
        comm.broadcast(&mut buf, 0).unwrap();
        assert_eq!(buf, vec![7]);
        assert_eq!(apply_with_labels(&comm, || Ok(vec![0.25])).unwrap(), vec![0.25]);
    }

    #[test]
    fn f32_codec_round_trips() {
        let values = [0.1f32, -3.5, f32::MAX];
        assert_eq!(decode_f32(&encode_f32(&values)).unwrap(), values);
        assert!(decode_f32(&[0, 1, 2]).is_err());
    }

    #[test]
    fn worker_threads_are_positive() {
        assert!(worker_local_threads(1024) >= 1);
    }
}
