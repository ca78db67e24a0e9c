use std::ops::Range;
use std::sync::Arc;
use std::thread;

use anyhow::{Result, anyhow, bail, ensure};
use candle_core::{D, Tensor};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpInfo {
    pub rank: usize,
    pub world_size: usize,
}

impl TpInfo {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        ensure!(
            world_size > 0,
            "tensor parallel world_size must be positive"
        );
        ensure!(
            rank < world_size,
            "tensor parallel rank must be in [0, world_size)"
        );
        Ok(Self { rank, world_size })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpBackend {
    None,
    Local,
}

/// Rendezvous point for ranks that live in the same process.
///
/// Every collective is two barrier phases: each rank publishes its tensor,
/// then all ranks read the full set before anyone may publish again. A rank
/// that fails poisons the group, and every pending or later wait returns an
/// error instead of blocking.
#[derive(Debug)]
pub struct LocalGroup {
    world_size: usize,
    state: Mutex<BarrierState>,
    arrived: Condvar,
    slots: Mutex<Vec<Option<Tensor>>>,
}

#[derive(Debug, Default)]
struct BarrierState {
    waiting: usize,
    generation: u64,
    poisoned_by: Option<usize>,
}

impl LocalGroup {
    pub fn new(world_size: usize) -> Result<Arc<Self>> {
        ensure!(world_size > 0, "local group world_size must be positive");
        Ok(Arc::new(Self {
            world_size,
            state: Mutex::new(BarrierState::default()),
            arrived: Condvar::new(),
            slots: Mutex::new(vec![None; world_size]),
        }))
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Marks the group as failed by `rank` and wakes every waiting peer.
    pub fn poison(&self, rank: usize) {
        let mut state = self.state.lock();
        if state.poisoned_by.is_none() {
            state.poisoned_by = Some(rank);
        }
        self.arrived.notify_all();
    }

    pub fn poisoned_by(&self) -> Option<usize> {
        self.state.lock().poisoned_by
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(peer) = state.poisoned_by {
            bail!("tensor parallel group aborted by rank {}", peer);
        }
        state.waiting += 1;
        if state.waiting == self.world_size {
            state.waiting = 0;
            state.generation += 1;
            self.arrived.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        while state.generation == generation && state.poisoned_by.is_none() {
            self.arrived.wait(&mut state);
        }
        match state.poisoned_by {
            Some(peer) if state.generation == generation => {
                bail!("tensor parallel group aborted by rank {}", peer)
            }
            _ => Ok(()),
        }
    }

    fn exchange(&self, rank: usize, x: &Tensor) -> Result<Vec<Tensor>> {
        ensure!(rank < self.world_size, "rank {} outside local group", rank);
        self.slots.lock()[rank] = Some(x.clone());
        self.wait()?;
        let gathered = {
            let slots = self.slots.lock();
            slots
                .iter()
                .enumerate()
                .map(|(peer, slot)| {
                    slot.clone()
                        .ok_or_else(|| anyhow!("rank {} did not publish a tensor", peer))
                })
                .collect::<Result<Vec<_>>>()
        };
        self.wait()?;
        gathered
    }
}

/// Poisons the group unless the rank finished successfully, including on unwind.
struct AbortOnFailure<'a> {
    group: &'a LocalGroup,
    rank: usize,
    succeeded: bool,
}

impl Drop for AbortOnFailure<'_> {
    fn drop(&mut self) {
        if !self.succeeded {
            self.group.poison(self.rank);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Comm {
    info: TpInfo,
    backend: TpBackend,
    group: Option<Arc<LocalGroup>>,
}

impl Comm {
    pub fn single() -> Self {
        Self {
            info: TpInfo {
                rank: 0,
                world_size: 1,
            },
            backend: TpBackend::None,
            group: None,
        }
    }

    pub fn from_group(rank: usize, group: Arc<LocalGroup>) -> Result<Self> {
        let info = TpInfo::new(rank, group.world_size())?;
        if info.world_size == 1 {
            return Ok(Self::single());
        }
        Ok(Self {
            info,
            backend: TpBackend::Local,
            group: Some(group),
        })
    }

    pub fn rank(&self) -> usize {
        self.info.rank
    }

    pub fn world_size(&self) -> usize {
        self.info.world_size
    }

    pub fn backend(&self) -> TpBackend {
        self.backend
    }

    pub fn shard_range(&self, total: usize) -> Result<Range<usize>> {
        shard_range(total, self.info.rank, self.info.world_size)
    }

    pub fn shard_size(&self, total: usize) -> Result<usize> {
        shard_size(total, self.info.world_size)
    }

    /// Element-wise sum over all ranks, accumulated in rank order.
    pub fn all_reduce_sum(&self, x: &Tensor) -> Result<Tensor> {
        let Some(group) = self.group.as_ref() else {
            return Ok(x.clone());
        };
        let parts = group.exchange(self.info.rank, x)?;
        let mut acc = parts[0].to_device(x.device())?;
        for part in &parts[1..] {
            acc = (acc + part.to_device(x.device())?)?;
        }
        Ok(acc)
    }

    /// Concatenates every rank's tensor along the last dimension.
    pub fn all_gather(&self, x: &Tensor) -> Result<Tensor> {
        let Some(group) = self.group.as_ref() else {
            return Ok(x.clone());
        };
        let parts = group
            .exchange(self.info.rank, x)?
            .into_iter()
            .map(|part| part.to_device(x.device()))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let refs: Vec<&Tensor> = parts.iter().collect();
        Ok(Tensor::cat(&refs, D::Minus1)?)
    }
}

/// Runs `f` once per rank on its own thread and returns the results in rank order.
///
/// When a rank fails, its peers are released from their collectives and the
/// failing rank's error is returned.
pub fn run_tensor_parallel<T, F>(world_size: usize, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(Comm) -> Result<T> + Sync,
{
    ensure!(world_size > 0, "world_size must be positive");
    if world_size == 1 {
        return Ok(vec![f(Comm::single())?]);
    }
    let group = LocalGroup::new(world_size)?;
    let results: Vec<Result<T>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let group = Arc::clone(&group);
                let f = &f;
                scope.spawn(move || {
                    let mut guard = AbortOnFailure {
                        group: &group,
                        rank,
                        succeeded: false,
                    };
                    let result = Comm::from_group(rank, Arc::clone(&group)).and_then(f);
                    guard.succeeded = result.is_ok();
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("tensor parallel rank {} panicked", rank)),
            })
            .collect()
    });

    let culprit = group.poisoned_by();
    let mut outputs = Vec::with_capacity(world_size);
    let mut first_error = None;
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(output) => outputs.push(output),
            Err(err) if culprit == Some(rank) => return Err(err),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(outputs),
    }
}

pub fn shard_range(total: usize, rank: usize, world_size: usize) -> Result<Range<usize>> {
    ensure!(world_size > 0, "world_size must be positive");
    ensure!(rank < world_size, "rank must be < world_size");
    ensure!(
        total.is_multiple_of(world_size),
        "dimension {} must be divisible by world_size {}",
        total,
        world_size
    );
    let size = total / world_size;
    let start = rank * size;
    let end = start + size;
    Ok(start..end)
}

pub fn shard_size(total: usize, world_size: usize) -> Result<usize> {
    ensure!(world_size > 0, "world_size must be positive");
    ensure!(
        total.is_multiple_of(world_size),
        "dimension {} must be divisible by world_size {}",
        total,
        world_size
    );
    Ok(total / world_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn shard_range_splits_evenly() {
        assert_eq!(shard_range(8, 0, 2).unwrap(), 0..4);
        assert_eq!(shard_range(8, 1, 2).unwrap(), 4..8);
        assert!(shard_range(7, 0, 2).is_err());
        assert!(shard_range(8, 2, 2).is_err());
    }

    #[test]
    fn single_rank_collectives_are_identity() {
        let comm = Comm::single();
        let x = Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap();
        let reduced = comm.all_reduce_sum(&x).unwrap();
        let gathered = comm.all_gather(&x).unwrap();
        assert_eq!(reduced.to_vec1::<f32>().unwrap(), vec![1., 2., 3.]);
        assert_eq!(gathered.to_vec1::<f32>().unwrap(), vec![1., 2., 3.]);
        assert_eq!(comm.backend(), TpBackend::None);
    }

    #[test]
    fn local_group_reduces_and_gathers() {
        let results = run_tensor_parallel(3, |comm| {
            let value = comm.rank() as f32 + 1.0;
            let x = Tensor::new(&[[value, 10.0 * value]], &Device::Cpu)?;
            let reduced = comm.all_reduce_sum(&x)?.to_vec2::<f32>()?;
            let gathered = comm.all_gather(&x)?.to_vec2::<f32>()?;
            Ok((reduced, gathered))
        })
        .unwrap();
        for (reduced, gathered) in results {
            assert_eq!(reduced, vec![vec![6.0, 60.0]]);
            assert_eq!(gathered, vec![vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0]]);
        }
    }

    #[test]
    fn failing_rank_releases_peers_blocked_in_collectives() {
        let result = run_tensor_parallel(2, |comm| {
            if comm.rank() == 1 {
                bail!("rank 1 could not load its slice");
            }
            let x = Tensor::new(&[1f32, 2.], &Device::Cpu)?;
            comm.all_reduce_sum(&x)
        });
        let err = result.unwrap_err().to_string();
        assert!(err.contains("could not load its slice"), "{err}");
    }

    #[test]
    fn failure_between_collectives_is_reported() {
        let result = run_tensor_parallel(3, |comm| {
            let x = Tensor::new(&[comm.rank() as f32], &Device::Cpu)?;
            let sum = comm.all_reduce_sum(&x)?;
            if comm.rank() == 2 {
                bail!("shape mismatch on rank 2");
            }
            comm.all_gather(&sum)
        });
        let err = result.unwrap_err().to_string();
        assert!(err.contains("shape mismatch on rank 2"), "{err}");
    }

    #[test]
    fn panicking_rank_aborts_the_group() {
        let result = run_tensor_parallel(2, |comm| {
            if comm.rank() == 0 {
                panic!("rank 0 failed");
            }
            let x = Tensor::new(&[1f32], &Device::Cpu)?;
            comm.all_gather(&x)
        });
        let err = result.unwrap_err().to_string();
        assert!(err.contains("rank 0 panicked"), "{err}");
    }

    #[test]
    fn poisoned_group_rejects_later_waits() {
        let group = LocalGroup::new(2).unwrap();
        group.poison(1);
        assert_eq!(group.poisoned_by(), Some(1));
        let comm = Comm::from_group(0, Arc::clone(&group)).unwrap();
        let x = Tensor::new(&[1f32], &Device::Cpu).unwrap();
        assert!(comm.all_reduce_sum(&x).is_err());
    }
}
