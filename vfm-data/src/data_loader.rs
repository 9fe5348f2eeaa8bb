use crate::sparse_row::{Batch, SparseRow};
use rand::seq::SliceRandom;
use rand::Rng;

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    /// Take the `batch_idx`-th minibatch of the current shuffle
    fn minibatch(&self, batch_idx: usize) -> anyhow::Result<Batch>;

    fn num_minibatch(&self) -> usize;

    /// Reshuffle the samples and cut them into minibatches of
    /// exactly `batch_size` examples
    fn shuffle_minibatch<R: Rng + ?Sized>(
        &mut self,
        batch_size: usize,
        rng: &mut R,
    ) -> anyhow::Result<()>;

    /// Total number of observations in the data
    fn num_obs(&self) -> usize;

    /// Largest feature index referenced by any row
    fn max_feature_index(&self) -> Option<usize>;
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(size: usize) -> Self {
        Self {
            samples: (0..size).collect(),
            chunks: vec![],
        }
    }

    /// Shuffle, then chunk; the last chunk wraps around to the
    /// front of the shuffled order so every chunk has `batch_size`
    /// members.
    pub fn shuffle_minibatch<R: Rng + ?Sized>(&mut self, batch_size: usize, rng: &mut R) {
        let ntot = self.size();
        if ntot == 0 || batch_size == 0 {
            self.chunks.clear();
            return;
        }

        self.samples.shuffle(rng);
        let nbatch = ntot.div_ceil(batch_size);

        self.chunks = (0..nbatch)
            .map(|b| {
                let lb = b * batch_size;
                let ub = (b + 1) * batch_size;
                (lb..ub).map(|i| self.samples[i % ntot]).collect()
            })
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

///
/// A simple data loader for in-memory sparse rows. Each row is one
/// observed (feature vector, target) pair.
///
pub struct InMemoryData {
    rows: Vec<SparseRow>,
    targets: Vec<f32>,
    minibatches: Minibatches,
}

impl InMemoryData {
    pub fn new(rows: Vec<SparseRow>, targets: Vec<f32>) -> anyhow::Result<Self> {
        if rows.len() != targets.len() {
            anyhow::bail!("{} rows vs. {} targets", rows.len(), targets.len());
        }
        let minibatches = Minibatches::new(rows.len());
        Ok(Self {
            rows,
            targets,
            minibatches,
        })
    }

    pub fn rows(&self) -> &[SparseRow] {
        &self.rows
    }

    pub fn targets(&self) -> &[f32] {
        &self.targets
    }

    /// Everything as one batch, in storage order
    pub fn full_batch(&self) -> Batch {
        Batch {
            rows: self.rows.clone(),
            targets: self.targets.clone(),
        }
    }

    /// Consecutive batches in storage order, no shuffling
    pub fn ordered_batches(&self, batch_size: usize) -> Vec<Batch> {
        let batch_size = batch_size.max(1);
        self.rows
            .chunks(batch_size)
            .zip(self.targets.chunks(batch_size))
            .map(|(r, t)| Batch {
                rows: r.to_vec(),
                targets: t.to_vec(),
            })
            .collect()
    }
}

impl DataLoader for InMemoryData {
    fn minibatch(&self, batch_idx: usize) -> anyhow::Result<Batch> {
        let samples = self.minibatches.chunks.get(batch_idx).ok_or_else(|| {
            anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.num_minibatch()
            )
        })?;

        Ok(Batch {
            rows: samples.iter().map(|&i| self.rows[i].clone()).collect(),
            targets: samples.iter().map(|&i| self.targets[i]).collect(),
        })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch<R: Rng + ?Sized>(
        &mut self,
        batch_size: usize,
        rng: &mut R,
    ) -> anyhow::Result<()> {
        if batch_size == 0 {
            anyhow::bail!("batch size must be positive");
        }
        self.minibatches.shuffle_minibatch(batch_size, rng);
        Ok(())
    }

    fn num_obs(&self) -> usize {
        self.rows.len()
    }

    fn max_feature_index(&self) -> Option<usize> {
        self.rows.iter().filter_map(|r| r.max_index()).max()
    }
}
