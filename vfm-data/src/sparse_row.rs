/// One example of the sparse design matrix: active feature indices
/// and the values at those indices.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseRow {
    indices: Vec<usize>,
    values: Vec<f32>,
}

impl SparseRow {
    pub fn new(indices: Vec<usize>, values: Vec<f32>) -> anyhow::Result<Self> {
        if indices.len() != values.len() {
            anyhow::bail!(
                "{} indices vs. {} values in a sparse row",
                indices.len(),
                values.len()
            );
        }
        Ok(Self { indices, values })
    }

    /// Indicator row with value 1 at each index
    pub fn one_hot(indices: &[usize]) -> Self {
        Self {
            indices: indices.to_vec(),
            values: vec![1.0; indices.len()],
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn max_index(&self) -> Option<usize> {
        self.indices.iter().copied().max()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.indices.iter().copied().zip(self.values.iter().copied())
    }
}

/// Rows padded to a common width `max_nnz`; padded slots carry
/// index 0 and value 0, so they contribute nothing to a prediction.
#[derive(Clone, Debug, PartialEq)]
pub struct PaddedRows {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
    pub nrows: usize,
    pub max_nnz: usize,
}

/// A minibatch: sparse rows with one target each
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    pub rows: Vec<SparseRow>,
    pub targets: Vec<f32>,
}

impl Batch {
    pub fn new(rows: Vec<SparseRow>, targets: Vec<f32>) -> anyhow::Result<Self> {
        if rows.len() != targets.len() {
            anyhow::bail!("{} rows vs. {} targets", rows.len(), targets.len());
        }
        Ok(Self { rows, targets })
    }

    /// Rows without targets, e.g. for scoring
    pub fn unlabelled(rows: Vec<SparseRow>) -> Self {
        let targets = vec![0.0; rows.len()];
        Self { rows, targets }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn max_nnz(&self) -> usize {
        self.rows.iter().map(|r| r.nnz()).max().unwrap_or(0)
    }

    pub fn max_index(&self) -> Option<usize> {
        self.rows.iter().filter_map(|r| r.max_index()).max()
    }

    /// Distinct active feature indices in ascending order
    pub fn active_features(&self) -> Vec<usize> {
        let mut active: Vec<usize> = self
            .rows
            .iter()
            .flat_map(|r| r.indices().iter().copied())
            .collect();
        active.sort_unstable();
        active.dedup();
        active
    }

    /// Flatten into row-major `nrows x max_nnz` buffers
    pub fn padded(&self) -> PaddedRows {
        let nrows = self.len();
        let max_nnz = self.max_nnz();
        let mut indices = vec![0u32; nrows * max_nnz];
        let mut values = vec![0f32; nrows * max_nnz];
        for (i, row) in self.rows.iter().enumerate() {
            for (j, (idx, val)) in row.iter().enumerate() {
                indices[i * max_nnz + j] = idx as u32;
                values[i * max_nnz + j] = val;
            }
        }
        PaddedRows {
            indices,
            values,
            nrows,
            max_nnz,
        }
    }
}
