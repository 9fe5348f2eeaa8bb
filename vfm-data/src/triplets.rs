use crate::common_io::{read_lines, RATING_DELIMITERS};
use crate::data_loader::InMemoryData;
use crate::schema::{FeatureSchema, UserItemLayout};
use crate::sparse_row::SparseRow;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name <-> index lookup for users or items
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    names: Vec<Box<str>>,
    #[serde(skip)]
    lookup: HashMap<Box<str>, usize>,
}

impl Vocabulary {
    pub fn from_names(names: Vec<Box<str>>) -> Self {
        let lookup = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        Self { names, lookup }
    }

    /// Index of `name`, adding it if unseen
    pub fn intern(&mut self, name: &str) -> usize {
        if let Some(&i) = self.lookup.get(name) {
            return i;
        }
        let i = self.names.len();
        let name: Box<str> = name.into();
        self.names.push(name.clone());
        self.lookup.insert(name, i);
        i
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).copied()
    }

    pub fn name(&self, i: usize) -> Option<&str> {
        self.names.get(i).map(|n| n.as_ref())
    }

    pub fn names(&self) -> &[Box<str>] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Rebuild the lookup table after deserialization
    pub fn reindex(&mut self) {
        self.lookup = self
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
    }
}

/// Observed (user, item, rating) triplets over fixed vocabularies
#[derive(Clone, Debug, Default)]
pub struct RatingTriplets {
    pub users: Vocabulary,
    pub items: Vocabulary,
    pub triplets: Vec<(usize, usize, f32)>,
}

fn parse_triplet(line: &str) -> anyhow::Result<(Box<str>, Box<str>, f32)> {
    let words: Vec<&str> = line
        .split(RATING_DELIMITERS.as_slice())
        .filter(|w| !w.is_empty())
        .collect();
    if words.len() < 3 {
        anyhow::bail!("expected `user item rating`, found: {}", line);
    }
    let rating = words[2]
        .parse::<f32>()
        .map_err(|e| anyhow::anyhow!("bad rating {:?}: {}", words[2], e))?;
    Ok((words[0].into(), words[1].into(), rating))
}

impl RatingTriplets {
    ///
    /// Read `user item rating [...]` lines; extra columns such as
    /// timestamps are ignored. A first line whose rating does not
    /// parse is treated as a header.
    ///
    /// * `input_file` - file name--either gzipped or not
    ///
    pub fn read(input_file: &str) -> anyhow::Result<Self> {
        let mut out = Self::default();
        out.extend_from_file(input_file, true)?;
        info!(
            "Read {} ratings over {} users and {} items from {}",
            out.triplets.len(),
            out.users.len(),
            out.items.len(),
            input_file
        );
        Ok(out)
    }

    /// Read with the vocabularies of already loaded data; ratings of
    /// unknown users or items are dropped.
    pub fn read_with_vocab(
        input_file: &str,
        users: &Vocabulary,
        items: &Vocabulary,
    ) -> anyhow::Result<Self> {
        let mut out = Self {
            users: users.clone(),
            items: items.clone(),
            triplets: vec![],
        };
        let nskip = out.extend_from_file(input_file, false)?;
        if nskip > 0 {
            warn!("Dropped {} ratings of unseen users/items", nskip);
        }
        Ok(out)
    }

    fn extend_from_file(&mut self, input_file: &str, grow_vocab: bool) -> anyhow::Result<usize> {
        let lines = read_lines(input_file)?;

        let mut parsed: Vec<(usize, anyhow::Result<(Box<str>, Box<str>, f32)>)> = lines
            .par_iter()
            .enumerate()
            .map(|(i, s)| (i, parse_triplet(s)))
            .collect();
        parsed.sort_by_key(|(i, _)| *i);

        let mut nskip = 0;
        for (i, res) in parsed {
            let (u, v, r) = match res {
                Ok(x) => x,
                Err(_) if i == 0 => continue,
                Err(e) => return Err(e),
            };
            if grow_vocab {
                let u = self.users.intern(&u);
                let v = self.items.intern(&v);
                self.triplets.push((u, v, r));
            } else {
                match (self.users.get(&u), self.items.get(&v)) {
                    (Some(u), Some(v)) => self.triplets.push((u, v, r)),
                    _ => nskip += 1,
                }
            }
        }
        Ok(nskip)
    }

    pub fn layout(&self) -> UserItemLayout {
        UserItemLayout::new(self.users.len(), self.items.len())
    }

    pub fn schema(&self) -> FeatureSchema {
        self.layout().schema()
    }

    pub fn len(&self) -> usize {
        self.triplets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triplets.is_empty()
    }

    /// Mean of all ratings, zero when empty
    pub fn mean_rating(&self) -> f32 {
        if self.triplets.is_empty() {
            return 0.0;
        }
        self.triplets.iter().map(|t| t.2 as f64).sum::<f64>() as f32 / self.len() as f32
    }

    /// One-hot design: user `u` at column `u`, item `i` at
    /// column `num_users + i`
    pub fn to_data(&self) -> anyhow::Result<InMemoryData> {
        let layout = self.layout();
        let rows = self
            .triplets
            .iter()
            .map(|&(u, i, _)| -> anyhow::Result<SparseRow> {
                Ok(SparseRow::one_hot(&[
                    layout.user_feature(u)?,
                    layout.item_feature(i)?,
                ]))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let targets = self.triplets.iter().map(|t| t.2).collect();
        InMemoryData::new(rows, targets)
    }
}
