use candle_core::Device;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use vfm_data::common_io::{mkdir_parent, open_buf_writer};
use vfm_data::{Batch, FeatureSchema, InMemoryData, UserItemLayout, Vocabulary};

use crate::config::VfmConfig;
use crate::error::{Result, VfmError};
use crate::interaction::{BatchTensors, Draw, InteractionEngine};
use crate::parameter_table::ParameterTable;
use crate::trainer::Trainer;
use crate::uncertainty::{FeaturePosterior, Posterior, UncertaintyScorer};

/// Everything but the tensors, stored next to the safetensors file
#[derive(Serialize, Deserialize)]
struct ModelMeta {
    config: VfmConfig,
    schema: FeatureSchema,
    layout: Option<UserItemLayout>,
    users: Option<Vocabulary>,
    items: Option<Vocabulary>,
}

/// Root mean squared error of posterior-mean predictions, visiting
/// `data` in storage order; `None` when `data` has no rows
pub(crate) fn rmse_at_mean(
    engine: &InteractionEngine,
    table: &ParameterTable,
    data: &InMemoryData,
    batch_size: usize,
) -> Result<Option<f32>> {
    let mut sse = 0f64;
    let mut n = 0usize;
    for batch in data.ordered_batches(batch_size) {
        let tensors = BatchTensors::from_batch(&batch, table.num_features(), table.device())?;
        let pred: Vec<f32> = engine.predict(table, &tensors, Draw::Mean)?.to_vec1()?;
        sse += pred
            .iter()
            .zip(batch.targets.iter())
            .map(|(p, y)| ((p - y) as f64).powi(2))
            .sum::<f64>();
        n += batch.len();
    }
    if n == 0 {
        return Ok(None);
    }
    Ok(Some((sse / n as f64).sqrt() as f32))
}

/// A fitted model, read-only
///
/// Predictions use posterior means. Scores use the closed-form
/// predictive variance of the factorized posterior.
pub struct TrainedModel {
    config: VfmConfig,
    table: ParameterTable,
    engine: InteractionEngine,
    posterior: Posterior,
    layout: Option<UserItemLayout>,
    users: Option<Vocabulary>,
    items: Option<Vocabulary>,
}

impl TrainedModel {
    pub fn new(config: VfmConfig, table: ParameterTable) -> Result<Self> {
        let posterior = table.posterior()?;
        let engine = InteractionEngine::new(config.use_interactions());
        Ok(Self {
            config,
            table,
            engine,
            posterior,
            layout: None,
            users: None,
            items: None,
        })
    }

    /// Attach user and item names for the one-hot user/item layout
    pub fn with_vocabulary(mut self, users: Vocabulary, items: Vocabulary) -> Result<Self> {
        let layout = UserItemLayout::new(users.len(), items.len());
        if layout.num_features() != self.table.num_features() {
            return Err(VfmError::shape(format!(
                "{} users + {} items vs. {} features",
                users.len(),
                items.len(),
                self.table.num_features()
            )));
        }
        self.layout = Some(layout);
        self.users = Some(users);
        self.items = Some(items);
        Ok(self)
    }

    pub fn config(&self) -> &VfmConfig {
        &self.config
    }

    pub fn schema(&self) -> &FeatureSchema {
        self.table.schema()
    }

    pub fn table(&self) -> &ParameterTable {
        &self.table
    }

    pub fn layout(&self) -> Option<&UserItemLayout> {
        self.layout.as_ref()
    }

    pub fn users(&self) -> Option<&Vocabulary> {
        self.users.as_ref()
    }

    pub fn items(&self) -> Option<&Vocabulary> {
        self.items.as_ref()
    }

    /// Point predictions at the posterior means, one per row
    pub fn predict(&self, batch: &Batch) -> Result<Vec<f32>> {
        if batch.is_empty() {
            return Ok(vec![]);
        }
        let tensors = BatchTensors::from_batch(batch, self.table.num_features(), self.table.device())?;
        let pred = self.engine.predict(&self.table, &tensors, Draw::Mean)?;
        Ok(pred.to_vec1()?)
    }

    /// Root mean squared error over every row of `data`; empty data
    /// is an error
    pub fn rmse(&self, data: &InMemoryData) -> Result<f32> {
        rmse_at_mean(&self.engine, &self.table, data, self.config.batch_size)?.ok_or_else(|| {
            VfmError::DataExhaustion {
                epoch: 0,
                batch: 0,
                reason: "no rows to evaluate".into(),
            }
        })
    }

    /// Posterior mean and variance of feature `feature_id`
    pub fn posterior(&self, feature_id: usize) -> Result<FeaturePosterior> {
        self.posterior.feature(feature_id).ok_or_else(|| {
            VfmError::shape(format!(
                "feature {} out of range for {} features",
                feature_id,
                self.table.num_features()
            ))
        })
    }

    /// Host copy of every posterior mean and variance
    pub fn posterior_snapshot(&self) -> &Posterior {
        &self.posterior
    }

    pub fn scorer(&self) -> UncertaintyScorer<'_> {
        UncertaintyScorer::new(&self.posterior)
    }

    /// Candidate items by descending predictive variance with `user`
    ///
    /// * `user` - feature id of the user
    /// * `items` - feature ids of the candidate items
    pub fn variance_rank(&self, user: usize, items: &[usize]) -> Result<Vec<(usize, f32)>> {
        self.scorer().rank_candidates(user, items)
    }

    /// The unobserved (user, item) pair with the largest predictive
    /// variance, or `None` when every pair is observed. Ties go to
    /// the earlier user, then the lower item id.
    ///
    /// * `users` - user feature ids to consider
    /// * `items` - item feature ids to consider
    /// * `observed` - pairs (user, item) already labelled
    pub fn most_informative(
        &self,
        users: &[usize],
        items: &[usize],
        observed: &HashSet<(usize, usize)>,
    ) -> Result<Option<(usize, usize, f32)>> {
        let scorer = self.scorer();
        let mut best: Option<(usize, usize, f32)> = None;
        for &u in users {
            let ranked = scorer.rank_candidates(u, items)?;
            let top = ranked.into_iter().find(|(i, _)| !observed.contains(&(u, *i)));
            if let Some((i, score)) = top {
                if best.is_none_or(|(_, _, s)| score > s) {
                    best = Some((u, i, score));
                }
            }
        }
        Ok(best)
    }

    /// Hand the parameters back to a trainer for more epochs
    pub fn into_trainer(self) -> Result<Trainer> {
        Trainer::resume(self.config, self.table)
    }

    /// Write `{prefix}.safetensors` (every mean and ln σ) and
    /// `{prefix}.json` (config, schema, names)
    pub fn save(&self, prefix: &str) -> Result<()> {
        let tensor_file = format!("{}.safetensors", prefix);
        let meta_file = format!("{}.json", prefix);
        mkdir_parent(&tensor_file).map_err(|e| VfmError::Io(std::io::Error::other(e.to_string())))?;

        self.table.save(&tensor_file)?;

        let meta = ModelMeta {
            config: self.config.clone(),
            schema: self.table.schema().clone(),
            layout: self.layout,
            users: self.users.clone(),
            items: self.items.clone(),
        };
        let mut writer = BufWriter::new(File::create(&meta_file)?);
        serde_json::to_writer_pretty(&mut writer, &meta)?;
        writer.flush()?;

        info!("Saved {} and {}", tensor_file, meta_file);
        Ok(())
    }

    /// Restore a model written by `save`; values are bit-exact
    pub fn load(prefix: &str, device: &Device) -> Result<Self> {
        let tensor_file = format!("{}.safetensors", prefix);
        let meta_file = format!("{}.json", prefix);

        let meta: ModelMeta = serde_json::from_reader(BufReader::new(File::open(&meta_file)?))?;
        meta.config.validate()?;

        // every value is overwritten by the file
        let mut rng = StdRng::seed_from_u64(meta.config.seed);
        let mut table = ParameterTable::new(&meta.config, &meta.schema, &mut rng, device)?;
        table.load(&tensor_file)?;

        let mut model = Self::new(meta.config, table)?;
        if let (Some(mut users), Some(mut items)) = (meta.users, meta.items) {
            users.reindex();
            items.reindex();
            model = model.with_vocabulary(users, items)?;
        }
        info!("Loaded {} features from {}", model.table.num_features(), tensor_file);
        Ok(model)
    }

    /// Name of feature `f` for reports
    fn feature_name(&self, f: usize) -> String {
        match (self.layout.as_ref(), self.users.as_ref(), self.items.as_ref()) {
            (Some(layout), Some(users), Some(items)) => {
                let name = if f < layout.num_users {
                    users.name(f)
                } else {
                    items.name(f - layout.num_users)
                };
                name.map(str::to_string).unwrap_or_else(|| f.to_string())
            }
            _ => f.to_string(),
        }
    }

    /// Per-feature posterior table, tab-separated, gzipped when the
    /// file name ends in `.gz`
    ///
    /// Columns: feature, group, name, bias mean, bias variance, then
    /// `k` latent means and `k` latent variances.
    pub fn write_posterior(&self, file: &str) -> anyhow::Result<()> {
        mkdir_parent(file)?;
        let mut writer = open_buf_writer(file)?;
        let rank = self.posterior.rank;
        let schema = self.table.schema();
        let group_names = schema.group_names();

        let mut header = vec![
            "feature".to_string(),
            "group".to_string(),
            "name".to_string(),
            "bias_mean".to_string(),
            "bias_var".to_string(),
        ];
        header.extend((0..rank).map(|k| format!("latent_mean_{}", k)));
        header.extend((0..rank).map(|k| format!("latent_var_{}", k)));
        writeln!(writer, "{}", header.join("\t"))?;

        for f in 0..self.posterior.num_features {
            let post = self.posterior(f)?;
            let group = schema
                .group_of(f)
                .and_then(|g| group_names.get(g))
                .map(|g| g.to_string())
                .unwrap_or_default();

            let mut line = vec![
                f.to_string(),
                group,
                self.feature_name(f),
                post.bias_mean.to_string(),
                post.bias_var.to_string(),
            ];
            line.extend(post.latent_mean.iter().map(|x| x.to_string()));
            line.extend(post.latent_var.iter().map(|x| x.to_string()));
            writeln!(writer, "{}", line.join("\t"))?;
        }
        writer.flush()?;
        info!("Wrote posterior of {} features to {}", self.posterior.num_features, file);
        Ok(())
    }
}
