use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vfm_data::{Batch, DataLoader, FeatureSchema, InMemoryData};

use crate::config::VfmConfig;
use crate::elbo::{ElboObjective, ElboTerms};
use crate::error::{Result, VfmError};
use crate::interaction::{BatchTensors, Draw, InteractionEngine};
use crate::model::{rmse_at_mean, TrainedModel};
use crate::parameter_table::ParameterTable;

/// Where a trainer is in its life
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainerState {
    Uninitialized,
    /// parameters allocated, no step taken
    Ready,
    Training { epoch: usize },
    /// ran every configured epoch
    Converged,
    /// halted by the stop signal
    Stopped,
}

/// Objective values of one step
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub epoch: usize,
    pub step: usize,
    pub loss: f32,
    pub mse: f32,
    pub rmse: f32,
    pub kl_hyper: f32,
    pub kl_bias: f32,
    pub kl_latent: f32,
}

impl StepReport {
    fn from_terms(terms: &ElboTerms, epoch: usize, step: usize) -> Result<Self> {
        let mse: f32 = terms.mse.to_scalar()?;
        Ok(Self {
            epoch,
            step,
            loss: terms.loss.to_scalar()?,
            mse,
            rmse: mse.sqrt(),
            kl_hyper: terms.kl_hyper.to_scalar()?,
            kl_bias: terms.kl_bias.to_scalar()?,
            kl_latent: terms.kl_latent.to_scalar()?,
        })
    }
}

/// Averages over the steps of one epoch
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub num_steps: usize,
    pub loss: f32,
    pub mse: f32,
    pub rmse: f32,
    pub kl_hyper: f32,
    pub kl_bias: f32,
    pub kl_latent: f32,
}

impl EpochReport {
    fn average(epoch: usize, steps: &[StepReport]) -> Self {
        let n = steps.len().max(1) as f32;
        let mean = |f: fn(&StepReport) -> f32| steps.iter().map(f).sum::<f32>() / n;
        let mse = mean(|s| s.mse);
        Self {
            epoch,
            num_steps: steps.len(),
            loss: mean(|s| s.loss),
            mse,
            rmse: mse.sqrt(),
            kl_hyper: mean(|s| s.kl_hyper),
            kl_bias: mean(|s| s.kl_bias),
            kl_latent: mean(|s| s.kl_latent),
        }
    }
}

/// Stochastic variational inference over minibatches
///
/// Each step: sample parameters by reparameterization, predict,
/// evaluate the negative ELBO, back-propagate and take one AdamW step
/// over every mean and ln σ. A step whose loss or gradients are not
/// finite is rejected before any parameter changes; an update that
/// leaves a parameter non-finite is rolled back.
pub struct Trainer {
    config: VfmConfig,
    device: Device,
    state: TrainerState,
    table: Option<ParameterTable>,
    optimizer: Option<AdamW>,
    engine: InteractionEngine,
    objective: ElboObjective,
    rng: StdRng,
    stop: Arc<AtomicBool>,
    epoch: usize,
    num_steps: usize,
}

impl Trainer {
    /// Validate `config`; nothing is allocated yet
    pub fn new(config: VfmConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let engine = InteractionEngine::new(config.use_interactions());
        let objective = ElboObjective::new(&config);
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            device,
            state: TrainerState::Uninitialized,
            table: None,
            optimizer: None,
            engine,
            objective,
            rng,
            stop: Arc::new(AtomicBool::new(false)),
            epoch: 0,
            num_steps: 0,
        })
    }

    /// Allocate and initialize parameters for `schema`
    pub fn initialize(&mut self, schema: &FeatureSchema) -> Result<()> {
        if self.state != TrainerState::Uninitialized {
            return Err(VfmError::config("trainer is already initialized"));
        }
        let table = ParameterTable::new(&self.config, schema, &mut self.rng, &self.device)?;
        self.attach(table)
    }

    /// Continue training from an existing parameter table, e.g. one
    /// restored from a checkpoint
    pub fn resume(config: VfmConfig, table: ParameterTable) -> Result<Self> {
        let device = table.device().clone();
        let mut trainer = Self::new(config, device)?;
        if table.rank() != trainer.config.effective_rank() {
            return Err(VfmError::shape(format!(
                "table rank {} vs. configured rank {}",
                table.rank(),
                trainer.config.effective_rank()
            )));
        }
        trainer.attach(table)?;
        Ok(trainer)
    }

    fn attach(&mut self, table: ParameterTable) -> Result<()> {
        let params = ParamsAdamW {
            lr: self.config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(table.varmap().all_vars(), params)?;
        info!(
            "initialized {} features, rank {}, {} groups of sizes {:?}",
            table.num_features(),
            table.rank(),
            table.prior().num_groups(),
            table.schema().group_sizes()
        );
        self.table = Some(table);
        self.optimizer = Some(optimizer);
        self.state = TrainerState::Ready;
        Ok(())
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn config(&self) -> &VfmConfig {
        &self.config
    }

    pub fn table(&self) -> Option<&ParameterTable> {
        self.table.as_ref()
    }

    /// Setting the returned flag halts training before the next step
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn ready_table(&self) -> Result<&ParameterTable> {
        self.table
            .as_ref()
            .ok_or_else(|| VfmError::config("trainer is not initialized"))
    }

    fn instability(&self, what: impl Into<String>) -> VfmError {
        VfmError::NumericalInstability {
            epoch: self.epoch,
            step: self.num_steps,
            what: what.into(),
        }
    }

    /// One stochastic gradient step on `batch`
    ///
    /// * `batch` - labelled rows
    /// * `total_obs` - number of observations in the full data, to
    ///   scale the KL penalty by the batch fraction
    pub fn step(&mut self, batch: &Batch, total_obs: usize) -> Result<StepReport> {
        let Some(table) = self.table.as_ref() else {
            return Err(VfmError::config("trainer is not initialized"));
        };
        let tensors = BatchTensors::from_batch(batch, table.num_features(), &self.device)?;
        let kl_scale = kl_scale(batch.len(), total_obs);

        let pred = self
            .engine
            .predict(table, &tensors, Draw::Sample(&mut self.rng))?;
        let terms = self.objective.loss(&tensors, &pred, table, kl_scale)?;
        let report = StepReport::from_terms(&terms, self.epoch, self.num_steps)?;

        if !report.loss.is_finite() {
            return Err(self.instability("loss"));
        }

        let grads = terms.loss.backward()?;
        if let Some(name) = first_non_finite_grad(table, &grads)? {
            return Err(self.instability(format!("gradient of {}", name)));
        }

        let snapshot = table.snapshot()?;

        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| VfmError::config("trainer is not initialized"))?;
        optimizer.step(&grads)?;

        let table = self.ready_table()?;
        if let Some(name) = table.first_non_finite()? {
            table.restore(&snapshot)?;
            return Err(self.instability(name));
        }
        self.num_steps += 1;

        debug!(
            "[{}:{}] loss {:.4} mse {:.4}",
            report.epoch, report.step, report.loss, report.mse
        );
        Ok(report)
    }

    /// Objective at the posterior means, no update
    pub fn objective_at_mean(&self, batch: &Batch, total_obs: usize) -> Result<StepReport> {
        let table = self.ready_table()?;
        let tensors = BatchTensors::from_batch(batch, table.num_features(), &self.device)?;
        let pred = self.engine.predict(table, &tensors, Draw::Mean)?;
        let terms = self
            .objective
            .loss(&tensors, &pred, table, kl_scale(batch.len(), total_obs))?;
        StepReport::from_terms(&terms, self.epoch, self.num_steps)
    }

    /// RMSE of the posterior-mean predictions over `data`; empty data
    /// is an error
    pub fn rmse(&self, data: &InMemoryData) -> Result<f32> {
        let table = self.ready_table()?;
        rmse_at_mean(&self.engine, table, data, self.config.batch_size)?.ok_or_else(|| {
            VfmError::DataExhaustion {
                epoch: self.epoch,
                batch: 0,
                reason: "no rows to evaluate".into(),
            }
        })
    }

    /// Run the configured number of epochs over `data`
    ///
    /// Each epoch reshuffles the data with the trainer's seeded
    /// generator and visits every minibatch once. Returns one report
    /// per completed epoch. The stop flag is honoured between steps;
    /// a stopped run keeps every update made so far.
    pub fn fit<D: DataLoader>(&mut self, data: &mut D) -> Result<Vec<EpochReport>> {
        self.fit_with(data, |_, _| Ok(()))
    }

    /// `fit`, calling `on_epoch` after every completed epoch
    pub fn fit_with<D, F>(&mut self, data: &mut D, mut on_epoch: F) -> Result<Vec<EpochReport>>
    where
        D: DataLoader,
        F: FnMut(&Trainer, &EpochReport) -> Result<()>,
    {
        let nfeat = self.ready_table()?.num_features();
        if let Some(max_index) = data.max_feature_index() {
            if max_index >= nfeat {
                return Err(VfmError::shape(format!(
                    "data references feature {} but the model has {}",
                    max_index, nfeat
                )));
            }
        }

        let total_obs = data.num_obs();
        if total_obs == 0 {
            return Err(VfmError::DataExhaustion {
                epoch: self.epoch,
                batch: 0,
                reason: "no observations".into(),
            });
        }

        let num_epochs = self.config.epochs;
        let pb = ProgressBar::new(num_epochs as u64);
        if !self.config.show_progress || self.config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut trace = vec![];

        for _ in 0..num_epochs {
            if self.stop_requested() {
                break;
            }
            self.state = TrainerState::Training { epoch: self.epoch };

            data.shuffle_minibatch(self.config.batch_size, &mut self.rng)
                .map_err(|e| VfmError::DataExhaustion {
                    epoch: self.epoch,
                    batch: 0,
                    reason: e.to_string(),
                })?;

            let num_batches = data.num_minibatch();
            if num_batches == 0 {
                return Err(VfmError::DataExhaustion {
                    epoch: self.epoch,
                    batch: 0,
                    reason: "no minibatches after shuffling".into(),
                });
            }

            let mut steps = Vec::with_capacity(num_batches);
            for b in 0..num_batches {
                if self.stop_requested() {
                    break;
                }
                let batch = data.minibatch(b).map_err(|e| VfmError::DataExhaustion {
                    epoch: self.epoch,
                    batch: b,
                    reason: e.to_string(),
                })?;
                steps.push(self.step(&batch, total_obs)?);
            }

            if steps.len() < num_batches {
                warn!(
                    "stopped at epoch {} after {}/{} minibatches",
                    self.epoch + 1,
                    steps.len(),
                    num_batches
                );
                break;
            }

            let report = EpochReport::average(self.epoch, &steps);
            if self.config.verbose {
                info!(
                    "[{}] loss: {:.4}, rmse: {:.4}, kl: {:.3} / {:.3} / {:.3}",
                    self.epoch + 1,
                    report.loss,
                    report.rmse,
                    report.kl_hyper,
                    report.kl_bias,
                    report.kl_latent
                );
            }
            self.epoch += 1;
            on_epoch(self, &report)?;
            trace.push(report);
            pb.inc(1);
        } // each epoch

        pb.finish_and_clear();

        self.state = if self.stop_requested() {
            TrainerState::Stopped
        } else {
            TrainerState::Converged
        };
        Ok(trace)
    }

    /// Freeze the current parameters for inference
    pub fn into_model(self) -> Result<TrainedModel> {
        let table = self
            .table
            .ok_or_else(|| VfmError::config("trainer is not initialized"))?;
        TrainedModel::new(self.config, table)
    }
}

/// Fraction of the data in a batch of `batch_len` rows
fn kl_scale(batch_len: usize, total_obs: usize) -> f64 {
    if total_obs == 0 {
        1.0
    } else {
        batch_len as f64 / total_obs as f64
    }
}

/// Name of the first trainable parameter whose gradient is not finite
fn first_non_finite_grad(
    table: &ParameterTable,
    grads: &candle_core::backprop::GradStore,
) -> Result<Option<String>> {
    let data = table
        .varmap()
        .data()
        .lock()
        .map_err(|_| VfmError::config("parameter map is poisoned"))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    for name in names {
        let var: &Tensor = data[name].as_tensor();
        if let Some(grad) = grads.get(var) {
            let total: f32 = grad.sum_all()?.to_scalar()?;
            if !total.is_finite() {
                return Ok(Some(name.clone()));
            }
        }
    }
    Ok(None)
}

/// Build, initialize and fit a model in one call
///
/// * `config` - model and training knobs
/// * `schema` - feature groups; must cover every feature in `data`
/// * `data` - labelled minibatch source
pub fn train<D: DataLoader>(
    config: VfmConfig,
    schema: &FeatureSchema,
    data: &mut D,
    device: &Device,
) -> Result<(TrainedModel, Vec<EpochReport>)> {
    let mut trainer = Trainer::new(config, device.clone())?;
    trainer.initialize(schema)?;
    let trace = trainer.fit(data)?;
    Ok((trainer.into_model()?, trace))
}
