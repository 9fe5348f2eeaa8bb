use candle_core::Device;
use vfm::{train, StepReport, Trainer, TrainerState, VfmConfig, VfmError};
use vfm_data::{Batch, DataLoader, FeatureSchema, InMemoryData, RatingTriplets, SparseRow, Vocabulary};

/// 2 users x 2 items, all four pairs rated
fn toy_ratings() -> RatingTriplets {
    RatingTriplets {
        users: Vocabulary::from_names(vec!["u0".into(), "u1".into()]),
        items: Vocabulary::from_names(vec!["i0".into(), "i1".into()]),
        triplets: vec![(0, 0, 5.0), (0, 1, 1.0), (1, 0, 1.0), (1, 1, 4.0)],
    }
}

fn toy_config() -> VfmConfig {
    VfmConfig {
        rank: 2,
        lambda0: 1.0,
        lambda1: 1.0,
        lambda2: 1.0,
        batch_size: 4,
        learning_rate: 0.05,
        epochs: 1,
        seed: 20,
        ..Default::default()
    }
}

fn run_steps(nsteps: usize) -> anyhow::Result<(StepReport, StepReport, Trainer)> {
    let ratings = toy_ratings();
    let batch = ratings.to_data()?.full_batch();

    let mut trainer = Trainer::new(toy_config(), Device::Cpu)?;
    trainer.initialize(&ratings.schema())?;

    let initial = trainer.objective_at_mean(&batch, batch.len())?;
    for _ in 0..nsteps {
        trainer.step(&batch, batch.len())?;
    }
    let last = trainer.objective_at_mean(&batch, batch.len())?;
    Ok((initial, last, trainer))
}

#[test]
fn seeded_steps_lower_the_loss() -> anyhow::Result<()> {
    let (initial, last, _) = run_steps(200)?;
    assert!(initial.loss.is_finite());
    assert!(
        last.loss < initial.loss,
        "loss {} -> {}",
        initial.loss,
        last.loss
    );
    Ok(())
}

#[test]
fn same_seed_same_parameters() -> anyhow::Result<()> {
    let (_, _, a) = run_steps(25)?;
    let (_, _, b) = run_steps(25)?;

    let a = a.table().ok_or(VfmError::config("no table"))?;
    let b = b.table().ok_or(VfmError::config("no table"))?;
    assert_eq!(a.names()?, b.names()?);

    let a_vars = a.varmap().data().lock().map_err(|e| anyhow::anyhow!("{}", e))?;
    let b_vars = b.varmap().data().lock().map_err(|e| anyhow::anyhow!("{}", e))?;
    for (name, var) in a_vars.iter() {
        let x: Vec<f32> = var.as_tensor().flatten_all()?.to_vec1()?;
        let y: Vec<f32> = b_vars[name].as_tensor().flatten_all()?.to_vec1()?;
        assert_eq!(x, y, "{} differs", name);
    }
    Ok(())
}

#[test]
fn different_seeds_diverge() -> anyhow::Result<()> {
    let ratings = toy_ratings();
    let mut data = ratings.to_data()?;
    let (a, _) = train(toy_config(), &ratings.schema(), &mut data, &Device::Cpu)?;
    let other = VfmConfig {
        seed: 21,
        ..toy_config()
    };
    let (b, _) = train(other, &ratings.schema(), &mut data, &Device::Cpu)?;
    assert_ne!(a.posterior_snapshot(), b.posterior_snapshot());
    Ok(())
}

#[test]
fn train_fits_the_toy_ratings() -> anyhow::Result<()> {
    let ratings = toy_ratings();
    let mut data = ratings.to_data()?;
    let config = VfmConfig {
        lambda0: 5e-3,
        lambda1: 5e-3,
        lambda2: 5e-3,
        batch_size: 2,
        epochs: 300,
        init_offset_mean: ratings.mean_rating(),
        ..toy_config()
    };

    let (model, trace) = train(config, &ratings.schema(), &mut data, &Device::Cpu)?;
    assert_eq!(trace.len(), 300);
    assert!(trace.iter().all(|r| r.num_steps == 2));

    let baseline = {
        let mean = ratings.mean_rating();
        let sse: f32 = ratings.triplets.iter().map(|t| (t.2 - mean).powi(2)).sum();
        (sse / 4.0).sqrt()
    };
    let rmse = model.rmse(&data)?;
    assert!(rmse < baseline, "rmse {} vs. baseline {}", rmse, baseline);
    Ok(())
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let config = VfmConfig {
        rank: 3,
        interactions: false,
        lambda2: 1.0,
        ..Default::default()
    };
    assert!(matches!(
        Trainer::new(config, Device::Cpu),
        Err(VfmError::Configuration(_))
    ));
}

/// Serves its first minibatch, then fails
struct FlakyLoader {
    inner: InMemoryData,
}

impl DataLoader for FlakyLoader {
    fn minibatch(&self, batch_idx: usize) -> anyhow::Result<Batch> {
        if batch_idx > 0 {
            anyhow::bail!("source closed");
        }
        self.inner.minibatch(batch_idx)
    }

    fn num_minibatch(&self) -> usize {
        self.inner.num_minibatch()
    }

    fn shuffle_minibatch<R: rand::Rng + ?Sized>(
        &mut self,
        batch_size: usize,
        rng: &mut R,
    ) -> anyhow::Result<()> {
        self.inner.shuffle_minibatch(batch_size, rng)
    }

    fn num_obs(&self) -> usize {
        self.inner.num_obs()
    }

    fn max_feature_index(&self) -> Option<usize> {
        self.inner.max_feature_index()
    }
}

#[test]
fn failing_source_is_data_exhaustion() -> anyhow::Result<()> {
    let ratings = toy_ratings();
    let mut loader = FlakyLoader {
        inner: ratings.to_data()?,
    };
    let config = VfmConfig {
        batch_size: 1,
        ..toy_config()
    };
    let mut trainer = Trainer::new(config, Device::Cpu)?;
    trainer.initialize(&ratings.schema())?;

    match trainer.fit(&mut loader) {
        Err(VfmError::DataExhaustion { epoch, batch, .. }) => {
            assert_eq!((epoch, batch), (0, 1));
        }
        other => panic!("expected data exhaustion, got {:?}", other.map(|t| t.len())),
    }
    assert!(matches!(trainer.state(), TrainerState::Training { epoch: 0 }));
    Ok(())
}

#[test]
fn out_of_range_batch_is_a_shape_error() -> anyhow::Result<()> {
    let mut trainer = Trainer::new(toy_config(), Device::Cpu)?;
    trainer.initialize(&FeatureSchema::user_item(2, 2))?;
    let batch = Batch::new(vec![SparseRow::one_hot(&[0, 4])], vec![3.0])?;
    assert!(matches!(
        trainer.step(&batch, 1),
        Err(VfmError::ShapeMismatch(_))
    ));
    Ok(())
}
