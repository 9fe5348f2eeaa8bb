use candle_core::Device;
use std::collections::HashMap;
use vfm::{train, TrainedModel, VfmConfig};
use vfm_data::common_io::read_lines;
use vfm_data::{RatingTriplets, Vocabulary};

fn ratings() -> RatingTriplets {
    RatingTriplets {
        users: Vocabulary::from_names(vec!["ann".into(), "bob".into(), "cat".into()]),
        items: Vocabulary::from_names(vec!["x".into(), "y".into()]),
        triplets: vec![(0, 0, 4.0), (1, 1, 2.0), (2, 0, 3.0), (0, 1, 1.0)],
    }
}

fn fitted() -> anyhow::Result<TrainedModel> {
    let data = ratings();
    let config = VfmConfig {
        rank: 3,
        batch_size: 2,
        epochs: 5,
        seed: 3,
        ..Default::default()
    };
    let (model, _) = train(config, &data.schema(), &mut data.to_data()?, &Device::Cpu)?;
    Ok(model.with_vocabulary(data.users.clone(), data.items.clone())?)
}

/// every registered tensor, by name
fn raw_values(model: &TrainedModel) -> anyhow::Result<HashMap<String, Vec<f32>>> {
    let vars = model
        .table()
        .varmap()
        .data()
        .lock()
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let mut out = HashMap::new();
    for (name, var) in vars.iter() {
        out.insert(name.clone(), var.as_tensor().flatten_all()?.to_vec1::<f32>()?);
    }
    Ok(out)
}

#[test]
fn save_and_load_are_exact() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let prefix = dir.path().join("model");
    let prefix = prefix.to_str().ok_or(anyhow::anyhow!("path"))?;

    let model = fitted()?;
    model.save(prefix)?;
    let loaded = TrainedModel::load(prefix, &Device::Cpu)?;

    // means and ln σ of every layer, not just the means
    assert_eq!(raw_values(&model)?, raw_values(&loaded)?);
    assert_eq!(raw_values(&model)?.len(), 10);
    assert_eq!(model.posterior_snapshot(), loaded.posterior_snapshot());
    assert_eq!(model.config(), loaded.config());
    assert_eq!(model.schema(), loaded.schema());

    let users = loaded.users().ok_or(anyhow::anyhow!("users"))?;
    assert_eq!(users.get("cat"), Some(2));
    assert_eq!(loaded.layout().map(|l| l.num_items), Some(2));

    assert_eq!(
        model.variance_rank(0, &[3, 4])?,
        loaded.variance_rank(0, &[3, 4])?
    );
    Ok(())
}

#[test]
fn loaded_model_resumes_training() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let prefix = dir.path().join("resume");
    let prefix = prefix.to_str().ok_or(anyhow::anyhow!("path"))?;

    fitted()?.save(prefix)?;
    let loaded = TrainedModel::load(prefix, &Device::Cpu)?;
    let before = loaded.posterior_snapshot().clone();

    let mut trainer = loaded.into_trainer()?;
    let trace = trainer.fit(&mut ratings().to_data()?)?;
    assert_eq!(trace.len(), 5);
    let after = trainer.into_model()?;
    assert_ne!(&before, after.posterior_snapshot());
    Ok(())
}

#[test]
fn posterior_table_has_a_row_per_feature() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("post.tsv.gz");
    let file = file.to_str().ok_or(anyhow::anyhow!("path"))?;

    let model = fitted()?;
    model.write_posterior(file)?;
    let lines = read_lines(file)?;

    assert_eq!(lines.len(), 1 + 5);
    let header: Vec<&str> = lines[0].split('\t').collect();
    assert_eq!(header.len(), 5 + 2 * 3);
    assert_eq!(header[3], "bias_mean");

    let bob: Vec<&str> = lines[2].split('\t').collect();
    assert_eq!(&bob[..3], &["1", "user", "bob"]);
    let y: Vec<&str> = lines[5].split('\t').collect();
    assert_eq!(&y[..3], &["4", "item", "y"]);
    let bias_mean: f32 = y[3].parse()?;
    assert_eq!(bias_mean, model.posterior(4)?.bias_mean);
    Ok(())
}

#[test]
fn missing_checkpoint_is_an_io_error() {
    let res = TrainedModel::load("/nonexistent/vfm/model", &Device::Cpu);
    assert!(matches!(res, Err(vfm::VfmError::Io(_))));
}
