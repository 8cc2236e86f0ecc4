use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use model::NonLocalNet;
use tempfile::tempdir;
use training::config::{DataSection, LoggingSection, ModelSection, RunConfig};
use training::{load_checkpoint, save_checkpoint};

fn run_config(seed: u64, num_classes: usize) -> RunConfig {
    RunConfig {
        model: ModelSection {
            variant: "nlnet18".to_string(),
            num_classes,
            attention: "nl".to_string(),
            attention_periods: [2, 2, 1000],
            bat_reduction: 2,
            bat_grid: 7,
            bat_heads: 4,
            gc_reduction: 16,
            dropout: 0.2,
            use_channel_gate: false,
            zero_init_last_norm: false,
            seed,
        },
        data: DataSection {
            root: PathBuf::from("unused"),
            holdout_every: 5,
            batch_size: 8,
        },
        logging: LoggingSection::default(),
    }
}

fn parameter_values(network: &NonLocalNet) -> Result<Vec<(String, Vec<f32>)>> {
    let mut out = Vec::new();
    for (name, var) in network.parameters() {
        out.push((name, var.as_tensor().flatten_all()?.to_vec1::<f32>()?));
    }
    Ok(out)
}

#[test]
fn checkpoint_round_trip_restores_every_parameter() -> Result<()> {
    let dir = tempdir()?;

    let config = run_config(1, 3);
    let source = NonLocalNet::new(config.network_config()?)?;
    save_checkpoint(dir.path(), &source, &config)?;

    let target = NonLocalNet::new(run_config(2, 3).network_config()?)?;
    let before = parameter_values(&target)?;
    let source_values = parameter_values(&source)?;
    assert!(
        before
            .iter()
            .zip(source_values.iter())
            .any(|((_, a), (_, b))| a != b),
        "differently seeded networks should disagree before the restore"
    );

    let manifest = load_checkpoint(dir.path(), &target)?;
    assert_eq!(manifest.num_classes, 3);

    let after = parameter_values(&target)?;
    assert_eq!(after, source_values);
    Ok(())
}

#[test]
fn tampered_weights_fail_checksum_validation() -> Result<()> {
    let dir = tempdir()?;
    let config = run_config(1, 3);
    let network = NonLocalNet::new(config.network_config()?)?;
    save_checkpoint(dir.path(), &network, &config)?;

    let mut file = OpenOptions::new()
        .append(true)
        .open(dir.path().join("model.safetensors"))?;
    file.write_all(b"corruption")?;
    drop(file);

    assert!(load_checkpoint(dir.path(), &network).is_err());
    Ok(())
}

#[test]
fn structural_mismatch_is_reported() -> Result<()> {
    let dir = tempdir()?;
    let config = run_config(1, 3);
    let network = NonLocalNet::new(config.network_config()?)?;
    save_checkpoint(dir.path(), &network, &config)?;

    // A head sized for five classes cannot accept the three-class weights.
    let other = NonLocalNet::new(run_config(1, 5).network_config()?)?;
    assert!(load_checkpoint(dir.path(), &other).is_err());
    Ok(())
}

#[test]
fn run_config_file_round_trip_and_validation() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("run.toml");
    std::fs::write(
        &path,
        r#"
[model]
variant = "nlnet50"
num_classes = 3
attention = "bat"
bat_grid = 7

[data]
root = "work/dataset"
batch_size = 16
"#,
    )?;

    let config = RunConfig::from_path(&path)?;
    assert_eq!(config.model.variant, "nlnet50");
    assert_eq!(config.data.holdout_every, 5);
    let network_config = config.network_config()?;
    assert_eq!(network_config.num_classes, 3);
    assert_eq!(network_config.stages[1].attention.label(), "bat");
    assert_eq!(network_config.stages[0].attention.label(), "none");

    std::fs::write(
        &path,
        r#"
[model]
variant = "resnet9000"
num_classes = 0

[data]
root = "work/dataset"
"#,
    )?;
    let err = RunConfig::from_path(&path).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("variant"));
    assert!(message.contains("num_classes"));
    Ok(())
}
