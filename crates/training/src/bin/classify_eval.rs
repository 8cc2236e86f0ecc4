use std::path::PathBuf;

use clap::Parser;
use dataset::{scan_class_folders, split_samples, FolderDataset};
use model::NonLocalNet;
use training::{
    evaluate, load_checkpoint, Logger, LoggingSettings, RunConfig, TrainingError,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("evaluation failed: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Non-local classifier evaluation CLI", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to run config file")]
    config: PathBuf,

    #[arg(long, value_name = "DIR", help = "Checkpoint directory to restore")]
    checkpoint: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Override the dataset root")]
    data_root: Option<PathBuf>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = RunConfig::from_path(&args.config)?;
    if let Some(root) = args.data_root {
        config.data.root = root;
    }

    let network = NonLocalNet::new(config.network_config()?)
        .map_err(|err| TrainingError::initialization(err.to_string()))?;

    if let Some(dir) = args.checkpoint.as_ref() {
        let manifest = load_checkpoint(dir, &network)?;
        if manifest.num_classes != config.model.num_classes {
            return Err(TrainingError::initialization(format!(
                "checkpoint was written for {} classes, config declares {}",
                manifest.num_classes, config.model.num_classes
            )));
        }
        println!("restored checkpoint from {}", dir.display());
    } else {
        println!("no checkpoint given, evaluating freshly initialized weights");
    }

    let folders = scan_class_folders(&config.data.root)?;
    if folders.len() != config.model.num_classes {
        return Err(TrainingError::initialization(format!(
            "dataset has {} classes, config declares {}",
            folders.len(),
            config.model.num_classes
        )));
    }
    let classes: Vec<String> = folders.iter().map(|f| f.name.clone()).collect();
    let split = split_samples(&folders, config.data.holdout_every);
    let validation = FolderDataset::new(split.validation, classes);

    let summary = evaluate(&network, &validation, config.data.batch_size)?;

    let mut logger = Logger::new(LoggingSettings {
        enable_stdout: config.logging.stdout,
        metrics_file: config.logging.metrics_file.clone(),
    })?;
    logger.log_evaluation(&summary);
    logger.flush();

    Ok(())
}
