//! `ood_pretrain` binary: split-wise out-of-distribution pretraining.
//!
//! Pretrains a ResNet-18 classifier on the full training set, then for each
//! of the five label-pair splits fits a density estimator and a variance
//! source on the split, and trains a DEUP estimator that starts from the
//! pretrained classifier. Every artifact is written under the naming contract
//! of [`deup_train::artifact::ArtifactName`].
//!
//! # Usage
//!
//! ```bash
//! cargo run --features tch-backend --bin ood_pretrain -- \
//!     --save-base-path runs/ --data-base-path data/
//! cargo run --features tch-backend --bin ood_pretrain -- --save-base-path /tmp/deup --dry-run
//! ```
//!
//! Real data is read from `<data-base-path>/cifar10_train_{images,labels}.npy`
//! and `<data-base-path>/cifar10_test_{images,labels}.npy`.

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{error, info, warn};

use deup_train::artifact::ArtifactName;
use deup_train::config::DeupConfig;
use deup_train::dataset::{
    DataLoader, LabelSplit, LabeledDataset, NpyImageDataset, Subset, SyntheticImageConfig, SyntheticImageDataset,
};
use deup_train::density::{DensityEstimator, MafMogDensityEstimator};
use deup_train::error::DeupResult;
use deup_train::model::{Activation, Mlp, MlpSpec, OutputActivation, Predictor, ResNet18Plus};
use deup_train::trainer::{DeupData, DeupEstimator, DeupNetworks, SignalSources};
use deup_train::variance::{DuqVarianceSource, VarianceSource};

const DATASET: &str = "cifar";
const TAG: &str = "new";
const WEIGHTS_EXT: &str = "ot";

/// Command-line arguments for the pretraining binary.
#[derive(Parser, Debug)]
#[command(name = "ood_pretrain", version, about = "DEUP split-wise OOD pretraining", long_about = None)]
struct Args {
    /// Directory that receives every weight file and history.
    #[arg(long, value_name = "DIR", default_value = ".")]
    save_base_path: PathBuf,

    /// Directory holding the `.npy` datasets.
    #[arg(long, value_name = "DIR", default_value = "data")]
    data_base_path: PathBuf,

    /// Path to a JSON configuration file. Defaults are used otherwise.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable CUDA training (overrides config `use_gpu`).
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// Use small synthetic datasets and one epoch per stage.
    ///
    /// Intended for pipeline smoke-tests only.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Number of synthetic training samples when `--dry-run` is active.
    #[arg(long, default_value_t = 200)]
    dry_run_samples: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("DEUP OOD pretraining v{}", deup_train::VERSION);

    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            match DeupConfig::from_json(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("No configuration file provided, using defaults");
            DeupConfig::default()
        }
    };

    if args.cuda {
        config.use_gpu = true;
    }
    if args.dry_run {
        config.epochs = 1;
        config.density.epochs = 1;
        config.density.hidden_size = 64;
        config.variance.epochs = 1;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    info!("  epochs       : {}", config.epochs);
    info!("  features     : {}", config.features);
    info!("  batch sizes  : train {} / eval {} / ood {}", config.train_batch_size, config.eval_batch_size, config.ood_batch_size);
    info!("  device       : {}", if config.use_gpu { "GPU" } else { "CPU" });

    let result = if args.dry_run {
        info!("DRY RUN: synthetic datasets ({} training samples)", args.dry_run_samples);
        let image = SyntheticImageConfig {
            height: config.variance.input_size,
            width: config.variance.input_size,
            channels: config.variance.in_channels,
            num_classes: config.variance.num_classes,
            ..SyntheticImageConfig::default()
        };
        let train = SyntheticImageDataset::new(args.dry_run_samples, SyntheticImageConfig { name: "synthetic_train".into(), ..image.clone() });
        let test = SyntheticImageDataset::new(
            (args.dry_run_samples / 2).max(config.variance.num_classes),
            SyntheticImageConfig { name: "synthetic_test".into(), ..image },
        );
        run(&config, &train, &test, &args.save_base_path)
    } else {
        match (
            NpyImageDataset::load(&args.data_base_path, "cifar10_train"),
            NpyImageDataset::load(&args.data_base_path, "cifar10_test"),
        ) {
            (Ok(train), Ok(test)) => run(&config, &train, &test, &args.save_base_path),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to load dataset: {e}");
                error!("Ensure the CIFAR-10 .npy files are present in {}", args.data_base_path.display());
                std::process::exit(1);
            }
        }
    };

    if let Err(e) = result {
        error!("Pretraining failed: {e}");
        std::process::exit(1);
    }
    info!("All splits finished; artifacts in {}", args.save_base_path.display());
}

/// Pretrain on the full data, then run every split.
fn run(config: &DeupConfig, train: &dyn LabeledDataset, test: &dyn LabeledDataset, save_base: &Path) -> DeupResult<()> {
    tch::manual_seed(config.seed as i64);
    std::fs::create_dir_all(save_base)?;
    let device = config.device();

    let pretrained = pretrain(config, train, test, save_base, device)?;
    for split in LabelSplit::all() {
        run_split(config, split, train, test, &pretrained, save_base, device)?;
    }
    Ok(())
}

/// Train the classifier alone on every class and save it.
fn pretrain(
    config: &DeupConfig,
    train: &dyn LabeledDataset,
    test: &dyn LabeledDataset,
    save_base: &Path,
    device: tch::Device,
) -> DeupResult<PathBuf> {
    info!("Pretraining on {} ({} samples)", train.name(), train.len());
    let mut cfg = config.clone();
    cfg.fit_error_predictor = false;

    let f = ResNet18Plus::new(config.variance.num_classes, device);
    let networks = DeupNetworks { f_predictor: Box::new(f), e_predictor: None };
    let mut estimator = DeupEstimator::new(networks, SignalSources::default(), cfg, device)?;

    let data = DeupData::new(DataLoader::new(train, config.train_batch_size, true, config.seed));
    let val = DataLoader::new(test, config.eval_batch_size, false, 0);
    let report = estimator.fit(&data, config.epochs, Some(&val))?;
    info!("Pretraining done after {} epochs", report.epochs_run);

    let path = ArtifactName::full("resnet18", DATASET, TAG, WEIGHTS_EXT)?.path_in(save_base);
    estimator.save_main_predictor(&path)?;
    estimator.save_history(&ArtifactName::full("history", DATASET, TAG, "json")?.path_in(save_base))?;
    info!("Saved pretrained classifier to {}", path.display());
    Ok(path)
}

/// Fit the signal sources of one split and train DEUP on it.
fn run_split(
    config: &DeupConfig,
    split: LabelSplit,
    train: &dyn LabeledDataset,
    test: &dyn LabeledDataset,
    pretrained: &Path,
    save_base: &Path,
    device: tch::Device,
) -> DeupResult<()> {
    let (a, b) = split.pair();
    info!("Split {}: holding out classes {a} and {b}", split.index());
    let name = |artifact: &str, ext: &str| ArtifactName::new(artifact, DATASET, split.index(), TAG, ext);

    let trainset = Subset::excluding_pair(train, split);
    let valset = Subset::excluding_pair(test, split);
    let oodset = Subset::with_pair(test, split);
    let train_loader = DataLoader::new(&trainset, config.train_batch_size, true, config.seed);
    let val_loader = DataLoader::new(&valset, config.eval_batch_size, false, 0);

    let mut density = MafMogDensityEstimator::new(config.density.clone(), trainset.input_dim(), device)?;
    let report = density.fit(&trainset, &name("mafmog", WEIGHTS_EXT)?.path_in(save_base))?;
    info!("{}", report.summary());

    let var_path = name("duq", WEIGHTS_EXT)?.path_in(save_base);
    let mut variance = DuqVarianceSource::new(config.variance.clone(), device)?;
    variance.fit(&train_loader, &var_path, None)?;
    let report = variance.fit(&train_loader, &var_path, Some(&val_loader))?;
    if let Err(e) = report.ensure_converged() {
        warn!("Continuing with the last variance source state: {e}");
    }

    let mut f = ResNet18Plus::new(config.variance.num_classes, device);
    f.load(pretrained)?;
    let e = Mlp::new(
        MlpSpec {
            input_dim: config.feature_mode()?.width(),
            output_dim: 1,
            hidden_size: 1024,
            n_hidden: 3,
            activation: Activation::Relu,
            output: OutputActivation::Sigmoid,
        },
        device,
    );

    let networks = DeupNetworks { f_predictor: Box::new(f), e_predictor: Some(Box::new(e)) };
    let signals = SignalSources { density: Some(Box::new(density)), variance: Some(Box::new(variance)) };
    let mut estimator = DeupEstimator::new(networks, signals, config.clone(), device)?;

    let data = DeupData {
        train_loader,
        error_loader: None,
        ood_loader: Some(DataLoader::new(&oodset, config.ood_batch_size, false, 0)),
    };
    let report = estimator.fit(&data, config.epochs, Some(&val_loader))?;
    if let Some(v) = report.history.last().and_then(|r| r.validation.as_ref()) {
        info!("Split {} final: {}", split.index(), v.summary());
    }

    estimator.save_main_predictor(&name("resnet18", WEIGHTS_EXT)?.path_in(save_base))?;
    estimator.save_error_predictor(&name("errornet", WEIGHTS_EXT)?.path_in(save_base))?;
    estimator.save_history(&name("history", "json")?.path_in(save_base))?;
    Ok(())
}
