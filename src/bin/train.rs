//! DBN training binary.
//!
//! Trains a single RBM or a full Deep Belief Network on MNIST IDX files and
//! reports test accuracy for the chosen fine-tuning mode.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dbn::classifier::accuracy;
use dbn::core::rbm::DisplayFn;
use dbn::data::mnist::MNIST_NUM_CLASSES;
use dbn::data::{binarize, load_mnist, normalize, shuffle_rows, MnistSplit};
use dbn::{Dbn, FineTuneConfig, LogisticRegression, Rbm, RbmTrainConfig, UpdateRule};
use ndarray::{s, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Width of an MNIST digit, used when drawing reconstructions.
const IMAGE_WIDTH: usize = 28;

#[derive(Parser, Debug)]
#[command(name = "dbn-train", about = "Train RBMs and Deep Belief Networks on MNIST")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a single RBM with contrastive divergence and save it
    Rbm(RbmArgs),
    /// Pretrain a DBN, fine-tune it and report test accuracy
    Dbn(DbnArgs),
}

#[derive(Args, Debug)]
struct DataArgs {
    /// Directory containing the MNIST IDX files
    #[arg(long, default_value = "data/mnist")]
    mnist_dir: PathBuf,

    /// Number of training images to use (0 = all)
    #[arg(long, default_value_t = 10_000)]
    train_size: usize,

    /// Number of test images to use (0 = all)
    #[arg(long, default_value_t = 1_000)]
    test_size: usize,

    /// JSON file with `pretrain` and `fine_tune` hyper-parameter sections
    #[arg(long)]
    config: Option<PathBuf>,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Override the number of epochs in every training phase
    #[arg(long)]
    epochs: Option<usize>,

    /// Override the learning-rate rule in every phase: constant, linear or exponential
    #[arg(long)]
    alpha_rule: Option<String>,

    /// Final learning rate of each segment for the linear rule
    #[arg(long, default_value_t = 0.0)]
    alpha_end: f32,

    /// Per-epoch decay factor for the exponential rule
    #[arg(long, default_value_t = 0.95)]
    alpha_decay: f32,
}

#[derive(Args, Debug)]
struct RbmArgs {
    #[command(flatten)]
    data: DataArgs,

    /// Hidden layer size
    #[arg(long, default_value_t = 500)]
    hidden: usize,

    /// Output configuration file
    #[arg(long, default_value = "data/output/rbm.json")]
    out: PathBuf,

    /// Draw a reconstructed digit on stderr after every epoch
    #[arg(long, default_value_t = false)]
    display: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FineTune {
    /// Wake-sleep with a top-level associative memory
    Ws,
    /// Backpropagation through a softmax layer (training error only)
    Bp,
    /// Logistic regression on the top-layer representation
    Cls,
}

#[derive(Args, Debug)]
struct DbnArgs {
    #[command(flatten)]
    data: DataArgs,

    /// Layer sizes, visible first
    #[arg(long, value_delimiter = ',', default_value = "784,500,500")]
    layers: Vec<usize>,

    /// Fine-tuning mode
    #[arg(long, value_enum, default_value_t = FineTune::Ws)]
    fine_tune: FineTune,

    /// Hidden units of the wake-sleep associative memory
    #[arg(long, default_value_t = 2000)]
    num_last_layer: usize,

    /// Load pretrained RBMs instead of pretraining (bottom first)
    #[arg(long, value_delimiter = ',')]
    load_rbms: Vec<PathBuf>,

    /// Directory where the pretrained RBMs are saved
    #[arg(long, default_value = "data/output/rbms")]
    save_dir: PathBuf,

    /// Output file for the fine-tuning errors
    #[arg(long, default_value = "data/output/performance.json")]
    metrics_file: PathBuf,
}

/// Hyper-parameter file layout; missing sections fall back to defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TrainFile {
    pretrain: RbmTrainConfig,
    fine_tune: FineTuneConfig,
}

impl TrainFile {
    fn load(args: &DataArgs) -> Result<Self> {
        let mut file = match args.config.as_deref() {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                serde_json::from_str(&json)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => TrainFile::default(),
        };
        if let Some(epochs) = args.epochs {
            file.pretrain.epochs = epochs;
            file.fine_tune.epochs = epochs;
        }
        if let Some(name) = args.alpha_rule.as_deref() {
            let rule = UpdateRule::from_name(name, args.alpha_end, args.alpha_decay)?;
            file.pretrain.alpha_rule = rule;
            file.fine_tune.alpha_rule = rule;
        }
        Ok(file)
    }
}

fn limit(size: usize) -> Option<usize> {
    (size > 0).then_some(size)
}

/// Load a split, shuffle it and scale it to binary pixels.
fn load_split(args: &DataArgs, split: MnistSplit, size: usize, rng: &mut StdRng) -> Result<(Array2<f32>, Vec<usize>)> {
    let (mut images, labels) = load_mnist(&args.mnist_dir, split, limit(size))
        .with_context(|| format!("failed to load MNIST from {}", args.mnist_dir.display()))?;
    normalize(&mut images);
    let images = binarize(&images, 0.5);
    let (images, labels) = shuffle_rows(&images, &labels, rng)?;
    info!("loaded {} {:?} images of width {}", images.nrows(), split, images.ncols());
    Ok((images, labels))
}

fn draw_digit(epoch: usize, sample: ArrayView1<'_, f32>) {
    let mut art = String::with_capacity(sample.len() + sample.len() / IMAGE_WIDTH);
    for (i, &p) in sample.iter().enumerate() {
        art.push(if p > 0.5 { '#' } else { '.' });
        if (i + 1) % IMAGE_WIDTH == 0 {
            art.push('\n');
        }
    }
    eprintln!("epoch {epoch} reconstruction:\n{art}");
}

fn run_rbm(args: RbmArgs) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(args.data.seed);
    let config = TrainFile::load(&args.data)?;
    let (train, _) = load_split(&args.data, MnistSplit::Train, args.data.train_size, &mut rng)?;
    let (test, _) = load_split(&args.data, MnistSplit::Test, args.data.test_size, &mut rng)?;

    // Validate on one batch worth of test images.
    let val_rows = config.pretrain.batch_size.min(test.nrows());
    let validation = test.slice(s![..val_rows, ..]).to_owned();

    let mut rbm = Rbm::new(train.ncols(), args.hidden, &mut rng)?;
    let start = Instant::now();
    let mut draw = draw_digit;
    let display: Option<DisplayFn<'_>> = if args.display { Some(&mut draw) } else { None };
    let history = rbm.train(&train, Some(&validation), &config.pretrain, &mut rng, display)?;
    if let Some(last) = history.last() {
        info!(
            "trained in {:.1}s, final reconstruction error {:.4}",
            start.elapsed().as_secs_f32(),
            last.reconstruction_error
        );
    }

    rbm.save_configuration(&args.out)?;
    info!("saved RBM to {}", args.out.display());
    Ok(())
}

fn run_dbn(args: DbnArgs) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(args.data.seed);
    let mut config = TrainFile::load(&args.data)?;
    config.fine_tune.num_labels.get_or_insert(MNIST_NUM_CLASSES);
    let (train, train_labels) = load_split(&args.data, MnistSplit::Train, args.data.train_size, &mut rng)?;
    let (test, test_labels) = load_split(&args.data, MnistSplit::Test, args.data.test_size, &mut rng)?;

    if args.layers.first() != Some(&train.ncols()) {
        bail!(
            "first layer must match the image width {}, got {:?}",
            train.ncols(),
            args.layers
        );
    }

    let mut dbn = Dbn::new(&args.layers, Box::new(LogisticRegression::default()), &mut rng)?;
    if args.load_rbms.is_empty() {
        let start = Instant::now();
        dbn.unsupervised_pretrain(&train, None, &config.pretrain, &mut rng, None)?;
        info!("pretraining finished in {:.1}s", start.elapsed().as_secs_f32());
        let paths = dbn.save_rbms(&args.save_dir)?;
        info!("saved {} RBMs to {}", paths.len(), args.save_dir.display());
    } else {
        dbn.load_rbms(args.load_rbms.as_slice())?;
        info!("loaded RBMs with sizes {:?}", dbn.sizes());
    }

    let start = Instant::now();
    match args.fine_tune {
        FineTune::Ws => {
            dbn.wake_sleep(args.num_last_layer, &train, &train_labels, &config.fine_tune, &mut rng)?;
            let predictions = dbn.predict_ws(&test, config.fine_tune.top_gibbs_k, &mut rng)?;
            info!("wake-sleep test accuracy: {:.4}", accuracy(&predictions, &test_labels));
        }
        FineTune::Bp => {
            dbn.backprop(MNIST_NUM_CLASSES, &train, &train_labels, &config.fine_tune, &mut rng)?;
            if let Some(error) = dbn.errors.last() {
                info!("backprop final training error: {error:.4}");
            }
        }
        FineTune::Cls => {
            dbn.fit_cls(&train, &train_labels, &mut rng)?;
            let predictions = dbn.predict_cls(&test, &mut rng)?;
            info!("classifier test accuracy: {:.4}", accuracy(&predictions, &test_labels));
        }
    }
    info!("fine-tuning finished in {:.1}s", start.elapsed().as_secs_f32());

    if !dbn.errors.is_empty() {
        dbn.save_performance_metrics(&args.metrics_file)?;
        info!("saved fine-tuning errors to {}", args.metrics_file.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dbn=info,dbn_train=info")))
        .init();

    match Cli::parse().command {
        Command::Rbm(args) => run_rbm(args),
        Command::Dbn(args) => run_dbn(args),
    }
}
