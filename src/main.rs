use clap::Parser;
use srgan::TrainConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod eval;
mod train;

#[derive(Parser)]
#[clap(
    name = "srgan",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
struct Entry {
    /// Log at debug level unless `RUST_LOG` is set
    #[clap(short, long, global = true)]
    verbose: bool,
    /// JSON training config, defaults are used for missing keys
    #[clap(long, global = true)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// Warm-start then adversarial training
    Train {
        /// Dataset path
        dataset: PathBuf,
        /// Model path
        model: PathBuf,
        /// Pretrained VGG weights
        #[clap(long)]
        vgg_weights: Option<PathBuf>,
        /// Warm-start epochs
        #[clap(long)]
        init_epochs: Option<u64>,
        /// Adversarial epochs
        #[clap(long)]
        gan_epochs: Option<u64>,
        #[clap(long)]
        batch_size: Option<i64>,
        #[clap(long)]
        seed: Option<i64>,
    },
    /// Upscale one image
    Eval {
        /// Generator path
        gen_path: PathBuf,
        /// Input image
        image: PathBuf,
        /// Demo path
        demo: PathBuf,
        /// Downscale the input first and score the result against it
        #[clap(long)]
        reference: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Entry::parse();
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let mut cfg = match &args.config {
        Some(path) => TrainConfig::load(path)?,
        None => TrainConfig::default(),
    };
    match args.subcommand {
        Subcommand::Train {
            dataset,
            model,
            vgg_weights,
            init_epochs,
            gan_epochs,
            batch_size,
            seed,
        } => {
            if let Some(n) = init_epochs {
                cfg.init_epochs = n;
            }
            if let Some(n) = gan_epochs {
                cfg.gan_epochs = n;
            }
            if let Some(n) = batch_size {
                cfg.batch_size = n;
            }
            if seed.is_some() {
                cfg.seed = seed;
            }
            train::train(dataset, model, vgg_weights, cfg)?;
        }
        Subcommand::Eval {
            gen_path,
            image,
            demo,
            reference,
        } => eval::eval(gen_path, image, demo, cfg.model, reference)?,
    }
    Ok(())
}
