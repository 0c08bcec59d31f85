// SPDX-License-Identifier: AGPL-3.0-only

//! `cwl2`: command-line front end for the Carlini-Wagner L2 attack.
//!
//! ```text
//! USAGE:
//!   cwl2 init-model <out>            Write a random linear or MLP blob
//!   cwl2 inspect <model>             Print a blob's geometry
//!   cwl2 attack [--model <path>]     Attack seeded synthetic images
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cw_attack::{one_hot, AttackConfig, BackendSelection, CarliniL2, Fallback};
use cw_models::{AnyClassifier, Classifier, ImageShape, LinearClassifier, Mlp};
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cwl2", about = "Carlini-Wagner L2 adversarial attack", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Write a randomly initialised classifier to a weight blob.
    InitModel {
        /// Output path.
        out: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Print the geometry of a weight blob.
    Inspect {
        /// Blob to read.
        model: PathBuf,
    },
    /// Run the attack on seeded synthetic images.
    Attack(AttackArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelKind {
    Linear,
    Mlp,
}

#[derive(Clone, Copy, ValueEnum)]
enum FallbackArg {
    Original,
    Zeros,
}

impl From<FallbackArg> for Fallback {
    fn from(arg: FallbackArg) -> Self {
        match arg {
            FallbackArg::Original => Self::Original,
            FallbackArg::Zeros => Self::Zeros,
        }
    }
}

#[derive(Args)]
struct ModelArgs {
    /// Classifier family.
    #[arg(long, value_enum, default_value_t = ModelKind::Linear)]
    kind: ModelKind,
    /// Input geometry as HxWxC (e.g. 28x28x1).
    #[arg(long, value_parser = parse_shape, default_value = "8x8x1")]
    shape: ImageShape,
    /// Number of classes.
    #[arg(long, default_value_t = 10)]
    classes: usize,
    /// Hidden width (MLP only).
    #[arg(long, default_value_t = 32)]
    hidden: usize,
    /// Weight initialisation seed.
    #[arg(long, default_value_t = 0)]
    model_seed: u64,
}

#[derive(Args)]
struct AttackArgs {
    /// Weight blob to attack; a random model is built from the flags below otherwise.
    #[arg(long)]
    model: Option<PathBuf>,
    #[command(flatten)]
    random: ModelArgs,
    /// Number of synthetic images.
    #[arg(long, default_value_t = 16)]
    count: usize,
    /// Seed for images and target selection.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Attack a random target class instead of just the true one.
    #[arg(long)]
    targeted: bool,
    /// Required logit gap.
    #[arg(long, default_value_t = 0.0)]
    confidence: f32,
    /// Binary-search steps over the tradeoff constant.
    #[arg(long, default_value_t = cw_attack::DEFAULT_BINARY_SEARCH_STEPS)]
    binary_search_steps: usize,
    /// Adam iterations per search step.
    #[arg(long, default_value_t = cw_attack::DEFAULT_MAX_ITERATIONS)]
    max_iterations: usize,
    /// Adam learning rate.
    #[arg(long, default_value_t = cw_attack::DEFAULT_LEARNING_RATE)]
    learning_rate: f32,
    /// Starting tradeoff constant.
    #[arg(long, default_value_t = cw_attack::DEFAULT_INITIAL_CONST)]
    initial_const: f32,
    /// Examples per batch.
    #[arg(long, default_value_t = cw_attack::DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    /// Never stop a search step early.
    #[arg(long)]
    no_abort: bool,
    /// What unfooled examples return.
    #[arg(long, value_enum, default_value_t = FallbackArg::Original)]
    fallback: FallbackArg,
    /// Gradient backend: auto, tape or session.
    #[arg(long, default_value = "auto")]
    backend: BackendSelection,
    /// Print one line per example.
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::InitModel { out, model } => cmd_init_model(&out, &model)?,
        Cmd::Inspect { model } => cmd_inspect(&model)?,
        Cmd::Attack(args) => cmd_attack(&args)?,
    }

    Ok(())
}

fn parse_shape(s: &str) -> std::result::Result<ImageShape, String> {
    let dims: Vec<usize> = s
        .split('x')
        .map(|d| d.trim().parse::<usize>().map_err(|e| format!("{d:?}: {e}")))
        .collect::<std::result::Result<_, _>>()?;
    match dims[..] {
        [h, w, c] if h > 0 && w > 0 && c > 0 => Ok(ImageShape::new(h, w, c)),
        [_, _, _] => Err("dimensions must be non-zero".into()),
        _ => Err(format!("expected HxWxC, got {s:?}")),
    }
}

fn build_model(args: &ModelArgs) -> Result<AnyClassifier> {
    if args.classes < 2 {
        bail!("need at least two classes, got {}", args.classes);
    }
    Ok(match args.kind {
        ModelKind::Linear => {
            LinearClassifier::random(args.shape, args.classes, args.model_seed).into()
        }
        ModelKind::Mlp => {
            if args.hidden == 0 {
                bail!("hidden width must be non-zero");
            }
            Mlp::random(args.shape, args.hidden, args.classes, args.model_seed).into()
        }
    })
}

fn cmd_init_model(out: &Path, args: &ModelArgs) -> Result<()> {
    let model = build_model(args)?;
    model
        .save(out)
        .with_context(|| format!("writing {}", out.display()))?;
    println!(
        "Wrote {} classifier {} -> {} classes to {}",
        model.kind(),
        model.input_shape(),
        model.num_classes(),
        out.display()
    );
    Ok(())
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let model =
        AnyClassifier::load(path).with_context(|| format!("reading {}", path.display()))?;
    println!("File         : {}", path.display());
    println!("Kind         : {}", model.kind());
    println!("Input shape  : {}", model.input_shape());
    println!("Classes      : {}", model.num_classes());
    if let AnyClassifier::Mlp(mlp) = &model {
        println!("Hidden width : {}", mlp.hidden());
    }
    println!("Blob size    : {} bytes", model.to_bytes().len());
    Ok(())
}

fn cmd_attack(args: &AttackArgs) -> Result<()> {
    let model = match &args.model {
        Some(path) => {
            AnyClassifier::load(path).with_context(|| format!("reading {}", path.display()))?
        }
        None => build_model(&args.random)?,
    };
    let shape = model.input_shape();
    let classes = model.num_classes();
    info!("Attacking {} {shape} -> {classes} classifier", model.kind());

    let mut rng = StdRng::seed_from_u64(args.seed);
    let images = Array4::from_shape_simple_fn(shape.batch_dims(args.count), || rng.gen::<f32>());
    let truth = model.predict(images.view())?;
    let labels = one_hot(&truth, classes);

    let config = AttackConfig::new(shape, classes)
        .with_targeted(args.targeted)
        .with_random_targets(true)
        .with_seed(args.seed)
        .with_confidence(args.confidence)
        .with_binary_search_steps(args.binary_search_steps)
        .with_max_iterations(args.max_iterations)
        .with_learning_rate(args.learning_rate)
        .with_initial_const(args.initial_const)
        .with_batch_size(args.batch_size)
        .with_abort_early(!args.no_abort)
        .with_fallback(args.fallback.into())
        .with_backend(args.backend);
    let outcome = CarliniL2::new(&model, config)?.attack(images.view(), labels.view())?;

    if args.verbose {
        for e in 0..args.count {
            let target = cw_models::argmax(outcome.labels.row(e).iter().copied());
            match outcome.best_class[e] {
                Some(class) => println!(
                    "[{e:>4}] true {} label {target} -> {class}  L2 {:.6}",
                    truth[e], outcome.best_l2[e]
                ),
                None => println!("[{e:>4}] true {} label {target} -> not fooled", truth[e]),
            }
        }
        println!();
    }

    let fooled: Vec<f32> = (0..args.count)
        .filter(|&e| outcome.succeeded(e))
        .map(|e| outcome.best_l2[e])
        .collect();
    println!(
        "Success rate : {:.4} ({}/{})",
        outcome.success_rate,
        fooled.len(),
        args.count
    );
    if fooled.is_empty() {
        println!("Mean L2      : n/a");
    } else {
        println!("Mean L2      : {:.6}", fooled.iter().sum::<f32>() / fooled.len() as f32);
    }
    Ok(())
}
