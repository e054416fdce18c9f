use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{builder::NonEmptyStringValueParser, Parser};
use sdgen_core::{
    DeviceMap, GenerationOutcome, HardwareProbe, Pipeline, Reporter, Sd3Loader, UserOverrides,
    DEFAULT_GUIDANCE_SCALE,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(name = "sdgen", author, version, about = "Generate images using Stable Diffusion 3")]
struct Args {
    /// Text prompt for image generation
    #[arg(long, value_parser = NonEmptyStringValueParser::new())]
    prompt: String,

    /// Output path for the generated image
    #[arg(long)]
    output: PathBuf,

    /// Path to the SD3 model checkpoint
    #[arg(long)]
    model: PathBuf,

    /// Image width (0 = auto)
    #[arg(long)]
    width: Option<usize>,

    /// Image height (0 = auto)
    #[arg(long)]
    height: Option<usize>,

    /// Number of inference steps (0 = auto)
    #[arg(long)]
    steps: Option<usize>,

    /// Negative prompt
    #[arg(long)]
    negative: Option<String>,

    /// Guidance scale
    #[arg(long, default_value_t = DEFAULT_GUIDANCE_SCALE)]
    guidance: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Accelerator ordinal to run on
    #[arg(long, default_value_t = 0)]
    device_ordinal: usize,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> UserOverrides {
        UserOverrides {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative.clone(),
            width: self.width,
            height: self.height,
            steps: self.steps,
            guidance: Some(self.guidance),
            seed: self.seed,
        }
    }
}

/// Logs go to stderr; stdout is reserved for the result record.
fn init_logging(verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sdgen_core={log_level},sdgen={log_level}").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = init_logging(args.verbose) {
        eprintln!("Error: failed to initialize logging: {err:#}");
        return ExitCode::FAILURE;
    }

    let pipeline = Pipeline::new(
        HardwareProbe::new(DeviceMap::new(args.cpu, args.device_ordinal)),
        Sd3Loader::new(),
    );
    let outcome = GenerationOutcome::from(
        pipeline
            .run(&args.overrides(), &args.model, &args.output)
            .await,
    );

    let mut reporter = Reporter::new(std::io::stdout().lock());
    match reporter.report(&outcome) {
        Ok(status) => ExitCode::from(status),
        Err(err) => {
            tracing::error!("{}: {err}", err.category());
            ExitCode::FAILURE
        }
    }
}
