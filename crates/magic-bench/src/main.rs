//! magic-bench: CLI tool for running refinement passes against preview
//! stages and collecting diagnostics.
//!
//! Drives the step orchestrator with lightweight stand-in stages so step
//! sequencing, override handling and cancellation can be observed without
//! a model runtime. Useful for:
//!
//! - Checking which preset and parameters each stage call receives
//! - Comparing preset mode against custom overrides
//! - Exercising cancellation (`--cancel-after`, Ctrl-C)
//! - Measuring per-step durations across repeated runs
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin magic-bench -- [OPTIONS]
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod preview;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use image::RgbaImage;
use magic_pipeline::{
    BoxError, CancellationSignal, Connectors, EnhanceOutput, EnhanceRequest, EnhancementStage,
    InterruptFlag, Orchestrator, RunConfig, RunDiagnostics, RunError, SamplingParams, StartState,
    StdClock, StepCount,
};
use tracing_subscriber::EnvFilter;

use crate::preview::{
    Preview, PreviewConditioning, PreviewControl, PreviewEnhancer, PreviewFuser, PreviewLatent,
    PreviewModel, PreviewVae,
};

/// Exit status for a run stopped by an interrupt.
const EXIT_INTERRUPTED: u8 = 130;

/// Multi-step refinement runs against preview stages.
///
/// Runs one to four refinement steps with configurable shared parameters
/// and prints per-step timing and parameter diagnostics.
#[derive(Parser)]
#[command(name = "magic-bench", version)]
struct Cli {
    /// Number of refinement steps. Values outside 1..=4 are clamped.
    #[arg(long, default_value_t = i64::from(StepCount::DEFAULT.get()), allow_negative_numbers = true)]
    step_count: i64,

    /// Let the shared parameters below override the per-step presets.
    #[arg(long)]
    custom: bool,

    /// Sampling seed. 0 lets the enhancement stage derive one.
    #[arg(long, default_value_t = SamplingParams::DEFAULT_SEED)]
    seed: u64,

    /// Sampler steps.
    #[arg(long, default_value_t = SamplingParams::DEFAULT_STEPS)]
    steps: u32,

    /// Guidance scale.
    #[arg(long, default_value_t = SamplingParams::DEFAULT_CFG)]
    cfg: f32,

    /// Denoise strength for steps 2 and later.
    #[arg(long, default_value_t = SamplingParams::DEFAULT_DENOISE)]
    denoise: f32,

    /// Sampler identifier.
    #[arg(long, default_value = SamplingParams::DEFAULT_SAMPLER)]
    sampler: String,

    /// Scheduler identifier.
    #[arg(long, default_value = SamplingParams::DEFAULT_SCHEDULER)]
    scheduler: String,

    /// Comma-separated region-hint focus terms.
    #[arg(long, default_value = SamplingParams::DEFAULT_CLIPSEG_TEXT)]
    clipseg_text: String,

    /// Full run config as a JSON string.
    ///
    /// When provided, all other run parameter flags are ignored. Missing
    /// fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,

    /// Reference image (PNG, JPEG, BMP, WebP) handed to every enhancement
    /// call.
    #[arg(long)]
    reference: Option<PathBuf>,

    /// Latent width in pixels.
    #[arg(long, default_value_t = 64, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..=4096))]
    width: u32,

    /// Latent height in pixels.
    #[arg(long, default_value_t = 64, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..=4096))]
    height: u32,

    /// Write the final image of the first run as PNG.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Raise the interrupt once this step's enhancement has finished.
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<u8>::new().range(1..=4))]
    cancel_after: Option<u8>,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,
}

/// Build a [`RunConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored. Otherwise, a config is
/// assembled from the individual flags.
fn config_from_cli(cli: &Cli) -> Result<RunConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    Ok(RunConfig {
        step_count: cli.step_count,
        custom: cli.custom,
        sampling: SamplingParams {
            seed: cli.seed,
            steps: cli.steps,
            cfg: cli.cfg,
            denoise: cli.denoise,
            sampler_name: cli.sampler.clone(),
            scheduler: cli.scheduler.clone(),
            clipseg_text: cli.clipseg_text.clone(),
        },
    })
}

/// Reject parameters the preview enhancer cannot run with.
fn validate(config: &RunConfig, enhancer: &PreviewEnhancer) -> Result<(), String> {
    let samplers = EnhancementStage::<Preview>::samplers(enhancer);
    let schedulers = EnhancementStage::<Preview>::schedulers(enhancer);
    config
        .sampling
        .validate()
        .and_then(|()| config.sampling.validate_names(samplers, schedulers))
        .map_err(|e| format!("Invalid config: {e}"))
}

fn load_reference(path: &Path) -> Result<RgbaImage, String> {
    image::open(path)
        .map(|image| image.to_rgba8())
        .map_err(|e| format!("Error reading {}: {e}", path.display()))
}

/// Raised by either Ctrl-C or the `--cancel-after` script.
struct AnyInterrupt<'a> {
    user: &'a InterruptFlag,
    scripted: &'a InterruptFlag,
}

impl CancellationSignal for AnyInterrupt<'_> {
    fn is_interrupted(&self) -> bool {
        self.user.is_raised() || self.scripted.is_raised()
    }
}

/// Wraps an enhancer and raises a flag after a given step completes.
struct CancelAfter<'a, E> {
    inner: E,
    step: Option<u8>,
    flag: &'a InterruptFlag,
}

impl<E: EnhancementStage<Preview>> EnhancementStage<Preview> for CancelAfter<'_, E> {
    fn enhance(
        &self,
        request: &EnhanceRequest<'_, Preview>,
    ) -> Result<EnhanceOutput<Preview>, BoxError> {
        let output = self.inner.enhance(request)?;
        if self.step == Some(request.step().get()) {
            tracing::info!(step = request.step().get(), "scripted cancel");
            self.flag.raise();
        }
        Ok(output)
    }

    fn samplers(&self) -> &[&'static str] {
        self.inner.samplers()
    }

    fn schedulers(&self) -> &[&'static str] {
        self.inner.schedulers()
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let enhancer = PreviewEnhancer;
    if let Err(msg) = validate(&config, &enhancer) {
        eprintln!("{msg}");
        return ExitCode::FAILURE;
    }

    let reference = match cli.reference.as_deref().map(load_reference).transpose() {
        Ok(reference) => reference,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let user = InterruptFlag::new();
    let handler_flag = user.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("received Ctrl+C, stopping at the next step boundary");
        handler_flag.raise();
    }) {
        tracing::warn!(error = %e, "could not install Ctrl+C handler");
    }
    let scripted = InterruptFlag::new();

    let model = PreviewModel::default();
    let vae = PreviewVae::default();
    let control = PreviewControl::default();
    let mut connectors = Connectors::<Preview>::new(&model, &vae, &control);
    if let Some(ref image) = reference {
        connectors = connectors.with_reference_image(image);
    }

    let orchestrator = Orchestrator::new(
        CancelAfter {
            inner: enhancer,
            step: cli.cancel_after,
            flag: &scripted,
        },
        PreviewFuser::default(),
    )
    .with_signal(AnyInterrupt {
        user: &user,
        scripted: &scripted,
    });

    eprintln!(
        "Latent: {}x{}{}",
        cli.width,
        cli.height,
        if reference.is_some() {
            " (with reference)"
        } else {
            ""
        },
    );
    eprintln!("Config: {config:#?}");
    eprintln!("Effective steps: {}", config.effective_steps().get());
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }
        scripted.clear();

        let start = StartState {
            latent: PreviewLatent::empty(cli.width, cli.height),
            positive: PreviewConditioning::POSITIVE,
            negative: PreviewConditioning::NEGATIVE,
        };

        match orchestrator.run_with_clock(&config, connectors, start, &StdClock) {
            Ok((output, diagnostics)) => {
                if cli.json {
                    match serde_json::to_string_pretty(&diagnostics) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("Error serializing diagnostics: {e}");
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    println!("{}", diagnostics.report());
                }

                // Write the image on the first run only.
                if run == 0
                    && let Some(ref path) = cli.output
                {
                    match output.image.save(path) {
                        Ok(()) => {
                            eprintln!(
                                "Image written to {} ({}x{})",
                                path.display(),
                                output.image.width(),
                                output.image.height(),
                            );
                        }
                        Err(e) => {
                            eprintln!("Error writing image to {}: {e}", path.display());
                            return ExitCode::FAILURE;
                        }
                    }
                }

                all_diagnostics.push(diagnostics);
            }
            Err(e @ RunError::Interrupted { .. }) => {
                eprintln!("{e}");
                return ExitCode::from(EXIT_INTERRUPTED);
            }
            Err(e) => {
                eprintln!("Refinement error: {e}");
                if let Some(source) = std::error::Error::source(&e) {
                    eprintln!("  caused by: {source}");
                }
                return ExitCode::FAILURE;
            }
        }

        if cli.runs > 1 {
            eprintln!();
        }
    }

    // Print summary when multiple runs.
    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[RunDiagnostics]) {
    debug_assert!(!all_diagnostics.is_empty(), "no diagnostics to summarize");

    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    // Per-step means.
    println!();
    println!("{:<24} {:>12}", "Step", "Mean (ms)");
    println!("{}", "-".repeat(40));

    for index in StepCount::MAX.indices() {
        let step_durations: Vec<f64> = all_diagnostics
            .iter()
            .filter_map(|d| d.steps.iter().find(|s| s.step == index))
            .map(|s| s.duration().as_secs_f64() * 1000.0)
            .collect();

        if step_durations.is_empty() {
            continue;
        }

        let step_mean = step_durations.iter().sum::<f64>() / step_durations.len() as f64;
        println!("{:<24} {step_mean:>10.3}ms", format!("Step {index}"));
    }
}
