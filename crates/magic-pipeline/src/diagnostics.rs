//! Run diagnostics: per-step timing and the values each stage reports
//! having used.
//!
//! Every call to [`Orchestrator::run_with_clock`](crate::Orchestrator::run_with_clock)
//! collects a [`RunDiagnostics`] alongside the output. Time comes from an
//! injected [`Clock`] so tests can drive it deterministically.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::types::{PresetId, StepCount, StepIndex};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Source of timestamps for diagnostics.
pub trait Clock {
    /// Opaque timestamp.
    type Instant;

    /// The current time.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// [`Clock`] backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Where an enhancement call's reference image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSource {
    /// No reference image (step 1 without a caller reference).
    None,
    /// The caller supplied one.
    Caller,
    /// The previous step's image stood in for a missing caller reference.
    PreviousStep,
}

/// Diagnostics collected from a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Steps the run set out to execute (after clamping).
    pub planned_steps: StepCount,
    /// Override flag passed to every enhancement call.
    pub custom: bool,
    /// One entry per completed step, in order.
    pub steps: Vec<StepDiagnostics>,
    /// Wall-clock duration of the whole run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

/// Diagnostics for one refinement step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDiagnostics {
    /// Step number.
    pub step: StepIndex,
    /// Fusion call, absent on step 1.
    pub fusion: Option<StageDiagnostics>,
    /// Enhancement call.
    pub enhancement: StageDiagnostics,
}

impl StepDiagnostics {
    /// Combined duration of the step's stage calls.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.fusion
            .as_ref()
            .map_or(Duration::ZERO, |f| f.duration)
            + self.enhancement.duration
    }
}

/// Diagnostics for a single stage call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of the call (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Conditioning fusion.
    Fusion {
        /// Preset tag passed.
        preset: PresetId,
        /// Override flag passed (always `false`).
        custom_override: bool,
        /// Whether the stage returned a preview.
        preview: bool,
    },
    /// Detail enhancement.
    Enhancement {
        /// Preset tag passed.
        preset: PresetId,
        /// Override flag passed.
        custom_override: bool,
        /// Denoise strength the orchestrator requested.
        denoise_requested: f32,
        /// Sampler steps the stage reports using.
        steps_used: u32,
        /// Guidance scale the stage reports using.
        cfg_used: f32,
        /// Denoise strength the stage reports using.
        denoise_used: f32,
        /// Where the reference image came from.
        reference: ReferenceSource,
        /// Whether the stage returned a mask.
        mask: bool,
    },
}

impl RunDiagnostics {
    /// Number of steps that completed.
    #[must_use]
    pub fn completed_steps(&self) -> usize {
        self.steps.len()
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Refinement Run Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Steps: {}/{}  |  Custom override: {}",
            self.completed_steps(),
            self.planned_steps.get(),
            if self.custom { "on" } else { "off" },
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);

        for step in &self.steps {
            let mut calls = Vec::with_capacity(2);
            if let Some(ref fusion) = step.fusion {
                calls.push((format!("Step {} fusion", step.step), fusion));
            }
            calls.push((format!("Step {} enhancement", step.step), &step.enhancement));

            for (name, diag) in calls {
                let ms = duration_ms(diag.duration);
                let pct = if total_ms > 0.0 {
                    ms / total_ms * 100.0
                } else {
                    0.0
                };
                let details = format_metrics(&diag.metrics);
                lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
            }
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Fusion {
            preset,
            custom_override,
            preview,
        } => {
            let preview = if *preview { " preview" } else { "" };
            format!("{preset} custom={custom_override}{preview}")
        }
        StageMetrics::Enhancement {
            preset,
            custom_override,
            denoise_requested,
            steps_used,
            cfg_used,
            denoise_used,
            reference,
            mask,
        } => {
            let reference = match reference {
                ReferenceSource::None => "none",
                ReferenceSource::Caller => "caller",
                ReferenceSource::PreviousStep => "previous",
            };
            let mask = if *mask { " mask" } else { "" };
            format!(
                "{preset} custom={custom_override} steps={steps_used} cfg={cfg_used:.2} denoise={denoise_requested:.2}->{denoise_used:.2} ref={reference}{mask}",
            )
        }
    }
}
