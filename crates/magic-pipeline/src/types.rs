//! Shared types for the refinement orchestrator.

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

/// Error currency for stage and reclaimer failures.
///
/// Stage errors are carried to the caller untouched inside
/// [`RunError::Stage`], so a caller that knows the concrete stage can
/// downcast them.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The artifact types a pair of stages agrees on.
///
/// The orchestrator never looks inside any of these. It only moves
/// latents, images and conditionings between stage calls and lends the
/// shared handles (model, VAE, control module) to every call.
pub trait Backend {
    /// Generative model handle.
    type Model;
    /// Encoder/decoder between latent and pixel space.
    type Vae;
    /// Latent samples.
    type Latent;
    /// Decoded image.
    type Image;
    /// One side of a conditioning pair.
    type Conditioning;
    /// Control-signal module consumed by the fusion stage.
    type ControlNet;
    /// Auxiliary image embedding forwarded to the enhancement stage.
    type ClipVision;
    /// Region mask reported by the enhancement stage.
    type Mask;
}

// ───────────────────────── Step numbering ─────────────────────────

/// One-based index of a refinement step (`1..=4`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepIndex(u8);

impl StepIndex {
    /// The first step, which runs enhancement only.
    pub const FIRST: Self = Self(1);

    /// Returns the index if it lies within `1..=StepCount::MAX`.
    #[must_use]
    pub const fn new(index: u8) -> Option<Self> {
        if index >= 1 && index <= StepCount::MAX.0 {
            Some(Self(index))
        } else {
            None
        }
    }

    /// The one-based step number.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Whether this is step 1.
    #[must_use]
    pub const fn is_first(self) -> bool {
        self.0 == 1
    }

    /// The preset tag stages resolve for this step.
    #[must_use]
    pub const fn preset(self) -> PresetId {
        PresetId(self)
    }
}

impl fmt::Display for StepIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of steps a run executes, always within `1..=4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepCount(u8);

impl StepCount {
    /// Smallest supported step count.
    pub const MIN: Self = Self(1);

    /// Largest supported step count.
    pub const MAX: Self = Self(4);

    /// Step count used when the caller does not choose one.
    pub const DEFAULT: Self = Self::MAX;

    /// Clamp an arbitrary requested count into `MIN..=MAX`.
    ///
    /// This is the orchestrator's policy: out-of-range requests are never
    /// rejected. Use [`StepCount::try_from`] for strict validation.
    #[must_use]
    pub fn clamped(requested: i64) -> Self {
        let clamped = requested.clamp(i64::from(Self::MIN.0), i64::from(Self::MAX.0));
        // Lossless: the value now lies within 1..=4.
        Self(u8::try_from(clamped).unwrap_or(Self::MAX.0))
    }

    /// The number of steps.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// The last step of the run.
    #[must_use]
    pub const fn last(self) -> StepIndex {
        StepIndex(self.0)
    }

    /// All step indices of the run in execution order.
    pub fn indices(self) -> impl Iterator<Item = StepIndex> {
        (1..=self.0).map(StepIndex)
    }
}

impl Default for StepCount {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<i64> for StepCount {
    type Error = ConfigError;

    fn try_from(requested: i64) -> Result<Self, Self::Error> {
        u8::try_from(requested)
            .ok()
            .and_then(StepIndex::new)
            .map(|last| Self(last.get()))
            .ok_or(ConfigError::StepCountOutOfRange { requested })
    }
}

/// Tag selecting a stage's private defaults for one step.
///
/// Rendered as `"Step 1"` through `"Step 4"`. The orchestrator builds and
/// passes it but never looks up what it stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PresetId(StepIndex);

impl PresetId {
    /// The step this preset belongs to.
    #[must_use]
    pub const fn step(self) -> StepIndex {
        self.0
    }
}

impl fmt::Display for PresetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step {}", self.0)
    }
}

impl Serialize for PresetId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PresetId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.strip_prefix("Step ")
            .and_then(|n| n.parse::<u8>().ok())
            .and_then(StepIndex::new)
            .map(StepIndex::preset)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid preset tag {tag:?}")))
    }
}

// ───────────────────────── Configuration ──────────────────────────

/// Sampling parameters shared by every enhancement call of a run.
///
/// Whether a stage honors them or falls back to its presets depends on
/// the override flag (see [`crate::stage::overrides`]). The orchestrator
/// forwards these values exactly as given, with one exception: step 1
/// always receives [`SamplingParams::FULL_DENOISE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Sampling seed. `0` asks the enhancement stage to derive one.
    pub seed: u64,

    /// Sampler steps per enhancement call.
    pub steps: u32,

    /// Classifier-free guidance scale.
    pub cfg: f32,

    /// Denoise strength for steps 2 and later.
    pub denoise: f32,

    /// Sampler identifier from the enhancement stage's catalog.
    pub sampler_name: String,

    /// Scheduler identifier from the enhancement stage's catalog.
    pub scheduler: String,

    /// Comma-separated focus terms for the region hint.
    pub clipseg_text: String,
}

impl SamplingParams {
    /// Default seed (derived by the stage).
    pub const DEFAULT_SEED: u64 = 0;
    /// Default sampler steps.
    pub const DEFAULT_STEPS: u32 = 25;
    /// Default guidance scale.
    pub const DEFAULT_CFG: f32 = 4.5;
    /// Default denoise strength.
    pub const DEFAULT_DENOISE: f32 = 0.65;
    /// Default sampler: the first entry of the usual sampler catalog.
    pub const DEFAULT_SAMPLER: &str = "euler";
    /// Default scheduler.
    pub const DEFAULT_SCHEDULER: &str = "MGHybrid";
    /// Default region-hint focus terms.
    pub const DEFAULT_CLIPSEG_TEXT: &str = "hand, feet, face";

    /// Denoise strength pinned on step 1.
    pub const FULL_DENOISE: f32 = 1.0;

    /// Accepted sampler steps.
    pub const STEPS_RANGE: RangeInclusive<u32> = 1..=10_000;
    /// Accepted guidance scale.
    pub const CFG_RANGE: RangeInclusive<f32> = 0.0..=100.0;
    /// Accepted denoise strength for steps 2 and later.
    pub const DENOISE_RANGE: RangeInclusive<f32> = 0.35..=0.9;

    /// Check every numeric field against its documented range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !Self::STEPS_RANGE.contains(&self.steps) {
            return Err(ConfigError::out_of_range(
                "steps",
                f64::from(self.steps),
                f64::from(*Self::STEPS_RANGE.start()),
                f64::from(*Self::STEPS_RANGE.end()),
            ));
        }
        if !Self::CFG_RANGE.contains(&self.cfg) {
            return Err(ConfigError::out_of_range(
                "cfg",
                f64::from(self.cfg),
                f64::from(*Self::CFG_RANGE.start()),
                f64::from(*Self::CFG_RANGE.end()),
            ));
        }
        if !Self::DENOISE_RANGE.contains(&self.denoise) {
            return Err(ConfigError::out_of_range(
                "denoise",
                f64::from(self.denoise),
                f64::from(*Self::DENOISE_RANGE.start()),
                f64::from(*Self::DENOISE_RANGE.end()),
            ));
        }
        Ok(())
    }

    /// Check the sampler and scheduler against a stage's catalog.
    ///
    /// An empty catalog accepts any identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownSampler`] or
    /// [`ConfigError::UnknownScheduler`].
    pub fn validate_names(&self, samplers: &[&str], schedulers: &[&str]) -> Result<(), ConfigError> {
        if !samplers.is_empty() && !samplers.contains(&self.sampler_name.as_str()) {
            return Err(ConfigError::UnknownSampler(self.sampler_name.clone()));
        }
        if !schedulers.is_empty() && !schedulers.contains(&self.scheduler.as_str()) {
            return Err(ConfigError::UnknownScheduler(self.scheduler.clone()));
        }
        Ok(())
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            seed: Self::DEFAULT_SEED,
            steps: Self::DEFAULT_STEPS,
            cfg: Self::DEFAULT_CFG,
            denoise: Self::DEFAULT_DENOISE,
            sampler_name: Self::DEFAULT_SAMPLER.to_string(),
            scheduler: Self::DEFAULT_SCHEDULER.to_string(),
            clipseg_text: Self::DEFAULT_CLIPSEG_TEXT.to_string(),
        }
    }
}

/// Data half of a run configuration.
///
/// Read-only for the duration of a run. The runtime handles (model, VAE,
/// control module, reference image, embedding) travel separately in
/// [`Connectors`] because they are borrowed, not data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Requested number of steps. Clamped into `1..=4` at run time.
    pub step_count: i64,

    /// When `true`, [`SamplingParams`] replace the enhancement stage's
    /// presets on every step (step-1 denoise excepted).
    pub custom: bool,

    /// Parameters shared by every enhancement call.
    #[serde(flatten)]
    pub sampling: SamplingParams,
}

impl RunConfig {
    /// The step count this configuration actually runs.
    #[must_use]
    pub fn effective_steps(&self) -> StepCount {
        StepCount::clamped(self.step_count)
    }

    /// Strict validation: the step count must already be in range and the
    /// sampling parameters must pass [`SamplingParams::validate`].
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        StepCount::try_from(self.step_count)?;
        self.sampling.validate()
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            step_count: i64::from(StepCount::DEFAULT.get()),
            custom: false,
            sampling: SamplingParams::default(),
        }
    }
}

/// Shared runtime handles lent to every stage call of a run.
pub struct Connectors<'a, B: Backend> {
    /// Generative model.
    pub model: &'a B::Model,
    /// Encoder/decoder.
    pub vae: &'a B::Vae,
    /// Control module for the fusion stage. Required even when only one
    /// step runs.
    pub control_net: &'a B::ControlNet,
    /// Caller-supplied reference image. When absent, steps 2 and later use
    /// the previous step's image instead.
    pub reference_image: Option<&'a B::Image>,
    /// Auxiliary embedding forwarded to every enhancement call.
    pub clip_vision: Option<&'a B::ClipVision>,
}

impl<'a, B: Backend> Connectors<'a, B> {
    /// Connectors without a reference image or embedding.
    #[must_use]
    pub const fn new(model: &'a B::Model, vae: &'a B::Vae, control_net: &'a B::ControlNet) -> Self {
        Self {
            model,
            vae,
            control_net,
            reference_image: None,
            clip_vision: None,
        }
    }

    /// Attach a caller-supplied reference image.
    #[must_use]
    pub const fn with_reference_image(mut self, image: &'a B::Image) -> Self {
        self.reference_image = Some(image);
        self
    }

    /// Attach an auxiliary embedding.
    #[must_use]
    pub const fn with_clip_vision(mut self, clip_vision: &'a B::ClipVision) -> Self {
        self.clip_vision = Some(clip_vision);
        self
    }
}

impl<B: Backend> Clone for Connectors<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for Connectors<'_, B> {}

/// Caller-provided starting point of a run.
pub struct StartState<B: Backend> {
    /// Starting latent.
    pub latent: B::Latent,
    /// Starting positive conditioning.
    pub positive: B::Conditioning,
    /// Starting negative conditioning.
    pub negative: B::Conditioning,
}

/// Artifacts threaded between steps once step 1 has produced an image.
///
/// Rebound as a whole after every step. A failed stage call drops the
/// state instead of leaving it half-updated.
pub struct StepState<B: Backend> {
    /// Latent produced by the last enhancement call.
    pub latent: B::Latent,
    /// Image produced by the last enhancement call.
    pub image: B::Image,
    /// Positive conditioning, rebound by every fusion call.
    pub positive: B::Conditioning,
    /// Negative conditioning, rebound by every fusion call.
    pub negative: B::Conditioning,
}

/// Final output of a run: the last enhancement call's latent and image.
pub struct RunOutput<B: Backend> {
    /// Final latent.
    pub latent: B::Latent,
    /// Final decoded image.
    pub image: B::Image,
}

// ───────────────────────── Errors ─────────────────────────────────

/// Which external stage a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Conditioning fusion.
    Fusion,
    /// Detail enhancement / sampling.
    Enhancement,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fusion => f.write_str("fusion"),
            Self::Enhancement => f.write_str("enhancement"),
        }
    }
}

/// Errors raised while validating a configuration.
///
/// The orchestrator never raises these itself; they come from the strict
/// helpers ([`RunConfig::validate`], [`StepCount::try_from`]) used by
/// callers that want to reject bad input up front.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Step count outside `1..=4`.
    #[error("step count {requested} is outside 1..=4")]
    StepCountOutOfRange {
        /// The rejected request.
        requested: i64,
    },

    /// A numeric parameter outside its documented range.
    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        /// Parameter name.
        field: &'static str,
        /// Rejected value.
        value: f64,
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },

    /// Sampler not in the enhancement stage's catalog.
    #[error("unknown sampler {0:?}")]
    UnknownSampler(String),

    /// Scheduler not in the enhancement stage's catalog.
    #[error("unknown scheduler {0:?}")]
    UnknownScheduler(String),
}

impl ConfigError {
    const fn out_of_range(field: &'static str, value: f64, min: f64, max: f64) -> Self {
        Self::OutOfRange {
            field,
            value,
            min,
            max,
        }
    }
}

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The cancellation signal was raised at a step boundary.
    #[error("run interrupted after {completed_steps} of {planned_steps} step(s)")]
    Interrupted {
        /// Steps fully completed before the abort.
        completed_steps: u8,
        /// Steps the run would have executed.
        planned_steps: u8,
    },

    /// A stage call failed. `source` is the stage's own error, untouched.
    #[error("{stage} stage failed on step {step}")]
    Stage {
        /// The failing stage.
        stage: StageKind,
        /// The step during which it failed.
        step: StepIndex,
        /// The stage's error.
        #[source]
        source: BoxError,
    },
}

impl RunError {
    /// Whether the run ended because of the cancellation signal.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // --- StepCount ---

    #[test]
    fn clamped_keeps_in_range_counts() {
        for n in 1..=4 {
            assert_eq!(i64::from(StepCount::clamped(n).get()), n);
        }
    }

    #[test]
    fn clamped_pins_out_of_range_counts() {
        assert_eq!(StepCount::clamped(0), StepCount::MIN);
        assert_eq!(StepCount::clamped(-3), StepCount::MIN);
        assert_eq!(StepCount::clamped(i64::MIN), StepCount::MIN);
        assert_eq!(StepCount::clamped(5), StepCount::MAX);
        assert_eq!(StepCount::clamped(i64::MAX), StepCount::MAX);
    }

    #[test]
    fn strict_step_count_rejects_out_of_range() {
        assert_eq!(
            StepCount::try_from(0),
            Err(ConfigError::StepCountOutOfRange { requested: 0 })
        );
        assert_eq!(
            StepCount::try_from(5),
            Err(ConfigError::StepCountOutOfRange { requested: 5 })
        );
        assert_eq!(StepCount::try_from(3).unwrap().get(), 3);
    }

    #[test]
    fn indices_run_from_one_to_count() {
        let steps: Vec<u8> = StepCount::clamped(3).indices().map(StepIndex::get).collect();
        assert_eq!(steps, vec![1, 2, 3]);
        assert_eq!(StepCount::clamped(3).last().get(), 3);
    }

    #[test]
    fn step_index_bounds() {
        assert!(StepIndex::new(0).is_none());
        assert!(StepIndex::new(5).is_none());
        assert!(StepIndex::new(1).unwrap().is_first());
        assert!(!StepIndex::new(4).unwrap().is_first());
    }

    // --- PresetId ---

    #[test]
    fn preset_tags_render_as_step_n() {
        let tags: Vec<String> = StepCount::MAX
            .indices()
            .map(|i| i.preset().to_string())
            .collect();
        assert_eq!(tags, ["Step 1", "Step 2", "Step 3", "Step 4"]);
    }

    #[test]
    fn preset_serializes_as_tag() {
        let json = serde_json::to_string(&StepIndex::new(2).unwrap().preset()).unwrap();
        assert_eq!(json, "\"Step 2\"");
        let back: PresetId = serde_json::from_str(&json).unwrap();
        assert_eq!(back.step().get(), 2);
    }

    #[test]
    fn preset_rejects_unknown_tags() {
        assert!(serde_json::from_str::<PresetId>("\"Step 9\"").is_err());
        assert!(serde_json::from_str::<PresetId>("\"Stage 1\"").is_err());
    }

    // --- SamplingParams ---

    #[test]
    fn sampling_defaults_match_documented_surface() {
        let p = SamplingParams::default();
        assert_eq!(p.seed, 0);
        assert_eq!(p.steps, 25);
        assert!((p.cfg - 4.5).abs() < f32::EPSILON);
        assert!((p.denoise - 0.65).abs() < f32::EPSILON);
        assert_eq!(p.scheduler, "MGHybrid");
        assert_eq!(p.clipseg_text, "hand, feet, face");
        assert!(p.validate().is_ok());
    }

    #[test]
    fn validate_rejects_denoise_outside_range() {
        let p = SamplingParams {
            denoise: 0.95,
            ..SamplingParams::default()
        };
        assert!(matches!(
            p.validate(),
            Err(ConfigError::OutOfRange { field: "denoise", .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_steps_and_nan_cfg() {
        let p = SamplingParams {
            steps: 0,
            ..SamplingParams::default()
        };
        assert!(matches!(
            p.validate(),
            Err(ConfigError::OutOfRange { field: "steps", .. })
        ));

        let p = SamplingParams {
            cfg: f32::NAN,
            ..SamplingParams::default()
        };
        assert!(matches!(
            p.validate(),
            Err(ConfigError::OutOfRange { field: "cfg", .. })
        ));
    }

    #[test]
    fn validate_names_against_catalog() {
        let p = SamplingParams::default();
        assert!(p.validate_names(&[], &[]).is_ok());
        assert!(p.validate_names(&["euler", "dpmpp_2m"], &["MGHybrid"]).is_ok());
        assert_eq!(
            p.validate_names(&["dpmpp_2m"], &[]),
            Err(ConfigError::UnknownSampler("euler".to_string()))
        );
        assert_eq!(
            p.validate_names(&[], &["karras"]),
            Err(ConfigError::UnknownScheduler("MGHybrid".to_string()))
        );
    }

    // --- RunConfig ---

    #[test]
    fn run_config_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.step_count, 4);
        assert!(!config.custom);
        assert_eq!(config.effective_steps(), StepCount::MAX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn run_config_partial_json_fills_defaults() {
        let config: RunConfig =
            serde_json::from_str(r#"{"step_count": 2, "custom": true, "seed": 7}"#).unwrap();
        assert_eq!(config.step_count, 2);
        assert!(config.custom);
        assert_eq!(config.sampling.seed, 7);
        assert_eq!(config.sampling.steps, SamplingParams::DEFAULT_STEPS);
        assert_eq!(config.sampling.scheduler, SamplingParams::DEFAULT_SCHEDULER);
    }

    #[test]
    fn run_config_serde_round_trip() {
        let config = RunConfig {
            step_count: 3,
            custom: true,
            sampling: SamplingParams {
                seed: 42,
                steps: 30,
                cfg: 6.0,
                denoise: 0.5,
                sampler_name: "dpmpp_2m".to_string(),
                scheduler: "karras".to_string(),
                clipseg_text: "face".to_string(),
            },
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn run_config_strict_validation_rejects_clampable_count() {
        let config = RunConfig {
            step_count: 7,
            ..RunConfig::default()
        };
        assert_eq!(config.effective_steps(), StepCount::MAX);
        assert_eq!(
            config.validate(),
            Err(ConfigError::StepCountOutOfRange { requested: 7 })
        );
    }

    // --- Errors ---

    #[test]
    fn interrupted_display() {
        let err = RunError::Interrupted {
            completed_steps: 2,
            planned_steps: 4,
        };
        assert_eq!(err.to_string(), "run interrupted after 2 of 4 step(s)");
        assert!(err.is_interrupted());
    }

    #[test]
    fn stage_error_keeps_source() {
        let err = RunError::Stage {
            stage: StageKind::Fusion,
            step: StepIndex::new(3).unwrap(),
            source: "control module rejected image".into(),
        };
        assert_eq!(err.to_string(), "fusion stage failed on step 3");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "control module rejected image");
        assert!(!err.is_interrupted());
    }
}
