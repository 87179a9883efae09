//! Contracts for the two external stages a refinement step drives.
//!
//! Each stage is a single fixed interface with two orthogonal knobs: a
//! [`PresetId`] selecting the stage's private defaults for a step, and an
//! override flag saying whether the explicit parameters in the request
//! replace those defaults. Lighter and heavier stage variants are just
//! different implementations of the same trait; the orchestrator never
//! needs to know which one it is driving.
//!
//! # Strategy pattern
//!
//! The orchestrator is generic over [`EnhancementStage`] and
//! [`FusionStage`], with artifact types fixed by a shared [`Backend`].
//! Both traits are implemented for `&T`, so callers can lend a stage to
//! an orchestrator and keep inspecting it afterwards.

use serde::{Deserialize, Serialize};

use crate::types::{Backend, BoxError, PresetId, StepIndex};

/// A shared parameter an enhancement call can take from the request or
/// from its preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Param {
    /// Sampling seed.
    Seed,
    /// Sampler steps.
    Steps,
    /// Guidance scale.
    Cfg,
    /// Denoise strength.
    Denoise,
    /// Sampler identifier.
    Sampler,
    /// Scheduler identifier.
    Scheduler,
    /// Region-hint focus terms.
    ClipsegText,
}

impl Param {
    /// Every shared parameter.
    pub const ALL: [Self; 7] = [
        Self::Seed,
        Self::Steps,
        Self::Cfg,
        Self::Denoise,
        Self::Sampler,
        Self::Scheduler,
        Self::ClipsegText,
    ];
}

/// Where a stage should take a parameter's value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamSource {
    /// The caller's value in the request replaces the preset.
    Explicit,
    /// The stage's preset for this step applies.
    Preset,
    /// The request value is fixed by the orchestrator and applies in
    /// every mode (step-1 denoise).
    Pinned,
}

impl ParamSource {
    /// Whether the request value should be used.
    #[must_use]
    pub const fn uses_request(self) -> bool {
        matches!(self, Self::Explicit | Self::Pinned)
    }
}

/// Resolve where `param` comes from on `step`.
///
/// Step-1 denoise is pinned to full strength whatever the mode. Every
/// other parameter follows the override flag on every step.
#[must_use]
pub const fn resolve(custom: bool, step: StepIndex, param: Param) -> ParamSource {
    if step.is_first() && matches!(param, Param::Denoise) {
        ParamSource::Pinned
    } else if custom {
        ParamSource::Explicit
    } else {
        ParamSource::Preset
    }
}

/// Whether the caller's value overrides the preset for `param` on `step`.
///
/// Equivalent to `custom && (step != 1 || param != Denoise)`.
#[must_use]
pub const fn overrides(custom: bool, step: StepIndex, param: Param) -> bool {
    matches!(resolve(custom, step, param), ParamSource::Explicit)
}

// ───────────────────────── Enhancement ───────────────────────────

/// Arguments of one enhancement call.
pub struct EnhanceRequest<'a, B: Backend> {
    /// Preset tag for this step.
    pub preset: PresetId,
    /// Whether explicit parameters replace the preset.
    pub custom_override: bool,
    /// Generative model.
    pub model: &'a B::Model,
    /// Encoder/decoder.
    pub vae: &'a B::Vae,
    /// Current positive conditioning.
    pub positive: &'a B::Conditioning,
    /// Current negative conditioning.
    pub negative: &'a B::Conditioning,
    /// Current latent.
    pub latent: &'a B::Latent,
    /// Seed, forwarded unmodified. `0` asks the stage to derive one.
    pub seed: u64,
    /// Sampler steps.
    pub steps: u32,
    /// Guidance scale.
    pub cfg: f32,
    /// Denoise strength. Always `1.0` on step 1.
    pub denoise: f32,
    /// Sampler identifier.
    pub sampler_name: &'a str,
    /// Scheduler identifier.
    pub scheduler: &'a str,
    /// Auxiliary strength knob. The orchestrator always passes `0.0`.
    pub strength: f32,
    /// Comma-separated region-hint focus terms.
    pub clipseg_text: &'a str,
    /// Reference image: the caller's, or the previous step's image.
    pub reference_image: Option<&'a B::Image>,
    /// Auxiliary embedding.
    pub clip_vision: Option<&'a B::ClipVision>,
}

impl<B: Backend> EnhanceRequest<'_, B> {
    /// The step this call belongs to.
    #[must_use]
    pub const fn step(&self) -> StepIndex {
        self.preset.step()
    }

    /// Where `param` should come from for this call.
    #[must_use]
    pub const fn source(&self, param: Param) -> ParamSource {
        resolve(self.custom_override, self.step(), param)
    }

    /// Whether the request value of `param` replaces the preset.
    #[must_use]
    pub const fn overrides(&self, param: Param) -> bool {
        overrides(self.custom_override, self.step(), param)
    }
}

/// Result of one enhancement call.
pub struct EnhanceOutput<B: Backend> {
    /// Refined latent.
    pub latent: B::Latent,
    /// Decoded image.
    pub image: B::Image,
    /// Sampler steps actually used.
    pub steps_used: u32,
    /// Guidance scale actually used.
    pub cfg_used: f32,
    /// Denoise strength actually used.
    pub denoise_used: f32,
    /// Region mask, when the stage computed one.
    pub mask: Option<B::Mask>,
}

/// Detail-enhancement / sampling stage.
pub trait EnhancementStage<B: Backend> {
    /// Refine a latent and decode it.
    ///
    /// # Errors
    ///
    /// Any error is propagated to the orchestrator's caller unchanged.
    fn enhance(&self, request: &EnhanceRequest<'_, B>) -> Result<EnhanceOutput<B>, BoxError>;

    /// Sampler identifiers this stage accepts. Empty means unrestricted.
    fn samplers(&self) -> &[&'static str] {
        &[]
    }

    /// Scheduler identifiers this stage accepts. Empty means unrestricted.
    fn schedulers(&self) -> &[&'static str] {
        &[]
    }
}

impl<B: Backend, T: EnhancementStage<B> + ?Sized> EnhancementStage<B> for &T {
    fn enhance(&self, request: &EnhanceRequest<'_, B>) -> Result<EnhanceOutput<B>, BoxError> {
        (**self).enhance(request)
    }

    fn samplers(&self) -> &[&'static str] {
        (**self).samplers()
    }

    fn schedulers(&self) -> &[&'static str] {
        (**self).schedulers()
    }
}

// ───────────────────────── Fusion ────────────────────────────────

/// Arguments of one fusion call.
pub struct FuseRequest<'a, B: Backend> {
    /// Preset tag for this step.
    pub preset: PresetId,
    /// Whether explicit parameters replace the preset. The orchestrator
    /// always runs fusion on presets and passes `false`.
    pub custom_override: bool,
    /// Image produced by the previous step.
    pub image: &'a B::Image,
    /// Current positive conditioning.
    pub positive: &'a B::Conditioning,
    /// Current negative conditioning.
    pub negative: &'a B::Conditioning,
    /// Control module.
    pub control_net: &'a B::ControlNet,
    /// Encoder/decoder.
    pub vae: &'a B::Vae,
}

/// Result of one fusion call.
pub struct FuseOutput<B: Backend> {
    /// Adjusted positive conditioning.
    pub positive: B::Conditioning,
    /// Adjusted negative conditioning.
    pub negative: B::Conditioning,
    /// Preview the stage rendered for itself, if any.
    pub preview: Option<B::Image>,
}

/// Conditioning-fusion stage.
pub trait FusionStage<B: Backend> {
    /// Adjust a conditioning pair from the current image.
    ///
    /// # Errors
    ///
    /// Any error is propagated to the orchestrator's caller unchanged.
    fn fuse(&self, request: &FuseRequest<'_, B>) -> Result<FuseOutput<B>, BoxError>;
}

impl<B: Backend, T: FusionStage<B> + ?Sized> FusionStage<B> for &T {
    fn fuse(&self, request: &FuseRequest<'_, B>) -> Result<FuseOutput<B>, BoxError> {
        (**self).fuse(request)
    }
}
