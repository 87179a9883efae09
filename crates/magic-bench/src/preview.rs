//! Preview stages: a small deterministic backend that works on RGBA
//! images, so refinement runs can be exercised without a model runtime.
//!
//! The latent is a single luminance channel in `0.0..=1.0`. Enhancement
//! blends seeded noise into it and decodes it through the positive and
//! negative tints. Fusion pulls the positive tint toward the mean colour
//! of the previous step's image.
//!
//! Both stages follow the stage contract: the preset for the call's step
//! applies unless the override flag is set, step-1 denoise is taken as
//! given, and seed `0` derives a seed from the preset identifier.

use std::hash::{Hash, Hasher};

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgba, RgbaImage};
use magic_pipeline::{
    Backend, BoxError, EnhanceOutput, EnhanceRequest, EnhancementStage, FuseOutput, FuseRequest,
    FusionStage, Param, PresetId, StepIndex,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use siphasher::sip::SipHasher13;

/// Artifact types of the preview stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct Preview;

impl Backend for Preview {
    type Model = PreviewModel;
    type Vae = PreviewVae;
    type Latent = PreviewLatent;
    type Image = RgbaImage;
    type Conditioning = PreviewConditioning;
    type ControlNet = PreviewControl;
    type ClipVision = ();
    type Mask = GrayImage;
}

/// Stand-in model: how much noise detail sampling adds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewModel {
    pub detail: f32,
}

impl Default for PreviewModel {
    fn default() -> Self {
        Self { detail: 0.25 }
    }
}

/// Stand-in VAE: gamma applied when decoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewVae {
    pub gamma: f32,
}

impl Default for PreviewVae {
    fn default() -> Self {
        Self { gamma: 1.0 }
    }
}

/// Stand-in control module: scales how strongly fusion follows the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewControl {
    pub strength: f32,
}

impl Default for PreviewControl {
    fn default() -> Self {
        Self { strength: 1.0 }
    }
}

/// One side of a conditioning pair: a colour and how much it counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewConditioning {
    pub tint: [f32; 3],
    pub weight: f32,
}

impl PreviewConditioning {
    /// Warm default positive prompt.
    pub const POSITIVE: Self = Self {
        tint: [1.0, 0.85, 0.7],
        weight: 0.5,
    };

    /// Dull default negative prompt.
    pub const NEGATIVE: Self = Self {
        tint: [0.3, 0.3, 0.3],
        weight: 0.3,
    };
}

/// Single-channel latent, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewLatent {
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
}

impl PreviewLatent {
    /// A flat mid-grey latent.
    #[must_use]
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            values: vec![0.5; pixel_count(width, height)],
        }
    }

    /// Encode an image's luminance.
    #[must_use]
    pub fn from_image(image: &RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            values: image.pixels().map(luminance).collect(),
        }
    }
}

fn pixel_count(width: u32, height: u32) -> usize {
    usize::try_from(u64::from(width) * u64::from(height)).unwrap_or(usize::MAX)
}

fn luminance(pixel: &Rgba<u8>) -> f32 {
    let [r, g, b, _] = pixel.0;
    (0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b)) / 255.0
}

// ───────────────────────── Enhancement ───────────────────────────

/// Sampler identifiers the preview enhancer accepts. The first is the
/// default.
pub const SAMPLERS: &[&str] = &[
    "euler",
    "euler_ancestral",
    "heun",
    "dpm_2",
    "dpmpp_2m",
    "dpmpp_sde",
    "ddim",
    "uni_pc",
];

/// Scheduler identifiers the preview enhancer accepts.
pub const SCHEDULERS: &[&str] = &[
    "normal",
    "karras",
    "exponential",
    "sgm_uniform",
    "simple",
    "beta",
    "MGHybrid",
];

/// Enhancement defaults for one step. Presets carry no seed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnhancePreset {
    pub steps: u32,
    pub cfg: f32,
    pub denoise: f32,
    pub sampler: &'static str,
    pub scheduler: &'static str,
    pub clipseg_text: &'static str,
}

const ENHANCE_PRESETS: [EnhancePreset; 4] = [
    EnhancePreset {
        steps: 20,
        cfg: 6.0,
        denoise: 1.0,
        sampler: "euler_ancestral",
        scheduler: "MGHybrid",
        clipseg_text: "",
    },
    EnhancePreset {
        steps: 25,
        cfg: 5.0,
        denoise: 0.65,
        sampler: "euler",
        scheduler: "MGHybrid",
        clipseg_text: "hand, feet, face",
    },
    EnhancePreset {
        steps: 30,
        cfg: 4.5,
        denoise: 0.5,
        sampler: "dpmpp_2m",
        scheduler: "karras",
        clipseg_text: "hand, feet, face",
    },
    EnhancePreset {
        steps: 30,
        cfg: 4.0,
        denoise: 0.4,
        sampler: "dpmpp_2m",
        scheduler: "karras",
        clipseg_text: "face",
    },
];

/// The enhancement preset for `step`.
#[must_use]
pub fn enhance_preset(step: StepIndex) -> &'static EnhancePreset {
    &ENHANCE_PRESETS[usize::from(step.get() - 1)]
}

/// Seed used when the request asks the stage to pick one.
#[must_use]
pub fn derive_seed(preset: PresetId) -> u64 {
    let mut hasher = SipHasher13::new();
    preset.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Parameters an enhancement call actually ran with.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<'a> {
    pub seed: u64,
    pub steps: u32,
    pub cfg: f32,
    pub denoise: f32,
    pub sampler: &'a str,
    pub scheduler: &'a str,
    pub clipseg_text: &'a str,
}

/// Pick each parameter from the request or the step's preset.
#[must_use]
pub fn resolve<'a>(request: &EnhanceRequest<'a, Preview>) -> Resolved<'a> {
    let preset = enhance_preset(request.step());
    let explicit = |param| request.source(param).uses_request();
    Resolved {
        seed: if request.seed == 0 {
            derive_seed(request.preset)
        } else {
            request.seed
        },
        steps: if explicit(Param::Steps) {
            request.steps
        } else {
            preset.steps
        },
        cfg: if explicit(Param::Cfg) {
            request.cfg
        } else {
            preset.cfg
        },
        denoise: if explicit(Param::Denoise) {
            request.denoise
        } else {
            preset.denoise
        },
        sampler: if explicit(Param::Sampler) {
            request.sampler_name
        } else {
            preset.sampler
        },
        scheduler: if explicit(Param::Scheduler) {
            request.scheduler
        } else {
            preset.scheduler
        },
        clipseg_text: if explicit(Param::ClipsegText) {
            request.clipseg_text
        } else {
            preset.clipseg_text
        },
    }
}

/// Seeded-noise enhancement stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviewEnhancer;

impl EnhancementStage<Preview> for PreviewEnhancer {
    fn enhance(
        &self,
        request: &EnhanceRequest<'_, Preview>,
    ) -> Result<EnhanceOutput<Preview>, BoxError> {
        let latent = request.latent;
        if latent.values.len() != pixel_count(latent.width, latent.height) {
            return Err(format!(
                "latent holds {} values for a {}x{} grid",
                latent.values.len(),
                latent.width,
                latent.height,
            )
            .into());
        }

        let params = resolve(request);
        tracing::debug!(
            preset = %request.preset,
            seed = params.seed,
            steps = params.steps,
            sampler = params.sampler,
            scheduler = params.scheduler,
            "preview sampling"
        );

        let reference = request
            .reference_image
            .map(|image| reference_luma(image, latent.width, latent.height));
        let values = sample(
            latent,
            &params,
            request.model.detail,
            reference.as_deref(),
        );
        let refined = PreviewLatent {
            width: latent.width,
            height: latent.height,
            values,
        };
        let image = decode(&refined, request.vae, request.positive, request.negative);
        let mask = (!params.clipseg_text.trim().is_empty()).then(|| region_mask(&refined));

        Ok(EnhanceOutput {
            latent: refined,
            image,
            steps_used: params.steps,
            cfg_used: params.cfg,
            denoise_used: params.denoise,
            mask,
        })
    }

    fn samplers(&self) -> &[&'static str] {
        SAMPLERS
    }

    fn schedulers(&self) -> &[&'static str] {
        SCHEDULERS
    }
}

/// Reference luminance resized to the latent grid.
fn reference_luma(image: &RgbaImage, width: u32, height: u32) -> Vec<f32> {
    if image.dimensions() == (width, height) {
        PreviewLatent::from_image(image).values
    } else {
        let resized = imageops::resize(image, width, height, FilterType::Triangle);
        PreviewLatent::from_image(&resized).values
    }
}

#[allow(clippy::cast_precision_loss)]
fn sample(
    latent: &PreviewLatent,
    params: &Resolved<'_>,
    detail: f32,
    reference: Option<&[f32]>,
) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let guidance = params.cfg / (params.cfg + 1.0);
    let denoise = params.denoise.clamp(0.0, 1.0);

    let mut values: Vec<f32> = latent
        .values
        .iter()
        .enumerate()
        .map(|(i, &base)| {
            let noise = rng.gen_range(-1.0_f32..=1.0) * detail * guidance;
            let mut value = base + noise * denoise;
            if let Some(reference) = reference {
                value += (reference[i] - value) * 0.25 * denoise;
            }
            value.clamp(0.0, 1.0)
        })
        .collect();

    for _ in 0..(params.steps / 10).clamp(1, 4) {
        values = box_blur(&values, latent.width, latent.height);
    }
    values
}

/// One 3x3 box-blur pass with edge clamping.
#[allow(clippy::cast_precision_loss)]
fn box_blur(values: &[f32], width: u32, height: u32) -> Vec<f32> {
    let (w, h) = (width as usize, height as usize);
    let mut out = Vec::with_capacity(values.len());
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0.0;
            let mut count = 0;
            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    sum += values[ny * w + nx];
                    count += 1;
                }
            }
            out.push(sum / count as f32);
        }
    }
    out
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn decode(
    latent: &PreviewLatent,
    vae: &PreviewVae,
    positive: &PreviewConditioning,
    negative: &PreviewConditioning,
) -> RgbaImage {
    RgbaImage::from_fn(latent.width, latent.height, |x, y| {
        let value = latent.values[(y * latent.width + x) as usize].powf(vae.gamma);
        let channel = |c: usize| {
            let tinted = value * positive.tint[c].mul_add(positive.weight, 1.0 - positive.weight);
            let level = (-negative.tint[c] * negative.weight).mul_add(0.1, tinted);
            (level.clamp(0.0, 1.0) * 255.0).round() as u8
        };
        Rgba([channel(0), channel(1), channel(2), 255])
    })
}

/// Bright regions stand in for the hinted areas.
fn region_mask(latent: &PreviewLatent) -> GrayImage {
    GrayImage::from_fn(latent.width, latent.height, |x, y| {
        let value = latent.values[(y * latent.width + x) as usize];
        Luma([if value > 0.5 { 255 } else { 0 }])
    })
}

// ───────────────────────── Fusion ────────────────────────────────

/// Fusion weight for each step. Step 1 never fuses.
const FUSE_WEIGHTS: [f32; 4] = [0.0, 0.35, 0.5, 0.6];

/// Mean-colour conditioning fusion.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviewFuser {
    /// Render a greyscale preview of the image each call.
    pub preview: bool,
}

impl FusionStage<Preview> for PreviewFuser {
    fn fuse(&self, request: &FuseRequest<'_, Preview>) -> Result<FuseOutput<Preview>, BoxError> {
        if request.image.width() == 0 || request.image.height() == 0 {
            return Err("cannot fuse an empty image".into());
        }

        let preset_weight = FUSE_WEIGHTS[usize::from(request.preset.step().get() - 1)];
        let weight = (preset_weight * request.control_net.strength).clamp(0.0, 1.0);
        let mean = mean_colour(request.image);
        let inverse = mean.map(|c| 1.0 - c);

        let positive = PreviewConditioning {
            tint: lerp3(request.positive.tint, mean, weight),
            weight: weight.mul_add(0.5, request.positive.weight).min(1.0),
        };
        let negative = PreviewConditioning {
            tint: lerp3(request.negative.tint, inverse, weight * 0.5),
            weight: request.negative.weight,
        };
        let preview = self.preview.then(|| {
            image::DynamicImage::ImageLuma8(imageops::grayscale(request.image)).to_rgba8()
        });

        Ok(FuseOutput {
            positive,
            negative,
            preview,
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean_colour(image: &RgbaImage) -> [f32; 3] {
    let mut sums = [0u64; 3];
    for pixel in image.pixels() {
        for (sum, &channel) in sums.iter_mut().zip(&pixel.0[..3]) {
            *sum += u64::from(channel);
        }
    }
    let count = (u64::from(image.width()) * u64::from(image.height())) as f32;
    sums.map(|sum| sum as f32 / count / 255.0)
}

fn lerp3(from: [f32; 3], to: [f32; 3], t: f32) -> [f32; 3] {
    [
        (to[0] - from[0]).mul_add(t, from[0]),
        (to[1] - from[1]).mul_add(t, from[1]),
        (to[2] - from[2]).mul_add(t, from[2]),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use magic_pipeline::{Connectors, Orchestrator, RunConfig, SamplingParams, StartState};

    use super::*;

    fn step(n: u8) -> StepIndex {
        StepIndex::new(n).unwrap()
    }

    struct Fixture {
        model: PreviewModel,
        vae: PreviewVae,
        latent: PreviewLatent,
        positive: PreviewConditioning,
        negative: PreviewConditioning,
        sampling: SamplingParams,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                model: PreviewModel::default(),
                vae: PreviewVae::default(),
                latent: PreviewLatent::empty(8, 6),
                positive: PreviewConditioning::POSITIVE,
                negative: PreviewConditioning::NEGATIVE,
                sampling: SamplingParams::default(),
            }
        }

        fn request(&self, n: u8, custom: bool) -> EnhanceRequest<'_, Preview> {
            EnhanceRequest {
                preset: step(n).preset(),
                custom_override: custom,
                model: &self.model,
                vae: &self.vae,
                positive: &self.positive,
                negative: &self.negative,
                latent: &self.latent,
                seed: self.sampling.seed,
                steps: self.sampling.steps,
                cfg: self.sampling.cfg,
                denoise: self.sampling.denoise,
                sampler_name: &self.sampling.sampler_name,
                scheduler: &self.sampling.scheduler,
                strength: 0.0,
                clipseg_text: &self.sampling.clipseg_text,
                reference_image: None,
                clip_vision: None,
            }
        }
    }

    #[test]
    fn preset_mode_uses_step_presets() {
        let fixture = Fixture::new();
        let resolved = resolve(&fixture.request(3, false));
        let preset = enhance_preset(step(3));
        assert_eq!(resolved.steps, preset.steps);
        assert_eq!(resolved.cfg, preset.cfg);
        assert_eq!(resolved.denoise, preset.denoise);
        assert_eq!(resolved.sampler, "dpmpp_2m");
        assert_eq!(resolved.scheduler, "karras");
    }

    #[test]
    fn custom_mode_uses_request_values() {
        let mut fixture = Fixture::new();
        fixture.sampling.steps = 7;
        fixture.sampling.scheduler = "beta".to_string();
        let resolved = resolve(&fixture.request(2, true));
        assert_eq!(resolved.steps, 7);
        assert_eq!(resolved.denoise, SamplingParams::DEFAULT_DENOISE);
        assert_eq!(resolved.scheduler, "beta");
    }

    #[test]
    fn step_one_denoise_is_taken_as_given() {
        let mut fixture = Fixture::new();
        fixture.sampling.denoise = SamplingParams::FULL_DENOISE;
        assert_eq!(resolve(&fixture.request(1, false)).denoise, 1.0);
        assert_eq!(resolve(&fixture.request(1, true)).denoise, 1.0);
    }

    #[test]
    fn zero_seed_is_derived_per_preset() {
        let fixture = Fixture::new();
        let first = resolve(&fixture.request(1, false)).seed;
        let second = resolve(&fixture.request(2, false)).seed;
        assert_eq!(first, derive_seed(step(1).preset()));
        assert_ne!(first, second);
        assert_eq!(first, derive_seed(step(1).preset()));
    }

    #[test]
    fn explicit_seed_is_kept() {
        let mut fixture = Fixture::new();
        fixture.sampling.seed = 42;
        assert_eq!(resolve(&fixture.request(2, false)).seed, 42);
    }

    #[test]
    fn enhancement_is_deterministic_for_a_fixed_seed() {
        let mut fixture = Fixture::new();
        fixture.sampling.seed = 7;
        let a = PreviewEnhancer.enhance(&fixture.request(2, true)).unwrap();
        let b = PreviewEnhancer.enhance(&fixture.request(2, true)).unwrap();
        assert_eq!(a.latent, b.latent);
        assert_eq!(a.image, b.image);

        fixture.sampling.seed = 8;
        let c = PreviewEnhancer.enhance(&fixture.request(2, true)).unwrap();
        assert_ne!(a.latent, c.latent);
    }

    #[test]
    fn enhancement_reports_used_values_and_mask() {
        let fixture = Fixture::new();
        let output = PreviewEnhancer.enhance(&fixture.request(4, false)).unwrap();
        assert_eq!(output.steps_used, 30);
        assert_eq!(output.denoise_used, 0.4);
        assert_eq!(output.image.dimensions(), (8, 6));
        assert_eq!(output.mask.unwrap().dimensions(), (8, 6));

        let output = PreviewEnhancer.enhance(&fixture.request(1, false)).unwrap();
        assert!(output.mask.is_none());
    }

    #[test]
    fn mismatched_latent_is_an_error() {
        let mut fixture = Fixture::new();
        fixture.latent.values.pop();
        assert!(PreviewEnhancer.enhance(&fixture.request(1, false)).is_err());
    }

    #[test]
    fn reference_of_another_size_is_resized() {
        let fixture = Fixture::new();
        let reference = RgbaImage::from_pixel(32, 32, Rgba([255, 255, 255, 255]));
        let mut request = fixture.request(2, false);
        request.reference_image = Some(&reference);
        let with_reference = PreviewEnhancer.enhance(&request).unwrap();
        let without = PreviewEnhancer.enhance(&fixture.request(2, false)).unwrap();
        let mean = |l: &PreviewLatent| l.values.iter().sum::<f32>();
        assert!(mean(&with_reference.latent) > mean(&without.latent));
    }

    #[test]
    fn fusion_moves_tint_toward_image() {
        let image = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 255, 255]));
        let vae = PreviewVae::default();
        let control = PreviewControl::default();
        let positive = PreviewConditioning::POSITIVE;
        let negative = PreviewConditioning::NEGATIVE;
        let request = FuseRequest::<Preview> {
            preset: step(2).preset(),
            custom_override: false,
            image: &image,
            positive: &positive,
            negative: &negative,
            control_net: &control,
            vae: &vae,
        };

        let fused = PreviewFuser { preview: true }.fuse(&request).unwrap();
        assert!(fused.positive.tint[2] > positive.tint[2]);
        assert!(fused.positive.tint[0] < positive.tint[0]);
        assert!(fused.positive.weight > positive.weight);
        assert_eq!(fused.preview.unwrap().dimensions(), (4, 4));

        let quiet = PreviewFuser::default().fuse(&request).unwrap();
        assert!(quiet.preview.is_none());
    }

    #[test]
    fn fusion_rejects_empty_image() {
        let image = RgbaImage::new(0, 0);
        let vae = PreviewVae::default();
        let control = PreviewControl::default();
        let request = FuseRequest::<Preview> {
            preset: step(2).preset(),
            custom_override: false,
            image: &image,
            positive: &PreviewConditioning::POSITIVE,
            negative: &PreviewConditioning::NEGATIVE,
            control_net: &control,
            vae: &vae,
        };
        assert!(PreviewFuser::default().fuse(&request).is_err());
    }

    #[test]
    fn full_run_over_preview_stages() {
        let model = PreviewModel::default();
        let vae = PreviewVae::default();
        let control = PreviewControl::default();
        let config = RunConfig::default();
        let start = || StartState::<Preview> {
            latent: PreviewLatent::empty(10, 10),
            positive: PreviewConditioning::POSITIVE,
            negative: PreviewConditioning::NEGATIVE,
        };

        let orchestrator = Orchestrator::new(PreviewEnhancer, PreviewFuser::default());
        let a = orchestrator
            .run(&config, Connectors::new(&model, &vae, &control), start())
            .unwrap();
        let b = orchestrator
            .run(&config, Connectors::new(&model, &vae, &control), start())
            .unwrap();
        assert_eq!(a.image.dimensions(), (10, 10));
        assert_eq!(a.image, b.image);
    }
}
