//! magic-pipeline: step orchestration for multi-pass image refinement
//! (runtime-agnostic).
//!
//! A refinement run executes one to four steps over two external stages:
//!
//! ```text
//! step 1:      enhance
//! step i ≥ 2:  fuse -> enhance
//! ```
//!
//! Each stage takes a per-step preset tag (`"Step 1"` .. `"Step 4"`) and an
//! override flag. With the flag off the stage's own preset for that step
//! decides its parameters; with it on the caller's shared parameters win,
//! except that the first enhancement always runs at full denoise.
//!
//! This crate owns no models, tensors or images. Artifact types come from
//! a [`Backend`], and the two stages are supplied as implementations of
//! [`EnhancementStage`] and [`FusionStage`]. Interruption and cache
//! reclamation are injected as a [`CancellationSignal`] and a
//! [`ResourceReclaimer`].

pub mod diagnostics;
pub mod orchestrator;
pub mod signal;
pub mod stage;
pub mod types;

pub use diagnostics::{Clock, RunDiagnostics, StdClock};
pub use orchestrator::Orchestrator;
pub use signal::{
    CancellationSignal, FnReclaimer, InterruptFlag, NeverInterrupted, NoopReclaimer,
    ReclaimGuard, ResourceReclaimer,
};
pub use stage::{
    EnhanceOutput, EnhanceRequest, EnhancementStage, FuseOutput, FuseRequest, FusionStage, Param,
    ParamSource,
};
pub use types::{
    Backend, BoxError, ConfigError, Connectors, PresetId, RunConfig, RunError, RunOutput,
    SamplingParams, StageKind, StartState, StepCount, StepIndex, StepState,
};
