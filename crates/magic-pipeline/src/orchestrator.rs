//! Step orchestration: run one to four refinement steps over an
//! enhancement stage and a fusion stage.
//!
//! ```text
//! step 1:      enhance("Step 1", denoise = 1.0)
//! step i ≥ 2:  fuse("Step i") -> enhance("Step i", denoise = configured)
//! ```
//!
//! Between steps the orchestrator threads a [`StepState`] (latent, image,
//! positive and negative conditioning). Fusion rebinds the conditioning
//! pair; enhancement rebinds the latent and image. A stage that fails
//! drops the state, so there is never a half-updated state to observe.
//!
//! The cancellation signal is polled before step 1 and before every later
//! step, never inside a stage call. A [`ReclaimGuard`] spans the whole run
//! so the reclaimer fires exactly once however the run ends.

use crate::diagnostics::{
    Clock, ReferenceSource, RunDiagnostics, StageDiagnostics, StageMetrics, StdClock,
    StepDiagnostics,
};
use crate::signal::{
    CancellationSignal, NeverInterrupted, NoopReclaimer, ReclaimGuard, ResourceReclaimer,
};
use crate::stage::{EnhanceOutput, EnhanceRequest, EnhancementStage, FuseRequest, FusionStage};
use crate::types::{
    Backend, Connectors, RunConfig, RunError, RunOutput, SamplingParams, StageKind, StartState,
    StepCount, StepIndex, StepState,
};

/// Sequences refinement steps over a pair of stages.
///
/// The cancellation signal and the reclaimer are injected here rather
/// than looked up globally. Defaults are [`NeverInterrupted`] and
/// [`NoopReclaimer`].
#[derive(Debug, Clone)]
pub struct Orchestrator<E, F, C = NeverInterrupted, R = NoopReclaimer> {
    enhancer: E,
    fuser: F,
    signal: C,
    reclaimer: R,
}

impl<E, F> Orchestrator<E, F> {
    /// An orchestrator that is never interrupted and has nothing to
    /// reclaim.
    pub const fn new(enhancer: E, fuser: F) -> Self {
        Self {
            enhancer,
            fuser,
            signal: NeverInterrupted,
            reclaimer: NoopReclaimer,
        }
    }
}

impl<E, F, C, R> Orchestrator<E, F, C, R> {
    /// Replace the cancellation signal.
    pub fn with_signal<S>(self, signal: S) -> Orchestrator<E, F, S, R> {
        Orchestrator {
            enhancer: self.enhancer,
            fuser: self.fuser,
            signal,
            reclaimer: self.reclaimer,
        }
    }

    /// Replace the resource reclaimer.
    pub fn with_reclaimer<Q>(self, reclaimer: Q) -> Orchestrator<E, F, C, Q> {
        Orchestrator {
            enhancer: self.enhancer,
            fuser: self.fuser,
            signal: self.signal,
            reclaimer,
        }
    }

    /// The enhancement stage.
    pub const fn enhancer(&self) -> &E {
        &self.enhancer
    }

    /// The fusion stage.
    pub const fn fuser(&self) -> &F {
        &self.fuser
    }
}

impl<E, F, C, R> Orchestrator<E, F, C, R>
where
    C: CancellationSignal,
    R: ResourceReclaimer,
{
    /// Run the configured number of steps and return the final latent and
    /// image.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Interrupted`] if the cancellation signal is
    /// raised at a step boundary, or [`RunError::Stage`] carrying the
    /// stage's own error if a stage call fails. The reclaimer runs in
    /// every case.
    pub fn run<B>(
        &self,
        config: &RunConfig,
        connectors: Connectors<'_, B>,
        start: StartState<B>,
    ) -> Result<RunOutput<B>, RunError>
    where
        B: Backend,
        E: EnhancementStage<B>,
        F: FusionStage<B>,
    {
        self.run_with_clock(config, connectors, start, &StdClock)
            .map(|(output, _)| output)
    }

    /// Like [`run`](Self::run), also returning per-step diagnostics timed
    /// with `clock`.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub fn run_with_clock<B, K>(
        &self,
        config: &RunConfig,
        connectors: Connectors<'_, B>,
        start: StartState<B>,
        clock: &K,
    ) -> Result<(RunOutput<B>, RunDiagnostics), RunError>
    where
        B: Backend,
        E: EnhancementStage<B>,
        F: FusionStage<B>,
        K: Clock,
    {
        let _reclaim = ReclaimGuard::new(&self.reclaimer);
        let started = clock.now();

        let planned = config.effective_steps();
        if i64::from(planned.get()) != config.step_count {
            tracing::debug!(
                requested = config.step_count,
                effective = planned.get(),
                "clamped step count"
            );
        }
        tracing::info!(
            steps = planned.get(),
            custom = config.custom,
            reference = connectors.reference_image.is_some(),
            "starting refinement run"
        );

        let mut steps = Vec::with_capacity(usize::from(planned.get()));

        self.checkpoint(StepIndex::FIRST, planned)?;
        let (mut state, first) = self.first_step(config, connectors, start, clock)?;
        steps.push(first);

        for index in planned.indices().skip(1) {
            self.checkpoint(index, planned)?;
            let (next, diagnostics) = self.refine_step(index, config, connectors, state, clock)?;
            state = next;
            steps.push(diagnostics);
        }

        let diagnostics = RunDiagnostics {
            planned_steps: planned,
            custom: config.custom,
            steps,
            total_duration: clock.elapsed(&started),
        };
        tracing::info!(
            steps = diagnostics.completed_steps(),
            duration_ms = diagnostics.total_duration.as_secs_f64() * 1000.0,
            "refinement run complete"
        );

        Ok((
            RunOutput {
                latent: state.latent,
                image: state.image,
            },
            diagnostics,
        ))
    }

    /// Abort if an interrupt is pending before `next` starts.
    fn checkpoint(&self, next: StepIndex, planned: StepCount) -> Result<(), RunError> {
        if self.signal.is_interrupted() {
            let completed_steps = next.get() - 1;
            tracing::info!(
                completed_steps,
                planned_steps = planned.get(),
                "interrupt requested; stopping"
            );
            return Err(RunError::Interrupted {
                completed_steps,
                planned_steps: planned.get(),
            });
        }
        Ok(())
    }

    /// Step 1: enhancement only, at full denoise.
    fn first_step<B, K>(
        &self,
        config: &RunConfig,
        connectors: Connectors<'_, B>,
        start: StartState<B>,
        clock: &K,
    ) -> Result<(StepState<B>, StepDiagnostics), RunError>
    where
        B: Backend,
        E: EnhancementStage<B>,
        K: Clock,
    {
        let index = StepIndex::FIRST;
        let _span = tracing::info_span!("refine_step", step = index.get()).entered();

        let reference = if connectors.reference_image.is_some() {
            ReferenceSource::Caller
        } else {
            ReferenceSource::None
        };
        let request = enhance_request(
            index,
            config,
            connectors,
            &start.latent,
            &start.positive,
            &start.negative,
            SamplingParams::FULL_DENOISE,
            connectors.reference_image,
        );
        let (output, enhancement) = self.enhance(&request, reference, clock)?;

        let state = StepState {
            latent: output.latent,
            image: output.image,
            positive: start.positive,
            negative: start.negative,
        };
        Ok((
            state,
            StepDiagnostics {
                step: index,
                fusion: None,
                enhancement,
            },
        ))
    }

    /// Step 2 and later: fusion, then enhancement at the configured
    /// denoise.
    fn refine_step<B, K>(
        &self,
        index: StepIndex,
        config: &RunConfig,
        connectors: Connectors<'_, B>,
        state: StepState<B>,
        clock: &K,
    ) -> Result<(StepState<B>, StepDiagnostics), RunError>
    where
        B: Backend,
        E: EnhancementStage<B>,
        F: FusionStage<B>,
        K: Clock,
    {
        let _span = tracing::info_span!("refine_step", step = index.get()).entered();

        let fuse_request = FuseRequest {
            preset: index.preset(),
            custom_override: false,
            image: &state.image,
            positive: &state.positive,
            negative: &state.negative,
            control_net: connectors.control_net,
            vae: connectors.vae,
        };
        tracing::debug!(preset = %fuse_request.preset, "fusion call");
        let began = clock.now();
        let fused = self
            .fuser
            .fuse(&fuse_request)
            .map_err(|source| RunError::Stage {
                stage: StageKind::Fusion,
                step: index,
                source,
            })?;
        let fusion = StageDiagnostics {
            duration: clock.elapsed(&began),
            metrics: StageMetrics::Fusion {
                preset: fuse_request.preset,
                custom_override: fuse_request.custom_override,
                preview: fused.preview.is_some(),
            },
        };

        let (reference_image, reference) = connectors.reference_image.map_or(
            (&state.image, ReferenceSource::PreviousStep),
            |image| (image, ReferenceSource::Caller),
        );
        let request = enhance_request(
            index,
            config,
            connectors,
            &state.latent,
            &fused.positive,
            &fused.negative,
            config.sampling.denoise,
            Some(reference_image),
        );
        let (output, enhancement) = self.enhance(&request, reference, clock)?;

        let next = StepState {
            latent: output.latent,
            image: output.image,
            positive: fused.positive,
            negative: fused.negative,
        };
        Ok((
            next,
            StepDiagnostics {
                step: index,
                fusion: Some(fusion),
                enhancement,
            },
        ))
    }

    /// Issue one enhancement call and time it.
    fn enhance<B, K>(
        &self,
        request: &EnhanceRequest<'_, B>,
        reference: ReferenceSource,
        clock: &K,
    ) -> Result<(EnhanceOutput<B>, StageDiagnostics), RunError>
    where
        B: Backend,
        E: EnhancementStage<B>,
        K: Clock,
    {
        tracing::debug!(
            preset = %request.preset,
            custom = request.custom_override,
            denoise = request.denoise,
            ?reference,
            "enhancement call"
        );
        let began = clock.now();
        let output = self
            .enhancer
            .enhance(request)
            .map_err(|source| RunError::Stage {
                stage: StageKind::Enhancement,
                step: request.step(),
                source,
            })?;
        let diagnostics = StageDiagnostics {
            duration: clock.elapsed(&began),
            metrics: StageMetrics::Enhancement {
                preset: request.preset,
                custom_override: request.custom_override,
                denoise_requested: request.denoise,
                steps_used: output.steps_used,
                cfg_used: output.cfg_used,
                denoise_used: output.denoise_used,
                reference,
                mask: output.mask.is_some(),
            },
        };
        Ok((output, diagnostics))
    }
}

/// Map the shared configuration onto one enhancement call.
///
/// Every shared parameter is forwarded exactly as configured; only the
/// denoise strength is chosen by the caller of this function.
#[allow(clippy::too_many_arguments)]
fn enhance_request<'a, B: Backend>(
    index: StepIndex,
    config: &'a RunConfig,
    connectors: Connectors<'a, B>,
    latent: &'a B::Latent,
    positive: &'a B::Conditioning,
    negative: &'a B::Conditioning,
    denoise: f32,
    reference_image: Option<&'a B::Image>,
) -> EnhanceRequest<'a, B> {
    let sampling = &config.sampling;
    EnhanceRequest {
        preset: index.preset(),
        custom_override: config.custom,
        model: connectors.model,
        vae: connectors.vae,
        positive,
        negative,
        latent,
        seed: sampling.seed,
        steps: sampling.steps,
        cfg: sampling.cfg,
        denoise,
        sampler_name: &sampling.sampler_name,
        scheduler: &sampling.scheduler,
        strength: 0.0,
        clipseg_text: &sampling.clipseg_text,
        reference_image,
        clip_vision: connectors.clip_vision,
    }
}
