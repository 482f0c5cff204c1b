//! Stack of layers plus the linear prediction head.
//!
//! One training cycle is
//!
//! ```text
//! update -> learn -> learn_prediction -> step_end -> predict -> prediction_end
//! ```
//!
//! `update` settles the whole stack on one input and accumulates the mean
//! activity of the bottom layer. `predict` maps that activity back into
//! input space as a forecast of the next input; `learn_prediction` on the
//! following cycle scores the forecast against the input that actually
//! arrived.

use tracing::{debug, trace};

use crate::backend::{
    ComputeBackend, Dispatch, EncodeInputArgs, PredictArgs, PredictionLearnArgs, SumActivityArgs,
};
use crate::config::{
    check_chain, ActivationParams, InitParams, InputCoding, LayerConfig, LearnRates,
    NetworkConfig, SparsityTargets, StepParams,
};
use crate::error::{Error, Result};
use crate::field::ReceptiveField;
use crate::layer::{Layer, LayerStats, Weights2D};
use crate::prng::Prng;
use crate::tensor::{DoubleBuffer, Extent, Tensor};

/// Spike-timing encoding state of the input field.
#[derive(Debug, Clone)]
pub struct InputSpikes {
    pub timers: DoubleBuffer,
    pub history: DoubleBuffer,
    pub spikes: Tensor,
}

#[derive(Debug, Clone)]
pub struct Hierarchy {
    input: Extent,
    layers: Vec<Layer>,
    prediction: DoubleBuffer,
    e_activity: DoubleBuffer,
    i_activity: DoubleBuffer,
    /// Activity the forecast in `prediction.previous()` was made from.
    e_forecast_source: Tensor,
    i_forecast_source: Tensor,
    prediction_from_e: Weights2D,
    prediction_from_i: Weights2D,
    input_spikes: Option<InputSpikes>,
}

impl Hierarchy {
    /// Builds one layer per config, bottom first, then the prediction head.
    pub fn create_random<B: ComputeBackend + ?Sized>(
        configs: &[LayerConfig],
        prediction_radius_e: u32,
        prediction_radius_i: u32,
        init: &InitParams,
        input_coding: InputCoding,
        backend: &mut B,
        rng: &mut Prng,
    ) -> Result<Self> {
        let input = configs
            .first()
            .map(|c| c.e_feed_forward)
            .ok_or(Error::InvalidConfig("a hierarchy needs at least one layer"))?;
        check_chain(input, configs)?;
        if prediction_radius_e > LayerConfig::MAX_RADIUS
            || prediction_radius_i > LayerConfig::MAX_RADIUS
        {
            return Err(Error::InvalidConfig("prediction radius exceeds MAX_RADIUS"));
        }

        let layers = configs
            .iter()
            .map(|config| Layer::create_random(config, init, backend, rng))
            .collect::<Result<Vec<_>>>()?;
        let bottom = &configs[0];

        let prediction = pair(backend, input)?;
        let e_activity = pair(backend, bottom.e)?;
        let i_activity = pair(backend, bottom.i)?;
        let e_forecast_source = backend.allocate(bottom.e.field())?;
        let i_forecast_source = backend.allocate(bottom.i.field())?;

        let seed = rng.seed_pair();
        let prediction_from_e = Weights2D::create_random(
            backend,
            ReceptiveField::new(bottom.e, input, prediction_radius_e),
            init.e_weights,
            seed,
            0,
        )?;
        let prediction_from_i = Weights2D::create_random(
            backend,
            ReceptiveField::new(bottom.i, input, prediction_radius_i),
            init.e_weights,
            seed,
            1,
        )?;

        let input_spikes = match input_coding {
            InputCoding::Analog => None,
            InputCoding::Spiking => Some(InputSpikes {
                timers: pair(backend, input)?,
                history: pair(backend, input)?,
                spikes: backend.allocate(input.field())?,
            }),
        };

        debug!(
            layers = layers.len(),
            input = %input,
            coding = ?input_coding,
            backend = backend.name(),
            "hierarchy created"
        );

        Ok(Self {
            input,
            layers,
            prediction,
            e_activity,
            i_activity,
            e_forecast_source,
            i_forecast_source,
            prediction_from_e,
            prediction_from_i,
            input_spikes,
        })
    }

    /// Validates `config` and builds the network it describes, seeding from
    /// `config.seed`.
    pub fn from_config<B: ComputeBackend + ?Sized>(
        config: &NetworkConfig,
        backend: &mut B,
    ) -> Result<Self> {
        config.validate()?;
        let mut rng = Prng::new(config.seed);
        Self::create_random(
            &config.layer_configs()?,
            config.prediction_radius_e,
            config.prediction_radius_i,
            &config.init,
            config.input_coding,
            backend,
            &mut rng,
        )
    }

    /// Allocates the zero 1x1 tensor fed to the top layer as feedback.
    pub fn allocate_neutral<B: ComputeBackend + ?Sized>(backend: &mut B) -> Result<Tensor> {
        Ok(backend.allocate(Extent::UNIT.field())?)
    }

    pub fn input_extent(&self) -> Extent {
        self.input
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn prediction(&self) -> &DoubleBuffer {
        &self.prediction
    }

    pub fn e_activity(&self) -> &DoubleBuffer {
        &self.e_activity
    }

    pub fn i_activity(&self) -> &DoubleBuffer {
        &self.i_activity
    }

    pub fn prediction_weights(&self) -> (&Weights2D, &Weights2D) {
        (&self.prediction_from_e, &self.prediction_from_i)
    }

    pub fn input_spikes(&self) -> Option<&InputSpikes> {
        self.input_spikes.as_ref()
    }

    fn check_io(&self, input: Tensor, neutral: Tensor) -> Result<()> {
        Error::check_shape("input", self.input.field(), input.shape())?;
        Error::check_shape("neutral feedback", Extent::UNIT.field(), neutral.shape())
    }

    /// Settles every layer on `input` for `iterations` rounds.
    ///
    /// Each round runs the excitatory sweep bottom-up, then the inhibitory
    /// sweep top-down, so every layer sees this round's output of its
    /// neighbours. The bottom layer's activity averaged over the rounds ends
    /// up in `e_activity().previous()` / `i_activity().previous()`.
    pub fn update<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        input: Tensor,
        neutral: Tensor,
        params: &ActivationParams,
        iterations: u32,
    ) -> Result<()> {
        self.check_io(input, neutral)?;
        if iterations == 0 {
            return Err(Error::InvalidConfig("settling needs at least one iteration"));
        }
        params.validate()?;
        trace!(iterations, "update");

        for layer in &self.layers {
            layer.ex_step_begin(backend)?;
        }
        for sums in [&self.e_activity, &self.i_activity] {
            backend.fill(sums.previous(), 0.0)?;
            backend.fill(sums.current(), 0.0)?;
        }

        let scale = 1.0 / iterations as f32;
        let top = self.layers.len() - 1;
        for _ in 0..iterations {
            let bottom_input = match &self.input_spikes {
                Some(spikes) => {
                    backend.dispatch(&Dispatch::EncodeInput(EncodeInputArgs {
                        input,
                        timers_prev: spikes.timers.previous(),
                        history_prev: spikes.history.previous(),
                        timers: spikes.timers.current(),
                        spikes: spikes.spikes,
                        history: spikes.history.current(),
                        history_rate: params.short_average_rate_inv,
                    }))?;
                    spikes.spikes
                }
                None => input,
            };

            for l in 0..=top {
                let feed_forward = if l == 0 {
                    bottom_input
                } else {
                    self.layers[l - 1].e().states.current()
                };
                self.layers[l].e_activate(backend, feed_forward, params)?;
            }
            for l in (0..=top).rev() {
                let feed_back = if l == top {
                    neutral
                } else {
                    self.layers[l + 1].i().states.current()
                };
                self.layers[l].i_activate(backend, feed_back, params)?;
            }

            let bottom = &self.layers[0];
            for (states, sums) in [
                (bottom.e().states.current(), &self.e_activity),
                (bottom.i().states.current(), &self.i_activity),
            ] {
                backend.dispatch(&Dispatch::SumActivity(SumActivityArgs {
                    states,
                    sums_prev: sums.previous(),
                    sums: sums.current(),
                    scale,
                }))?;
            }

            for layer in &mut self.layers {
                layer.sim_step_end();
            }
            self.e_activity.swap();
            self.i_activity.swap();
            if let Some(spikes) = &mut self.input_spikes {
                spikes.timers.swap();
                spikes.history.swap();
            }
        }
        Ok(())
    }

    /// Runs `Layer::learn` bottom-up with context from the neighbours.
    ///
    /// Layer 0 learns against the raw input (its spike history under spiking
    /// input coding); the top layer takes `neutral` as its feedback context.
    pub fn learn<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        input: Tensor,
        neutral: Tensor,
        rates: &LearnRates,
        sparsity: &SparsityTargets,
    ) -> Result<()> {
        self.check_io(input, neutral)?;
        rates.validate()?;
        sparsity.validate()?;
        let top = self.layers.len() - 1;
        for (l, layer) in self.layers.iter().enumerate() {
            let ff_short = if l > 0 {
                self.layers[l - 1].e().short_averages.previous()
            } else if let Some(spikes) = &self.input_spikes {
                spikes.history.previous()
            } else {
                input
            };
            let (fb_short, fb_long) = if l == top {
                (neutral, neutral)
            } else {
                let above = self.layers[l + 1].i();
                (above.short_averages.previous(), above.long_averages.previous())
            };
            layer.learn(backend, ff_short, fb_short, fb_long, rates, sparsity)?;
        }
        Ok(())
    }

    /// Forecasts the next input from the settled bottom-layer activity.
    pub fn predict<B: ComputeBackend + ?Sized>(&self, backend: &mut B) -> Result<()> {
        backend.dispatch(&Dispatch::Predict(PredictArgs {
            e_activity: self.e_activity.previous(),
            i_activity: self.i_activity.previous(),
            e_weights: self.prediction_from_e.previous(),
            i_weights: self.prediction_from_i.previous(),
            prediction: self.prediction.current(),
            e_field: self.prediction_from_e.field(),
            i_field: self.prediction_from_i.field(),
        }))?;
        Ok(())
    }

    /// Delta rule on the prediction head: moves the previous forecast
    /// toward `truth`.
    pub fn learn_prediction<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        truth: Tensor,
        alpha: f32,
    ) -> Result<()> {
        Error::check_shape("ground truth", self.input.field(), truth.shape())?;
        if !alpha.is_finite() || alpha < 0.0 {
            return Err(Error::InvalidConfig("prediction alpha must be finite and non-negative"));
        }
        backend.dispatch(&Dispatch::PredictionLearn(PredictionLearnArgs {
            e_source: self.e_forecast_source,
            i_source: self.i_forecast_source,
            truth,
            prediction_prev: self.prediction.previous(),
            e_weights_prev: self.prediction_from_e.previous(),
            i_weights_prev: self.prediction_from_i.previous(),
            e_weights: self.prediction_from_e.current(),
            i_weights: self.prediction_from_i.current(),
            e_field: self.prediction_from_e.field(),
            i_field: self.prediction_from_i.field(),
            alpha,
        }))?;
        Ok(())
    }

    /// Publishes learned weights: layers first, then the prediction head.
    pub fn step_end(&mut self) {
        for layer in &mut self.layers {
            layer.ex_step_end();
        }
        self.prediction_from_e.swap();
        self.prediction_from_i.swap();
    }

    /// Publishes the forecast and retains the activity it was made from.
    pub fn prediction_end(&mut self) {
        self.prediction.swap();
        self.e_forecast_source = self.e_activity.replace_previous(self.e_forecast_source);
        self.i_forecast_source = self.i_activity.replace_previous(self.i_forecast_source);
    }

    /// One full training cycle on `input`.
    pub fn step<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        input: Tensor,
        neutral: Tensor,
        params: &StepParams,
    ) -> Result<()> {
        self.update(backend, input, neutral, &params.activation, params.iterations)?;
        self.learn(backend, input, neutral, &params.learn, &params.sparsity)?;
        self.learn_prediction(backend, input, params.prediction_alpha)?;
        self.step_end();
        self.predict(backend)?;
        self.prediction_end();
        Ok(())
    }

    /// Latest published forecast.
    pub fn read_prediction<B: ComputeBackend + ?Sized>(&self, backend: &mut B) -> Result<Vec<f32>> {
        Ok(backend.readback(self.prediction.previous())?)
    }

    /// Sets every input spike timer to `phase`. No-op under analog coding.
    pub fn set_input_phase<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        phase: f32,
    ) -> Result<()> {
        if let Some(spikes) = &self.input_spikes {
            backend.fill(spikes.timers.previous(), phase)?;
            backend.fill(spikes.timers.current(), phase)?;
        }
        Ok(())
    }

    pub fn stats<B: ComputeBackend + ?Sized>(&self, backend: &mut B) -> Result<Vec<LayerStats>> {
        self.layers.iter().map(|l| l.stats(backend)).collect()
    }
}

fn pair<B: ComputeBackend + ?Sized>(backend: &mut B, extent: Extent) -> Result<DoubleBuffer> {
    let first = backend.allocate(extent.field())?;
    let second = backend.allocate(extent.field())?;
    Ok(DoubleBuffer::new(first, second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExecutionTier;
    use crate::config::generate_configs_from_sizes;
    use crate::host::HostBackend;

    fn two_layer(backend: &mut HostBackend, coding: InputCoding) -> Hierarchy {
        let configs = generate_configs_from_sizes(
            Extent::new(4, 4),
            &[Extent::new(8, 8), Extent::new(4, 4)],
            &[Extent::new(4, 4), Extent::new(2, 2)],
        )
        .unwrap();
        let mut rng = Prng::new(17);
        Hierarchy::create_random(&configs, 4, 4, &InitParams::default(), coding, backend, &mut rng)
            .unwrap()
    }

    #[test]
    fn fresh_prediction_weights_have_identical_buffers() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let net = two_layer(&mut b, InputCoding::Analog);
        let (from_e, from_i) = net.prediction_weights();
        for w in [from_e, from_i] {
            assert_eq!(b.readback(w.current()).unwrap(), b.readback(w.previous()).unwrap());
        }
    }

    #[test]
    fn broken_chain_is_rejected() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let mut configs = generate_configs_from_sizes(
            Extent::new(4, 4),
            &[Extent::new(8, 8), Extent::new(4, 4)],
            &[Extent::new(4, 4), Extent::new(2, 2)],
        )
        .unwrap();
        configs[0].i_feed_back = Extent::UNIT;
        let mut rng = Prng::new(1);
        let err = Hierarchy::create_random(
            &configs,
            4,
            4,
            &InitParams::default(),
            InputCoding::Analog,
            &mut b,
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ChainBroken { layer: 0 }));
    }

    #[test]
    fn update_rejects_mismatched_input() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let mut net = two_layer(&mut b, InputCoding::Analog);
        let input = b.allocate(Extent::new(3, 4).field()).unwrap();
        let neutral = Hierarchy::allocate_neutral(&mut b).unwrap();
        let err = net
            .update(&mut b, input, neutral, &ActivationParams::default(), 4)
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { what: "input", .. }));
    }

    #[test]
    fn activity_sums_average_over_iterations() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let mut net = two_layer(&mut b, InputCoding::Analog);
        let input = b.allocate_with(Extent::new(4, 4).field(), &[1.0; 16]).unwrap();
        let neutral = Hierarchy::allocate_neutral(&mut b).unwrap();
        net.update(&mut b, input, neutral, &ActivationParams::for_iterations(5), 5)
            .unwrap();
        let sums = b.readback(net.e_activity().previous()).unwrap();
        assert_eq!(sums.len(), 64);
        assert!(sums.iter().all(|s| (0.0..=1.0 + 1e-5).contains(s)));
    }

    #[test]
    fn prediction_end_retains_forecast_source() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let mut net = two_layer(&mut b, InputCoding::Analog);
        let activity = net.e_activity().previous();
        let prediction = net.prediction().current();
        net.prediction_end();
        assert_eq!(net.e_forecast_source, activity);
        assert_ne!(net.e_activity().previous(), activity);
        assert_eq!(net.prediction().previous(), prediction);
    }

    #[test]
    fn prediction_learning_closes_the_error() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let mut net = two_layer(&mut b, InputCoding::Analog);
        let truth = b.allocate_with(Extent::new(4, 4).field(), &[0.5; 16]).unwrap();
        // Constant features: the delta rule drives the forecast onto the target.
        b.fill(net.e_forecast_source, 0.2).unwrap();
        b.fill(net.i_forecast_source, 0.2).unwrap();
        b.fill(net.e_activity().previous(), 0.2).unwrap();
        b.fill(net.i_activity().previous(), 0.2).unwrap();
        for _ in 0..200 {
            net.predict(&mut b).unwrap();
            net.prediction.swap();
            net.learn_prediction(&mut b, truth, 0.05).unwrap();
            net.step_end();
        }
        net.predict(&mut b).unwrap();
        let forecast = b.readback(net.prediction().current()).unwrap();
        assert!(forecast.iter().all(|p| (p - 0.5).abs() < 1e-3), "{forecast:?}");
    }

    #[test]
    fn spiking_input_fills_history() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let mut net = two_layer(&mut b, InputCoding::Spiking);
        net.set_input_phase(&mut b, 0.0).unwrap();
        let input = b.allocate_with(Extent::new(4, 4).field(), &[0.5; 16]).unwrap();
        let neutral = Hierarchy::allocate_neutral(&mut b).unwrap();
        net.update(&mut b, input, neutral, &ActivationParams::for_iterations(8), 8)
            .unwrap();
        let spikes = net.input_spikes().unwrap();
        let history = b.readback(spikes.history.previous()).unwrap();
        assert!(history.iter().all(|h| *h > 0.0));
        net.learn(&mut b, input, neutral, &LearnRates::default(), &SparsityTargets::default())
            .unwrap();
    }

    #[test]
    fn full_step_runs_on_two_layers() {
        let mut b = HostBackend::new(ExecutionTier::Parallel);
        let mut net = two_layer(&mut b, InputCoding::Analog);
        let input = b.allocate_with(Extent::new(4, 4).field(), &[0.25; 16]).unwrap();
        let neutral = Hierarchy::allocate_neutral(&mut b).unwrap();
        let params = NetworkConfig::default().step_params();
        for _ in 0..3 {
            net.step(&mut b, input, neutral, &params).unwrap();
        }
        let forecast = net.read_prediction(&mut b).unwrap();
        assert_eq!(forecast.len(), 16);
        assert!(forecast.iter().all(|p| p.is_finite()));
        assert_eq!(net.stats(&mut b).unwrap().len(), 2);
    }

    #[test]
    fn learning_calls_reject_degenerate_parameters() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let mut net = two_layer(&mut b, InputCoding::Analog);
        let input = b.allocate_with(Extent::new(4, 4).field(), &[0.5; 16]).unwrap();
        let neutral = Hierarchy::allocate_neutral(&mut b).unwrap();

        let zero_sparsity = SparsityTargets { e: 0.0, i: 0.0 };
        let err = net
            .learn(&mut b, input, neutral, &LearnRates::default(), &zero_sparsity)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let negative = LearnRates {
            e_alpha: -5.0,
            ..LearnRates::default()
        };
        let err = net
            .learn(&mut b, input, neutral, &negative, &SparsityTargets::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        for alpha in [f32::NAN, f32::INFINITY, -0.1] {
            let err = net.learn_prediction(&mut b, input, alpha).unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)));
        }

        net.step_end();
        let (from_e, from_i) = net.prediction_weights();
        for w in [from_e, from_i] {
            assert!(b.readback(w.previous()).unwrap().iter().all(|v| v.is_finite()));
        }
    }
}
