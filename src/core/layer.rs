//! One excitatory/inhibitory layer.
//!
//! A layer owns two neuron populations and five weight connections, all
//! double-buffered. Within an example the calling order is:
//!
//! ```text
//! ex_step_begin -> { e_activate -> i_activate -> sim_step_end } x iterations
//!               -> learn -> ex_step_end
//! ```
//!
//! Activation passes write the `current` state buffers and read the
//! `previous` ones; `sim_step_end` publishes them. Learning writes the
//! `current` weights and thresholds; `ex_step_end` publishes those.

use tracing::debug;

use crate::backend::{
    ComputeBackend, Dispatch, EActivateArgs, ELearnArgs, IActivateArgs, ILearnArgs, PopulationIo,
    RandomFillArgs,
};
use crate::config::{ActivationParams, InitParams, LayerConfig, LearnRates, SparsityTargets, WeightRange};
use crate::error::{Error, Result};
use crate::field::ReceptiveField;
use crate::prng::Prng;
use crate::tensor::{DoubleBuffer, Extent, Shape, Tensor};

/// State fields of one population.
#[derive(Debug, Clone)]
pub struct NeuronLayer {
    pub activations: DoubleBuffer,
    pub states: DoubleBuffer,
    pub short_averages: DoubleBuffer,
    pub long_averages: DoubleBuffer,
    pub thresholds: DoubleBuffer,
}

impl NeuronLayer {
    fn create<B: ComputeBackend + ?Sized>(
        backend: &mut B,
        extent: Extent,
        sparsity: f32,
        threshold: f32,
    ) -> Result<Self> {
        let layer = Self {
            activations: allocate_pair(backend, extent.field())?,
            states: allocate_pair(backend, extent.field())?,
            short_averages: allocate_pair(backend, extent.field())?,
            long_averages: allocate_pair(backend, extent.field())?,
            thresholds: allocate_pair(backend, extent.field())?,
        };
        fill_pair(backend, &layer.long_averages, sparsity)?;
        fill_pair(backend, &layer.thresholds, threshold)?;
        Ok(layer)
    }

    pub fn extent(&self) -> Extent {
        self.states.shape().extent
    }

    /// Binding of an activation pass over this population.
    pub fn io(&self) -> PopulationIo {
        PopulationIo {
            activations_prev: self.activations.previous(),
            states_prev: self.states.previous(),
            short_prev: self.short_averages.previous(),
            long_prev: self.long_averages.previous(),
            thresholds: self.thresholds.previous(),
            activations: self.activations.current(),
            states: self.states.current(),
            short: self.short_averages.current(),
            long: self.long_averages.current(),
        }
    }

    fn swap_activity(&mut self) {
        self.activations.swap();
        self.states.swap();
        self.short_averages.swap();
        self.long_averages.swap();
    }

    fn stats<B: ComputeBackend + ?Sized>(&self, backend: &mut B) -> Result<PopulationStats> {
        Ok(PopulationStats {
            mean_state: mean(&backend.readback(self.states.previous())?),
            mean_long_average: mean(&backend.readback(self.long_averages.previous())?),
            mean_threshold: mean(&backend.readback(self.thresholds.previous())?),
        })
    }
}

/// Double-buffered weights of one directed connection.
#[derive(Debug, Clone)]
pub struct Weights2D {
    weights: DoubleBuffer,
    field: ReceptiveField,
}

impl Weights2D {
    /// Fills `previous` from the seeded device-side generator and copies it
    /// into `current`.
    pub(crate) fn create_random<B: ComputeBackend + ?Sized>(
        backend: &mut B,
        field: ReceptiveField,
        range: WeightRange,
        seed: [u32; 2],
        stream: u32,
    ) -> Result<Self> {
        let weights = allocate_pair(backend, Shape::new(field.target, field.taps()))?;
        backend.dispatch(&Dispatch::RandomFill(RandomFillArgs {
            tensor: weights.previous(),
            min: range.min,
            max: range.max,
            seed,
            stream,
        }))?;
        backend.copy(weights.previous(), weights.current())?;
        Ok(Self { weights, field })
    }

    #[inline]
    pub fn current(&self) -> Tensor {
        self.weights.current()
    }

    #[inline]
    pub fn previous(&self) -> Tensor {
        self.weights.previous()
    }

    #[inline]
    pub fn field(&self) -> ReceptiveField {
        self.field
    }

    #[inline]
    pub(crate) fn swap(&mut self) {
        self.weights.swap();
    }
}

/// Mean activity figures of one population, read from the `previous` role.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PopulationStats {
    pub mean_state: f32,
    pub mean_long_average: f32,
    pub mean_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerStats {
    pub e: PopulationStats,
    pub i: PopulationStats,
}

#[derive(Debug, Clone)]
pub struct Layer {
    config: LayerConfig,
    e: NeuronLayer,
    i: NeuronLayer,
    e_feed_forward: Weights2D,
    e_feed_back: Weights2D,
    i_feed_forward: Weights2D,
    i_lateral: Weights2D,
    i_feed_back: Weights2D,
}

impl Layer {
    /// Allocates and initialises a layer.
    ///
    /// Excitatory connections are filled from one pair of draws on `rng`,
    /// inhibitory connections from the next pair. Long averages start at the
    /// target sparsity and thresholds at their initial constant.
    pub fn create_random<B: ComputeBackend + ?Sized>(
        config: &LayerConfig,
        init: &InitParams,
        backend: &mut B,
        rng: &mut Prng,
    ) -> Result<Self> {
        config.validate()?;
        init.validate()?;

        let e = NeuronLayer::create(backend, config.e, init.sparsity.e, init.e_threshold)?;
        let i = NeuronLayer::create(backend, config.i, init.sparsity.i, init.i_threshold)?;

        let seed_e = rng.seed_pair();
        let seed_i = rng.seed_pair();
        let (e_range, i_range) = (init.e_weights, init.i_weights);

        let e_feed_forward =
            Weights2D::create_random(backend, config.e_feed_forward_field(), e_range, seed_e, 0)?;
        let e_feed_back =
            Weights2D::create_random(backend, config.e_feed_back_field(), i_range, seed_e, 1)?;
        let i_feed_forward =
            Weights2D::create_random(backend, config.i_feed_forward_field(), e_range, seed_i, 0)?;
        let i_lateral =
            Weights2D::create_random(backend, config.i_lateral_field(), i_range, seed_i, 1)?;
        let i_feed_back =
            Weights2D::create_random(backend, config.i_feed_back_field(), e_range, seed_i, 2)?;

        debug!(
            e = %config.e,
            i = %config.i,
            feed_forward = %config.e_feed_forward,
            feed_back = %config.i_feed_back,
            "layer created"
        );

        Ok(Self {
            config: *config,
            e,
            i,
            e_feed_forward,
            e_feed_back,
            i_feed_forward,
            i_lateral,
            i_feed_back,
        })
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn e(&self) -> &NeuronLayer {
        &self.e
    }

    pub fn i(&self) -> &NeuronLayer {
        &self.i
    }

    pub fn e_feed_forward_weights(&self) -> &Weights2D {
        &self.e_feed_forward
    }

    pub fn e_feed_back_weights(&self) -> &Weights2D {
        &self.e_feed_back
    }

    pub fn i_feed_forward_weights(&self) -> &Weights2D {
        &self.i_feed_forward
    }

    pub fn i_lateral_weights(&self) -> &Weights2D {
        &self.i_lateral
    }

    pub fn i_feed_back_weights(&self) -> &Weights2D {
        &self.i_feed_back
    }

    /// All five connections, excitatory first.
    pub fn weights(&self) -> [&Weights2D; 5] {
        [
            &self.e_feed_forward,
            &self.e_feed_back,
            &self.i_feed_forward,
            &self.i_lateral,
            &self.i_feed_back,
        ]
    }

    pub fn e_activate_dispatch(
        &self,
        feed_forward: Tensor,
        params: &ActivationParams,
    ) -> Result<Dispatch> {
        Error::check_shape(
            "feed-forward input",
            self.config.e_feed_forward.field(),
            feed_forward.shape(),
        )?;
        Ok(Dispatch::EActivate(EActivateArgs {
            feed_forward,
            i_states: self.i.states.previous(),
            ff_weights: self.e_feed_forward.previous(),
            fb_weights: self.e_feed_back.previous(),
            population: self.e.io(),
            ff_field: self.e_feed_forward.field(),
            fb_field: self.e_feed_back.field(),
            params: *params,
        }))
    }

    pub fn i_activate_dispatch(
        &self,
        feed_back: Tensor,
        params: &ActivationParams,
    ) -> Result<Dispatch> {
        Error::check_shape(
            "feed-back input",
            self.config.i_feed_back.field(),
            feed_back.shape(),
        )?;
        Ok(Dispatch::IActivate(IActivateArgs {
            // Same-step excitatory output.
            e_states: self.e.states.current(),
            feed_back,
            ff_weights: self.i_feed_forward.previous(),
            lateral_weights: self.i_lateral.previous(),
            fb_weights: self.i_feed_back.previous(),
            population: self.i.io(),
            ff_field: self.i_feed_forward.field(),
            lateral_field: self.i_lateral.field(),
            fb_field: self.i_feed_back.field(),
            params: *params,
        }))
    }

    pub fn learn_dispatches(
        &self,
        ff_short: Tensor,
        fb_short: Tensor,
        fb_long: Tensor,
        rates: &LearnRates,
        sparsity: &SparsityTargets,
    ) -> Result<[Dispatch; 2]> {
        rates.validate()?;
        sparsity.validate()?;
        Error::check_shape(
            "feed-forward context",
            self.config.e_feed_forward.field(),
            ff_short.shape(),
        )?;
        Error::check_shape(
            "feed-back short average",
            self.config.i_feed_back.field(),
            fb_short.shape(),
        )?;
        Error::check_shape(
            "feed-back long average",
            self.config.i_feed_back.field(),
            fb_long.shape(),
        )?;

        let e_learn = Dispatch::ELearn(ELearnArgs {
            ff_short,
            e_short: self.e.short_averages.previous(),
            e_long: self.e.long_averages.previous(),
            i_short: self.i.short_averages.previous(),
            ff_weights_prev: self.e_feed_forward.previous(),
            fb_weights_prev: self.e_feed_back.previous(),
            thresholds_prev: self.e.thresholds.previous(),
            ff_weights: self.e_feed_forward.current(),
            fb_weights: self.e_feed_back.current(),
            thresholds: self.e.thresholds.current(),
            ff_field: self.e_feed_forward.field(),
            fb_field: self.e_feed_back.field(),
            alpha: rates.e_alpha,
            beta: rates.e_beta,
            delta: rates.e_delta,
            sparsity: sparsity.e,
        });
        let i_learn = Dispatch::ILearn(ILearnArgs {
            fb_short,
            fb_long,
            e_short: self.e.short_averages.previous(),
            i_short: self.i.short_averages.previous(),
            i_long: self.i.long_averages.previous(),
            ff_weights_prev: self.i_feed_forward.previous(),
            lateral_weights_prev: self.i_lateral.previous(),
            fb_weights_prev: self.i_feed_back.previous(),
            thresholds_prev: self.i.thresholds.previous(),
            ff_weights: self.i_feed_forward.current(),
            lateral_weights: self.i_lateral.current(),
            fb_weights: self.i_feed_back.current(),
            thresholds: self.i.thresholds.current(),
            ff_field: self.i_feed_forward.field(),
            lateral_field: self.i_lateral.field(),
            fb_field: self.i_feed_back.field(),
            alpha: rates.i_alpha,
            beta: rates.i_beta,
            gamma: rates.i_gamma,
            delta: rates.i_delta,
            sparsity: sparsity.i,
        });
        Ok([e_learn, i_learn])
    }

    /// One settling iteration of the excitatory population.
    pub fn e_activate<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        feed_forward: Tensor,
        params: &ActivationParams,
    ) -> Result<()> {
        let call = self.e_activate_dispatch(feed_forward, params)?;
        backend.dispatch(&call)?;
        Ok(())
    }

    /// One settling iteration of the inhibitory population. Must follow
    /// `e_activate` of the same iteration.
    pub fn i_activate<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        feed_back: Tensor,
        params: &ActivationParams,
    ) -> Result<()> {
        let call = self.i_activate_dispatch(feed_back, params)?;
        backend.dispatch(&call)?;
        Ok(())
    }

    /// Updates weights and thresholds of both populations into `current`.
    pub fn learn<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        ff_short: Tensor,
        fb_short: Tensor,
        fb_long: Tensor,
        rates: &LearnRates,
        sparsity: &SparsityTargets,
    ) -> Result<()> {
        for call in self.learn_dispatches(ff_short, fb_short, fb_long, rates, sparsity)? {
            backend.dispatch(&call)?;
        }
        Ok(())
    }

    /// Clears the per-example short averages of both populations.
    pub fn ex_step_begin<B: ComputeBackend + ?Sized>(&self, backend: &mut B) -> Result<()> {
        fill_pair(backend, &self.e.short_averages, 0.0)?;
        fill_pair(backend, &self.i.short_averages, 0.0)?;
        Ok(())
    }

    pub fn sim_step_end(&mut self) {
        self.e.swap_activity();
        self.i.swap_activity();
    }

    pub fn ex_step_end(&mut self) {
        self.e.thresholds.swap();
        self.i.thresholds.swap();
        self.e_feed_forward.swap();
        self.e_feed_back.swap();
        self.i_feed_forward.swap();
        self.i_lateral.swap();
        self.i_feed_back.swap();
    }

    pub fn stats<B: ComputeBackend + ?Sized>(&self, backend: &mut B) -> Result<LayerStats> {
        Ok(LayerStats {
            e: self.e.stats(backend)?,
            i: self.i.stats(backend)?,
        })
    }
}

fn allocate_pair<B: ComputeBackend + ?Sized>(backend: &mut B, shape: Shape) -> Result<DoubleBuffer> {
    let first = backend.allocate(shape)?;
    let second = backend.allocate(shape)?;
    Ok(DoubleBuffer::new(first, second))
}

fn fill_pair<B: ComputeBackend + ?Sized>(
    backend: &mut B,
    pair: &DoubleBuffer,
    value: f32,
) -> Result<()> {
    backend.fill(pair.current(), value)?;
    backend.fill(pair.previous(), value)?;
    Ok(())
}

pub(crate) fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExecutionTier;
    use crate::config::generate_configs_from_sizes;
    use crate::host::HostBackend;

    fn config() -> LayerConfig {
        generate_configs_from_sizes(Extent::new(2, 2), &[Extent::new(8, 8)], &[Extent::new(4, 4)])
            .unwrap()[0]
    }

    fn layer(backend: &mut HostBackend, seed: u64) -> Layer {
        let mut rng = Prng::new(seed);
        Layer::create_random(&config(), &InitParams::default(), backend, &mut rng).unwrap()
    }

    #[test]
    fn fresh_weights_have_identical_buffers() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let layer = layer(&mut b, 5);
        for w in layer.weights() {
            let cur = b.readback(w.current()).unwrap();
            let prev = b.readback(w.previous()).unwrap();
            assert_eq!(cur, prev);
        }
    }

    #[test]
    fn fresh_layer_starts_at_targets() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let layer = layer(&mut b, 5);
        let init = InitParams::default();
        for (pop, sparsity, thr) in [
            (layer.e(), init.sparsity.e, init.e_threshold),
            (layer.i(), init.sparsity.i, init.i_threshold),
        ] {
            let long = b.readback(pop.long_averages.previous()).unwrap();
            let thresholds = b.readback(pop.thresholds.previous()).unwrap();
            assert!(long.iter().all(|v| *v == sparsity));
            assert!(thresholds.iter().all(|v| *v == thr));
        }
    }

    #[test]
    fn weights_respect_init_ranges() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let layer = layer(&mut b, 8);
        let lateral = b.readback(layer.i_lateral_weights().current()).unwrap();
        assert!(lateral.iter().all(|v| (0.0..=0.01).contains(v)));
        let ff = b.readback(layer.e_feed_forward_weights().current()).unwrap();
        assert!(ff.iter().all(|v| (-0.01..=0.01).contains(v)));
        assert_eq!(ff.len(), 64 * 17 * 17);
    }

    #[test]
    fn sim_step_end_twice_restores_buffers() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let mut layer = layer(&mut b, 1);
        let (e_io, i_io) = (layer.e().io(), layer.i().io());
        layer.sim_step_end();
        assert_eq!(layer.e().states.current(), e_io.states_prev);
        layer.sim_step_end();
        let after = layer.e().io();
        assert_eq!(after.states, e_io.states);
        assert_eq!(after.short, e_io.short);
        assert_eq!(after.long_prev, e_io.long_prev);
        assert_eq!(layer.i().io().activations, i_io.activations);
    }

    #[test]
    fn ex_step_begin_clears_short_averages() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let mut layer = layer(&mut b, 1);
        for t in [layer.e().short_averages.current(), layer.e().short_averages.previous()] {
            b.fill(t, 0.7).unwrap();
        }
        layer.ex_step_begin(&mut b).unwrap();
        layer.sim_step_end();
        for pop in [layer.e(), layer.i()] {
            for t in [pop.short_averages.current(), pop.short_averages.previous()] {
                assert!(b.readback(t).unwrap().iter().all(|v| *v == 0.0));
            }
        }
    }

    #[test]
    fn dispatches_never_read_what_they_write() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let layer = layer(&mut b, 2);
        let input = b.allocate(Extent::new(2, 2).field()).unwrap();
        let neutral = b.allocate(Extent::UNIT.field()).unwrap();
        let params = ActivationParams::default();
        let mut calls = vec![
            layer.e_activate_dispatch(input, &params).unwrap(),
            layer.i_activate_dispatch(neutral, &params).unwrap(),
        ];
        calls.extend(
            layer
                .learn_dispatches(
                    input,
                    neutral,
                    neutral,
                    &LearnRates::default(),
                    &SparsityTargets::default(),
                )
                .unwrap(),
        );
        for call in &calls {
            assert!(call.check_isolation().is_ok(), "{:?}", call.entry());
        }
    }

    #[test]
    fn wrong_input_shape_is_rejected() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let layer = layer(&mut b, 2);
        let input = b.allocate(Extent::new(3, 3).field()).unwrap();
        let err = layer
            .e_activate(&mut b, input, &ActivationParams::default())
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn strong_drive_makes_units_fire() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let mut layer = layer(&mut b, 3);
        let ff = layer.e_feed_forward_weights().previous();
        b.fill(ff, 1.0).unwrap();
        let input = b.allocate_with(Extent::new(2, 2).field(), &[1.0; 4]).unwrap();
        let params = ActivationParams {
            eta: 1.0,
            short_average_rate_inv: 1.0,
            long_average_decay: 0.5,
        };
        layer.ex_step_begin(&mut b).unwrap();
        layer.e_activate(&mut b, input, &params).unwrap();
        layer.sim_step_end();
        let states = b.readback(layer.e().states.previous()).unwrap();
        assert!(states.iter().all(|s| *s == 1.0));
        let stats = layer.stats(&mut b).unwrap();
        assert_eq!(stats.e.mean_state, 1.0);
        assert!((stats.e.mean_long_average - (0.5 * 0.03 + 0.5)).abs() < 1e-4);
    }

    #[test]
    fn frozen_learning_copies_weights_through() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let mut layer = layer(&mut b, 4);
        let input = b.allocate(Extent::new(2, 2).field()).unwrap();
        let neutral = b.allocate(Extent::UNIT.field()).unwrap();
        let before: Vec<Vec<f32>> = layer
            .weights()
            .iter()
            .map(|w| b.readback(w.previous()).unwrap())
            .collect();
        layer
            .learn(
                &mut b,
                input,
                neutral,
                neutral,
                &LearnRates::FROZEN,
                &SparsityTargets::default(),
            )
            .unwrap();
        layer.ex_step_end();
        for (w, old) in layer.weights().iter().zip(&before) {
            assert_eq!(&b.readback(w.previous()).unwrap(), old);
        }
    }

    #[test]
    fn learning_rejects_degenerate_parameters() {
        let mut b = HostBackend::new(ExecutionTier::Scalar);
        let layer = layer(&mut b, 6);
        let input = b.allocate(Extent::new(2, 2).field()).unwrap();
        let neutral = b.allocate(Extent::UNIT.field()).unwrap();
        let before = b.readback(layer.e_feed_forward_weights().current()).unwrap();

        let zero_sparsity = SparsityTargets { e: 0.0, i: 0.0 };
        let err = layer
            .learn(&mut b, input, neutral, neutral, &LearnRates::default(), &zero_sparsity)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let negative = LearnRates {
            e_alpha: -5.0,
            ..LearnRates::default()
        };
        let err = layer
            .learn(&mut b, input, neutral, neutral, &negative, &SparsityTargets::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let nan = LearnRates {
            i_gamma: f32::NAN,
            ..LearnRates::default()
        };
        assert!(layer
            .learn(&mut b, input, neutral, neutral, &nan, &SparsityTargets::default())
            .is_err());

        let after = b.readback(layer.e_feed_forward_weights().current()).unwrap();
        assert_eq!(before, after);
    }
}
