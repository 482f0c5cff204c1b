//! Host backend: tensors live in main memory and kernels run on the CPU.
//!
//! Every kernel computes one independent task per unit. Under
//! [`ExecutionTier::Parallel`] the units are spread over the rayon pool;
//! the results are identical to the scalar path because no unit reads
//! anything another unit of the same dispatch writes.

use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{trace, warn};

use crate::backend::{
    ComputeBackend, Dispatch, EActivateArgs, ELearnArgs, EncodeInputArgs, ExecutionTier,
    IActivateArgs, ILearnArgs, KernelEntry, KernelHandle, KernelTable, PopulationIo,
    PredictArgs, PredictionLearnArgs, RandomFillArgs, SumActivityArgs,
};
use crate::config::ActivationParams;
use crate::error::BackendError;
use crate::rule::{SpikingRule, UpdateRule};
use crate::tensor::{Extent, Shape, Tensor};

#[derive(Debug)]
struct HostTensor {
    shape: Shape,
    data: Vec<f32>,
}

#[derive(Debug)]
pub struct HostBackend {
    tier: ExecutionTier,
    rule: Arc<dyn UpdateRule>,
    tensors: Vec<HostTensor>,
    kernels: KernelTable,
}

impl HostBackend {
    /// Host backend running the default spiking rule.
    pub fn new(tier: ExecutionTier) -> Self {
        Self::with_rule(tier, Arc::new(SpikingRule))
    }

    pub fn with_rule(tier: ExecutionTier, rule: Arc<dyn UpdateRule>) -> Self {
        let tier = match tier {
            ExecutionTier::Parallel if cfg!(feature = "parallel") => ExecutionTier::Parallel,
            ExecutionTier::Parallel => {
                warn!("built without the `parallel` feature; host kernels run sequentially");
                ExecutionTier::Scalar
            }
            _ => ExecutionTier::Scalar,
        };
        let mut kernels = KernelTable::default();
        for (n, entry) in KernelEntry::ALL.iter().enumerate() {
            kernels.insert(*entry, KernelHandle(n as u32));
        }
        Self {
            tier,
            rule,
            tensors: Vec::new(),
            kernels,
        }
    }

    /// Effective tier after feature fallback.
    pub fn tier(&self) -> ExecutionTier {
        self.tier
    }

    pub fn rule(&self) -> &dyn UpdateRule {
        self.rule.as_ref()
    }

    pub fn allocated_floats(&self) -> usize {
        self.tensors.iter().map(|t| t.data.len()).sum()
    }

    fn tensor(&self, t: Tensor) -> Result<&HostTensor, BackendError> {
        let stored = self
            .tensors
            .get(t.id() as usize)
            .ok_or(BackendError::UnknownTensor(t.id()))?;
        if stored.shape != t.shape() {
            return Err(BackendError::ShapeMismatch {
                expected: stored.shape,
                actual: t.shape(),
            });
        }
        Ok(stored)
    }

    fn tensor_mut(&mut self, t: Tensor) -> Result<&mut HostTensor, BackendError> {
        self.tensor(t)?;
        Ok(&mut self.tensors[t.id() as usize])
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &str {
        match self.tier {
            ExecutionTier::Parallel => "host-parallel",
            _ => "host-scalar",
        }
    }

    fn kernels(&self) -> &KernelTable {
        &self.kernels
    }

    fn allocate(&mut self, shape: Shape) -> Result<Tensor, BackendError> {
        let id = self.tensors.len() as u32;
        self.tensors.push(HostTensor {
            shape,
            data: vec![0.0; shape.len()],
        });
        Ok(Tensor::new(id, shape))
    }

    fn fill(&mut self, tensor: Tensor, value: f32) -> Result<(), BackendError> {
        self.tensor_mut(tensor)?.data.fill(value);
        Ok(())
    }

    fn copy(&mut self, src: Tensor, dst: Tensor) -> Result<(), BackendError> {
        self.tensor(src)?;
        if src.shape() != dst.shape() {
            return Err(BackendError::ShapeMismatch {
                expected: src.shape(),
                actual: dst.shape(),
            });
        }
        if src.id() == dst.id() {
            return Ok(());
        }
        let data = self.tensors[src.id() as usize].data.clone();
        self.tensor_mut(dst)?.data = data;
        Ok(())
    }

    fn upload(&mut self, data: &[f32], tensor: Tensor) -> Result<(), BackendError> {
        let stored = self.tensor_mut(tensor)?;
        if stored.data.len() != data.len() {
            return Err(BackendError::SizeMismatch {
                expected: stored.data.len(),
                actual: data.len(),
            });
        }
        stored.data.copy_from_slice(data);
        Ok(())
    }

    fn readback(&mut self, tensor: Tensor) -> Result<Vec<f32>, BackendError> {
        Ok(self.tensor(tensor)?.data.clone())
    }

    fn dispatch(&mut self, call: &Dispatch) -> Result<(), BackendError> {
        self.kernels.get(call.entry())?;
        call.check_isolation()?;
        let writes = call.writes();
        for t in call.reads().iter().chain(&writes) {
            self.tensor(*t)?;
        }
        trace!(
            kernel = call.entry().name(),
            units = call.extent().area(),
            "host dispatch"
        );

        // Outputs are moved out of the arena so the read set can stay borrowed.
        let mut outputs: Vec<Vec<f32>> = writes
            .iter()
            .map(|t| std::mem::take(&mut self.tensors[t.id() as usize].data))
            .collect();
        let exec = Exec {
            tensors: &self.tensors,
            rule: self.rule.as_ref(),
            parallel: self.tier == ExecutionTier::Parallel,
        };
        exec.run(call, &mut outputs);
        for (t, data) in writes.iter().zip(outputs) {
            self.tensors[t.id() as usize].data = data;
        }
        Ok(())
    }
}

/// Uniform value in `[0, 1)` for element `index` of the fill stream
/// `(seed, stream)`. The WGSL `random_fill` entry point computes the same.
pub(crate) fn random_unit(seed: [u32; 2], stream: u32, index: u32) -> f32 {
    let key = pcg_hash(seed[0].wrapping_add(pcg_hash(seed[1] ^ pcg_hash(stream))));
    let h = pcg_hash(index ^ key);
    (h >> 8) as f32 / 16_777_216.0
}

#[inline]
fn pcg_hash(v: u32) -> u32 {
    let state = v.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

#[inline]
fn unit_xy(u: usize, extent: Extent) -> (u32, u32) {
    let w = extent.width as usize;
    ((u % w) as u32, (u / w) as u32)
}

#[derive(Debug, Clone, Copy)]
struct UnitUpdate {
    activation: f32,
    state: f32,
    short: f32,
    long: f32,
}

/// Previous-step fields of the population being settled.
struct Previous<'a> {
    activations: &'a [f32],
    short: &'a [f32],
    long: &'a [f32],
    thresholds: &'a [f32],
}

impl Previous<'_> {
    #[inline]
    fn settle(
        &self,
        rule: &dyn UpdateRule,
        params: &ActivationParams,
        u: usize,
        drive: f32,
    ) -> UnitUpdate {
        let out = rule.integrate(self.activations[u], drive, self.thresholds[u], params.eta);
        UnitUpdate {
            activation: out.activation,
            state: out.state,
            short: rule.short_average(self.short[u], out.state, params.short_average_rate_inv),
            long: rule.long_average(self.long[u], out.state, params.long_average_decay),
        }
    }
}

/// Output order matches `PopulationIo::writes`.
fn scatter(units: Vec<UnitUpdate>, out: &mut [Vec<f32>]) {
    let [activations, states, short, long] = out else {
        return;
    };
    for (u, unit) in units.into_iter().enumerate() {
        activations[u] = unit.activation;
        states[u] = unit.state;
        short[u] = unit.short;
        long[u] = unit.long;
    }
}

/// Starts unit `u`'s weight row from its previous values; taps outside
/// the source field keep them.
#[inline]
fn carry(row: &mut [f32], prev: &[f32], u: usize) {
    let d = row.len();
    row.copy_from_slice(&prev[u * d..(u + 1) * d]);
}

struct Exec<'a> {
    tensors: &'a [HostTensor],
    rule: &'a dyn UpdateRule,
    #[cfg_attr(not(feature = "parallel"), allow(dead_code))]
    parallel: bool,
}

impl<'a> Exec<'a> {
    #[inline]
    fn data(&self, t: Tensor) -> &'a [f32] {
        &self.tensors[t.id() as usize].data
    }

    fn previous(&self, io: &PopulationIo) -> Previous<'a> {
        Previous {
            activations: self.data(io.activations_prev),
            short: self.data(io.short_prev),
            long: self.data(io.long_prev),
            thresholds: self.data(io.thresholds),
        }
    }

    fn map_units<T, F>(&self, n: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        #[cfg(feature = "parallel")]
        if self.parallel {
            return (0..n).into_par_iter().map(f).collect();
        }
        (0..n).map(f).collect()
    }

    /// Runs `f(unit, row)` over consecutive `stride`-sized rows of `out`.
    fn for_each_row<F>(&self, out: &mut [f32], stride: usize, f: F)
    where
        F: Fn(usize, &mut [f32]) + Sync + Send,
    {
        #[cfg(feature = "parallel")]
        if self.parallel {
            out.par_chunks_mut(stride)
                .enumerate()
                .for_each(|(u, row)| f(u, row));
            return;
        }
        out.chunks_mut(stride)
            .enumerate()
            .for_each(|(u, row)| f(u, row));
    }

    fn run(&self, call: &Dispatch, out: &mut [Vec<f32>]) {
        match call {
            Dispatch::RandomFill(a) => self.random_fill(a, out),
            Dispatch::EActivate(a) => self.e_activate(a, out),
            Dispatch::IActivate(a) => self.i_activate(a, out),
            Dispatch::ELearn(a) => self.e_learn(a, out),
            Dispatch::ILearn(a) => self.i_learn(a, out),
            Dispatch::Predict(a) => self.predict(a, out),
            Dispatch::PredictionLearn(a) => self.prediction_learn(a, out),
            Dispatch::SumActivity(a) => self.sum_activity(a, out),
            Dispatch::EncodeInput(a) => self.encode_input(a, out),
        }
    }

    fn random_fill(&self, a: &RandomFillArgs, out: &mut [Vec<f32>]) {
        let [weights] = out else { return };
        let depth = a.tensor.shape().depth as usize;
        let span = a.max - a.min;
        self.for_each_row(weights, depth, |u, row| {
            for (k, v) in row.iter_mut().enumerate() {
                let index = (u * depth + k) as u32;
                *v = a.min + span * random_unit(a.seed, a.stream, index);
            }
        });
    }

    fn e_activate(&self, a: &EActivateArgs, out: &mut [Vec<f32>]) {
        let input = self.data(a.feed_forward);
        let i_states = self.data(a.i_states);
        let w_ff = self.data(a.ff_weights);
        let w_fb = self.data(a.fb_weights);
        let prev = self.previous(&a.population);
        let extent = a.population.states.extent();
        let (d_ff, d_fb) = (a.ff_field.taps() as usize, a.fb_field.taps() as usize);
        let rule = self.rule;

        let units = self.map_units(extent.area(), |u| {
            let (x, y) = unit_xy(u, extent);
            let mut drive = 0.0;
            a.ff_field
                .for_each_tap(x, y, |k, i| drive += w_ff[u * d_ff + k] * input[i]);
            a.fb_field
                .for_each_tap(x, y, |k, i| drive -= w_fb[u * d_fb + k] * i_states[i]);
            prev.settle(rule, &a.params, u, drive)
        });
        scatter(units, out);
    }

    fn i_activate(&self, a: &IActivateArgs, out: &mut [Vec<f32>]) {
        let e_states = self.data(a.e_states);
        let feed_back = self.data(a.feed_back);
        let i_states = self.data(a.population.states_prev);
        let w_ff = self.data(a.ff_weights);
        let w_lat = self.data(a.lateral_weights);
        let w_fb = self.data(a.fb_weights);
        let prev = self.previous(&a.population);
        let extent = a.population.states.extent();
        let d_ff = a.ff_field.taps() as usize;
        let d_lat = a.lateral_field.taps() as usize;
        let d_fb = a.fb_field.taps() as usize;
        let center = a.lateral_field.center_tap();
        let rule = self.rule;

        let units = self.map_units(extent.area(), |u| {
            let (x, y) = unit_xy(u, extent);
            let mut drive = 0.0;
            a.ff_field
                .for_each_tap(x, y, |k, i| drive += w_ff[u * d_ff + k] * e_states[i]);
            a.fb_field
                .for_each_tap(x, y, |k, i| drive += w_fb[u * d_fb + k] * feed_back[i]);
            a.lateral_field.for_each_tap(x, y, |k, i| {
                if k != center {
                    drive -= w_lat[u * d_lat + k] * i_states[i];
                }
            });
            prev.settle(rule, &a.params, u, drive)
        });
        scatter(units, out);
    }

    fn e_learn(&self, a: &ELearnArgs, out: &mut [Vec<f32>]) {
        let [w_ff, w_fb, thresholds] = out else {
            return;
        };
        let ff_short = self.data(a.ff_short);
        let e_short = self.data(a.e_short);
        let e_long = self.data(a.e_long);
        let i_short = self.data(a.i_short);
        let w_ff_prev = self.data(a.ff_weights_prev);
        let w_fb_prev = self.data(a.fb_weights_prev);
        let thr_prev = self.data(a.thresholds_prev);
        let extent = a.thresholds.extent();
        let rule = self.rule;

        self.for_each_row(w_ff, a.ff_field.taps() as usize, |u, row| {
            carry(row, w_ff_prev, u);
            let (x, y) = unit_xy(u, extent);
            let post = e_short[u];
            a.ff_field.for_each_tap(x, y, |k, i| {
                row[k] = rule.feed_forward_weight(row[k], ff_short[i], post, a.alpha);
            });
        });
        self.for_each_row(w_fb, a.fb_field.taps() as usize, |u, row| {
            carry(row, w_fb_prev, u);
            let (x, y) = unit_xy(u, extent);
            let post = e_short[u];
            a.fb_field.for_each_tap(x, y, |k, i| {
                row[k] = rule.inhibitory_weight(row[k], i_short[i], post, a.sparsity, a.beta);
            });
        });
        self.for_each_row(thresholds, 1, |u, thr| {
            thr[0] = rule.threshold(thr_prev[u], e_long[u], a.sparsity, a.delta);
        });
    }

    fn i_learn(&self, a: &ILearnArgs, out: &mut [Vec<f32>]) {
        let [w_ff, w_lat, w_fb, thresholds] = out else {
            return;
        };
        let fb_short = self.data(a.fb_short);
        let fb_long = self.data(a.fb_long);
        let e_short = self.data(a.e_short);
        let i_short = self.data(a.i_short);
        let i_long = self.data(a.i_long);
        let w_ff_prev = self.data(a.ff_weights_prev);
        let w_lat_prev = self.data(a.lateral_weights_prev);
        let w_fb_prev = self.data(a.fb_weights_prev);
        let thr_prev = self.data(a.thresholds_prev);
        let extent = a.thresholds.extent();
        let center = a.lateral_field.center_tap();
        let rule = self.rule;

        self.for_each_row(w_ff, a.ff_field.taps() as usize, |u, row| {
            carry(row, w_ff_prev, u);
            let (x, y) = unit_xy(u, extent);
            let post = i_short[u];
            a.ff_field.for_each_tap(x, y, |k, i| {
                row[k] = rule.feed_forward_weight(row[k], e_short[i], post, a.alpha);
            });
        });
        self.for_each_row(w_lat, a.lateral_field.taps() as usize, |u, row| {
            carry(row, w_lat_prev, u);
            let (x, y) = unit_xy(u, extent);
            let post = i_short[u];
            a.lateral_field.for_each_tap(x, y, |k, i| {
                if k != center {
                    row[k] = rule.inhibitory_weight(row[k], i_short[i], post, a.sparsity, a.beta);
                }
            });
        });
        self.for_each_row(w_fb, a.fb_field.taps() as usize, |u, row| {
            carry(row, w_fb_prev, u);
            let (x, y) = unit_xy(u, extent);
            let post = i_short[u];
            a.fb_field.for_each_tap(x, y, |k, i| {
                row[k] = rule.feed_back_weight(row[k], post, fb_short[i], fb_long[i], a.gamma);
            });
        });
        self.for_each_row(thresholds, 1, |u, thr| {
            thr[0] = rule.threshold(thr_prev[u], i_long[u], a.sparsity, a.delta);
        });
    }

    fn predict(&self, a: &PredictArgs, out: &mut [Vec<f32>]) {
        let [prediction] = out else { return };
        let e_activity = self.data(a.e_activity);
        let i_activity = self.data(a.i_activity);
        let w_e = self.data(a.e_weights);
        let w_i = self.data(a.i_weights);
        let extent = a.prediction.extent();
        let (d_e, d_i) = (a.e_field.taps() as usize, a.i_field.taps() as usize);

        self.for_each_row(prediction, 1, |u, p| {
            let (x, y) = unit_xy(u, extent);
            let mut sum = 0.0;
            a.e_field
                .for_each_tap(x, y, |k, i| sum += w_e[u * d_e + k] * e_activity[i]);
            a.i_field
                .for_each_tap(x, y, |k, i| sum += w_i[u * d_i + k] * i_activity[i]);
            p[0] = sum;
        });
    }

    fn prediction_learn(&self, a: &PredictionLearnArgs, out: &mut [Vec<f32>]) {
        let [w_e, w_i] = out else { return };
        let e_source = self.data(a.e_source);
        let i_source = self.data(a.i_source);
        let truth = self.data(a.truth);
        let prediction = self.data(a.prediction_prev);
        let w_e_prev = self.data(a.e_weights_prev);
        let w_i_prev = self.data(a.i_weights_prev);
        let extent = a.e_weights.extent();

        self.for_each_row(w_e, a.e_field.taps() as usize, |u, row| {
            carry(row, w_e_prev, u);
            let (x, y) = unit_xy(u, extent);
            let step = a.alpha * (truth[u] - prediction[u]);
            a.e_field
                .for_each_tap(x, y, |k, i| row[k] += step * e_source[i]);
        });
        self.for_each_row(w_i, a.i_field.taps() as usize, |u, row| {
            carry(row, w_i_prev, u);
            let (x, y) = unit_xy(u, extent);
            let step = a.alpha * (truth[u] - prediction[u]);
            a.i_field
                .for_each_tap(x, y, |k, i| row[k] += step * i_source[i]);
        });
    }

    fn sum_activity(&self, a: &SumActivityArgs, out: &mut [Vec<f32>]) {
        let [sums] = out else { return };
        let states = self.data(a.states);
        let prev = self.data(a.sums_prev);
        self.for_each_row(sums, 1, |u, s| s[0] = prev[u] + a.scale * states[u]);
    }

    fn encode_input(&self, a: &EncodeInputArgs, out: &mut [Vec<f32>]) {
        let input = self.data(a.input);
        let timers_prev = self.data(a.timers_prev);
        let history_prev = self.data(a.history_prev);

        let units = self.map_units(input.len(), |u| {
            let mut timer = timers_prev[u] + input[u];
            let spike = if timer >= 1.0 {
                timer -= 1.0;
                1.0
            } else if timer <= -1.0 {
                timer += 1.0;
                -1.0
            } else {
                0.0
            };
            let history =
                (1.0 - a.history_rate) * history_prev[u] + a.history_rate * f32::abs(spike);
            (timer, spike, history)
        });
        let [timers, spikes, history] = out else {
            return;
        };
        for (u, (t, s, h)) in units.into_iter().enumerate() {
            timers[u] = t;
            spikes[u] = s;
            history[u] = h;
        }
    }
}
