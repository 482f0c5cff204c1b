//! Network configuration.
//!
//! `LayerConfig` fixes the geometry of one layer; the parameter bundles
//! carry the scalars handed to construction, settling and learning.
//! Everything validates up front so kernels never see a degenerate value.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::backend::ExecutionTier;
use crate::error::{Error, Result};
use crate::field::ReceptiveField;
use crate::tensor::Extent;

/// Receptive-field radii of the five connections of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Radii {
    pub e_feed_forward: u32,
    pub e_feed_back: u32,
    pub i_feed_forward: u32,
    pub i_lateral: u32,
    pub i_feed_back: u32,
}

impl Default for Radii {
    fn default() -> Self {
        Self {
            e_feed_forward: 8,
            e_feed_back: 6,
            i_feed_forward: 6,
            i_lateral: 6,
            i_feed_back: 6,
        }
    }
}

/// Geometry of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerConfig {
    /// Source of the excitatory feed-forward input: the network input for
    /// layer 0, the excitatory field of the layer below otherwise.
    pub e_feed_forward: Extent,
    pub e: Extent,
    pub i: Extent,
    /// Source of inhibitory feedback: the inhibitory field of the layer
    /// above, 1x1 for the top layer.
    pub i_feed_back: Extent,
    pub radii: Radii,
}

impl LayerConfig {
    pub const MAX_RADIUS: u32 = 32;

    pub fn validate(&self) -> Result<()> {
        if self.e_feed_forward.is_empty()
            || self.e.is_empty()
            || self.i.is_empty()
            || self.i_feed_back.is_empty()
        {
            return Err(Error::InvalidConfig("layer extents must be at least 1x1"));
        }
        let r = &self.radii;
        let largest = r
            .e_feed_forward
            .max(r.e_feed_back)
            .max(r.i_feed_forward)
            .max(r.i_lateral)
            .max(r.i_feed_back);
        if largest > Self::MAX_RADIUS {
            return Err(Error::InvalidConfig("receptive field radius exceeds MAX_RADIUS"));
        }
        if r.i_lateral == 0 {
            return Err(Error::InvalidConfig("inhibitory lateral radius must be at least 1"));
        }
        Ok(())
    }

    pub fn e_feed_forward_field(&self) -> ReceptiveField {
        ReceptiveField::new(self.e_feed_forward, self.e, self.radii.e_feed_forward)
    }

    pub fn e_feed_back_field(&self) -> ReceptiveField {
        ReceptiveField::new(self.i, self.e, self.radii.e_feed_back)
    }

    pub fn i_feed_forward_field(&self) -> ReceptiveField {
        ReceptiveField::new(self.e, self.i, self.radii.i_feed_forward)
    }

    pub fn i_lateral_field(&self) -> ReceptiveField {
        ReceptiveField::new(self.i, self.i, self.radii.i_lateral)
    }

    pub fn i_feed_back_field(&self) -> ReceptiveField {
        ReceptiveField::new(self.i_feed_back, self.i, self.radii.i_feed_back)
    }
}

/// Builds chained layer configs with default radii.
///
/// Layer 0 reads `input`; layer `n` reads the excitatory field of layer
/// `n-1` and takes feedback from the inhibitory field of layer `n+1`.
pub fn generate_configs_from_sizes(
    input: Extent,
    e_sizes: &[Extent],
    i_sizes: &[Extent],
) -> Result<Vec<LayerConfig>> {
    generate_configs_with_radii(input, e_sizes, i_sizes, Radii::default())
}

pub fn generate_configs_with_radii(
    input: Extent,
    e_sizes: &[Extent],
    i_sizes: &[Extent],
    radii: Radii,
) -> Result<Vec<LayerConfig>> {
    if e_sizes.len() != i_sizes.len() {
        return Err(Error::LayerCountMismatch {
            e_layers: e_sizes.len(),
            i_layers: i_sizes.len(),
        });
    }
    let configs = e_sizes
        .iter()
        .zip(i_sizes)
        .enumerate()
        .map(|(l, (&e, &i))| LayerConfig {
            e_feed_forward: if l == 0 { input } else { e_sizes[l - 1] },
            e,
            i,
            i_feed_back: i_sizes.get(l + 1).copied().unwrap_or(Extent::UNIT),
            radii,
        })
        .collect();
    Ok(configs)
}

/// Checks the chaining invariant between adjacent configs.
pub fn check_chain(input: Extent, configs: &[LayerConfig]) -> Result<()> {
    if configs.is_empty() {
        return Err(Error::InvalidConfig("a hierarchy needs at least one layer"));
    }
    for (l, config) in configs.iter().enumerate() {
        let below = if l == 0 { input } else { configs[l - 1].e };
        let above = configs.get(l + 1).map_or(Extent::UNIT, |c| c.i);
        if config.e_feed_forward != below || config.i_feed_back != above {
            return Err(Error::ChainBroken { layer: l });
        }
    }
    Ok(())
}

/// Inclusive range of initial weight values.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WeightRange {
    pub min: f32,
    pub max: f32,
}

impl WeightRange {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min > self.max {
            return Err(Error::InvalidConfig("weight range must be finite with min <= max"));
        }
        Ok(())
    }
}

/// Target firing rates of the two populations.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SparsityTargets {
    pub e: f32,
    pub i: f32,
}

impl Default for SparsityTargets {
    fn default() -> Self {
        Self { e: 0.03, i: 0.03 }
    }
}

impl SparsityTargets {
    pub fn validate(&self) -> Result<()> {
        let ok = |s: f32| s > 0.0 && s < 1.0;
        if !ok(self.e) || !ok(self.i) {
            return Err(Error::InvalidConfig("sparsity targets must lie in (0, 1)"));
        }
        Ok(())
    }
}

/// Initial state of a freshly created network.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct InitParams {
    /// Excitatory feed-forward weights of both populations, inhibitory
    /// feedback weights and the prediction head.
    pub e_weights: WeightRange,
    /// Inhibitory weights: excitatory feedback and inhibitory lateral.
    pub i_weights: WeightRange,
    pub e_threshold: f32,
    pub i_threshold: f32,
    pub sparsity: SparsityTargets,
}

impl Default for InitParams {
    fn default() -> Self {
        Self {
            e_weights: WeightRange::new(-0.01, 0.01),
            i_weights: WeightRange::new(0.0, 0.01),
            e_threshold: 0.01,
            i_threshold: 0.01,
            sparsity: SparsityTargets::default(),
        }
    }
}

impl InitParams {
    pub fn validate(&self) -> Result<()> {
        self.e_weights.validate()?;
        self.i_weights.validate()?;
        if !self.e_threshold.is_finite() || !self.i_threshold.is_finite() {
            return Err(Error::InvalidConfig("initial thresholds must be finite"));
        }
        self.sparsity.validate()
    }
}

/// Scalars of one settling iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ActivationParams {
    /// Integration rate of the membrane.
    pub eta: f32,
    /// Weight of one iteration in the per-example short average.
    pub short_average_rate_inv: f32,
    pub long_average_decay: f32,
}

impl Default for ActivationParams {
    fn default() -> Self {
        Self::for_iterations(30)
    }
}

impl ActivationParams {
    /// Defaults with the short average normalised over `iterations`.
    pub fn for_iterations(iterations: u32) -> Self {
        Self {
            eta: 0.02,
            short_average_rate_inv: 1.0 / iterations.max(1) as f32,
            long_average_decay: 0.002,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.eta > 0.0 && self.eta <= 1.0) {
            return Err(Error::InvalidConfig("eta must lie in (0, 1]"));
        }
        let unit = |v: f32| (0.0..=1.0).contains(&v);
        if !unit(self.short_average_rate_inv) || !unit(self.long_average_decay) {
            return Err(Error::InvalidConfig("average rates must lie in [0, 1]"));
        }
        Ok(())
    }
}

/// Learning rates of one layer update.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LearnRates {
    pub e_alpha: f32,
    pub e_beta: f32,
    pub e_delta: f32,
    pub i_alpha: f32,
    pub i_beta: f32,
    pub i_gamma: f32,
    pub i_delta: f32,
}

impl Default for LearnRates {
    fn default() -> Self {
        Self {
            e_alpha: 0.01,
            e_beta: 0.028,
            e_delta: 0.028,
            i_alpha: 0.028,
            i_beta: 0.028,
            i_gamma: 0.06,
            i_delta: 0.028,
        }
    }
}

impl LearnRates {
    /// All rates zero: learning passes copy weights through unchanged.
    pub const FROZEN: LearnRates = LearnRates {
        e_alpha: 0.0,
        e_beta: 0.0,
        e_delta: 0.0,
        i_alpha: 0.0,
        i_beta: 0.0,
        i_gamma: 0.0,
        i_delta: 0.0,
    };

    pub fn validate(&self) -> Result<()> {
        let rates = [
            self.e_alpha,
            self.e_beta,
            self.e_delta,
            self.i_alpha,
            self.i_beta,
            self.i_gamma,
            self.i_delta,
        ];
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(Error::InvalidConfig("learning rates must be finite and non-negative"));
        }
        Ok(())
    }
}

/// How the input image drives layer 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum InputCoding {
    /// Layer 0 reads the input values directly.
    #[default]
    Analog,
    /// Input values drive per-unit spike timers; layer 0 reads the spikes.
    Spiking,
}

/// Everything one training cycle needs besides the tensors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams {
    pub activation: ActivationParams,
    pub iterations: u32,
    pub learn: LearnRates,
    pub sparsity: SparsityTargets,
    pub prediction_alpha: f32,
}

impl StepParams {
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(Error::InvalidConfig("settling needs at least one iteration"));
        }
        if !self.prediction_alpha.is_finite() || self.prediction_alpha < 0.0 {
            return Err(Error::InvalidConfig("prediction alpha must be finite and non-negative"));
        }
        self.activation.validate()?;
        self.learn.validate()?;
        self.sparsity.validate()
    }
}

/// Complete description of a network and its training schedule.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NetworkConfig {
    pub input: Extent,
    pub e_sizes: Vec<Extent>,
    pub i_sizes: Vec<Extent>,
    pub radii: Radii,
    pub prediction_radius_e: u32,
    pub prediction_radius_i: u32,
    pub init: InitParams,
    pub activation: ActivationParams,
    pub iterations: u32,
    pub learn: LearnRates,
    pub prediction_alpha: f32,
    pub input_coding: InputCoding,
    pub seed: u64,
    pub execution_tier: ExecutionTier,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input: Extent::new(2, 2),
            e_sizes: vec![Extent::new(8, 8)],
            i_sizes: vec![Extent::new(4, 4)],
            radii: Radii::default(),
            prediction_radius_e: 6,
            prediction_radius_i: 6,
            init: InitParams::default(),
            activation: ActivationParams::for_iterations(30),
            iterations: 30,
            learn: LearnRates::default(),
            prediction_alpha: 0.005,
            input_coding: InputCoding::Analog,
            seed: 1,
            execution_tier: ExecutionTier::Scalar,
        }
    }
}

impl NetworkConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_layers(mut self, e_sizes: Vec<Extent>, i_sizes: Vec<Extent>) -> Self {
        self.e_sizes = e_sizes;
        self.i_sizes = i_sizes;
        self
    }

    pub fn with_execution_tier(mut self, tier: ExecutionTier) -> Self {
        self.execution_tier = tier;
        self
    }

    pub fn layer_configs(&self) -> Result<Vec<LayerConfig>> {
        generate_configs_with_radii(self.input, &self.e_sizes, &self.i_sizes, self.radii)
    }

    pub fn step_params(&self) -> StepParams {
        StepParams {
            activation: self.activation,
            iterations: self.iterations,
            learn: self.learn,
            sparsity: self.init.sparsity,
            prediction_alpha: self.prediction_alpha,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input.is_empty() {
            return Err(Error::InvalidConfig("input extent must be at least 1x1"));
        }
        if self.prediction_radius_e > LayerConfig::MAX_RADIUS
            || self.prediction_radius_i > LayerConfig::MAX_RADIUS
        {
            return Err(Error::InvalidConfig("prediction radius exceeds MAX_RADIUS"));
        }
        for config in self.layer_configs()? {
            config.validate()?;
        }
        self.init.validate()?;
        self.step_params().validate()
    }

    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: NetworkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "serde")]
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
