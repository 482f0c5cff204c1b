//! # heinet
//!
//! Hierarchical excitatory/inhibitory sparse coding with local learning.
//!
//! Each layer pairs an excitatory and an inhibitory population on 2D grids.
//! Units integrate windowed input, fire against adaptive thresholds and
//! learn with local Hebbian-style rules; lateral and top-down inhibition
//! keep the code sparse. Layers stack into a [`hierarchy::Hierarchy`] whose
//! bottom-layer activity feeds a linear head that forecasts the next input.
//!
//! ## Quick Start
//!
//! ```
//! use heinet::prelude::*;
//!
//! let config = NetworkConfig::default().with_seed(42);
//! let mut backend = HostBackend::new(ExecutionTier::Scalar);
//! let mut net = Hierarchy::from_config(&config, &mut backend)?;
//!
//! let input = backend.allocate_with(config.input.field(), &[1.0, 0.0, 0.0, 0.0])?;
//! let neutral = Hierarchy::allocate_neutral(&mut backend)?;
//! net.step(&mut backend, input, neutral, &config.step_params())?;
//!
//! let forecast = net.read_prediction(&mut backend)?;
//! assert_eq!(forecast.len(), 4);
//! # Ok::<(), heinet::Error>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): Serialization of configuration types, JSON config files
//! - `parallel`: Run host kernels across units via rayon
//! - `gpu`: Run kernels as wgpu compute shaders
//!
//! ## Modules
//!
//! - [`hierarchy`]: Layer stack, settling schedule and prediction head
//! - [`layer`]: One excitatory/inhibitory layer
//! - [`backend`]: Device abstraction and kernel dispatch descriptions
//! - [`host`]: CPU backend
//! - [`config`]: Geometry, parameters and config generation

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/tensor.rs"]
pub mod tensor;

#[path = "core/field.rs"]
pub mod field;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/rule.rs"]
pub mod rule;

#[path = "core/backend.rs"]
pub mod backend;

#[path = "core/host.rs"]
pub mod host;

#[cfg(feature = "gpu")]
#[path = "core/gpu.rs"]
pub mod gpu;

#[path = "core/layer.rs"]
pub mod layer;

#[path = "core/hierarchy.rs"]
pub mod hierarchy;

pub use error::{BackendError, Error, Result};

pub mod prelude {
    pub use crate::backend::{open_backend, ComputeBackend, ExecutionTier};
    pub use crate::config::{
        generate_configs_from_sizes, ActivationParams, InitParams, InputCoding, LayerConfig,
        LearnRates, NetworkConfig, Radii, SparsityTargets, StepParams, WeightRange,
    };
    pub use crate::error::{BackendError, Error, Result};
    pub use crate::hierarchy::Hierarchy;
    pub use crate::host::HostBackend;
    pub use crate::layer::{Layer, LayerStats};
    pub use crate::prng::Prng;
    pub use crate::rule::{LeakyRule, SpikingRule, UpdateRule};
    pub use crate::tensor::{DoubleBuffer, Extent, Shape, Tensor};
}
