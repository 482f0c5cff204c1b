//! Compute backend abstraction.
//!
//! Layers and the hierarchy never touch tensor storage directly. They
//! describe each kernel launch as a [`Dispatch`] (one argument struct per
//! entry point, fields named by role) and hand it to a [`ComputeBackend`].
//! Backends reject a dispatch that binds one tensor as both input and
//! output, which keeps every kernel a pure function of its read set.

use tracing::warn;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::ActivationParams;
use crate::error::BackendError;
use crate::field::ReceptiveField;
use crate::host::HostBackend;
use crate::tensor::{Extent, Shape, Tensor};

/// Where kernels run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ExecutionTier {
    /// Host, one unit after another.
    #[default]
    Scalar,
    /// Host, units spread over the rayon pool (requires the `parallel` feature).
    Parallel,
    /// wgpu compute shaders (requires the `gpu` feature).
    Gpu,
}

impl ExecutionTier {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scalar" => Some(Self::Scalar),
            "parallel" => Some(Self::Parallel),
            "gpu" => Some(Self::Gpu),
            _ => None,
        }
    }
}

/// Named kernel entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelEntry {
    RandomFill,
    EActivate,
    IActivate,
    ELearn,
    ILearn,
    Predict,
    PredictionLearn,
    SumActivity,
    EncodeInput,
}

const ENTRY_COUNT: usize = 9;

impl KernelEntry {
    pub const ALL: [KernelEntry; ENTRY_COUNT] = [
        KernelEntry::RandomFill,
        KernelEntry::EActivate,
        KernelEntry::IActivate,
        KernelEntry::ELearn,
        KernelEntry::ILearn,
        KernelEntry::Predict,
        KernelEntry::PredictionLearn,
        KernelEntry::SumActivity,
        KernelEntry::EncodeInput,
    ];

    pub fn name(self) -> &'static str {
        match self {
            KernelEntry::RandomFill => "random_fill",
            KernelEntry::EActivate => "e_activate",
            KernelEntry::IActivate => "i_activate",
            KernelEntry::ELearn => "e_learn",
            KernelEntry::ILearn => "i_learn",
            KernelEntry::Predict => "predict",
            KernelEntry::PredictionLearn => "prediction_learn",
            KernelEntry::SumActivity => "sum_activity",
            KernelEntry::EncodeInput => "encode_input",
        }
    }
}

/// Opaque handle to a compiled entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHandle(pub u32);

/// Compiled entry points of one backend, fixed once the backend exists.
#[derive(Debug, Clone, Default)]
pub struct KernelTable {
    handles: [Option<KernelHandle>; ENTRY_COUNT],
}

impl KernelTable {
    pub fn insert(&mut self, entry: KernelEntry, handle: KernelHandle) {
        self.handles[entry as usize] = Some(handle);
    }

    pub fn get(&self, entry: KernelEntry) -> Result<KernelHandle, BackendError> {
        self.handles[entry as usize].ok_or(BackendError::MissingEntryPoint(entry.name()))
    }

    pub fn contains(&self, entry: KernelEntry) -> bool {
        self.handles[entry as usize].is_some()
    }
}

/// Device operations the simulation needs.
pub trait ComputeBackend {
    fn name(&self) -> &str;

    fn kernels(&self) -> &KernelTable;

    /// Allocates a zero-filled tensor.
    fn allocate(&mut self, shape: Shape) -> Result<Tensor, BackendError>;

    fn fill(&mut self, tensor: Tensor, value: f32) -> Result<(), BackendError>;

    fn copy(&mut self, src: Tensor, dst: Tensor) -> Result<(), BackendError>;

    fn upload(&mut self, data: &[f32], tensor: Tensor) -> Result<(), BackendError>;

    /// Blocks until the tensor contents are on the host.
    fn readback(&mut self, tensor: Tensor) -> Result<Vec<f32>, BackendError>;

    fn dispatch(&mut self, call: &Dispatch) -> Result<(), BackendError>;

    /// Allocates a tensor and uploads `data` into it.
    fn allocate_with(&mut self, shape: Shape, data: &[f32]) -> Result<Tensor, BackendError> {
        let tensor = self.allocate(shape)?;
        self.upload(data, tensor)?;
        Ok(tensor)
    }
}

/// Opens a backend for `tier`.
///
/// A GPU request without an adapter (or without the `gpu` feature) falls
/// back to the scalar host backend.
pub fn open_backend(tier: ExecutionTier, gpu_capacity: usize) -> Box<dyn ComputeBackend> {
    match tier {
        ExecutionTier::Scalar | ExecutionTier::Parallel => Box::new(HostBackend::new(tier)),
        ExecutionTier::Gpu => {
            #[cfg(feature = "gpu")]
            {
                match crate::gpu::GpuBackend::new(gpu_capacity) {
                    Ok(gpu) => return Box::new(gpu),
                    Err(e) => warn!("GPU backend unavailable ({e}); using scalar host backend"),
                }
            }
            #[cfg(not(feature = "gpu"))]
            {
                let _ = gpu_capacity;
                warn!("built without the `gpu` feature; using scalar host backend");
            }
            Box::new(HostBackend::new(ExecutionTier::Scalar))
        }
    }
}

/// Tensors of one neuron population touched by an activation pass.
#[derive(Debug, Clone, Copy)]
pub struct PopulationIo {
    pub activations_prev: Tensor,
    pub states_prev: Tensor,
    pub short_prev: Tensor,
    pub long_prev: Tensor,
    pub thresholds: Tensor,
    pub activations: Tensor,
    pub states: Tensor,
    pub short: Tensor,
    pub long: Tensor,
}

impl PopulationIo {
    fn reads(&self) -> [Tensor; 5] {
        [
            self.activations_prev,
            self.states_prev,
            self.short_prev,
            self.long_prev,
            self.thresholds,
        ]
    }

    fn writes(&self) -> [Tensor; 4] {
        [self.activations, self.states, self.short, self.long]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RandomFillArgs {
    pub tensor: Tensor,
    pub min: f32,
    pub max: f32,
    pub seed: [u32; 2],
    /// Separates tensors filled from the same seed.
    pub stream: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EActivateArgs {
    pub feed_forward: Tensor,
    pub i_states: Tensor,
    pub ff_weights: Tensor,
    pub fb_weights: Tensor,
    pub population: PopulationIo,
    pub ff_field: ReceptiveField,
    pub fb_field: ReceptiveField,
    pub params: ActivationParams,
}

#[derive(Debug, Clone, Copy)]
pub struct IActivateArgs {
    /// Excitatory states written earlier in the same step.
    pub e_states: Tensor,
    pub feed_back: Tensor,
    pub ff_weights: Tensor,
    pub lateral_weights: Tensor,
    pub fb_weights: Tensor,
    pub population: PopulationIo,
    pub ff_field: ReceptiveField,
    pub lateral_field: ReceptiveField,
    pub fb_field: ReceptiveField,
    pub params: ActivationParams,
}

#[derive(Debug, Clone, Copy)]
pub struct ELearnArgs {
    pub ff_short: Tensor,
    pub e_short: Tensor,
    pub e_long: Tensor,
    pub i_short: Tensor,
    pub ff_weights_prev: Tensor,
    pub fb_weights_prev: Tensor,
    pub thresholds_prev: Tensor,
    pub ff_weights: Tensor,
    pub fb_weights: Tensor,
    pub thresholds: Tensor,
    pub ff_field: ReceptiveField,
    pub fb_field: ReceptiveField,
    pub alpha: f32,
    pub beta: f32,
    pub delta: f32,
    pub sparsity: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct ILearnArgs {
    pub fb_short: Tensor,
    pub fb_long: Tensor,
    pub e_short: Tensor,
    pub i_short: Tensor,
    pub i_long: Tensor,
    pub ff_weights_prev: Tensor,
    pub lateral_weights_prev: Tensor,
    pub fb_weights_prev: Tensor,
    pub thresholds_prev: Tensor,
    pub ff_weights: Tensor,
    pub lateral_weights: Tensor,
    pub fb_weights: Tensor,
    pub thresholds: Tensor,
    pub ff_field: ReceptiveField,
    pub lateral_field: ReceptiveField,
    pub fb_field: ReceptiveField,
    pub alpha: f32,
    pub beta: f32,
    pub gamma: f32,
    pub delta: f32,
    pub sparsity: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct PredictArgs {
    pub e_activity: Tensor,
    pub i_activity: Tensor,
    pub e_weights: Tensor,
    pub i_weights: Tensor,
    pub prediction: Tensor,
    pub e_field: ReceptiveField,
    pub i_field: ReceptiveField,
}

#[derive(Debug, Clone, Copy)]
pub struct PredictionLearnArgs {
    pub e_source: Tensor,
    pub i_source: Tensor,
    pub truth: Tensor,
    pub prediction_prev: Tensor,
    pub e_weights_prev: Tensor,
    pub i_weights_prev: Tensor,
    pub e_weights: Tensor,
    pub i_weights: Tensor,
    pub e_field: ReceptiveField,
    pub i_field: ReceptiveField,
    pub alpha: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct SumActivityArgs {
    pub states: Tensor,
    pub sums_prev: Tensor,
    pub sums: Tensor,
    pub scale: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct EncodeInputArgs {
    pub input: Tensor,
    pub timers_prev: Tensor,
    pub history_prev: Tensor,
    pub timers: Tensor,
    pub spikes: Tensor,
    pub history: Tensor,
    pub history_rate: f32,
}

/// One kernel launch.
#[derive(Debug, Clone, Copy)]
pub enum Dispatch {
    RandomFill(RandomFillArgs),
    EActivate(EActivateArgs),
    IActivate(IActivateArgs),
    ELearn(ELearnArgs),
    ILearn(ILearnArgs),
    Predict(PredictArgs),
    PredictionLearn(PredictionLearnArgs),
    SumActivity(SumActivityArgs),
    EncodeInput(EncodeInputArgs),
}

impl Dispatch {
    pub fn entry(&self) -> KernelEntry {
        match self {
            Dispatch::RandomFill(_) => KernelEntry::RandomFill,
            Dispatch::EActivate(_) => KernelEntry::EActivate,
            Dispatch::IActivate(_) => KernelEntry::IActivate,
            Dispatch::ELearn(_) => KernelEntry::ELearn,
            Dispatch::ILearn(_) => KernelEntry::ILearn,
            Dispatch::Predict(_) => KernelEntry::Predict,
            Dispatch::PredictionLearn(_) => KernelEntry::PredictionLearn,
            Dispatch::SumActivity(_) => KernelEntry::SumActivity,
            Dispatch::EncodeInput(_) => KernelEntry::EncodeInput,
        }
    }

    /// Tensors the kernel reads.
    pub fn reads(&self) -> Vec<Tensor> {
        match self {
            Dispatch::RandomFill(_) => Vec::new(),
            Dispatch::EActivate(a) => {
                let mut v = vec![a.feed_forward, a.i_states, a.ff_weights, a.fb_weights];
                v.extend(a.population.reads());
                v
            }
            Dispatch::IActivate(a) => {
                let mut v = vec![
                    a.e_states,
                    a.feed_back,
                    a.ff_weights,
                    a.lateral_weights,
                    a.fb_weights,
                ];
                v.extend(a.population.reads());
                v
            }
            Dispatch::ELearn(a) => vec![
                a.ff_short,
                a.e_short,
                a.e_long,
                a.i_short,
                a.ff_weights_prev,
                a.fb_weights_prev,
                a.thresholds_prev,
            ],
            Dispatch::ILearn(a) => vec![
                a.fb_short,
                a.fb_long,
                a.e_short,
                a.i_short,
                a.i_long,
                a.ff_weights_prev,
                a.lateral_weights_prev,
                a.fb_weights_prev,
                a.thresholds_prev,
            ],
            Dispatch::Predict(a) => vec![a.e_activity, a.i_activity, a.e_weights, a.i_weights],
            Dispatch::PredictionLearn(a) => vec![
                a.e_source,
                a.i_source,
                a.truth,
                a.prediction_prev,
                a.e_weights_prev,
                a.i_weights_prev,
            ],
            Dispatch::SumActivity(a) => vec![a.states, a.sums_prev],
            Dispatch::EncodeInput(a) => vec![a.input, a.timers_prev, a.history_prev],
        }
    }

    /// Tensors the kernel writes.
    pub fn writes(&self) -> Vec<Tensor> {
        match self {
            Dispatch::RandomFill(a) => vec![a.tensor],
            Dispatch::EActivate(a) => a.population.writes().to_vec(),
            Dispatch::IActivate(a) => a.population.writes().to_vec(),
            Dispatch::ELearn(a) => vec![a.ff_weights, a.fb_weights, a.thresholds],
            Dispatch::ILearn(a) => vec![
                a.ff_weights,
                a.lateral_weights,
                a.fb_weights,
                a.thresholds,
            ],
            Dispatch::Predict(a) => vec![a.prediction],
            Dispatch::PredictionLearn(a) => vec![a.e_weights, a.i_weights],
            Dispatch::SumActivity(a) => vec![a.sums],
            Dispatch::EncodeInput(a) => vec![a.timers, a.spikes, a.history],
        }
    }

    /// Units the kernel runs over; one independent task each.
    pub fn extent(&self) -> Extent {
        match self {
            Dispatch::RandomFill(a) => a.tensor.extent(),
            Dispatch::EActivate(a) => a.population.states.extent(),
            Dispatch::IActivate(a) => a.population.states.extent(),
            Dispatch::ELearn(a) => a.thresholds.extent(),
            Dispatch::ILearn(a) => a.thresholds.extent(),
            Dispatch::Predict(a) => a.prediction.extent(),
            Dispatch::PredictionLearn(a) => a.e_weights.extent(),
            Dispatch::SumActivity(a) => a.sums.extent(),
            Dispatch::EncodeInput(a) => a.spikes.extent(),
        }
    }

    /// Fails if a written tensor is also read, or written twice.
    pub fn check_isolation(&self) -> Result<(), BackendError> {
        let reads = self.reads();
        let writes = self.writes();
        for (n, w) in writes.iter().enumerate() {
            let aliased =
                reads.iter().any(|r| r.id() == w.id()) || writes[..n].iter().any(|o| o.id() == w.id());
            if aliased {
                return Err(BackendError::Aliased {
                    entry: self.entry().name(),
                    tensor: w.id(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: u32) -> Tensor {
        Tensor::new(id, Extent::new(2, 2).field())
    }

    #[test]
    fn kernel_table_reports_missing_entries() {
        let mut table = KernelTable::default();
        table.insert(KernelEntry::Predict, KernelHandle(3));
        assert_eq!(table.get(KernelEntry::Predict).ok(), Some(KernelHandle(3)));
        match table.get(KernelEntry::ELearn) {
            Err(BackendError::MissingEntryPoint(name)) => assert_eq!(name, "e_learn"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn isolation_rejects_read_write_alias() {
        let call = Dispatch::SumActivity(SumActivityArgs {
            states: t(0),
            sums_prev: t(1),
            sums: t(1),
            scale: 1.0,
        });
        assert!(matches!(
            call.check_isolation(),
            Err(BackendError::Aliased { tensor: 1, .. })
        ));
    }

    #[test]
    fn isolation_rejects_duplicate_writes() {
        let call = Dispatch::EncodeInput(EncodeInputArgs {
            input: t(0),
            timers_prev: t(1),
            history_prev: t(2),
            timers: t(3),
            spikes: t(3),
            history: t(4),
            history_rate: 0.1,
        });
        assert!(call.check_isolation().is_err());
    }

    #[test]
    fn isolation_accepts_disjoint_sets() {
        let call = Dispatch::SumActivity(SumActivityArgs {
            states: t(0),
            sums_prev: t(1),
            sums: t(2),
            scale: 0.5,
        });
        assert!(call.check_isolation().is_ok());
        assert_eq!(call.extent(), Extent::new(2, 2));
    }

    #[test]
    fn tier_parses_cli_names() {
        assert_eq!(ExecutionTier::parse("parallel"), Some(ExecutionTier::Parallel));
        assert_eq!(ExecutionTier::parse("tpu"), None);
    }
}
