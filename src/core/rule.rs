//! Per-unit update formulas.
//!
//! Kernels handle windowing and bookkeeping; the arithmetic applied to each
//! unit and each weight goes through an [`UpdateRule`]. The host backend
//! takes any rule. The GPU backend compiles [`SpikingRule`] into its shaders.

use std::fmt;

/// Result of integrating one unit for one settling iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Integrated {
    pub activation: f32,
    pub state: f32,
}

pub trait UpdateRule: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Folds `drive` into the membrane and decides the output state.
    fn integrate(&self, activation: f32, drive: f32, threshold: f32, eta: f32) -> Integrated;

    /// Box-car accumulation, cleared at the start of every example.
    #[inline]
    fn short_average(&self, short: f32, state: f32, rate_inv: f32) -> f32 {
        short + rate_inv * state
    }

    #[inline]
    fn long_average(&self, long: f32, state: f32, decay: f32) -> f32 {
        (1.0 - decay) * long + decay * state
    }

    /// Oja's rule; keeps excitatory receptive fields bounded.
    #[inline]
    fn feed_forward_weight(&self, weight: f32, pre: f32, post: f32, alpha: f32) -> f32 {
        weight + alpha * post * (pre - post * weight)
    }

    /// Inhibition grows while the target unit fires above `target`.
    #[inline]
    fn inhibitory_weight(&self, weight: f32, pre: f32, post: f32, target: f32, beta: f32) -> f32 {
        (weight + beta * pre * (post - target)).max(0.0)
    }

    /// Correlates the unit with deviations of top-down context from its mean.
    #[inline]
    fn feed_back_weight(
        &self,
        weight: f32,
        post: f32,
        pre_short: f32,
        pre_long: f32,
        gamma: f32,
    ) -> f32 {
        weight + gamma * post * (pre_short - pre_long)
    }

    /// Homeostasis: raise the threshold of units firing above target.
    #[inline]
    fn threshold(&self, threshold: f32, long: f32, target: f32, delta: f32) -> f32 {
        threshold + delta * (long - target)
    }
}

/// Leaky integrate-and-fire with reset. Binary states.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpikingRule;

impl UpdateRule for SpikingRule {
    fn name(&self) -> &'static str {
        "spiking"
    }

    #[inline]
    fn integrate(&self, activation: f32, drive: f32, threshold: f32, eta: f32) -> Integrated {
        let a = (1.0 - eta) * activation + eta * drive;
        if a > threshold {
            Integrated {
                activation: 0.0,
                state: 1.0,
            }
        } else {
            Integrated {
                activation: a,
                state: 0.0,
            }
        }
    }
}

/// Leaky integrator with a rectified, graded output and no reset.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeakyRule;

impl UpdateRule for LeakyRule {
    fn name(&self) -> &'static str {
        "leaky"
    }

    #[inline]
    fn integrate(&self, activation: f32, drive: f32, threshold: f32, eta: f32) -> Integrated {
        let a = (1.0 - eta) * activation + eta * drive;
        Integrated {
            activation: a,
            state: (a - threshold).max(0.0),
        }
    }
}
