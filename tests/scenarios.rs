//! End-to-end runs of the hierarchy on the host backend.

use std::sync::Arc;

use heinet::prelude::*;

const SEQUENCE: [[f32; 4]; 8] = [
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
    [0.0, 0.0, 0.0, 1.0],
    [0.0, 1.0, 0.0, 0.0],
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [1.0, 0.0, 0.0, 0.0],
];

fn normalized(frame: &[f32; 4]) -> Vec<f32> {
    let mean = frame.iter().sum::<f32>() / 4.0;
    let var = frame.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
    frame.iter().map(|v| (v - mean) / var.sqrt()).collect()
}

fn sparsity_config() -> NetworkConfig {
    let mut config = NetworkConfig::default().with_seed(2024);
    config.init.sparsity = SparsityTargets { e: 0.02, i: 0.02 };
    config.iterations = 1;
    config.activation = ActivationParams::for_iterations(1);
    config
}

#[test]
fn zero_input_holds_long_averages_at_target() {
    let config = sparsity_config();
    let mut backend = HostBackend::new(ExecutionTier::Scalar);
    let mut net = Hierarchy::from_config(&config, &mut backend).unwrap();
    let input = backend.allocate(config.input.field()).unwrap();
    let neutral = Hierarchy::allocate_neutral(&mut backend).unwrap();
    let params = config.step_params();

    for _ in 0..50 {
        net.update(&mut backend, input, neutral, &params.activation, params.iterations)
            .unwrap();
        net.learn(&mut backend, input, neutral, &params.learn, &params.sparsity)
            .unwrap();
        net.step_end();
    }

    let layer = &net.layers()[0];
    assert_eq!(layer.e().extent(), Extent::new(8, 8));
    let long = backend.readback(layer.e().long_averages.previous()).unwrap();
    assert_eq!(long.len(), 64);
    for (u, v) in long.iter().enumerate() {
        assert!((v - 0.02).abs() <= 0.005, "unit {u}: long average {v}");
    }

    // Units firing below target lower their thresholds every example.
    let initial = config.init.e_threshold;
    let thresholds = backend.readback(layer.e().thresholds.previous()).unwrap();
    for (u, t) in thresholds.iter().enumerate() {
        assert!(*t < initial && *t > 0.0, "unit {u}: threshold {t}");
    }
    let stats = net.stats(&mut backend).unwrap();
    assert!(stats[0].e.mean_threshold < initial);
    assert!(stats[0].e.mean_long_average < 0.02);
}

/// Forecast sign tables of the last `keep` repetitions, one string per
/// sequence index, plus the raw forecasts of the final repetition.
fn sign_tables(seed: u64, repetitions: usize, keep: usize) -> (Vec<Vec<String>>, Vec<Vec<f32>>) {
    let config = NetworkConfig::default().with_seed(seed);
    let mut backend = HostBackend::new(ExecutionTier::Scalar);
    let mut net = Hierarchy::from_config(&config, &mut backend).unwrap();
    let neutral = Hierarchy::allocate_neutral(&mut backend).unwrap();
    let frames: Vec<Tensor> = SEQUENCE
        .iter()
        .map(|f| {
            backend
                .allocate_with(config.input.field(), &normalized(f))
                .unwrap()
        })
        .collect();
    let params = config.step_params();

    let mut tables = Vec::new();
    let mut forecasts = Vec::new();
    for rep in 0..repetitions {
        let recording = rep + keep >= repetitions;
        let mut table: Vec<String> = Vec::new();
        for frame in &frames {
            net.step(&mut backend, *frame, neutral, &params).unwrap();
            if recording {
                let forecast = net.read_prediction(&mut backend).unwrap();
                table.push(forecast.iter().map(|p| if *p > 0.0 { '+' } else { '-' }).collect());
                if rep + 1 == repetitions {
                    forecasts.push(forecast);
                }
            }
        }
        if recording {
            tables.push(table);
        }
    }
    (tables, forecasts)
}

#[test]
fn sequence_forecasts_are_deterministic() {
    let (first, first_values) = sign_tables(11, 6, 1);
    let (second, second_values) = sign_tables(11, 6, 1);
    assert_eq!(first[0].len(), SEQUENCE.len());
    assert_eq!(first, second);
    assert_eq!(first_values, second_values);
    for forecast in &first_values {
        assert!(forecast.iter().all(|p| p.is_finite() && p.abs() < 10.0), "{forecast:?}");
    }
}

#[test]
fn sequence_forecast_signs_settle() {
    let (tables, _) = sign_tables(11, 220, 2);
    assert_eq!(tables.len(), 2);
    assert_eq!(tables[0].len(), SEQUENCE.len());
    assert_eq!(tables[0], tables[1], "sign table still changing between repetitions");
}

#[test]
fn prediction_head_learns_on_the_sequence() {
    let mut config = NetworkConfig::default().with_seed(5);
    // Low thresholds so the bottom layer fires from the first example on.
    config.init.e_threshold = 1e-4;
    config.init.i_threshold = 1e-4;
    let mut backend = HostBackend::new(ExecutionTier::Scalar);
    let mut net = Hierarchy::from_config(&config, &mut backend).unwrap();
    let neutral = Hierarchy::allocate_neutral(&mut backend).unwrap();
    let (from_e, _) = net.prediction_weights();
    let initial = backend.readback(from_e.previous()).unwrap();
    let params = config.step_params();

    for frame in SEQUENCE.iter().cycle().take(16) {
        let input = backend
            .allocate_with(config.input.field(), &normalized(frame))
            .unwrap();
        net.step(&mut backend, input, neutral, &params).unwrap();
    }

    let (from_e, _) = net.prediction_weights();
    let learned = backend.readback(from_e.previous()).unwrap();
    assert_eq!(initial.len(), learned.len());
    assert_ne!(initial, learned);
}

#[test]
fn same_seed_gives_identical_initial_weights() {
    let config = generate_configs_from_sizes(
        Extent::new(4, 4),
        &[Extent::new(8, 8)],
        &[Extent::new(4, 4)],
    )
    .unwrap()[0];
    let init = InitParams::default();

    let mut a = HostBackend::new(ExecutionTier::Scalar);
    let mut b = HostBackend::new(ExecutionTier::Scalar);
    let first = Layer::create_random(&config, &init, &mut a, &mut Prng::new(99)).unwrap();
    let second = Layer::create_random(&config, &init, &mut b, &mut Prng::new(99)).unwrap();

    for (wa, wb) in first.weights().iter().zip(second.weights().iter()) {
        let va = a.readback(wa.current()).unwrap();
        let vb = b.readback(wb.current()).unwrap();
        assert_eq!(va.len(), vb.len());
        let bits_a: Vec<u32> = va.iter().map(|v| v.to_bits()).collect();
        let bits_b: Vec<u32> = vb.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits_a, bits_b);
    }

    let third = Layer::create_random(&config, &init, &mut a, &mut Prng::new(100)).unwrap();
    let w1 = a.readback(first.e_feed_forward_weights().current()).unwrap();
    let w3 = a.readback(third.e_feed_forward_weights().current()).unwrap();
    assert_ne!(w1, w3);
}

#[test]
fn example_begin_then_sim_end_leaves_zero_short_averages() {
    let config =
        generate_configs_from_sizes(Extent::new(2, 2), &[Extent::new(4, 4)], &[Extent::new(2, 2)])
            .unwrap()[0];
    let mut backend = HostBackend::new(ExecutionTier::Scalar);
    let mut rng = Prng::new(3);
    let mut layer =
        Layer::create_random(&config, &InitParams::default(), &mut backend, &mut rng).unwrap();
    backend.fill(layer.e().short_averages.current(), 0.7).unwrap();
    backend.fill(layer.i().short_averages.previous(), 0.4).unwrap();

    layer.ex_step_begin(&mut backend).unwrap();
    layer.sim_step_end();

    for pop in [layer.e(), layer.i()] {
        for t in [pop.short_averages.current(), pop.short_averages.previous()] {
            assert!(backend.readback(t).unwrap().iter().all(|v| *v == 0.0));
        }
    }
}

#[test]
fn leaky_rule_runs_end_to_end() {
    let config = NetworkConfig::default()
        .with_seed(8)
        .with_layers(
            vec![Extent::new(8, 8), Extent::new(4, 4)],
            vec![Extent::new(4, 4), Extent::new(2, 2)],
        );
    let mut backend = HostBackend::with_rule(ExecutionTier::Scalar, Arc::new(LeakyRule));
    assert_eq!(backend.rule().name(), "leaky");
    let mut net = Hierarchy::from_config(&config, &mut backend).unwrap();
    let input = backend
        .allocate_with(config.input.field(), &[1.5, -0.5, -0.5, -0.5])
        .unwrap();
    let neutral = Hierarchy::allocate_neutral(&mut backend).unwrap();
    let params = config.step_params();

    for _ in 0..4 {
        net.step(&mut backend, input, neutral, &params).unwrap();
    }

    for layer in net.layers() {
        let states = backend.readback(layer.e().states.previous()).unwrap();
        assert!(states.iter().all(|s| s.is_finite() && *s >= 0.0));
    }
    let forecast = net.read_prediction(&mut backend).unwrap();
    assert!(forecast.iter().all(|p| p.is_finite()));
}

#[test]
fn mismatched_layer_lists_are_rejected() {
    let err = generate_configs_from_sizes(
        Extent::new(2, 2),
        &[Extent::new(8, 8), Extent::new(4, 4)],
        &[Extent::new(4, 4)],
    )
    .unwrap_err();
    assert!(matches!(err, Error::LayerCountMismatch { e_layers: 2, i_layers: 1 }));
}

#[cfg(feature = "serde")]
#[test]
fn json_config_fills_in_defaults() {
    let config = NetworkConfig::from_json_str(
        r#"{
            "seed": 7,
            "iterations": 10,
            "e_sizes": [{ "width": 6, "height": 6 }],
            "i_sizes": [{ "width": 3, "height": 3 }],
            "execution_tier": "parallel"
        }"#,
    )
    .unwrap();
    assert_eq!(config.seed, 7);
    assert_eq!(config.iterations, 10);
    assert_eq!(config.e_sizes, vec![Extent::new(6, 6)]);
    assert_eq!(config.execution_tier, ExecutionTier::Parallel);
    assert_eq!(config.input, NetworkConfig::default().input);

    let err = NetworkConfig::from_json_str(r#"{ "prediction_alpha": -1.0 }"#).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}
