use heinet::prelude::*;
use tracing::{info, warn};

/// Floats reserved on the device when running with `--tier gpu`.
const GPU_ARENA_FLOATS: usize = 16 << 20;

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

struct Options {
    config: Option<String>,
    tier: Option<ExecutionTier>,
    steps: Option<usize>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1).peekable();
    let command = match args.peek() {
        Some(a) if !a.starts_with("--") => args.next(),
        _ => None,
    };

    let mut opts = Options {
        config: None,
        tier: None,
        steps: None,
    };
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--help" | "-h" => {
                print_help();
                return;
            }
            "--config" => opts.config = Some(value(&mut args, "--config")),
            "--tier" => {
                let raw = value(&mut args, "--tier");
                match ExecutionTier::parse(&raw) {
                    Some(t) => opts.tier = Some(t),
                    None => fail(&format!("Unknown tier: {raw}")),
                }
            }
            "--steps" => {
                let raw = value(&mut args, "--steps");
                match raw.parse() {
                    Ok(n) => opts.steps = Some(n),
                    Err(_) => fail(&format!("Invalid step count: {raw}")),
                }
            }
            other => fail(&format!("Unknown option: {other}")),
        }
    }

    let result = match command.as_deref() {
        None | Some("prediction") => run_prediction(&opts),
        Some("sparsity") => run_sparsity(&opts),
        Some("help") => {
            print_help();
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn print_help() {
    println!("heinet (hierarchical E/I sparse coding)");
    println!("usage:");
    println!("  heinet [prediction] [options]   learn to forecast an 8-step sequence");
    println!("  heinet sparsity [options]       zero-input homeostasis run");
    println!("options:");
    println!("  --config <file.json>            network configuration");
    println!("  --tier scalar|parallel|gpu      execution tier");
    println!("  --steps <n>                     training cycles");
    println!("  --help");
}

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> String {
    match args.next() {
        Some(v) => v,
        None => fail(&format!("{flag} needs a value")),
    }
}

fn fail(msg: &str) -> ! {
    eprintln!("{msg}");
    print_help();
    std::process::exit(2);
}

fn load_config(opts: &Options) -> Result<NetworkConfig> {
    let mut config = match &opts.config {
        Some(path) => NetworkConfig::load(path)?,
        None => NetworkConfig::default(),
    };
    if let Some(tier) = opts.tier {
        config = config.with_execution_tier(tier);
    }
    config.validate()?;
    Ok(config)
}

/// Zero mean, unit variance over the four inputs.
fn normalized(frame: &[f32; 4]) -> [f32; 4] {
    let mean = frame.iter().sum::<f32>() / frame.len() as f32;
    let variance = frame.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / frame.len() as f32;
    let inv = if variance > 0.0 { 1.0 / variance.sqrt() } else { 0.0 };
    frame.map(|v| (v - mean) * inv)
}

fn signs(values: &[f32]) -> String {
    values.iter().map(|v| if *v > 0.0 { '+' } else { '-' }).collect()
}

fn run_prediction(opts: &Options) -> Result<()> {
    let config = load_config(opts)?;
    if config.input.area() != 4 {
        warn!(input = %config.input, "prediction demo feeds 4 inputs; overriding input extent");
    }
    let config = NetworkConfig {
        input: Extent::new(2, 2),
        ..config
    };
    let steps = opts.steps.unwrap_or(8 * 400);

    let mut backend = open_backend(config.execution_tier, GPU_ARENA_FLOATS);
    info!(backend = backend.name(), steps, "prediction demo");
    let backend = backend.as_mut();

    let mut net = Hierarchy::from_config(&config, backend)?;
    let neutral = Hierarchy::allocate_neutral(backend)?;
    let frames = SEQUENCE
        .iter()
        .map(|f| backend.allocate_with(config.input.field(), &normalized(f)))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let params = config.step_params();

    let mut hits = 0usize;
    for t in 0..steps {
        let s = t % SEQUENCE.len();
        let truth = normalized(&SEQUENCE[s]);
        let forecast = net.read_prediction(backend)?;
        let correct = signs(&forecast) == signs(&truth);
        if correct {
            hits += 1;
        }

        net.step(backend, frames[s], neutral, &params)?;

        let last_round = steps.saturating_sub(SEQUENCE.len());
        if t >= last_round {
            if t == last_round {
                println!("sequence:");
            }
            println!(
                "  {s}: input {} forecast {} {}",
                signs(&truth),
                signs(&forecast),
                if correct { "ok" } else { "miss" }
            );
        }
    }

    info!(
        accuracy = hits as f32 / steps.max(1) as f32,
        "prediction demo finished"
    );
    Ok(())
}

fn run_sparsity(opts: &Options) -> Result<()> {
    let config = load_config(opts)?;
    let steps = opts.steps.unwrap_or(50);

    let mut backend = open_backend(config.execution_tier, GPU_ARENA_FLOATS);
    info!(backend = backend.name(), steps, "sparsity demo");
    let backend = backend.as_mut();

    let mut net = Hierarchy::from_config(&config, backend)?;
    let neutral = Hierarchy::allocate_neutral(backend)?;
    let input = backend.allocate(config.input.field())?;
    let params = config.step_params();

    for t in 0..steps {
        net.update(backend, input, neutral, &params.activation, params.iterations)?;
        net.learn(backend, input, neutral, &params.learn, &params.sparsity)?;
        net.step_end();
        if t % 10 == 0 {
            let stats = net.stats(backend)?;
            info!(
                t,
                e_long = stats[0].e.mean_long_average,
                e_threshold = stats[0].e.mean_threshold,
                "homeostasis"
            );
        }
    }

    for (l, layer) in net.layers().iter().enumerate() {
        let long = backend.readback(layer.e().long_averages.previous())?;
        let worst = long
            .iter()
            .map(|v| (v - params.sparsity.e).abs())
            .fold(0.0f32, f32::max);
        println!(
            "layer {l}: target {:.3} mean {:.4} max error {:.4}",
            params.sparsity.e,
            long.iter().sum::<f32>() / long.len().max(1) as f32,
            worst
        );
    }
    Ok(())
}
