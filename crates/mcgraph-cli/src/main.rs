mod bench;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use mcgraph::{ComputeFramework, Settings};
use tracing_subscriber::EnvFilter;

use crate::bench::{run_bench, BenchConfig, BermudanPut};

#[derive(Parser)]
#[command(name = "mcgraph", about = "mcgraph device and benchmark driver", version)]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the devices every registered backend exposes
    Devices,
    /// Price a Bermudan put repeatedly on one device and print timings as JSON
    Bench {
        /// Device identifier as printed by `devices`
        #[arg(long, default_value = "RefCpu/DEFAULT/Host")]
        device: String,
        #[arg(long, default_value_t = 10_000)]
        paths: usize,
        /// Exercise dates, one variate draw each
        #[arg(long, default_value_t = 12)]
        steps: usize,
        /// Re-finalisations with fresh spots after the first build
        #[arg(long, default_value_t = 10)]
        repeat: usize,
        #[arg(long, default_value_t = 100.0)]
        spot: f64,
        #[arg(long, default_value_t = 100.0)]
        strike: f64,
        #[arg(long, default_value_t = 0.2)]
        sigma: f64,
        #[arg(long, default_value_t = 0.03)]
        rate: f64,
        #[arg(long, default_value_t = 1.0)]
        maturity: f64,
        /// Seed for the spot perturbations between repetitions
        #[arg(long, default_value_t = 7)]
        seed: u64,
        /// Evaluate path values in single precision
        #[arg(long)]
        single: bool,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    mcgraph_backend_ref_cpu::register_ref_cpu_device();
    mcgraph_backend_c::register_c_device();
    let framework = ComputeFramework::new();

    match cli.command {
        Command::Devices => {
            for name in framework.available_devices() {
                println!("{name}");
            }
        }
        Command::Bench {
            device,
            paths,
            steps,
            repeat,
            spot,
            strike,
            sigma,
            rate,
            maturity,
            seed,
            single,
        } => {
            let product = BermudanPut {
                strike,
                rate,
                sigma,
                maturity,
                exercise_dates: steps,
            };
            let mut settings = Settings::from_env().with_debug(true);
            if single {
                settings.use_double_precision = false;
            }
            let config = BenchConfig {
                paths,
                repeat,
                spot,
                seed,
                settings,
            };
            let context = framework.context(&device)?;
            let mut ctx = context
                .lock()
                .map_err(|_| anyhow!("context for {device} is poisoned"))?;
            let report = run_bench(&mut ctx, &product, &config)
                .with_context(|| format!("benchmark on {device}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
