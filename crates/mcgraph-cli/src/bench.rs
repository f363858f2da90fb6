//! Longstaff-Schwartz Bermudan put benchmark.
//!
//! The graph is recorded once; every repetition re-initiates the same slot and version, so
//! only the inputs are resupplied and the compiled chain is reused.

use std::time::Instant;

use anyhow::{ensure, Context, Result};
use mcgraph::{ComputeContext, ComputeResult, DebugInfo, OpCode, Settings, VariableId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct BermudanPut {
    pub strike: f64,
    pub rate: f64,
    pub sigma: f64,
    pub maturity: f64,
    pub exercise_dates: usize,
}

impl BermudanPut {
    fn dt(&self) -> f64 {
        self.maturity / self.exercise_dates as f64
    }

    /// Scalar inputs in recording order.
    fn inputs(&self, spot: f64) -> [f64; 7] {
        let dt = self.dt();
        [
            spot,
            self.strike,
            (self.rate - 0.5 * self.sigma * self.sigma) * dt,
            self.sigma * dt.sqrt(),
            (-self.rate * dt).exp(),
            0.0,
            1.0,
        ]
    }

    /// Records the full pricing graph and returns the id of the price.
    pub fn record(&self, ctx: &mut ComputeContext, spot: f64) -> ComputeResult<VariableId> {
        let steps = self.exercise_dates;
        let mut ids = [0; 7];
        for (id, value) in ids.iter_mut().zip(self.inputs(spot)) {
            *id = ctx.create_input_variable(value)?;
        }
        let [s0, strike, drift, vol, discount, zero, one] = ids;
        let draws = ctx.create_input_variates(1, steps)?;

        let mut spots = Vec::with_capacity(steps);
        let mut s = s0;
        for draw in &draws[0] {
            let shock = ctx.apply_operation(OpCode::Mult, &[vol, *draw])?;
            let log_step = ctx.apply_operation(OpCode::Add, &[drift, shock])?;
            let growth = ctx.apply_operation(OpCode::Exp, &[log_step])?;
            s = ctx.apply_operation(OpCode::Mult, &[s, growth])?;
            spots.push(s);
        }

        let payoff = |ctx: &mut ComputeContext, at: VariableId| -> ComputeResult<VariableId> {
            let diff = ctx.apply_operation(OpCode::Subtract, &[strike, at])?;
            ctx.apply_operation(OpCode::Max, &[diff, zero])
        };

        let mut value = payoff(ctx, spots[steps - 1])?;
        for t in (0..steps - 1).rev() {
            value = ctx.apply_operation(OpCode::Mult, &[value, discount])?;
            let exercise = payoff(ctx, spots[t])?;
            let itm = ctx.apply_operation(OpCode::IndicatorGt, &[exercise, zero])?;
            let continuation =
                ctx.apply_operation(OpCode::ConditionalExpectation, &[value, itm, spots[t]])?;
            let better = ctx.apply_operation(OpCode::IndicatorGt, &[exercise, continuation])?;
            let take = ctx.apply_operation(OpCode::Mult, &[better, itm])?;
            let hold = ctx.apply_operation(OpCode::Subtract, &[one, take])?;
            let exercised = ctx.apply_operation(OpCode::Mult, &[take, exercise])?;
            let held = ctx.apply_operation(OpCode::Mult, &[hold, value])?;
            value = ctx.apply_operation(OpCode::Add, &[exercised, held])?;
        }
        value = ctx.apply_operation(OpCode::Mult, &[value, discount])?;
        ctx.apply_operation(OpCode::ConditionalExpectation, &[value, one])
    }

    /// Supplies the inputs of a cached recording.
    pub fn resupply(&self, ctx: &mut ComputeContext, spot: f64) -> ComputeResult<()> {
        for value in self.inputs(spot) {
            ctx.create_input_variable(value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub paths: usize,
    pub repeat: usize,
    pub spot: f64,
    pub seed: u64,
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize)]
pub struct Valuation {
    pub spot: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub device: String,
    pub paths: usize,
    pub exercise_dates: usize,
    pub wall_ms: f64,
    pub valuations: Vec<Valuation>,
    pub debug: DebugInfo,
}

pub fn run_bench(
    ctx: &mut ComputeContext,
    product: &BermudanPut,
    config: &BenchConfig,
) -> Result<BenchReport> {
    ensure!(product.exercise_dates > 0, "at least one exercise date is required");
    ctx.reset_debug_info();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let start = Instant::now();

    let (slot, is_new) = ctx
        .initiate_calculation(config.paths, 0, 0, config.settings)
        .context("initiate recording")?;
    debug!(slot, is_new, "recording Bermudan put");
    let price = product
        .record(ctx, config.spot)
        .context("record Bermudan put graph")?;
    ctx.declare_output_variable(price)
        .context("declare price output")?;
    let mut valuations = vec![Valuation {
        spot: config.spot,
        price: finalize_price(ctx)?,
    }];

    for _ in 0..config.repeat {
        let spot = config.spot * rng.gen_range(0.8..1.2);
        let (_, is_new) = ctx
            .initiate_calculation(config.paths, slot, 0, config.settings)
            .context("initiate cached calculation")?;
        ensure!(!is_new, "slot {slot} lost its compiled chain");
        product
            .resupply(ctx, spot)
            .context("resupply Bermudan put inputs")?;
        valuations.push(Valuation {
            spot,
            price: finalize_price(ctx)?,
        });
    }

    let report = BenchReport {
        device: ctx.device_info().identifier(),
        paths: config.paths,
        exercise_dates: product.exercise_dates,
        wall_ms: start.elapsed().as_secs_f64() * 1e3,
        valuations,
        debug: ctx.debug_info(),
    };
    ctx.dispose_calculation(slot)
        .context("dispose benchmark slot")?;
    info!(
        device = %report.device,
        runs = report.valuations.len(),
        wall_ms = report.wall_ms,
        "benchmark finished"
    );
    Ok(report)
}

fn finalize_price(ctx: &mut ComputeContext) -> Result<f64> {
    let outputs = ctx.finalize_to_vec().context("finalize calculation")?;
    outputs
        .first()
        .and_then(|values| values.first())
        .copied()
        .context("price output is empty")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mcgraph_backend_ref_cpu::RefCpuDevice;

    use super::*;

    fn product() -> BermudanPut {
        BermudanPut {
            strike: 100.0,
            rate: 0.03,
            sigma: 0.2,
            maturity: 1.0,
            exercise_dates: 4,
        }
    }

    #[test]
    fn bench_reuses_the_compiled_chain() {
        let mut ctx = ComputeContext::new(Arc::new(RefCpuDevice::new()));
        let config = BenchConfig {
            paths: 2048,
            repeat: 3,
            spot: 100.0,
            seed: 5,
            settings: Settings::default().with_debug(true),
        };
        let report = run_bench(&mut ctx, &product(), &config).unwrap();
        assert_eq!(report.valuations.len(), 4);
        assert_eq!(report.debug.number_of_program_builds, 1);
        assert_eq!(report.device, "RefCpu/DEFAULT/Host");
    }

    #[test]
    fn at_the_money_price_is_plausible() {
        let mut ctx = ComputeContext::new(Arc::new(RefCpuDevice::new()));
        let config = BenchConfig {
            paths: 4096,
            repeat: 0,
            spot: 100.0,
            seed: 0,
            settings: Settings::default().with_regression_order(2),
        };
        let report = run_bench(&mut ctx, &product(), &config).unwrap();
        let price = report.valuations[0].price;
        assert!((5.0..9.0).contains(&price), "price {price}");
    }

    #[test]
    fn deep_out_of_the_money_put_prices_zero() {
        let mut ctx = ComputeContext::new(Arc::new(RefCpuDevice::new()));
        let config = BenchConfig {
            paths: 1024,
            repeat: 1,
            spot: 400.0,
            seed: 0,
            settings: Settings::default(),
        };
        let report = run_bench(&mut ctx, &product(), &config).unwrap();
        assert_eq!(report.valuations[0].price, 0.0);
        assert_eq!(report.valuations.len(), 2);
    }

    #[test]
    fn report_serialises_debug_counters() {
        let report = BenchReport {
            device: "RefCpu/DEFAULT/Host".to_string(),
            paths: 1,
            exercise_dates: 1,
            wall_ms: 0.5,
            valuations: vec![Valuation {
                spot: 100.0,
                price: 4.0,
            }],
            debug: DebugInfo::default(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["debug"]["number_of_program_builds"], 0);
        assert_eq!(json["valuations"][0]["price"], 4.0);
    }
}
