//! Estimate command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use crucible_core::CrucibleConfig;
use crucible_training::{CostEstimate, CostEstimator};

pub fn execute(
    config: &CrucibleConfig,
    family: &str,
    steps: u64,
    dataset_size: u64,
    json_output: bool,
) -> Result<()> {
    let estimator = CostEstimator::new(config.estimator.clone());
    let estimate = estimator
        .estimate(family, steps, dataset_size)
        .with_context(|| format!("Cannot estimate {family}"))?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&estimate)?);
    } else {
        print_estimate(&estimate);
    }
    Ok(())
}

pub fn print_estimate(estimate: &CostEstimate) {
    println!("{}", "Cost Estimate".bold().cyan());
    println!("  Family:        {}", estimate.model_family);
    println!("  GPU class:     {} at ${:.2}/h", estimate.gpu_class, estimate.expected_hourly_rate);
    println!("  Expected time: {:.2} h", estimate.expected_hours);
    println!("  Budgeted time: {:.2} h", estimate.budget_hours);
    println!("  Charge:        {} points (${:.2})", estimate.points.to_string().green(), estimate.usd);
}
