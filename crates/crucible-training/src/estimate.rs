//! Conservative prepaid cost estimation.
//!
//! The estimate is charged in full before any GPU is rented, so it is biased
//! high on purpose: a per-family duration model, scaled for dataset size,
//! padded by a safety buffer, priced at the expected GPU-class rate plus the
//! platform margin, and rounded up to whole points.

use crate::error::{TrainingError, TrainingResult};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Duration model for one model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyProfile {
    /// Wall-clock hours per optimizer step on the family's GPU class.
    pub hours_per_step: f64,
    /// Dataset size (items) the step timing was measured on.
    #[serde(default)]
    pub baseline_dataset_size: u64,
    /// Extra duration per 100% of dataset size above the baseline.
    #[serde(default)]
    pub dataset_scale: f64,
    /// GPU class rented for this family; keys into `EstimatorConfig::gpu_rates`.
    pub gpu_class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub safety_buffer: f64,
    pub platform_margin: f64,
    pub points_per_usd: f64,
    /// Expected USD per hour for each GPU class.
    pub gpu_rates: BTreeMap<String, f64>,
    pub families: BTreeMap<String, FamilyProfile>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        let gpu_rates = BTreeMap::from([
            ("rtx3090".to_string(), 0.30),
            ("rtx4090".to_string(), 0.45),
            ("a100".to_string(), 1.40),
        ]);
        let families = BTreeMap::from([
            (
                "sd15-lora".to_string(),
                FamilyProfile {
                    hours_per_step: 0.000_3,
                    baseline_dataset_size: 30,
                    dataset_scale: 0.25,
                    gpu_class: "rtx3090".to_string(),
                },
            ),
            (
                "sdxl-lora".to_string(),
                FamilyProfile {
                    hours_per_step: 0.000_75,
                    baseline_dataset_size: 30,
                    dataset_scale: 0.25,
                    gpu_class: "rtx4090".to_string(),
                },
            ),
            (
                "flux-lora".to_string(),
                FamilyProfile {
                    hours_per_step: 0.001_2,
                    baseline_dataset_size: 30,
                    dataset_scale: 0.3,
                    gpu_class: "a100".to_string(),
                },
            ),
        ]);
        Self {
            safety_buffer: 1.5,
            platform_margin: 1.3,
            points_per_usd: 100.0,
            gpu_rates,
            families,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.safety_buffer.is_nan() || self.safety_buffer <= 1.0 {
            return Err(TrainingError::InvalidConfig("safety_buffer must be > 1.0".to_string()));
        }
        if self.platform_margin.is_nan() || self.platform_margin < 1.0 {
            return Err(TrainingError::InvalidConfig("platform_margin must be >= 1.0".to_string()));
        }
        if self.points_per_usd.is_nan() || self.points_per_usd <= 0.0 {
            return Err(TrainingError::InvalidConfig("points_per_usd must be > 0".to_string()));
        }
        for (name, profile) in &self.families {
            if profile.hours_per_step.is_nan() || profile.hours_per_step <= 0.0 {
                return Err(TrainingError::InvalidConfig(format!(
                    "family '{name}': hours_per_step must be > 0"
                )));
            }
            if profile.dataset_scale < 0.0 {
                return Err(TrainingError::InvalidConfig(format!(
                    "family '{name}': dataset_scale must be >= 0"
                )));
            }
            if !self.gpu_rates.contains_key(&profile.gpu_class) {
                return Err(TrainingError::UnknownGpuClass(profile.gpu_class.clone()));
            }
        }
        Ok(())
    }
}

/// Breakdown of a prepaid charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub model_family: String,
    pub gpu_class: String,
    /// Modelled duration without the safety buffer; drives the soft timeout.
    pub expected_hours: f64,
    /// Buffered duration the charge pays for.
    pub budget_hours: f64,
    pub expected_hourly_rate: f64,
    pub usd: f64,
    pub points: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CostEstimator {
    config: EstimatorConfig,
}

impl CostEstimator {
    #[must_use]
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn profile(&self, model_family: &str) -> TrainingResult<&FamilyProfile> {
        self.config
            .families
            .get(model_family)
            .ok_or_else(|| TrainingError::UnknownModelFamily(model_family.to_string()))
    }

    pub fn estimate(
        &self,
        model_family: &str,
        total_steps: u64,
        dataset_size: u64,
    ) -> TrainingResult<CostEstimate> {
        let profile = self.profile(model_family)?;
        let rate = *self
            .config
            .gpu_rates
            .get(&profile.gpu_class)
            .ok_or_else(|| TrainingError::UnknownGpuClass(profile.gpu_class.clone()))?;

        let expected_hours =
            profile.hours_per_step * total_steps as f64 * dataset_multiplier(profile, dataset_size);
        let budget_hours = expected_hours * self.config.safety_buffer;
        let usd = budget_hours * rate * self.config.platform_margin;
        let points = (usd * self.config.points_per_usd).ceil() as u64;

        Ok(CostEstimate {
            model_family: model_family.to_string(),
            gpu_class: profile.gpu_class.clone(),
            expected_hours,
            budget_hours,
            expected_hourly_rate: rate,
            usd,
            points,
        })
    }

    /// Rented hours a prepaid amount covers at an actual hourly rate.
    #[must_use]
    pub fn affordable_hours(&self, points: u64, hourly_rate: f64) -> f64 {
        let effective = hourly_rate * self.config.platform_margin;
        if effective <= 0.0 {
            return 0.0;
        }
        points as f64 / self.config.points_per_usd / effective
    }

    /// Points owed for actually rented time, without the safety buffer.
    #[must_use]
    pub fn actual_points(&self, rented: Duration, hourly_rate: f64) -> u64 {
        let hours = rented.num_milliseconds().max(0) as f64 / 3_600_000.0;
        let usd = hours * hourly_rate * self.config.platform_margin;
        (usd * self.config.points_per_usd).ceil() as u64
    }
}

fn dataset_multiplier(profile: &FamilyProfile, dataset_size: u64) -> f64 {
    if profile.baseline_dataset_size == 0 || dataset_size <= profile.baseline_dataset_size {
        return 1.0;
    }
    let excess = (dataset_size - profile.baseline_dataset_size) as f64;
    1.0 + profile.dataset_scale * excess / profile.baseline_dataset_size as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Binary-exact numbers so the point total is exact: 632 steps * 1/16 h
    /// = 39.5 h, doubled by the buffer = 79 h, at $2/h = $158 = 15,800 points.
    fn exact_config() -> EstimatorConfig {
        EstimatorConfig {
            safety_buffer: 2.0,
            platform_margin: 1.0,
            points_per_usd: 100.0,
            gpu_rates: BTreeMap::from([("a100".to_string(), 2.0)]),
            families: BTreeMap::from([(
                "flux-lora".to_string(),
                FamilyProfile {
                    hours_per_step: 0.0625,
                    baseline_dataset_size: 20,
                    dataset_scale: 0.5,
                    gpu_class: "a100".to_string(),
                },
            )]),
        }
    }

    #[test]
    fn test_estimate_pipeline() {
        let estimator = CostEstimator::new(exact_config());
        let estimate = estimator.estimate("flux-lora", 632, 20).unwrap();
        assert_eq!(estimate.expected_hours, 39.5);
        assert_eq!(estimate.budget_hours, 79.0);
        assert_eq!(estimate.points, 15_800);
    }

    #[test]
    fn test_dataset_above_baseline_scales_duration() {
        let estimator = CostEstimator::new(exact_config());
        let base = estimator.estimate("flux-lora", 632, 20).unwrap();
        let doubled = estimator.estimate("flux-lora", 632, 40).unwrap();
        // 100% over baseline at scale 0.5 => 1.5x duration
        assert_eq!(doubled.expected_hours, base.expected_hours * 1.5);
        assert!(doubled.points > base.points);
    }

    #[test]
    fn test_dataset_below_baseline_is_not_discounted() {
        let estimator = CostEstimator::new(exact_config());
        let base = estimator.estimate("flux-lora", 632, 20).unwrap();
        let small = estimator.estimate("flux-lora", 632, 3).unwrap();
        assert_eq!(base.points, small.points);
    }

    #[test]
    fn test_estimate_is_biased_above_expected_cost() {
        let estimator = CostEstimator::default();
        let estimate = estimator.estimate("sdxl-lora", 2000, 30).unwrap();
        let unbuffered = estimate.expected_hours * estimate.expected_hourly_rate * 1.3 * 100.0;
        assert!(estimate.points as f64 > unbuffered);
    }

    #[test]
    fn test_unknown_family_is_rejected() {
        let estimator = CostEstimator::default();
        assert!(matches!(
            estimator.estimate("gpt-9", 100, 10),
            Err(TrainingError::UnknownModelFamily(_))
        ));
    }

    #[test]
    fn test_affordable_hours_inverts_pricing() {
        let estimator = CostEstimator::new(exact_config());
        assert_eq!(estimator.affordable_hours(15_800, 2.0), 79.0);
        assert_eq!(estimator.affordable_hours(15_800, 0.0), 0.0);
    }

    #[test]
    fn test_actual_points_rounds_up() {
        let estimator = CostEstimator::new(exact_config());
        assert_eq!(estimator.actual_points(Duration::hours(1), 2.0), 200);
        assert_eq!(estimator.actual_points(Duration::seconds(1), 2.0), 1);
        assert_eq!(estimator.actual_points(Duration::zero(), 2.0), 0);
    }

    #[test]
    fn test_default_config_is_valid() {
        EstimatorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_buffer_must_exceed_one() {
        let config = EstimatorConfig { safety_buffer: 1.0, ..EstimatorConfig::default() };
        assert!(config.validate().is_err());
    }
}
