//! `cost` estimates what a device's recent usage actually cost.
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Known device type tokens, matched case-insensitively as substrings of the
/// reported model name. Anything else prices as "generic".
const TYPE_TOKENS: [&str; 7] = ["a100", "v100", "t4", "rtx", "h100", "a10", "k80"];

/// Below this average utilization the idle reduction kicks in.
const IDLE_CUTOFF_PCT: f64 = 10.0;

/// A volume discount bracket: usage at or beyond `min_hours` gets the
/// multiplier. The highest applicable bracket wins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeBracket {
    pub min_hours: f64,
    pub multiplier: f64,
}

/// Pricing configuration.
///
/// Rate selection order for a device: per-device override, then the reserved
/// rate if the device is marked reserved, then the standard rate for its
/// normalized type, then the generic fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostModel {
    /// Standard hourly rates by normalized type
    pub standard_rates: HashMap<String, f64>,
    /// Discounted hourly rates for reserved capacity, by normalized type
    pub reserved_rates: HashMap<String, f64>,
    /// Hourly rate overrides by device id
    pub device_overrides: HashMap<String, f64>,
    /// Device ids billed at the reserved rate
    pub reserved_devices: HashSet<String>,
    /// Hourly rate when the type has no table entry
    pub generic_rate: f64,
    /// Multiplier for spot capacity, 1.0 when not applicable
    pub spot_discount: f64,
    /// Sorted ascending by `min_hours`
    pub volume_brackets: Vec<VolumeBracket>,
    pub tax_rate: f64,
    /// Lower bound on the utilization factor
    pub utilization_floor: f64,
    /// Extra multiplier applied below the idle cutoff
    pub idle_factor: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        let standard_rates = [
            ("a100", 3.06),
            ("v100", 2.48),
            ("t4", 0.53),
            ("rtx", 1.20),
            ("h100", 4.76),
            ("a10", 1.10),
            ("k80", 0.45),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        CostModel {
            standard_rates,
            reserved_rates: HashMap::new(),
            device_overrides: HashMap::new(),
            reserved_devices: HashSet::new(),
            generic_rate: 1.00,
            spot_discount: 1.0,
            volume_brackets: vec![
                VolumeBracket {
                    min_hours: 100.0,
                    multiplier: 0.95,
                },
                VolumeBracket {
                    min_hours: 500.0,
                    multiplier: 0.90,
                },
                VolumeBracket {
                    min_hours: 2000.0,
                    multiplier: 0.85,
                },
            ],
            tax_rate: 0.0,
            utilization_floor: 0.30,
            idle_factor: 0.50,
        }
    }
}

/// The result of pricing one device over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub device_id: String,
    /// Normalized type the rate was selected by
    pub device_type: String,
    pub cost_per_hour: f64,
    pub uptime_hours: f64,
    pub utilization_factor: f64,
    /// Cost after utilization scaling and spot discount
    pub actual_cost: f64,
    /// After the volume bracket
    pub discounted_cost: f64,
    /// After tax
    pub total_cost: f64,
}

impl CostModel {
    /// Normalize a reported model name to a pricing type token.
    pub fn normalize_type(name: &str) -> &'static str {
        let lower = name.to_lowercase();
        for token in TYPE_TOKENS {
            if lower.contains(token) {
                return token;
            }
        }
        "generic"
    }

    /// Hourly rate for a device, honoring the selection order.
    pub fn cost_per_hour(&self, device_id: &str, device_name: &str) -> f64 {
        if let Some(rate) = self.device_overrides.get(device_id) {
            return *rate;
        }
        let normalized = Self::normalize_type(device_name);
        if self.reserved_devices.contains(device_id) {
            if let Some(rate) = self.reserved_rates.get(normalized) {
                return *rate;
            }
        }
        self.standard_rates
            .get(normalized)
            .copied()
            .unwrap_or(self.generic_rate)
    }

    /// Piecewise-linear utilization scaling, bounded below by the floor.
    pub fn utilization_factor(&self, average_utilization_pct: f64) -> f64 {
        (average_utilization_pct / 100.0).clamp(0.0, 1.0).max(self.utilization_floor)
    }

    fn volume_multiplier(&self, uptime_hours: f64) -> f64 {
        self.volume_brackets
            .iter()
            .filter(|b| uptime_hours >= b.min_hours)
            .map(|b| b.multiplier)
            .last()
            .unwrap_or(1.0)
    }

    /// Price one device's usage over a window.
    pub fn estimate(
        &self,
        device_id: &str,
        device_name: &str,
        average_utilization_pct: f64,
        uptime_hours: f64,
    ) -> CostEstimate {
        let cost_per_hour = self.cost_per_hour(device_id, device_name);
        let utilization_factor = self.utilization_factor(average_utilization_pct);

        let mut actual_cost =
            cost_per_hour * uptime_hours * utilization_factor * self.spot_discount;
        if average_utilization_pct < IDLE_CUTOFF_PCT {
            actual_cost *= self.idle_factor;
        }

        let discounted_cost = actual_cost * self.volume_multiplier(uptime_hours);
        let total_cost = discounted_cost * (1.0 + self.tax_rate);

        CostEstimate {
            device_id: device_id.to_string(),
            device_type: Self::normalize_type(device_name).to_string(),
            cost_per_hour,
            uptime_hours,
            utilization_factor,
            actual_cost,
            discounted_cost,
            total_cost,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize_type() {
        assert_eq!(CostModel::normalize_type("NVIDIA A100-SXM4-40GB"), "a100");
        assert_eq!(CostModel::normalize_type("Tesla V100-PCIE-16GB"), "v100");
        assert_eq!(CostModel::normalize_type("GeForce RTX 4090"), "rtx");
        assert_eq!(CostModel::normalize_type("Radeon Pro W6800"), "generic");
    }

    #[test]
    fn test_a10_does_not_shadow_a100() {
        // Token order matters: an A100 name contains "a10" too, so "a100"
        // must be tried first.
        assert_eq!(CostModel::normalize_type("NVIDIA A100"), "a100");
        assert_eq!(CostModel::normalize_type("NVIDIA A10G"), "a10");
    }

    #[test]
    fn test_rate_selection_order() {
        let mut model = CostModel::default();
        model.reserved_rates.insert("a100".to_string(), 2.00);
        model.reserved_devices.insert("node-a/0".to_string());
        model.device_overrides.insert("node-a/1".to_string(), 9.99);

        // Override beats everything.
        assert_eq!(model.cost_per_hour("node-a/1", "NVIDIA A100"), 9.99);
        // Reserved beats standard.
        assert_eq!(model.cost_per_hour("node-a/0", "NVIDIA A100"), 2.00);
        // Standard by type.
        assert_eq!(model.cost_per_hour("node-b/0", "NVIDIA A100"), 3.06);
        // Generic fallback.
        assert_eq!(model.cost_per_hour("node-b/1", "Mystery Card"), 1.00);
    }

    #[test]
    fn test_utilization_factor_floor() {
        let model = CostModel::default();
        assert_eq!(model.utilization_factor(80.0), 0.80);
        assert_eq!(model.utilization_factor(5.0), 0.30);
        assert_eq!(model.utilization_factor(0.0), 0.30);
        assert_eq!(model.utilization_factor(150.0), 1.0);
    }

    #[test]
    fn test_idle_reduction_applies_below_cutoff() {
        let model = CostModel::default();
        let idle = model.estimate("d", "NVIDIA A100", 5.0, 10.0);
        let busy = model.estimate("d", "NVIDIA A100", 50.0, 10.0);
        // Idle: rate * hours * floor * idle_factor.
        assert!((idle.actual_cost - 3.06 * 10.0 * 0.30 * 0.50).abs() < 1e-9);
        assert!((busy.actual_cost - 3.06 * 10.0 * 0.50).abs() < 1e-9);
    }

    #[test]
    fn test_volume_discount_picks_highest_bracket() {
        let model = CostModel::default();
        let short = model.estimate("d", "NVIDIA T4", 50.0, 50.0);
        assert!((short.discounted_cost - short.actual_cost).abs() < 1e-9);

        let long = model.estimate("d", "NVIDIA T4", 50.0, 600.0);
        assert!((long.discounted_cost - long.actual_cost * 0.90).abs() < 1e-9);

        let huge = model.estimate("d", "NVIDIA T4", 50.0, 5000.0);
        assert!((huge.discounted_cost - huge.actual_cost * 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_tax_applied_last() {
        let mut model = CostModel::default();
        model.tax_rate = 0.20;
        let estimate = model.estimate("d", "NVIDIA A100", 100.0, 10.0);
        assert!((estimate.total_cost - estimate.discounted_cost * 1.20).abs() < 1e-9);
    }

    #[test]
    fn test_spot_discount() {
        let mut model = CostModel::default();
        model.spot_discount = 0.70;
        let estimate = model.estimate("d", "NVIDIA A100", 100.0, 10.0);
        assert!((estimate.actual_cost - 3.06 * 10.0 * 1.0 * 0.70).abs() < 1e-9);
    }
}
