//! Feature assembly: one reading plus its rolling RPM statistics become the
//! nine-value vector the classifier was trained on.
//!
//! The order of [`FEATURE_NAMES`] is shared with the scoring artifacts. Any
//! change here needs a new artifact version.

use serde::{Deserialize, Serialize};

use crate::store::RollingStats;
use crate::types::Reading;

pub const FEATURE_DIM: usize = 9;

/// Canonical input order of the classifier.
pub const FEATURE_NAMES: [&str; FEATURE_DIM] = [
    "engine_rpm",
    "rpm_rolling_mean",
    "rpm_rolling_std",
    "coolant_temp",
    "intake_temp",
    "vehicle_speed",
    "maf",
    "map_kpa",
    "throttle",
];

/// Column names used by the training dataset, index-aligned with
/// [`FEATURE_NAMES`]. Artifacts may list either form.
pub const DATASET_COLUMNS: [&str; FEATURE_DIM] = [
    "Engine RPM [RPM]",
    "rpm_rolling_mean",
    "rpm_rolling_std",
    "Engine Coolant Temperature [°C]",
    "Intake Air Temperature [°C]",
    "Vehicle Speed Sensor [km/h]",
    "Air Flow Rate from Mass Flow Sensor [g/s]",
    "Intake Manifold Absolute Pressure [kPa]",
    "Absolute Throttle Position [%]",
];

pub type FeatureVector = [f64; FEATURE_DIM];

/// Named view of a feature vector. Field order matches [`FEATURE_NAMES`], so
/// the serialized map lists the values in input order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub engine_rpm: f64,
    pub rpm_rolling_mean: f64,
    pub rpm_rolling_std: f64,
    pub coolant_temp: f64,
    pub intake_temp: f64,
    pub vehicle_speed: f64,
    pub maf: f64,
    pub map_kpa: f64,
    pub throttle: f64,
}

impl Features {
    pub fn assemble(reading: &Reading, stats: RollingStats) -> Self {
        Self {
            engine_rpm: reading.engine_rpm,
            rpm_rolling_mean: stats.mean,
            rpm_rolling_std: stats.std,
            coolant_temp: reading.coolant_temp,
            intake_temp: reading.intake_temp,
            vehicle_speed: reading.vehicle_speed,
            maf: reading.maf,
            map_kpa: reading.map_kpa,
            throttle: reading.throttle,
        }
    }

    pub fn to_vector(&self) -> FeatureVector {
        [
            self.engine_rpm,
            self.rpm_rolling_mean,
            self.rpm_rolling_std,
            self.coolant_temp,
            self.intake_temp,
            self.vehicle_speed,
            self.maf,
            self.map_kpa,
            self.throttle,
        ]
    }

    /// `(name, value)` pairs in canonical order.
    pub fn named(&self) -> impl Iterator<Item = (&'static str, f64)> {
        FEATURE_NAMES.into_iter().zip(self.to_vector())
    }
}

/// True when `names` is the canonical order, spelled with either the
/// service names or the dataset column names.
pub fn matches_schema<S: AsRef<str>>(names: &[S]) -> bool {
    names.len() == FEATURE_DIM
        && names
            .iter()
            .enumerate()
            .all(|(i, got)| got.as_ref() == FEATURE_NAMES[i] || got.as_ref() == DATASET_COLUMNS[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> Reading {
        Reading {
            vehicle_id: "car-1".into(),
            engine_rpm: 2100.0,
            coolant_temp: 91.0,
            intake_temp: 33.0,
            vehicle_speed: 64.0,
            maf: 12.5,
            map_kpa: 98.0,
            throttle: 22.0,
        }
    }

    #[test]
    fn vector_follows_canonical_order() {
        let stats = RollingStats { mean: 2000.0, std: 50.0 };
        let v = Features::assemble(&reading(), stats).to_vector();
        assert_eq!(v, [2100.0, 2000.0, 50.0, 91.0, 33.0, 64.0, 12.5, 98.0, 22.0]);
    }

    #[test]
    fn absent_fields_land_as_zero() {
        let r = Reading::rpm("car-2", 800.0);
        let v = Features::assemble(&r, RollingStats { mean: 800.0, std: 0.0 }).to_vector();
        assert_eq!(v[0], 800.0);
        assert!(v[3..].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn serialized_map_uses_feature_names() {
        let f = Features::assemble(&reading(), RollingStats { mean: 1.0, std: 2.0 });
        let json = serde_json::to_value(f).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), FEATURE_DIM);
        for (name, value) in f.named() {
            assert_eq!(obj[name].as_f64(), Some(value));
        }
    }

    #[test]
    fn schema_match_is_order_sensitive() {
        assert!(matches_schema(&FEATURE_NAMES));
        let mut swapped = FEATURE_NAMES;
        swapped.swap(1, 2);
        assert!(!matches_schema(&swapped));
        assert!(!matches_schema(&FEATURE_NAMES[..8]));
        assert!(matches_schema(&DATASET_COLUMNS));
    }
}
