use serde::{Deserialize, Deserializer, Serialize};

use crate::alerts::Alert;
use crate::features::Features;

pub const DEFAULT_VEHICLE_ID: &str = "vehicle_1";

fn default_vehicle_id() -> String {
    DEFAULT_VEHICLE_ID.to_string()
}

// Absent and explicit `null` sensor values both read as 0.0.
fn zero_if_null<'de, D>(de: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(de)?.unwrap_or(0.0))
}

fn id_or_default<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(de)?.unwrap_or_else(default_vehicle_id))
}

/// One telemetry sample as sent by a vehicle (same schema on both endpoints).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(default = "default_vehicle_id", deserialize_with = "id_or_default")]
    pub vehicle_id: String,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub engine_rpm: f64,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub coolant_temp: f64,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub intake_temp: f64,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub vehicle_speed: f64,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub maf: f64,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub map_kpa: f64,
    #[serde(default, deserialize_with = "zero_if_null")]
    pub throttle: f64,
}

impl Default for Reading {
    fn default() -> Self {
        Self {
            vehicle_id: default_vehicle_id(),
            engine_rpm: 0.0,
            coolant_temp: 0.0,
            intake_temp: 0.0,
            vehicle_speed: 0.0,
            maf: 0.0,
            map_kpa: 0.0,
            throttle: 0.0,
        }
    }
}

impl Reading {
    /// A reading for `vehicle_id` carrying only an RPM value.
    pub fn rpm(vehicle_id: impl Into<String>, engine_rpm: f64) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            engine_rpm,
            ..Self::default()
        }
    }
}

/// Response to one reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    /// 1 when `probability > 0.5`.
    pub prediction: u8,
    pub probability: f64,
    /// `round(100 - probability * 60, 2)`; always within [40, 100].
    pub health_score: f64,
    /// The nine feature values that were scored.
    pub features: Features,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

impl ScoreResult {
    pub fn from_probability(probability: f64, features: Features, alerts: Vec<Alert>) -> Self {
        Self {
            prediction: u8::from(probability > 0.5),
            probability,
            health_score: health_score(probability),
            features,
            alerts,
        }
    }
}

/// `100 - 60p`, rounded to two decimals with ties to even.
pub fn health_score(probability: f64) -> f64 {
    ((100.0 - probability * 60.0) * 100.0).round_ties_even() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Scoring,
    Timeout,
    Connection,
}

/// Body of an HTTP error response, and of an error frame on a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    pub vehicle_id: String,
    pub window: Vec<f64>,
    pub rolling_mean: f64,
    pub rolling_std: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthOut {
    pub status: String,
    pub model_version: String,
    pub tracked_vehicles: usize,
}
