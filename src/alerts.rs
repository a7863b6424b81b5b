//! Threshold rules that flag individual readings. They are reported next to
//! the model score and never feed into it.

use serde::{Deserialize, Serialize};

use crate::features::Features;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alert {
    HighRpm,
    EngineOverheat,
    Overspeed,
    ThrottleAbuse,
    LowEfficiency,
    PressureFault,
    RpmAnomaly,
}

const HIGH_RPM: f64 = 3000.0;
const COOLANT_MAX_C: f64 = 100.0;
const INTAKE_MAX_C: f64 = 80.0;
const OVERSPEED_KPH: f64 = 120.0;
const MAP_RANGE_KPA: (f64, f64) = (50.0, 180.0);
const RPM_STD_LIMIT: f64 = 350.0;

pub fn evaluate(f: &Features) -> Vec<Alert> {
    let mut out = Vec::new();
    if f.engine_rpm > HIGH_RPM {
        out.push(Alert::HighRpm);
    }
    if f.coolant_temp > COOLANT_MAX_C || f.intake_temp > INTAKE_MAX_C {
        out.push(Alert::EngineOverheat);
    }
    if f.vehicle_speed > OVERSPEED_KPH {
        out.push(Alert::Overspeed);
    }
    if f.throttle > 70.0 && f.vehicle_speed < 30.0 {
        out.push(Alert::ThrottleAbuse);
    }
    if f.maf > 40.0 && f.vehicle_speed < 25.0 {
        out.push(Alert::LowEfficiency);
    }
    if f.map_kpa > MAP_RANGE_KPA.1 || f.map_kpa < MAP_RANGE_KPA.0 {
        out.push(Alert::PressureFault);
    }
    if f.rpm_rolling_std > RPM_STD_LIMIT {
        out.push(Alert::RpmAnomaly);
    }
    out
}
