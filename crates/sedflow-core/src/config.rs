//! JSON configuration of a complete simulation.
//!
//! A config built by [`Simulation::export_config`](crate::Simulation::export_config)
//! restarts the run from its current state.
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::{NumericalParameters, PhysicalParameters, ReachMethods};
use crate::error::{Result, SedflowError};
use crate::flow::{SedimentRouter, WaterScheme};
use crate::network::ReachDescriptor;
use crate::timeseries::Boundaries;
use crate::timestep::TimestepMonitor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(default)]
    pub physics: PhysicalParameters,
    pub numerics: NumericalParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub parameters: Parameters,
    #[serde(default)]
    pub methods: ReachMethods,
    #[serde(default)]
    pub water: WaterScheme,
    /// Bedload routing; water-only runs leave it out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sediment: Option<SedimentRouter>,
    #[serde(default)]
    pub monitor: TimestepMonitor,
    pub reaches: Vec<ReachDescriptor>,
    #[serde(default)]
    pub boundaries: Boundaries,
    /// Simulated time the run starts from.
    #[serde(default)]
    pub elapsed: f64,
}

impl SimulationConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| SedflowError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&json)?;
        info!(
            target: "sedflow::config",
            path = %path.display(),
            reaches = config.reaches.len(),
            sediment = config.sediment.is_some(),
            "config.loaded"
        );
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradient::GradientEvaluator;

    const MINIMAL: &str = r#"{
        "parameters": { "numerics": { "finish": 600.0 } },
        "reaches": [
            {
                "id": 2, "length": 100.0, "elevation": 1.0,
                "strata": { "layers": [[{ "kind": { "type": "normal" }, "fractions": [0.1, 0.2, 0.3, 0.4] }]] },
                "channel": { "type": "parallel_shift", "geometry": { "type": "rectangular", "width": 5.0 } }
            },
            {
                "id": 1, "downstream": 2, "length": 100.0, "elevation": 2.0, "discharge": 3.0,
                "strata": { "layers": [[{ "kind": { "type": "normal" }, "fractions": [0.1, 0.2, 0.3, 0.4] }]] },
                "channel": { "type": "parallel_shift", "geometry": { "type": "rectangular", "width": 5.0 } }
            }
        ]
    }"#;

    #[test]
    fn minimal_config_takes_defaults() {
        let config = SimulationConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(config.reaches.len(), 2);
        assert_eq!(config.parameters.numerics.finish, 600.0);
        assert_eq!(config.parameters.physics.grain_diameters.len(), 4);
        assert!(config.sediment.is_none(), "sediment routing is opt-in");
        assert!(matches!(config.water, WaterScheme::ImplicitKinematicWave { .. }));
        assert!(matches!(config.methods.water_energy_slope, GradientEvaluator::ReturnBedslope { .. }));
    }

    #[test]
    fn serialized_config_parses_back() {
        let mut config = SimulationConfig::from_json_str(MINIMAL).unwrap();
        config.sediment = Some(SedimentRouter::default());
        let json = config.to_json_string().unwrap();
        let back = SimulationConfig::from_json_str(&json).unwrap();
        assert_eq!(back.reaches, config.reaches);
        assert_eq!(back.sediment, config.sediment);
        assert_eq!(back.water, config.water);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = SimulationConfig::from_file("/nonexistent/sedflow.json").unwrap_err();
        assert!(matches!(err, SedflowError::Read { .. }));
        assert!(err.to_string().contains("sedflow.json"), "message must name the file: {err}");
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            SimulationConfig::from_json_str("{ \"reaches\": 3 }"),
            Err(SedflowError::Parse(_))
        ));
    }
}
