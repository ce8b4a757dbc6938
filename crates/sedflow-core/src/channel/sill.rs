//! Fixed overflow structures at the upstream end of a reach.
use serde::{Deserialize, Serialize};

use crate::error::{Result, SedflowError};

/// Sill with its crest elevation and overfall hydraulics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sill {
    pub top_edge_elevation: f64,
    pub weir: PoleniSill,
}

impl Sill {
    pub fn free_overfall_hydraulic_head(&self, discharge: f64, gravity: f64) -> f64 {
        self.top_edge_elevation + self.weir.overfall_height(discharge, gravity)
    }
}

/// Poleni weir equation `Q = (2/3) μ w √(2g) h^(3/2)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoleniSill {
    pub overfall_width: f64,
    #[serde(default = "default_poleni_factor")]
    pub poleni_factor: f64,
}

fn default_poleni_factor() -> f64 {
    1.0 / 3f64.sqrt()
}

impl PoleniSill {
    pub fn validate(&self) -> Result<()> {
        if !(self.overfall_width > 0.0) {
            return Err(SedflowError::invalid("sill.overfall_width", "must be positive"));
        }
        if !(self.poleni_factor > 0.0) {
            return Err(SedflowError::invalid("sill.poleni_factor", "must be positive"));
        }
        Ok(())
    }

    /// Energy height above the crest needed to pass `discharge`.
    pub fn overfall_height(&self, discharge: f64, gravity: f64) -> f64 {
        let q = discharge.max(0.0);
        (1.5 * q / (self.overfall_width * self.poleni_factor * (2.0 * gravity).sqrt())).powf(2.0 / 3.0)
    }
}
