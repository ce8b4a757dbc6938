//! Channel cross-sections, the way the bed follows sediment volume changes,
//! and the hydraulic quantities derived from them.
pub mod resistance;
pub mod sill;

pub use resistance::{FlowResistance, RootFinding};
pub use sill::{PoleniSill, Sill};

use serde::{Deserialize, Serialize};

use crate::context::SimulationContext;
use crate::error::{Result, SedflowError};
use crate::grains::GrainMixture;
use crate::network::Reach;

/// `y = addition + factor · x^exponent`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerLaw {
    pub addition: f64,
    pub factor: f64,
    pub exponent: f64,
}

impl PowerLaw {
    pub fn new(addition: f64, factor: f64, exponent: f64) -> Self {
        Self { addition, factor, exponent }
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        self.addition + self.factor * x.powf(self.exponent)
    }
}

// ── Cross-section geometry ───────────────────────────────────────────────────

/// Cross-section of the alluvial channel.  Both shapes are infinitely deep so
/// water never leaves the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelGeometry {
    Rectangular { width: f64 },
    /// Symmetric V; `bank_slope` is depth per half width.
    VShaped { bank_slope: f64 },
}

impl ChannelGeometry {
    pub fn validate(&self) -> Result<()> {
        match self {
            ChannelGeometry::Rectangular { width } if !(*width > 0.0) => {
                Err(SedflowError::invalid("channel.width", "must be positive"))
            }
            ChannelGeometry::VShaped { bank_slope } if !(*bank_slope > 0.0) => {
                Err(SedflowError::invalid("channel.bank_slope", "must be positive"))
            }
            _ => Ok(()),
        }
    }

    pub fn cross_sectional_area(&self, depth: f64) -> f64 {
        let depth = depth.max(0.0);
        match self {
            ChannelGeometry::Rectangular { width } => width * depth,
            ChannelGeometry::VShaped { bank_slope } => depth * depth / bank_slope,
        }
    }

    pub fn depth_from_area(&self, area: f64) -> f64 {
        let area = area.max(0.0);
        match self {
            ChannelGeometry::Rectangular { width } => area / width,
            ChannelGeometry::VShaped { bank_slope } => (bank_slope * area).sqrt(),
        }
    }

    pub fn mean_depth(&self, depth: f64) -> f64 {
        match self {
            ChannelGeometry::Rectangular { .. } => depth,
            ChannelGeometry::VShaped { .. } => 0.5 * depth,
        }
    }

    /// Mean water depth above the part of the bed that is transporting.
    pub fn mean_depth_within_active_width(&self, depth: f64, active_width: f64) -> f64 {
        match self {
            ChannelGeometry::Rectangular { .. } => depth,
            ChannelGeometry::VShaped { bank_slope } => (2.0 * depth - 0.5 * active_width * bank_slope) * 0.5,
        }
    }

    pub fn width_at_depth(&self, depth: f64) -> f64 {
        match self {
            ChannelGeometry::Rectangular { width } => *width,
            ChannelGeometry::VShaped { bank_slope } => 2.0 * depth.max(0.0) / bank_slope,
        }
    }

    /// Hydraulic radius; `approximate` replaces it by the mean depth for the
    /// rectangle (wide channel assumption).
    pub fn hydraulic_radius(&self, depth: f64, approximate: bool) -> f64 {
        let depth = depth.max(0.0);
        match self {
            ChannelGeometry::Rectangular { width } => {
                if approximate {
                    depth
                } else {
                    width * depth / (width + 2.0 * depth)
                }
            }
            ChannelGeometry::VShaped { bank_slope } => depth / (1.0 + bank_slope * bank_slope).sqrt(),
        }
    }

    /// Hydraulic radius as a power law of the cross-sectional area, if the
    /// shape admits one.
    pub fn hydraulic_radius_of_area(&self, approximate: bool) -> Option<PowerLaw> {
        match self {
            ChannelGeometry::Rectangular { width } => approximate.then(|| PowerLaw::new(0.0, 1.0 / width, 1.0)),
            ChannelGeometry::VShaped { bank_slope } => Some(PowerLaw::new(
                0.0,
                (bank_slope / (1.0 + bank_slope * bank_slope)).sqrt(),
                0.5,
            )),
        }
    }

    /// Wetted bed length across the active width.
    pub fn active_perimeter(&self, active_width: f64) -> f64 {
        match self {
            ChannelGeometry::Rectangular { width } => active_width.min(*width),
            ChannelGeometry::VShaped { bank_slope } => active_width * (1.0 + bank_slope * bank_slope).sqrt(),
        }
    }
}

// ── Bed update behaviour ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelBehaviour {
    /// The cross-section shifts vertically as a whole.  Upstream of a sill
    /// the deposit may be wedge shaped, doubling the elevation change at the
    /// reach centre.
    ParallelShift {
        geometry: ChannelGeometry,
        #[serde(default)]
        wedge_upstream_of_sill: bool,
    },
}

impl ChannelBehaviour {
    pub fn rectangular(width: f64) -> Self {
        ChannelBehaviour::ParallelShift {
            geometry: ChannelGeometry::Rectangular { width },
            wedge_upstream_of_sill: false,
        }
    }

    pub fn geometry(&self) -> &ChannelGeometry {
        match self {
            ChannelBehaviour::ParallelShift { geometry, .. } => geometry,
        }
    }

    fn shape_factor(&self) -> f64 {
        match self {
            ChannelBehaviour::ParallelShift { wedge_upstream_of_sill: true, .. } => 2.0,
            ChannelBehaviour::ParallelShift { .. } => 1.0,
        }
    }

    /// Bed surface of the reach that exchanges material with the flow.
    pub fn bed_surface(&self, active_width: f64, length: f64) -> Result<f64> {
        let perimeter = self.geometry().active_perimeter(active_width);
        if perimeter < 0.0 {
            return Err(SedflowError::NegativePerimeter { perimeter });
        }
        Ok(perimeter * length)
    }

    /// Elevation change caused by a bulk sediment volume change.
    pub fn elevation_increment(&self, volume_increment: f64, active_width: f64, length: f64) -> Result<f64> {
        let surface = self.bed_surface(active_width, length)?;
        if surface == 0.0 {
            return Ok(0.0);
        }
        Ok(self.shape_factor() * volume_increment / surface)
    }

    /// Constant height-per-volume factor, when the elevation change is linear
    /// in the volume change.
    pub fn linear_conversion_factor(&self, active_width: f64, length: f64) -> Result<Option<f64>> {
        let surface = self.bed_surface(active_width, length)?;
        if surface == 0.0 {
            return Ok(Some(0.0));
        }
        Ok(Some(self.shape_factor() / surface))
    }

    pub fn per_unit_bed_surface(&self, overall: &GrainMixture, active_width: f64, length: f64) -> Result<GrainMixture> {
        let surface = self.bed_surface(active_width, length)?;
        if surface > 0.0 {
            overall.scaled(1.0 / surface)
        } else {
            Ok(overall.zeroed())
        }
    }

    pub fn overall_from_per_unit_bed_surface(&self, per_unit: &GrainMixture, active_width: f64, length: f64) -> Result<GrainMixture> {
        per_unit.scaled(self.bed_surface(active_width, length)?)
    }
}

// ── Derived hydraulics ───────────────────────────────────────────────────────

/// Sediment energy slope increased for the downslope weight component of the
/// bedload on steep beds.
pub fn steep_slope_corrected(sediment_slope: f64, angle_of_repose: f64, bedslope: f64) -> f64 {
    let relative = angle_of_repose - bedslope.atan();
    if relative > 0.0 {
        sediment_slope * angle_of_repose.sin() / relative.sin()
    } else {
        sediment_slope
    }
}

/// Sediment energy slope used for transport, corrected when configured.
pub fn effective_sediment_slope(reach: &Reach, ctx: &SimulationContext) -> f64 {
    let slope = reach.state.sediment_energy_slope;
    if ctx.methods.correct_shear_stress_for_steep_slopes && reach.state.bedslope > 0.0 {
        steep_slope_corrected(slope, ctx.physics.angle_of_repose(), reach.state.bedslope)
    } else {
        slope
    }
}

/// `τ = h_active · ρw · g · S_sediment`.
pub fn bed_shear_stress(reach: &Reach, location: &str, ctx: &SimulationContext) -> Result<f64> {
    if reach.state.sediment_energy_slope < 0.0 {
        return Err(SedflowError::NegativeEnergySlope {
            slope: reach.state.sediment_energy_slope,
            location: location.to_string(),
        });
    }
    let mean_depth = reach
        .channel
        .geometry()
        .mean_depth_within_active_width(reach.state.maximum_water_depth, reach.state.active_width);
    Ok(mean_depth * ctx.physics.water_density * ctx.physics.gravity * effective_sediment_slope(reach, ctx))
}

/// Channel width at the water surface while water flows, zero otherwise.
pub fn active_width(reach: &Reach) -> f64 {
    if reach.state.discharge > 0.0 {
        reach.channel.geometry().width_at_depth(reach.state.maximum_water_depth)
    } else {
        0.0
    }
}
