//! Bedload particle velocity, used for the sediment CFL bound.
use serde::{Deserialize, Serialize};

use crate::context::SimulationContext;
use crate::error::{Result, SedflowError};
use crate::network::Reach;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BedloadVelocityModel {
    /// Rolling particle velocity after Julien & Bounvilay,
    /// `u* (3.3 ln θ_r + 17.7)` with `θ_r` the Shields number of the
    /// roughness diameter.
    JulienBounvilay {
        roughness_factor: f64,
        roughness_percentile: f64,
    },
    /// Transport rate spread over a moving layer of constant thickness.
    TransportRatePerArea { moving_layer_thickness: f64 },
}

impl Default for BedloadVelocityModel {
    fn default() -> Self {
        BedloadVelocityModel::JulienBounvilay {
            roughness_factor: 1.0,
            roughness_percentile: 50.0,
        }
    }
}

impl BedloadVelocityModel {
    pub fn validate(&self) -> Result<()> {
        match self {
            BedloadVelocityModel::JulienBounvilay {
                roughness_factor,
                roughness_percentile,
            } => {
                if !(*roughness_factor > 0.0) {
                    return Err(SedflowError::invalid("bedload_velocity.roughness_factor", "must be positive"));
                }
                if !(0.0..=100.0).contains(roughness_percentile) {
                    return Err(SedflowError::invalid("bedload_velocity.roughness_percentile", "must lie within 0..100"));
                }
                Ok(())
            }
            BedloadVelocityModel::TransportRatePerArea { moving_layer_thickness } => {
                if !(*moving_layer_thickness > 0.0) {
                    return Err(SedflowError::invalid("bedload_velocity.moving_layer_thickness", "must be positive"));
                }
                Ok(())
            }
        }
    }

    /// Velocity of the moving bedload; zero while nothing is eroded.
    pub fn evaluate(&self, reach: &Reach, ctx: &SimulationContext) -> f64 {
        let erosion_rate = reach.state.erosion_rate.overall_volume();
        if erosion_rate <= 0.0 {
            return 0.0;
        }
        match self {
            BedloadVelocityModel::JulienBounvilay {
                roughness_factor,
                roughness_percentile,
            } => {
                let diameters = &ctx.physics.grain_diameters;
                let d = reach.strata.active().percentile_diameter(diameters, *roughness_percentile);
                let d = if d.is_nan() {
                    diameters.last().copied().unwrap_or(f64::NAN)
                } else {
                    d
                };
                let theta = ctx
                    .physics
                    .dimensionless_shear_stress(reach.state.bed_shear_stress, roughness_factor * d);
                let approximate = ctx.methods.flow_resistance.uses_approximations();
                let radius = reach
                    .channel
                    .geometry()
                    .hydraulic_radius(reach.state.maximum_water_depth, approximate);
                let shear_velocity = (ctx.physics.gravity * radius * reach.state.sediment_energy_slope.max(0.0)).sqrt();
                let v = shear_velocity * (3.3 * theta.ln() + 17.7);
                if v.is_nan() {
                    0.0
                } else {
                    v.max(0.0)
                }
            }
            BedloadVelocityModel::TransportRatePerArea { moving_layer_thickness } => {
                let perimeter = reach.channel.geometry().active_perimeter(reach.state.active_width);
                if perimeter <= 0.0 {
                    return 0.0;
                }
                erosion_rate / (perimeter * moving_layer_thickness)
            }
        }
    }
}
