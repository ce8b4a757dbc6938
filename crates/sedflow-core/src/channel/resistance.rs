//! Flow resistance: the relation between water depth, velocity and discharge
//! of a reach.
//!
//! The fixed power law reads `v = f · √(g R S) · (R / (f_D · D))^e` with `R`
//! the hydraulic radius, `S` the water energy slope and `D` a percentile
//! diameter of the active layer.
use serde::{Deserialize, Serialize};

use super::PowerLaw;
use crate::context::SimulationContext;
use crate::error::{Result, SedflowError};
use crate::network::Reach;

/// Controls for the bracketing root finder used where no closed form exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFinding {
    #[serde(default = "default_starting_value")]
    pub starting_value: f64,
    #[serde(default = "default_accuracy")]
    pub accuracy: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_starting_value() -> f64 {
    0.1
}
fn default_accuracy() -> f64 {
    1e-10
}
fn default_max_iterations() -> usize {
    200
}

impl Default for RootFinding {
    fn default() -> Self {
        Self {
            starting_value: default_starting_value(),
            accuracy: default_accuracy(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl RootFinding {
    /// Positive root of a function increasing in `x`, found by expanding a
    /// bracket from the starting value and bisecting it.
    pub fn increasing_root<F>(&self, quantity: &'static str, f: F) -> Result<f64>
    where
        F: Fn(f64) -> f64,
    {
        let mut lo = 0.0;
        let mut hi = self.starting_value.max(f64::MIN_POSITIVE);
        let mut expansions = 0;
        while f(hi) < 0.0 {
            lo = hi;
            hi *= 2.0;
            expansions += 1;
            if expansions > self.max_iterations || !hi.is_finite() {
                return Err(SedflowError::RootNotFound { quantity });
            }
        }
        for _ in 0..self.max_iterations {
            let mid = 0.5 * (lo + hi);
            if f(mid) < 0.0 {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo <= self.accuracy * hi.max(1.0) {
                return Ok(0.5 * (lo + hi));
            }
        }
        Err(SedflowError::RootNotFound { quantity })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResistance {
    FixedPowerLaw {
        factor: f64,
        grains_factor: f64,
        grains_percentile: f64,
        exponent: f64,
        /// Use the wide-channel approximation for the hydraulic radius.
        #[serde(default)]
        use_approximations: bool,
        /// Depth derived from discharge never implies a higher Froude number.
        #[serde(default = "default_max_froude")]
        maximum_froude_number: f64,
        #[serde(default)]
        root_finding: RootFinding,
    },
}

fn default_max_froude() -> f64 {
    1.5
}

impl Default for FlowResistance {
    /// Rickenmann–Recking style power law with `D84` roughness.
    fn default() -> Self {
        FlowResistance::FixedPowerLaw {
            factor: 6.5,
            grains_factor: 1.0,
            grains_percentile: 84.0,
            exponent: 1.0 / 6.0,
            use_approximations: true,
            maximum_froude_number: default_max_froude(),
            root_finding: RootFinding::default(),
        }
    }
}

impl FlowResistance {
    pub fn validate(&self) -> Result<()> {
        let FlowResistance::FixedPowerLaw {
            factor,
            grains_factor,
            grains_percentile,
            maximum_froude_number,
            ..
        } = self;
        if !(*factor > 0.0) {
            return Err(SedflowError::invalid("flow_resistance.factor", "must be positive"));
        }
        if !(*grains_factor > 0.0) {
            return Err(SedflowError::invalid("flow_resistance.grains_factor", "must be positive"));
        }
        if !(0.0..=100.0).contains(grains_percentile) {
            return Err(SedflowError::invalid("flow_resistance.grains_percentile", "must lie within 0..100"));
        }
        if *maximum_froude_number < 0.5 {
            return Err(SedflowError::invalid("flow_resistance.maximum_froude_number", "must be at least 0.5"));
        }
        Ok(())
    }

    pub fn uses_approximations(&self) -> bool {
        let FlowResistance::FixedPowerLaw { use_approximations, .. } = self;
        *use_approximations
    }

    /// Roughness diameter of the active layer; the coarsest class stands in
    /// for an empty active layer.
    pub fn representative_diameter(&self, reach: &Reach, ctx: &SimulationContext) -> f64 {
        let FlowResistance::FixedPowerLaw { grains_percentile, .. } = self;
        let diameters = &ctx.physics.grain_diameters;
        let d = reach.strata.active().percentile_diameter(diameters, *grains_percentile);
        if d.is_nan() {
            diameters.last().copied().unwrap_or(f64::NAN)
        } else {
            d
        }
    }

    pub fn velocity_from_depth(&self, reach: &Reach, depth: f64, ctx: &SimulationContext) -> f64 {
        let FlowResistance::FixedPowerLaw {
            factor,
            grains_factor,
            exponent,
            use_approximations,
            ..
        } = self;
        let slope = reach.state.water_energy_slope;
        if depth <= 0.0 || slope <= 0.0 {
            return 0.0;
        }
        let radius = reach.channel.geometry().hydraulic_radius(depth, *use_approximations);
        let roughness = grains_factor * self.representative_diameter(reach, ctx);
        (ctx.physics.gravity * radius * slope).sqrt() * factor * (radius / roughness).powf(*exponent)
    }

    /// Discharge and flow velocity for a given maximum water depth.
    pub fn discharge_and_velocity(&self, reach: &Reach, depth: f64, ctx: &SimulationContext) -> (f64, f64) {
        let velocity = self.velocity_from_depth(reach, depth, ctx);
        (velocity * reach.channel.geometry().cross_sectional_area(depth), velocity)
    }

    /// Maximum water depth and flow velocity carrying a given discharge.
    pub fn depth_and_velocity(&self, reach: &Reach, discharge: f64, ctx: &SimulationContext) -> Result<(f64, f64)> {
        if discharge <= 0.0 {
            return Ok((0.0, 0.0));
        }
        let FlowResistance::FixedPowerLaw {
            maximum_froude_number,
            root_finding,
            ..
        } = self;
        let geometry = reach.channel.geometry();
        let g = ctx.physics.gravity;
        // Shallowest depth at which the Froude number stays within bounds.
        let froude_depth = root_finding.increasing_root("froude limited depth", |h| {
            let area = geometry.cross_sectional_area(h);
            area * (g * geometry.mean_depth(h)).sqrt() * maximum_froude_number - discharge
        })?;
        let depth = if reach.state.water_energy_slope > 0.0 {
            let equilibrium = root_finding.increasing_root("equilibrium flow depth", |h| {
                self.discharge_and_velocity(reach, h, ctx).0 - discharge
            })?;
            equilibrium.max(froude_depth)
        } else {
            froude_depth
        };
        Ok((depth, discharge / geometry.cross_sectional_area(depth)))
    }

    /// `Q = factor · V^exponent` with `V` the water volume in the reach, when
    /// the hydraulic radius is a power law of the cross-sectional area.
    pub fn discharge_of_volume(&self, reach: &Reach, ctx: &SimulationContext) -> Option<PowerLaw> {
        let FlowResistance::FixedPowerLaw {
            factor,
            grains_factor,
            exponent,
            use_approximations,
            ..
        } = self;
        let radius = reach.channel.geometry().hydraulic_radius_of_area(*use_approximations)?;
        if radius.addition != 0.0 {
            return None;
        }
        let length = reach.state.length;
        let slope = reach.state.water_energy_slope.max(0.0);
        let scaled_length = length.powf(radius.exponent);
        let roughness = grains_factor * self.representative_diameter(reach, ctx);
        let law_factor = (ctx.physics.gravity * slope * radius.factor / scaled_length).sqrt()
            * (radius.factor / (scaled_length * roughness)).powf(*exponent)
            * (factor / length);
        Some(PowerLaw::new(0.0, law_factor, 1.0 + radius.exponent * (exponent + 0.5)))
    }
}
