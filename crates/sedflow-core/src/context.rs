//! Parameters and strategies shared by every reach, plus the simulation clock.
//!
//! One [`SimulationContext`] is created per run and passed by reference into
//! every routing, capacity and sorting call.
use serde::{Deserialize, Serialize};

use crate::channel::FlowResistance;
use crate::error::{Result, SedflowError};
use crate::gradient::{GradientEvaluator, GradientProperty};
use crate::strata::StrataSorting;
use crate::velocity::BedloadVelocityModel;

// ── Physical constants ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalParameters {
    #[serde(default = "default_water_density")]
    pub water_density: f64,
    #[serde(default = "default_sediment_density")]
    pub sediment_density: f64,
    /// Pore volume per bulk volume of the bed.
    #[serde(default = "default_pore_fraction")]
    pub pore_fraction: f64,
    #[serde(default = "default_gravity")]
    pub gravity: f64,
    #[serde(default = "default_angle_of_repose")]
    pub angle_of_repose_deg: f64,
    /// Representative diameter of each grain-size class in metres, ascending.
    pub grain_diameters: Vec<f64>,
}

fn default_water_density() -> f64 {
    1000.0
}
fn default_sediment_density() -> f64 {
    2650.0
}
fn default_pore_fraction() -> f64 {
    0.3
}
fn default_gravity() -> f64 {
    9.81
}
fn default_angle_of_repose() -> f64 {
    30.0
}

impl Default for PhysicalParameters {
    fn default() -> Self {
        Self {
            water_density: default_water_density(),
            sediment_density: default_sediment_density(),
            pore_fraction: default_pore_fraction(),
            gravity: default_gravity(),
            angle_of_repose_deg: default_angle_of_repose(),
            grain_diameters: vec![0.002, 0.008, 0.032, 0.128],
        }
    }
}

impl PhysicalParameters {
    pub fn angle_of_repose(&self) -> f64 {
        self.angle_of_repose_deg.to_radians()
    }

    /// Submerged specific gravity `ρs/ρw − 1`.
    pub fn relative_submerged_density(&self) -> f64 {
        self.sediment_density / self.water_density - 1.0
    }

    /// Shields number `τ / ((ρs − ρw) g d)`.
    pub fn dimensionless_shear_stress(&self, bed_shear_stress: f64, diameter: f64) -> f64 {
        bed_shear_stress / ((self.sediment_density - self.water_density) * self.gravity * diameter)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.water_density > 0.0) {
            return Err(SedflowError::invalid("water_density", "must be positive"));
        }
        if !(self.sediment_density > self.water_density) {
            return Err(SedflowError::invalid("sediment_density", "must exceed water_density"));
        }
        if !(0.0..1.0).contains(&self.pore_fraction) {
            return Err(SedflowError::invalid("pore_fraction", "must lie within [0, 1)"));
        }
        if !(self.gravity > 0.0) {
            return Err(SedflowError::invalid("gravity", "must be positive"));
        }
        if !(self.angle_of_repose_deg > 0.0 && self.angle_of_repose_deg < 90.0) {
            return Err(SedflowError::invalid("angle_of_repose_deg", "must lie within (0, 90)"));
        }
        if self.grain_diameters.is_empty() {
            return Err(SedflowError::invalid("grain_diameters", "at least one grain class is required"));
        }
        if self.grain_diameters.iter().any(|&d| !(d > 0.0)) {
            return Err(SedflowError::invalid("grain_diameters", "diameters must be positive"));
        }
        if self.grain_diameters.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SedflowError::invalid("grain_diameters", "diameters must be strictly ascending"));
        }
        Ok(())
    }
}

// ── Numerical controls ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericalParameters {
    /// Courant number applied to every CFL bound.
    #[serde(default = "default_cfl")]
    pub cfl_number: f64,
    /// Multiplier on the network-wide minimum timestep.
    #[serde(default = "default_timestep_factor")]
    pub timestep_factor: f64,
    /// A timestep below this many seconds aborts the run.
    #[serde(default = "default_termination_threshold")]
    pub termination_threshold: f64,
    /// Simulated time in seconds at which the run stops.
    pub finish: f64,
}

fn default_cfl() -> f64 {
    0.5
}
fn default_timestep_factor() -> f64 {
    1.0
}
fn default_termination_threshold() -> f64 {
    1e-6
}

impl Default for NumericalParameters {
    fn default() -> Self {
        Self {
            cfl_number: default_cfl(),
            timestep_factor: default_timestep_factor(),
            termination_threshold: default_termination_threshold(),
            finish: 3600.0,
        }
    }
}

impl NumericalParameters {
    pub fn validate(&self) -> Result<()> {
        if !(self.cfl_number > 0.0) {
            return Err(SedflowError::invalid("cfl_number", "must be positive"));
        }
        if !(self.timestep_factor > 0.0 && self.timestep_factor <= 1.0) {
            return Err(SedflowError::invalid("timestep_factor", "must lie within (0, 1]"));
        }
        if !(self.termination_threshold >= 0.0) {
            return Err(SedflowError::invalid("termination_threshold", "must not be negative"));
        }
        if !self.finish.is_finite() || self.finish < 0.0 {
            return Err(SedflowError::invalid("finish", "must be a finite, non-negative time"));
        }
        Ok(())
    }
}

// ── Shared reach methods ─────────────────────────────────────────────────────

/// Strategies evaluated identically for every reach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachMethods {
    pub bedslope: GradientEvaluator,
    pub water_energy_slope: GradientEvaluator,
    pub sediment_energy_slope: GradientEvaluator,
    pub flow_resistance: FlowResistance,
    #[serde(default)]
    pub bedload_velocity: BedloadVelocityModel,
    #[serde(default)]
    pub strata_sorting: StrataSorting,
    /// Increase the sediment energy slope on steep beds to account for the
    /// downslope weight of the bedload.
    #[serde(default)]
    pub correct_shear_stress_for_steep_slopes: bool,
}

impl Default for ReachMethods {
    fn default() -> Self {
        Self {
            bedslope: GradientEvaluator::DownstreamTwoCell {
                property: GradientProperty::Elevation,
                minimum_slope: None,
            },
            water_energy_slope: GradientEvaluator::ReturnBedslope { minimum_slope: None },
            sediment_energy_slope: GradientEvaluator::ReturnWaterEnergySlope { minimum_slope: None },
            flow_resistance: FlowResistance::default(),
            bedload_velocity: BedloadVelocityModel::default(),
            strata_sorting: StrataSorting::default(),
            correct_shear_stress_for_steep_slopes: false,
        }
    }
}

impl ReachMethods {
    pub fn validate(&self) -> Result<()> {
        if self.bedslope.depends_on_bedslope() || self.bedslope.depends_on_water_energy_slope() {
            return Err(SedflowError::invalid("methods.bedslope", "must be computed from reach properties"));
        }
        if self.water_energy_slope.depends_on_water_energy_slope() {
            return Err(SedflowError::invalid("methods.water_energy_slope", "cannot return itself"));
        }
        self.bedslope.validate()?;
        self.water_energy_slope.validate()?;
        self.sediment_energy_slope.validate()?;
        self.flow_resistance.validate()?;
        self.bedload_velocity.validate()?;
        self.strata_sorting.validate()
    }
}

// ── Context ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimulationContext {
    pub physics: PhysicalParameters,
    pub numerics: NumericalParameters,
    pub methods: ReachMethods,
    /// Simulated seconds since the start of the run.
    pub elapsed: f64,
    /// Last committed timestep, `None` before the first step.
    pub timestep: Option<f64>,
}

impl SimulationContext {
    pub fn new(physics: PhysicalParameters, numerics: NumericalParameters, methods: ReachMethods) -> Result<Self> {
        physics.validate()?;
        numerics.validate()?;
        methods.validate()?;
        Ok(Self {
            physics,
            numerics,
            methods,
            elapsed: 0.0,
            timestep: None,
        })
    }

    pub fn finished(&self) -> bool {
        self.elapsed >= self.numerics.finish
    }
}
