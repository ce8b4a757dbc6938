//! Strategies that re-sort the stratigraphy after each sediment step.
//!
//! All thicknesses are volumes per unit bed surface.  `sort` returns whether
//! any material moved between layers.
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::Stratigraphy;
use crate::context::SimulationContext;
use crate::error::{Result, SedflowError};
use crate::grains::GrainMixture;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrataSorting {
    /// A single well-mixed layer; nothing is ever sorted.
    SingleLayerNoSorting { layer_thickness: f64 },
    ThresholdBased(ThresholdBasedSorting),
    TwoLayerContinuous(ContinuousSorting),
    TwoLayerShearStress(ShearStressSorting),
}

impl Default for StrataSorting {
    fn default() -> Self {
        StrataSorting::SingleLayerNoSorting { layer_thickness: 0.5 }
    }
}

impl StrataSorting {
    pub fn validate(&self) -> Result<()> {
        match self {
            StrataSorting::SingleLayerNoSorting { .. } => Ok(()),
            StrataSorting::ThresholdBased(s) => s.validate(),
            StrataSorting::TwoLayerContinuous(s) => s.validate(),
            StrataSorting::TwoLayerShearStress(s) => s.validate(),
        }
    }

    /// Target thickness of the active layer for the given stratigraphy.
    pub fn layer_thickness(&self, strata: &Stratigraphy, diameters: &[f64]) -> f64 {
        match self {
            StrataSorting::SingleLayerNoSorting { layer_thickness } => *layer_thickness,
            StrataSorting::ThresholdBased(s) => {
                let (lower, upper) = s.thresholds(strata.active(), diameters);
                0.5 * (lower + upper)
            }
            StrataSorting::TwoLayerContinuous(s) => s.target_thickness(strata.active(), diameters),
            StrataSorting::TwoLayerShearStress(s) => s.target_thickness(strata.active(), diameters),
        }
    }

    pub fn sort(&self, strata: &mut Stratigraphy, bed_shear_stress: f64, ctx: &SimulationContext) -> Result<bool> {
        let diameters = &ctx.physics.grain_diameters;
        let moved = match self {
            StrataSorting::SingleLayerNoSorting { .. } => false,
            StrataSorting::ThresholdBased(s) => s.sort(strata, diameters)?,
            StrataSorting::TwoLayerContinuous(s) => s.sort(strata, diameters)?,
            StrataSorting::TwoLayerShearStress(s) => s.sort(strata, bed_shear_stress, ctx)?,
        };
        if moved {
            trace!(target: "sedflow::strata", layers = strata.len(), "strata.sorted");
        }
        Ok(moved)
    }
}

fn check_two_layers(strategy: &'static str, strata: &Stratigraphy) -> Result<()> {
    if strata.len() != 2 {
        return Err(SedflowError::StrataLayerCount {
            strategy,
            expected: "exactly 2",
            found: strata.len(),
        });
    }
    Ok(())
}

/// Layer thickness, optionally tied to a grain percentile of the active layer.
fn dynamic_thickness(fixed: f64, dynamic: bool, factor: f64, percentile: f64, active: &GrainMixture, diameters: &[f64]) -> f64 {
    if dynamic && active.overall_volume() > 0.0 {
        factor * active.percentile_diameter(diameters, percentile)
    } else {
        fixed
    }
}

// ── Threshold based multi-layer stratigraphy ─────────────────────────────────

/// Keeps the active layer thickness between a lower and an upper threshold by
/// moving increments of `increment_layer_thickness` from and to the
/// substrate.  With `dynamic_thresholds` the thresholds are factors on a
/// reference grain diameter of the active layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdBasedSorting {
    pub increment_layer_thickness: f64,
    #[serde(default)]
    pub dynamic_thresholds: bool,
    #[serde(default = "default_reference_percentile")]
    pub reference_grain_size_percentile: f64,
    pub lower_threshold: f64,
    pub upper_threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_lower_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_threshold_difference: Option<f64>,
}

fn default_reference_percentile() -> f64 {
    84.0
}

impl ThresholdBasedSorting {
    fn minimum_difference(&self) -> f64 {
        self.minimum_threshold_difference
            .unwrap_or(1.1 * self.increment_layer_thickness)
    }

    fn minimum_lower(&self) -> f64 {
        self.minimum_lower_threshold.unwrap_or_else(|| {
            self.minimum_difference() * self.lower_threshold / (self.upper_threshold - self.lower_threshold)
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.increment_layer_thickness > 0.0) {
            return Err(SedflowError::invalid("increment_layer_thickness", "must be positive"));
        }
        if !(0.0..=100.0).contains(&self.reference_grain_size_percentile) {
            return Err(SedflowError::invalid("reference_grain_size_percentile", "must lie within 0..100"));
        }
        if !(self.lower_threshold > 0.0) {
            return Err(SedflowError::invalid("lower_threshold", "must be positive"));
        }
        if self.upper_threshold <= self.lower_threshold {
            return Err(SedflowError::invalid("upper_threshold", "must exceed lower_threshold"));
        }
        if !(self.minimum_lower() > 0.0) {
            return Err(SedflowError::invalid("minimum_lower_threshold", "must be positive"));
        }
        if self.minimum_difference() <= self.increment_layer_thickness {
            return Err(SedflowError::invalid(
                "minimum_threshold_difference",
                "must exceed increment_layer_thickness",
            ));
        }
        Ok(())
    }

    /// Lower and upper active layer thickness thresholds.
    pub fn thresholds(&self, active: &GrainMixture, diameters: &[f64]) -> (f64, f64) {
        let min_lower = self.minimum_lower();
        let min_diff = self.minimum_difference();
        let (lower, upper) = if self.dynamic_thresholds {
            if active.overall_volume() > 0.0 {
                let reference = active.percentile_diameter(diameters, self.reference_grain_size_percentile);
                (reference * self.lower_threshold, reference * self.upper_threshold)
            } else {
                (min_lower, min_lower + min_diff)
            }
        } else {
            let (mut lower, upper) = (self.lower_threshold, self.upper_threshold);
            if upper - lower < min_diff {
                lower = 0.5 * (lower + upper - min_diff);
            }
            (lower, upper)
        };
        let lower = lower.max(min_lower);
        (lower, upper.max(lower + min_diff))
    }

    fn sort(&self, strata: &mut Stratigraphy, diameters: &[f64]) -> Result<bool> {
        if strata.len() < 2 {
            return Err(SedflowError::StrataLayerCount {
                strategy: "threshold based sorting",
                expected: "at least 2",
                found: strata.len(),
            });
        }
        let increment = self.increment_layer_thickness;
        let active_thickness = strata.layers[0].overall_volume();
        let (lower, upper) = self.thresholds(strata.active(), diameters);
        let thickness = 0.5 * (lower + upper);
        let base = strata.len() - 1;
        let settled = |strata: &Stratigraphy| (strata.layers[0].overall_volume() - thickness).abs() <= 0.5 * increment;

        if active_thickness < lower {
            if strata.layers[1].overall_volume() <= 0.0 {
                return Ok(false);
            }
            loop {
                let previous_active = strata.layers[0].clone();
                for i in 0..base.saturating_sub(1) {
                    strata.layers[i] = strata.layers[i + 1].clone();
                }
                let base_volume = strata.layers[base].overall_volume();
                let share = if base_volume > 0.0 { (increment / base_volume).min(1.0) } else { 0.0 };
                let update = strata.layers[base].scaled(share)?;
                strata.layers[base].subtract(&update)?;
                strata.layers[base - 1] = update;
                strata.layers[0].add(&previous_active)?;
                if settled(strata) || strata.layers[1].overall_volume() <= 0.0 {
                    break;
                }
            }
            Ok(true)
        } else if active_thickness > upper {
            let update = strata.layers[0].scaled(increment / active_thickness)?;
            loop {
                let previous_base = strata.layers[base].clone();
                for i in (2..=base).rev() {
                    strata.layers[i] = strata.layers[i - 1].clone();
                }
                strata.layers[1] = update.clone();
                strata.layers[0].subtract(&update)?;
                strata.layers[base].add(&previous_base)?;
                if settled(strata) || strata.layers[0].overall_volume() <= 0.0 {
                    break;
                }
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

// ── Two-layer continuous exchange ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousSorting {
    pub layer_thickness: f64,
    #[serde(default)]
    pub dynamic_layer_thickness: bool,
    #[serde(default = "default_thickness_factor")]
    pub layer_thickness_factor: f64,
    #[serde(default = "default_reference_percentile")]
    pub reference_grain_size_percentile: f64,
}

fn default_thickness_factor() -> f64 {
    2.0
}

impl ContinuousSorting {
    pub fn validate(&self) -> Result<()> {
        if !(self.layer_thickness > 0.0) {
            return Err(SedflowError::invalid("layer_thickness", "must be positive"));
        }
        if !(self.layer_thickness_factor > 0.0) {
            return Err(SedflowError::invalid("layer_thickness_factor", "must be positive"));
        }
        Ok(())
    }

    pub fn target_thickness(&self, active: &GrainMixture, diameters: &[f64]) -> f64 {
        dynamic_thickness(
            self.layer_thickness,
            self.dynamic_layer_thickness,
            self.layer_thickness_factor,
            self.reference_grain_size_percentile,
            active,
            diameters,
        )
    }

    fn sort(&self, strata: &mut Stratigraphy, diameters: &[f64]) -> Result<bool> {
        check_two_layers("two-layer continuous sorting", strata)?;
        let target = self.target_thickness(strata.active(), diameters);
        let active = strata.layers[0].overall_volume();
        let sub = strata.layers[1].overall_volume();
        if active < target && sub > 0.0 {
            let update = strata.layers[1].scaled((target - active) / sub)?;
            let update = strata.layers[1].subtract(&update)?;
            strata.layers[0].add(&update)?;
            Ok(true)
        } else if active > target {
            let update = strata.layers[0].scaled((active - target) / active)?;
            let update = strata.layers[0].subtract(&update)?;
            strata.layers[1].add(&update)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

// ── Two-layer exchange driven by bed shear stress ────────────────────────────

/// Dimensionless shear stresses between which the sublayer starts to
/// contribute to material pulled into the active layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakUpConditions {
    pub median_diameter: f64,
    pub theta_critical_sublayer: f64,
    pub theta_critical_active_layer: f64,
}

impl BreakUpConditions {
    fn sublayer_influence(&self, bed_shear_stress: f64, ctx: &SimulationContext) -> f64 {
        let theta = ctx.physics.dimensionless_shear_stress(bed_shear_stress, self.median_diameter);
        let span = self.theta_critical_active_layer - self.theta_critical_sublayer;
        if span > 0.0 {
            ((theta - self.theta_critical_sublayer) / span).clamp(0.0, 1.0)
        } else if theta >= self.theta_critical_sublayer {
            1.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShearStressSorting {
    pub layer_thickness: f64,
    #[serde(default)]
    pub dynamic_layer_thickness: bool,
    #[serde(default = "default_thickness_factor")]
    pub layer_thickness_factor: f64,
    #[serde(default = "default_reference_percentile")]
    pub reference_grain_size_percentile: f64,
    /// Critical dimensionless shear stress for initiation of motion of the
    /// sublayer material.
    pub theta_critical: f64,
    /// Recompute break-up conditions from the current layers on every sort.
    #[serde(default)]
    pub dynamic_break_up_conditions: bool,
    /// Fixed break-up conditions shared by all reaches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predefined: Option<BreakUpConditions>,
}

impl ShearStressSorting {
    pub fn validate(&self) -> Result<()> {
        ContinuousSorting {
            layer_thickness: self.layer_thickness,
            dynamic_layer_thickness: self.dynamic_layer_thickness,
            layer_thickness_factor: self.layer_thickness_factor,
            reference_grain_size_percentile: self.reference_grain_size_percentile,
        }
        .validate()?;
        if !(self.theta_critical > 0.0) {
            return Err(SedflowError::invalid("theta_critical", "must be positive"));
        }
        if let Some(p) = &self.predefined {
            if !(p.median_diameter > 0.0) {
                return Err(SedflowError::invalid("predefined.median_diameter", "must be positive"));
            }
            if !(p.theta_critical_sublayer > 0.0) {
                return Err(SedflowError::invalid("predefined.theta_critical_sublayer", "must be positive"));
            }
            if p.theta_critical_active_layer <= p.theta_critical_sublayer {
                return Err(SedflowError::invalid(
                    "predefined.theta_critical_active_layer",
                    "must exceed theta_critical_sublayer",
                ));
            }
        }
        Ok(())
    }

    pub fn target_thickness(&self, active: &GrainMixture, diameters: &[f64]) -> f64 {
        dynamic_thickness(
            self.layer_thickness,
            self.dynamic_layer_thickness,
            self.layer_thickness_factor,
            self.reference_grain_size_percentile,
            active,
            diameters,
        )
    }

    fn sublayer_influence(&self, strata: &mut Stratigraphy, active: f64, bed_shear_stress: f64, ctx: &SimulationContext) -> f64 {
        if let Some(predefined) = &self.predefined {
            return predefined.sublayer_influence(bed_shear_stress, ctx);
        }
        if (self.dynamic_break_up_conditions || strata.break_up.is_none()) && active > 0.0 {
            let diameters = &ctx.physics.grain_diameters;
            let mean_active = strata.layers[0].arithmetic_mean_diameter(diameters);
            let mean_sub = strata.layers[1].arithmetic_mean_diameter(diameters).min(mean_active);
            strata.break_up = Some(BreakUpConditions {
                median_diameter: strata.layers[0].percentile_diameter(diameters, 50.0),
                theta_critical_sublayer: self.theta_critical,
                theta_critical_active_layer: (mean_active / mean_sub).powf(2.0 / 3.0) * self.theta_critical,
            });
        }
        strata
            .break_up
            .as_ref()
            .map_or(1.0, |b| b.sublayer_influence(bed_shear_stress, ctx))
    }

    fn sort(&self, strata: &mut Stratigraphy, bed_shear_stress: f64, ctx: &SimulationContext) -> Result<bool> {
        check_two_layers("two-layer shear stress sorting", strata)?;
        let target = self.target_thickness(strata.active(), &ctx.physics.grain_diameters);
        let active = strata.layers[0].overall_volume();
        let sub = strata.layers[1].overall_volume();
        if active < target && sub > 0.0 {
            self.sort_upward(strata, target, active, sub, bed_shear_stress, ctx)?;
            Ok(true)
        } else if active > target {
            sort_downward(strata, target, active, sub)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn sort_upward(
        &self,
        strata: &mut Stratigraphy,
        target: f64,
        active: f64,
        sub: f64,
        bed_shear_stress: f64,
        ctx: &SimulationContext,
    ) -> Result<()> {
        let mut influence = self.sublayer_influence(strata, active, bed_shear_stress, ctx);
        if active <= 0.0 {
            influence = 1.0;
        }
        let update_thickness = (target - active).min(sub);
        if update_thickness == sub {
            strata.sublayer_memory = Some(strata.layers[1].clone());
        }
        let mut update = strata.layers[1].scaled(influence * update_thickness / sub)?;
        if influence < 1.0 {
            update.add(&strata.layers[0].scaled((1.0 - influence) * update_thickness / active)?)?;
        }
        let taken = strata.layers[1].scaled(update_thickness / sub)?;
        strata.layers[1].subtract(&taken)?;
        strata.layers[0].add(&update)
    }
}

/// Downward exchange of the shear-stress strategy: the active layer is scaled
/// to the target, the sublayer absorbs the excess in its own composition.
fn sort_downward(strata: &mut Stratigraphy, target: f64, active: f64, sub: f64) -> Result<()> {
    strata.layers[0].scale(target / active)?;
    let remaining = sub + active - target;
    if sub > 0.0 {
        strata.layers[1].scale(remaining / sub)?;
    } else {
        let base = strata
            .sublayer_memory
            .clone()
            .unwrap_or_else(|| strata.layers[0].clone());
        strata.layers[1] = base.normalized_to(remaining)?;
    }
    Ok(())
}
