//! Bedload transport capacity.
//!
//! Rickenmann's discharge-based relation has no fractional hiding and moves
//! material distributed like its base, normally the active layer:
//!
//! ```text
//! q_c = 0.065 (s − 1)^1.67 √g d50^1.5 S_bed^−1.12      [× (d90/dm)^(10/9)]
//! Φ   = 3.1 (s − 1)^−1.5 (d90/d30)^0.2 (q − q_c) S^1.5 × active width
//! ```
//!
//! The Wilcock & Crowe (2003) surface-based model evaluates every grain class
//! against its own reference shear stress, reduced for fine and raised for
//! coarse classes by the hiding function
//!
//! ```text
//! τ_ri = τ_rm (d_i/d_m)^b,   b = 0.67 / (1 + exp(1.5 − d_i/d_m))
//! ```
use serde::{Deserialize, Serialize};

use crate::channel::steep_slope_corrected;
use crate::context::SimulationContext;
use crate::error::{Result, SedflowError};
use crate::grains::GrainMixture;
use crate::network::Reach;

/// Below this active layer volume the reach has nothing to transport of its
/// own and passes on what arrives from upstream.
pub const BYPASS_VOLUME: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportCapacityModel {
    RickenmannNonFractional {
        #[serde(default)]
        correction_for_steep_slopes: bool,
        /// Raise the critical discharge with the coarseness of the surface.
        #[serde(default)]
        armour: bool,
    },
    /// Fractional transport of Wilcock & Crowe.  The sand content of the
    /// base sets the reference Shields number unless a constant is given.
    WilcockCrowe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        constant_sand_fraction: Option<f64>,
    },
}

/// Grain size range counted as sand, in metres.
const SAND_RANGE: (f64, f64) = (0.0000625, 0.002);

/// Dimensionless transport rate `W*` of a grain class at relative shear
/// stress `phi = τ / τ_ri`.
pub(crate) fn wilcock_crowe_transport(phi: f64) -> f64 {
    if phi < 1.35 {
        0.002 * phi.powf(7.5)
    } else {
        14.0 * (1.0 - 0.894 / phi.sqrt()).powf(4.5)
    }
}

impl Default for TransportCapacityModel {
    fn default() -> Self {
        TransportCapacityModel::RickenmannNonFractional {
            correction_for_steep_slopes: false,
            armour: false,
        }
    }
}

impl TransportCapacityModel {
    pub fn validate(&self) -> Result<()> {
        if let TransportCapacityModel::WilcockCrowe {
            constant_sand_fraction: Some(f),
        } = self
        {
            if !(0.0..=1.0).contains(f) {
                return Err(SedflowError::invalid("capacity.constant_sand_fraction", "must lie within [0, 1]"));
            }
        }
        Ok(())
    }

    /// Capacity based on the active layer, or `None` when the active layer is
    /// too thin to serve as a distribution base.
    pub fn evaluate(&self, reach: &Reach, ctx: &SimulationContext) -> Result<Option<GrainMixture>> {
        let active = reach.strata.active();
        if active.overall_volume() <= BYPASS_VOLUME {
            return Ok(None);
        }
        self.capacity_for_base(reach, active, ctx).map(Some)
    }

    /// Capacity volume rate evaluated on the distribution base `base`.  A
    /// base of negligible volume yields zero transport.
    pub fn capacity_for_base(&self, reach: &Reach, base: &GrainMixture, ctx: &SimulationContext) -> Result<GrainMixture> {
        let volume = base.overall_volume();
        if volume <= BYPASS_VOLUME {
            return Ok(base.zeroed());
        }
        match self {
            TransportCapacityModel::RickenmannNonFractional {
                correction_for_steep_slopes,
                armour,
            } => {
                let rate = rickenmann_volume(reach, base, *correction_for_steep_slopes, *armour, ctx);
                base.scaled(rate / volume)
            }
            TransportCapacityModel::WilcockCrowe { constant_sand_fraction } => {
                let per_fraction = wilcock_crowe_fractions(reach, base, *constant_sand_fraction, ctx);
                GrainMixture::distribute_fractional_abundance(&per_fraction, base)
            }
        }
    }
}

fn rickenmann_volume(
    reach: &Reach,
    base: &GrainMixture,
    correction_for_steep_slopes: bool,
    armour: bool,
    ctx: &SimulationContext,
) -> f64 {
    let state = &reach.state;
    if state.bedslope <= 0.0 || state.discharge <= 0.0 {
        return 0.0;
    }
    let diameters = &ctx.physics.grain_diameters;
    let d90 = base.percentile_diameter(diameters, 90.0);
    let d50 = base.percentile_diameter(diameters, 50.0);
    let d30 = base.percentile_diameter(diameters, 30.0);
    let s_minus_one = ctx.physics.relative_submerged_density();

    let mut q_critical =
        0.065 * s_minus_one.powf(1.67) * ctx.physics.gravity.sqrt() * d50.powf(1.5) * state.bedslope.powf(-1.12);
    if armour {
        q_critical *= (d90 / base.arithmetic_mean_diameter(diameters)).powf(10.0 / 9.0);
    }

    // Virtual rectangle with the mean depth above the active width.
    let geometry = reach.channel.geometry();
    let flow_depth = geometry.mean_depth_within_active_width(state.maximum_water_depth, state.active_width);
    if flow_depth <= 0.0 {
        return 0.0;
    }
    let flow_width = geometry.cross_sectional_area(state.maximum_water_depth) / flow_depth;
    let q = state.discharge / flow_width;

    let mut slope = state.sediment_energy_slope.max(0.0);
    if correction_for_steep_slopes {
        slope = steep_slope_corrected(slope, ctx.physics.angle_of_repose(), state.bedslope);
    }
    if q > q_critical {
        3.1 * s_minus_one.powf(-1.5) * (d90 / d30).powf(0.2) * (q - q_critical) * slope.powf(1.5) * state.active_width
    } else {
        0.0
    }
}

/// Per-class capacity volume rates of Wilcock & Crowe for the surface `base`.
fn wilcock_crowe_fractions(
    reach: &Reach,
    base: &GrainMixture,
    constant_sand_fraction: Option<f64>,
    ctx: &SimulationContext,
) -> Vec<f64> {
    let state = &reach.state;
    let abundances = base.overall_fractional_abundance();
    let volume = base.overall_volume();
    let tau = state.bed_shear_stress;
    if !(tau > 0.0) || !(state.active_width > 0.0) || !(volume > 0.0) {
        return vec![0.0; abundances.len()];
    }
    let physics = &ctx.physics;
    let diameters = &physics.grain_diameters;
    let sand = constant_sand_fraction
        .unwrap_or_else(|| base.volume_within_diameter_range(diameters, SAND_RANGE.0, SAND_RANGE.1) / volume);
    let theta_rm = 0.021 + 0.015 * (-20.0 * sand).exp();
    let mean = base.geometric_mean_diameter(diameters);
    let tau_rm = theta_rm * (physics.sediment_density - physics.water_density) * physics.gravity * mean;
    let shear_velocity = (tau / physics.water_density).sqrt();
    let scale = state.active_width * shear_velocity.powi(3) / (physics.relative_submerged_density() * physics.gravity);

    abundances
        .iter()
        .zip(diameters)
        .map(|(&p, &d)| {
            let relative = d / mean;
            let tau_ri = tau_rm * relative.powf(0.67 / (1.0 + (1.5 - relative).exp()));
            scale * (p / volume) * wilcock_crowe_transport(tau / tau_ri)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::active_width;
    use crate::grains::GrainKind;
    use crate::network::tests::single_reach;
    use approx::assert_relative_eq;

    fn flowing(slope: f64, discharge: f64, depth: f64) -> (Reach, SimulationContext) {
        let (mut reach, ctx) = single_reach(slope);
        reach.state.discharge = discharge;
        reach.state.maximum_water_depth = depth;
        reach.state.active_width = active_width(&reach);
        (reach, ctx)
    }

    #[test]
    fn capacity_vanishes_below_critical_discharge() {
        let model = TransportCapacityModel::default();
        let (reach, ctx) = flowing(0.01, 0.01, 0.01);
        let rate = model.evaluate(&reach, &ctx).unwrap().unwrap();
        assert!(rate.is_zero(), "trickle must not move gravel: {}", rate.overall_volume());
    }

    #[test]
    fn capacity_follows_active_layer_distribution() {
        let model = TransportCapacityModel::default();
        let (reach, ctx) = flowing(0.02, 10.0, 0.8);
        let rate = model.evaluate(&reach, &ctx).unwrap().unwrap();
        assert!(rate.overall_volume() > 0.0, "flood must transport");
        let active = reach.strata.active().overall_fractional_abundance();
        let moved = rate.overall_fractional_abundance();
        for (a, m) in active.iter().zip(&moved) {
            assert_relative_eq!(a, m, epsilon = 1e-12);
        }
    }

    #[test]
    fn capacity_grows_with_discharge_and_armour_reduces_it() {
        let (low, ctx) = flowing(0.02, 5.0, 0.5);
        let (high, _) = flowing(0.02, 10.0, 0.5);
        let plain = TransportCapacityModel::default();
        let armoured = TransportCapacityModel::RickenmannNonFractional {
            correction_for_steep_slopes: false,
            armour: true,
        };
        let v = |m: &TransportCapacityModel, r: &Reach| m.evaluate(r, &ctx).unwrap().unwrap().overall_volume();
        assert!(v(&plain, &high) > v(&plain, &low), "more water, more bedload");
        assert!(v(&armoured, &high) < v(&plain, &high), "armouring raises the threshold");
    }

    #[test]
    fn empty_active_layer_requests_bypass() {
        let (mut reach, ctx) = flowing(0.02, 10.0, 0.8);
        reach.strata.layers[0] = reach.strata.active().zeroed();
        let model = TransportCapacityModel::default();
        assert!(model.evaluate(&reach, &ctx).unwrap().is_none(), "thin active layer must bypass");
        let upstream = GrainMixture::normal(vec![0.0, 1e-3, 1e-3, 0.0]).unwrap();
        let bypassed = model.capacity_for_base(&reach, &upstream, &ctx).unwrap();
        assert_eq!(bypassed.fraction(GrainKind::Normal, 0), Some(0.0));
        assert!(bypassed.overall_volume() > 0.0);
    }

    #[test]
    fn wilcock_crowe_matches_hand_computed_single_class() {
        let (mut reach, ctx) = flowing(0.02, 10.0, 0.8);
        // Sand-free surface: τ_rm = 0.036 × 1650 kg/m³ × 9.81 m/s² × 0.008 m.
        let tau_rm = 0.036 * 1650.0 * 9.81 * 0.008;
        reach.state.bed_shear_stress = 2.0 * tau_rm;
        let base = GrainMixture::normal(vec![0.0, 0.6, 0.0, 0.0]).unwrap();
        let model = TransportCapacityModel::WilcockCrowe { constant_sand_fraction: None };
        let rate = model.capacity_for_base(&reach, &base, &ctx).unwrap();
        // W* = 14 (1 − 0.894/√2)^4.5 = 0.155463, q = b W* u*³ / ((s − 1) g).
        assert_relative_eq!(rate.overall_volume(), 4.32323e-5, max_relative = 1e-5);
        assert_eq!(rate.fraction(GrainKind::Normal, 0), Some(0.0), "absent classes do not move");
    }

    #[test]
    fn wilcock_crowe_branches_meet_at_the_break_point() {
        let below = wilcock_crowe_transport(1.35 - 1e-12);
        let above = wilcock_crowe_transport(1.35);
        assert_relative_eq!(below, above, max_relative = 1e-3);
        assert!(wilcock_crowe_transport(0.5) < wilcock_crowe_transport(1.0));
    }

    #[test]
    fn hiding_mobilises_coarse_grains_in_a_mixture() {
        let (mut reach, ctx) = flowing(0.02, 10.0, 0.8);
        let mean = (0.008f64 * 0.032).sqrt();
        reach.state.bed_shear_stress = 2.0 * 0.036 * 1650.0 * 9.81 * mean;
        let base = GrainMixture::normal(vec![0.0, 0.5, 0.5, 0.0]).unwrap();
        let model = TransportCapacityModel::WilcockCrowe { constant_sand_fraction: None };
        let rate = model.capacity_for_base(&reach, &base, &ctx).unwrap();
        let fine = rate.fraction(GrainKind::Normal, 1).unwrap();
        let coarse = rate.fraction(GrainKind::Normal, 2).unwrap();
        assert!(fine > coarse, "fine grains still move more: {fine:e} vs {coarse:e}");
        // Without hiding the coarse class would sit at φ = 1 and move 0.002/0.97
        // of the fine class; the hiding function lifts it to about 0.158.
        assert_relative_eq!(coarse / fine, 0.158088, max_relative = 1e-4);
    }

    #[test]
    fn wilcock_crowe_needs_shear_stress_and_valid_sand_fraction() {
        let (reach, ctx) = flowing(0.02, 10.0, 0.8);
        let model = TransportCapacityModel::WilcockCrowe { constant_sand_fraction: Some(0.2) };
        let rate = model.evaluate(&reach, &ctx).unwrap().unwrap();
        assert!(rate.is_zero(), "no shear stress, no transport");
        assert!(TransportCapacityModel::WilcockCrowe { constant_sand_fraction: Some(1.5) }
            .validate()
            .is_err());
        assert!(model.validate().is_ok());
    }
}
