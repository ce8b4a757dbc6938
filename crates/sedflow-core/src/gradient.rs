//! Slope evaluators for bed, water energy and sediment energy slopes.
//!
//! All evaluators are read-only over the network and return one slope per
//! reach.  Margins and reaches next to the downstream margin fall back to the
//! stored bed slope where a stencil would otherwise use boundary values.
use serde::{Deserialize, Serialize};

use crate::context::SimulationContext;
use crate::error::{Result, SedflowError};
use crate::network::{Reach, ReachNetwork};

/// Scalar reach property a gradient may be taken of, or weighted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradientProperty {
    Elevation,
    HydraulicHead,
    WaterLevel,
    MaximumWaterDepth,
    FlowVelocity,
    Discharge,
    Length,
    ActiveWidth,
    BedShearStress,
}

impl GradientProperty {
    pub fn value(self, reach: &Reach, gravity: f64) -> f64 {
        let s = &reach.state;
        match self {
            GradientProperty::Elevation => s.elevation,
            GradientProperty::HydraulicHead => reach.hydraulic_head(gravity),
            GradientProperty::WaterLevel => reach.water_level(),
            GradientProperty::MaximumWaterDepth => s.maximum_water_depth,
            GradientProperty::FlowVelocity => s.flow_velocity,
            GradientProperty::Discharge => s.discharge,
            GradientProperty::Length => s.length,
            GradientProperty::ActiveWidth => s.active_width,
            GradientProperty::BedShearStress => s.bed_shear_stress,
        }
    }

    fn uses_water_surface(self) -> bool {
        matches!(self, GradientProperty::HydraulicHead | GradientProperty::WaterLevel)
    }

    /// Value of `reach` as seen from upstream, i.e. with its sill crest or
    /// overfall head taken into account.
    fn downstream_value(self, reach: &Reach, location: &str, gravity: f64) -> Result<f64> {
        let value = self.value(reach, gravity);
        let Some(sill) = &reach.sill else {
            return Ok(value);
        };
        match self {
            GradientProperty::Elevation => Ok(value.max(sill.top_edge_elevation)),
            GradientProperty::HydraulicHead => {
                Ok(value.max(sill.free_overfall_hydraulic_head(reach.state.discharge, gravity)))
            }
            GradientProperty::WaterLevel | GradientProperty::MaximumWaterDepth | GradientProperty::FlowVelocity => {
                Err(SedflowError::UnsupportedSillProperty {
                    property: format!("{self:?}"),
                    location: location.to_string(),
                })
            }
            _ => Ok(value),
        }
    }
}

/// Sediment volume property used to weight confluence branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixtureProperty {
    ErosionRate,
    DepositionRate,
    Erosion,
    Deposition,
    /// Whole stratigraphy; has no single volume and is rejected.
    Strata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Weighting {
    Scalar { property: GradientProperty },
    Volume { property: MixtureProperty },
}

impl Default for Weighting {
    fn default() -> Self {
        Weighting::Scalar { property: GradientProperty::Discharge }
    }
}

impl Weighting {
    fn validate(&self) -> Result<()> {
        match self {
            Weighting::Volume { property: MixtureProperty::Strata } => {
                Err(SedflowError::UnsupportedWeighting { property: "strata".into() })
            }
            _ => Ok(()),
        }
    }

    fn weight(&self, reach: &Reach, gravity: f64) -> Result<f64> {
        let s = &reach.state;
        Ok(match self {
            Weighting::Scalar { property } => property.value(reach, gravity),
            Weighting::Volume { property } => match property {
                MixtureProperty::ErosionRate => s.erosion_rate.overall_volume(),
                MixtureProperty::DepositionRate => s.deposition_rate.overall_volume(),
                MixtureProperty::Erosion => s.erosion.overall_volume(),
                MixtureProperty::Deposition => s.deposition.overall_volume(),
                MixtureProperty::Strata => {
                    return Err(SedflowError::UnsupportedWeighting { property: "strata".into() })
                }
            },
        })
    }
}

// ── Evaluators ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GradientEvaluator {
    /// `(local − downstream) / local length`.
    DownstreamTwoCell {
        property: GradientProperty,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum_slope: Option<f64>,
    },
    /// `(upstream − downstream) / (upstream length + local length)`, averaged
    /// over the branches of a confluence.
    ThreeCell {
        property: GradientProperty,
        #[serde(default)]
        weighting: Weighting,
    },
    ReturnBedslope {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum_slope: Option<f64>,
    },
    ReturnWaterEnergySlope {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum_slope: Option<f64>,
    },
}

fn floored(slope: f64, minimum: Option<f64>) -> f64 {
    match minimum {
        Some(m) => slope.max(m),
        None => slope,
    }
}

impl GradientEvaluator {
    pub fn validate(&self) -> Result<()> {
        match self {
            GradientEvaluator::ThreeCell { weighting, .. } => weighting.validate(),
            GradientEvaluator::DownstreamTwoCell { minimum_slope, .. }
            | GradientEvaluator::ReturnBedslope { minimum_slope }
            | GradientEvaluator::ReturnWaterEnergySlope { minimum_slope } => match minimum_slope {
                Some(m) if !m.is_finite() => Err(SedflowError::invalid("minimum_slope", "must be finite")),
                _ => Ok(()),
            },
        }
    }

    pub fn depends_on_bedslope(&self) -> bool {
        matches!(self, GradientEvaluator::ReturnBedslope { .. })
    }

    pub fn depends_on_water_energy_slope(&self) -> bool {
        matches!(self, GradientEvaluator::ReturnWaterEnergySlope { .. })
    }

    pub fn evaluate(&self, network: &ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<f64> {
        let reach = network.reach(index);
        let g = ctx.physics.gravity;
        match self {
            GradientEvaluator::ReturnBedslope { minimum_slope } => Ok(floored(reach.state.bedslope, *minimum_slope)),
            GradientEvaluator::ReturnWaterEnergySlope { minimum_slope } => {
                Ok(floored(reach.state.water_energy_slope, *minimum_slope))
            }
            GradientEvaluator::DownstreamTwoCell { property, minimum_slope } => {
                let Some(down) = network.downstream_of(index) else {
                    return Ok(floored(reach.state.bedslope, *minimum_slope));
                };
                if property.uses_water_surface() && down.is_downstream_margin() {
                    return Ok(floored(reach.state.bedslope, *minimum_slope));
                }
                let downstream = property.downstream_value(down, &network.label(index), g)?;
                let slope = (property.value(reach, g) - downstream) / reach.state.length;
                Ok(floored(slope, *minimum_slope))
            }
            GradientEvaluator::ThreeCell { property, weighting } => {
                weighting.validate()?;
                let down = match network.downstream_of(index) {
                    Some(down) if !reach.is_margin() => down,
                    _ => return Ok(reach.state.bedslope),
                };
                if property.uses_water_surface() && down.is_downstream_margin() {
                    return Ok(reach.state.bedslope);
                }
                let downstream = property.downstream_value(down, &network.label(index), g)?;
                let length = reach.state.length;
                let branch = |up: &Reach| (property.value(up, g) - downstream) / (up.state.length + length);
                if reach.upstream.len() == 1 {
                    return Ok(branch(network.reach(reach.upstream[0])));
                }
                let mut weighted = 0.0;
                let mut total = 0.0;
                for up in network.upstream_of(index) {
                    let w = weighting.weight(up, g)?;
                    weighted += branch(up) * w;
                    total += w;
                }
                if total > 0.0 {
                    return Ok(weighted / total);
                }
                // No branch carries weight: plain mean over the branches.
                let branches = reach.upstream.len() as f64;
                Ok(network.upstream_of(index).map(branch).sum::<f64>() / branches)
            }
        }
    }

    pub fn evaluate_all(&self, network: &ReachNetwork, ctx: &SimulationContext) -> Result<Vec<f64>> {
        (0..network.len()).map(|i| self.evaluate(network, i, ctx)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{PoleniSill, Sill};
    use crate::network::tests::{descriptor, test_context};
    use approx::assert_relative_eq;

    fn chain() -> ReachNetwork {
        ReachNetwork::from_descriptors(vec![
            descriptor(1, Some(2), 3.0),
            descriptor(2, Some(3), 2.0),
            descriptor(3, None, 1.5),
        ])
        .unwrap()
    }

    #[test]
    fn two_cell_slope_uses_local_length() {
        let net = chain();
        let ctx = test_context();
        let eval = GradientEvaluator::DownstreamTwoCell {
            property: GradientProperty::Elevation,
            minimum_slope: None,
        };
        assert_relative_eq!(eval.evaluate(&net, 1, &ctx).unwrap(), 0.01);
        assert_relative_eq!(eval.evaluate(&net, 2, &ctx).unwrap(), 0.005);
        let floored = GradientEvaluator::DownstreamTwoCell {
            property: GradientProperty::Elevation,
            minimum_slope: Some(0.008),
        };
        assert_relative_eq!(floored.evaluate(&net, 2, &ctx).unwrap(), 0.008);
    }

    #[test]
    fn water_surface_next_to_outlet_returns_bedslope() {
        let mut net = chain();
        let ctx = test_context();
        net.reach_mut(3).state.bedslope = 0.042;
        let eval = GradientEvaluator::DownstreamTwoCell {
            property: GradientProperty::WaterLevel,
            minimum_slope: None,
        };
        assert_relative_eq!(eval.evaluate(&net, 3, &ctx).unwrap(), 0.042);
        let m = net.downstream_margin();
        net.reach_mut(m).state.bedslope = 0.03;
        assert_relative_eq!(eval.evaluate(&net, m, &ctx).unwrap(), 0.03, epsilon = 1e-12);
    }

    #[test]
    fn three_cell_spans_both_neighbours() {
        let net = chain();
        let ctx = test_context();
        let eval = GradientEvaluator::ThreeCell {
            property: GradientProperty::Elevation,
            weighting: Weighting::default(),
        };
        assert_relative_eq!(eval.evaluate(&net, 2, &ctx).unwrap(), (3.0 - 1.5) / 200.0);
    }

    #[test]
    fn confluence_weights_branches() {
        let mut net = ReachNetwork::from_descriptors(vec![
            descriptor(1, Some(3), 3.0),
            descriptor(2, Some(3), 5.0),
            descriptor(3, Some(4), 2.0),
            descriptor(4, None, 1.0),
        ])
        .unwrap();
        let ctx = test_context();
        net.reach_mut(1).state.discharge = 1.0;
        net.reach_mut(3).state.discharge = 3.0;
        let eval = GradientEvaluator::ThreeCell {
            property: GradientProperty::Elevation,
            weighting: Weighting::Scalar { property: GradientProperty::Discharge },
        };
        let expected = (0.01 * 1.0 + 0.02 * 3.0) / 4.0;
        assert_relative_eq!(eval.evaluate(&net, 4, &ctx).unwrap(), expected, epsilon = 1e-12);

        let strata = GradientEvaluator::ThreeCell {
            property: GradientProperty::Elevation,
            weighting: Weighting::Volume { property: MixtureProperty::Strata },
        };
        assert!(strata.validate().is_err(), "strata weighting must be rejected");
        assert!(strata.evaluate(&net, 4, &ctx).is_err());
    }

    #[test]
    fn dry_confluence_falls_back_to_plain_mean() {
        let net = ReachNetwork::from_descriptors(vec![
            descriptor(1, Some(3), 3.0),
            descriptor(2, Some(3), 5.0),
            descriptor(3, Some(4), 2.0),
            descriptor(4, None, 1.0),
        ])
        .unwrap();
        let ctx = test_context();
        let eval = GradientEvaluator::ThreeCell {
            property: GradientProperty::Elevation,
            weighting: Weighting::Scalar { property: GradientProperty::Discharge },
        };
        let slope = eval.evaluate(&net, 4, &ctx).unwrap();
        assert!(slope.is_finite(), "both branches dry gave {slope}");
        assert_relative_eq!(slope, (0.01 + 0.02) / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn sill_raises_downstream_elevation_and_rejects_depth() {
        let mut net = chain();
        let ctx = test_context();
        net.reach_mut(2).sill = Some(Sill {
            top_edge_elevation: 2.5,
            weir: PoleniSill { overfall_width: 5.0, poleni_factor: 0.577 },
        });
        let elevation = GradientEvaluator::DownstreamTwoCell {
            property: GradientProperty::Elevation,
            minimum_slope: None,
        };
        assert_relative_eq!(elevation.evaluate(&net, 1, &ctx).unwrap(), 0.005);
        let depth = GradientEvaluator::DownstreamTwoCell {
            property: GradientProperty::MaximumWaterDepth,
            minimum_slope: None,
        };
        assert!(matches!(
            depth.evaluate(&net, 1, &ctx),
            Err(SedflowError::UnsupportedSillProperty { .. })
        ));
    }

    #[test]
    fn return_evaluators_floor_stored_slopes() {
        let mut net = chain();
        let ctx = test_context();
        net.reach_mut(2).state.bedslope = -0.01;
        net.reach_mut(2).state.water_energy_slope = 0.02;
        let bed = GradientEvaluator::ReturnBedslope { minimum_slope: Some(0.0) };
        let water = GradientEvaluator::ReturnWaterEnergySlope { minimum_slope: None };
        assert_eq!(bed.evaluate(&net, 2, &ctx).unwrap(), 0.0);
        assert_eq!(water.evaluate(&net, 2, &ctx).unwrap(), 0.02);
        assert!(bed.depends_on_bedslope() && !bed.depends_on_water_energy_slope());
        assert!(water.depends_on_water_energy_slope());
    }
}
