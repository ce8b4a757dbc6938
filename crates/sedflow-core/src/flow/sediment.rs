//! Bedload routing: transport capacity, erosion and deposition bookkeeping,
//! and the resulting changes of bed elevation and stratigraphy.
//!
//! Every reach erodes at its transport capacity and receives the erosion of
//! its upstream neighbours as deposition.  When a reach cannot supply what its
//! capacity requests, the missing part is also withheld from the downstream
//! deposition, so no sediment is created at a shortfall.
use serde::{Deserialize, Serialize};

use super::{cfl_candidate, ChangeRate, FlowScheme, SchemeKind};
use crate::capacity::TransportCapacityModel;
use crate::context::SimulationContext;
use crate::error::{Result, SedflowError};
use crate::grains::GrainMixture;
use crate::network::{Reach, ReachNetwork};
use crate::timestep::TimestepCandidate;

/// Start value of the per-reach search for the smallest bound.
const UNBOUNDED_TIMESTEP: f64 = f64::MAX - 4.0;

/// Below this volume the sublayer does not need protecting.
const SUBLAYER_VOLUME: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SedimentRouter {
    #[serde(default)]
    pub capacity: TransportCapacityModel,
    /// Share of the active layer that may be eroded in one step.
    #[serde(default = "default_active_layer_fraction")]
    pub maximum_fraction_of_active_layer_to_be_eroded: f64,
    #[serde(default = "default_prevent_slopes")]
    pub prevent_zero_or_negative_bed_slopes: bool,
    /// Largest relative change of the two-cell bed slope in one step.
    #[serde(default = "default_relative_slope_change")]
    pub maximum_relative_two_cell_bed_slope_change: f64,
}

fn default_active_layer_fraction() -> f64 {
    0.5
}
fn default_prevent_slopes() -> bool {
    true
}
fn default_relative_slope_change() -> f64 {
    0.5
}

impl Default for SedimentRouter {
    fn default() -> Self {
        Self {
            capacity: TransportCapacityModel::default(),
            maximum_fraction_of_active_layer_to_be_eroded: default_active_layer_fraction(),
            prevent_zero_or_negative_bed_slopes: default_prevent_slopes(),
            maximum_relative_two_cell_bed_slope_change: default_relative_slope_change(),
        }
    }
}

/// Copy of `mixture` without the kinds that vanish when eroded.
fn without_ephemeral(mixture: &GrainMixture) -> GrainMixture {
    let mut result = mixture.clone();
    for c in result.components_mut().iter_mut().filter(|c| c.kind.is_ephemeral()) {
        c.fractions.iter_mut().for_each(|v| *v = 0.0);
    }
    result
}

/// Sum of the erosion rates of the upstream neighbours.
fn upstream_erosion_rate(network: &ReachNetwork, index: usize) -> Result<GrainMixture> {
    let mut sum = network.reach(index).state.erosion_rate.zeroed();
    for up in network.upstream_of(index) {
        sum.add(&up.state.erosion_rate)?;
    }
    Ok(sum)
}

/// Halves `start` until `slope_change(dt) / slope` stays within
/// `maximum_relative_change`.
pub(crate) fn halve_until_slope_change_within<F>(
    start: f64,
    slope: f64,
    maximum_relative_change: f64,
    slope_change: F,
) -> Result<f64>
where
    F: Fn(f64) -> Result<f64>,
{
    let mut dt = start;
    while slope_change(dt)? / slope > maximum_relative_change {
        dt /= 2.0;
        if dt < f64::MIN_POSITIVE {
            break;
        }
    }
    Ok(dt)
}

impl SedimentRouter {
    pub fn validate_parameters(&self) -> Result<()> {
        let f = self.maximum_fraction_of_active_layer_to_be_eroded;
        if !(f > 0.0 && f <= 1.0) {
            return Err(SedflowError::invalid(
                "sediment.maximum_fraction_of_active_layer_to_be_eroded",
                "must lie within (0, 1]",
            ));
        }
        if !(self.maximum_relative_two_cell_bed_slope_change > 0.0) {
            return Err(SedflowError::invalid(
                "sediment.maximum_relative_two_cell_bed_slope_change",
                "must be positive",
            ));
        }
        self.capacity.validate()
    }

    /// Net bulk volume change rate `(deposition − erosion) / (1 − n)`.
    fn net_bulk_rate(reach: &Reach, ctx: &SimulationContext) -> f64 {
        (reach.state.deposition_rate.overall_volume() - reach.state.erosion_rate.overall_volume())
            / (1.0 - ctx.physics.pore_fraction)
    }

    fn slope_candidate(
        &self,
        network: &ReachNetwork,
        index: usize,
        found_so_far: f64,
        ctx: &SimulationContext,
    ) -> Result<Option<TimestepCandidate>> {
        let reach = network.reach(index);
        let Some(down) = network.downstream_of(index) else {
            return Ok(None);
        };
        let length = reach.state.length;
        let slope = (reach.state.elevation - down.state.elevation) / length;
        if !self.prevent_zero_or_negative_bed_slopes || !(slope > 0.0) {
            return Ok(None);
        }
        let max_change = self.maximum_relative_two_cell_bed_slope_change;
        let local_rate = Self::net_bulk_rate(reach, ctx);
        // The downstream margin keeps its elevation.
        let down_rate = if down.is_margin() { 0.0 } else { Self::net_bulk_rate(down, ctx) };
        let local = reach
            .channel
            .linear_conversion_factor(reach.state.active_width, length)?;
        let downstream = down
            .channel
            .linear_conversion_factor(down.state.active_width, down.state.length)?;
        let dt = match (local, downstream) {
            (Some(kl), Some(kd)) => {
                let rate = ((kl * local_rate - kd * down_rate) / length).abs();
                if !(rate > 0.0) {
                    return Ok(None);
                }
                max_change * slope / rate
            }
            _ => {
                halve_until_slope_change_within(found_so_far, slope, max_change, |dt| {
                    let dz_local = reach
                        .channel
                        .elevation_increment(local_rate * dt, reach.state.active_width, length)?;
                    let dz_down = down
                        .channel
                        .elevation_increment(down_rate * dt, down.state.active_width, down.state.length)?;
                    Ok(((dz_local - dz_down) / length).abs())
                })?
            }
        };
        Ok(Some(TimestepCandidate {
            dt,
            index,
            bound: "bed slope change",
        }))
    }
}

impl FlowScheme for SedimentRouter {
    fn scheme_kind(&self) -> SchemeKind {
        SchemeKind::Sediment
    }

    fn name(&self) -> &'static str {
        "bedload"
    }

    fn validate(&self, _network: &ReachNetwork, _ctx: &SimulationContext) -> Result<()> {
        self.validate_parameters()
    }

    fn calculate_change_rate(&self, network: &ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<ChangeRate> {
        let rate = self.capacity.evaluate(network.reach(index), ctx)?;
        Ok(ChangeRate::Sediment(rate))
    }

    fn hand_down_change_rate(&self, network: &mut ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<()> {
        let inflow = upstream_erosion_rate(network, index)?;
        if network.reach(index).capacity_bypass {
            let rate = self.capacity.capacity_for_base(network.reach(index), &inflow, ctx)?;
            network.reach_mut(index).state.erosion_rate = rate;
        }
        network.reach_mut(index).state.deposition_rate = without_ephemeral(&inflow);
        Ok(())
    }

    fn timestep_candidates(&self, network: &ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<Vec<TimestepCandidate>> {
        let reach = network.reach(index);
        if reach.is_margin() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(3);
        let velocity = ctx.methods.bedload_velocity.evaluate(reach, ctx);
        out.extend(cfl_candidate(network, index, velocity, "bedload CFL", ctx));

        let protects_sublayer = reach
            .strata
            .layer(1)
            .is_some_and(|l| l.overall_volume() > SUBLAYER_VOLUME);
        if protects_sublayer {
            let per_unit_rate = reach.per_unit_bed_surface(&reach.state.erosion_rate)?.overall_volume();
            if per_unit_rate > 0.0 {
                out.push(TimestepCandidate {
                    dt: reach.strata.active().overall_volume() * self.maximum_fraction_of_active_layer_to_be_eroded
                        / per_unit_rate,
                    index,
                    bound: "active layer erosion",
                });
            }
        }

        let found_so_far = out.iter().map(|c| c.dt).fold(UNBOUNDED_TIMESTEP, f64::min);
        out.extend(self.slope_candidate(network, index, found_so_far, ctx)?);
        Ok(out)
    }

    fn calculate_change(&self, network: &mut ReachNetwork, index: usize, dt: f64, _ctx: &SimulationContext) -> Result<()> {
        let state = &mut network.reach_mut(index).state;
        state.deposition = state.deposition_rate.scaled(dt)?;
        state.erosion = state.erosion_rate.scaled(dt)?;
        Ok(())
    }

    fn hand_down_change(&self, network: &mut ReachNetwork, index: usize, _dt: f64, _ctx: &SimulationContext) -> Result<()> {
        let reach = network.reach(index);
        let (width, length) = (reach.state.active_width, reach.state.length);
        let deposition_pu = reach.per_unit_bed_surface(&reach.state.deposition)?;
        let mut erosion_pu = reach.per_unit_bed_surface(&reach.state.erosion)?;
        let mut shortfall = None;

        if !reach.is_margin() {
            let mut strata = reach.strata.clone();
            strata.deposit(&deposition_pu)?;
            let available = strata.potential_erosion(&erosion_pu)?;
            if available != erosion_pu {
                let actual = reach.channel.overall_from_per_unit_bed_surface(&available, width, length)?;
                let mut missing = reach.state.erosion.clone();
                missing.subtract(&actual)?;
                shortfall = Some((actual, missing));
                erosion_pu = available;
            }
        }

        let downstream = reach.downstream;
        let state = &mut network.reach_mut(index).state;
        state.deposition_per_unit_bed_surface = deposition_pu;
        state.erosion_per_unit_bed_surface = erosion_pu;
        if let Some((actual, missing)) = shortfall {
            state.erosion = actual;
            if let Some(d) = downstream {
                network.reach_mut(d).state.deposition.subtract(&missing)?;
            }
        }
        Ok(())
    }

    fn apply_change(&self, network: &mut ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<()> {
        let reach = network.reach_mut(index);
        if reach.is_margin() {
            return Ok(());
        }
        reach.strata.deposit(&reach.state.deposition_per_unit_bed_surface)?;
        reach.strata.erode(&reach.state.erosion_per_unit_bed_surface)?;
        let net = (reach.state.deposition.overall_volume() - reach.state.erosion.overall_volume())
            / (1.0 - ctx.physics.pore_fraction);
        let dz = reach
            .channel
            .elevation_increment(net, reach.state.active_width, reach.state.length)?;
        reach.state.elevation += dz;
        Ok(())
    }

    fn update_other_parameters(&self, network: &mut ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<()> {
        let reach = network.reach_mut(index);
        if reach.is_margin() {
            return Ok(());
        }
        let tau = reach.state.bed_shear_stress;
        ctx.methods.strata_sorting.sort(&mut reach.strata, tau, ctx)?;
        Ok(())
    }

    fn hand_down_other_parameters(&self, network: &mut ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<()> {
        let methods = &ctx.methods;
        let bedslope = methods.bedslope.evaluate(network, index, ctx)?;
        network.reach_mut(index).state.bedslope = bedslope;
        if methods.water_energy_slope.depends_on_bedslope() {
            let water = methods.water_energy_slope.evaluate(network, index, ctx)?;
            network.reach_mut(index).state.water_energy_slope = water;
            if methods.sediment_energy_slope.depends_on_water_energy_slope() {
                let sediment = methods.sediment_energy_slope.evaluate(network, index, ctx)?;
                network.reach_mut(index).state.sediment_energy_slope = sediment;
            }
        }
        if methods.sediment_energy_slope.depends_on_bedslope() {
            let sediment = methods.sediment_energy_slope.evaluate(network, index, ctx)?;
            network.reach_mut(index).state.sediment_energy_slope = sediment;
        }
        Ok(())
    }
}
