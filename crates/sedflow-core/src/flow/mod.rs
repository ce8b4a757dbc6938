//! Flow schemes and the phased lifecycle every scheme goes through per step.
//!
//! A step runs each scheme through rate evaluation, the serial hand-down of
//! rates, a timestep proposal, change evaluation and the commit phases.  Only
//! [`FlowScheme::calculate_change_rate`] and the timestep candidates run as a
//! parallel map; everything else walks the network in canonical order (or in
//! reverse for [`FlowScheme::update_other_parameters`]).
pub mod explicit;
pub mod implicit;
pub mod sediment;
pub mod uniform;

pub use sediment::SedimentRouter;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::SimulationContext;
use crate::error::{Result, SedflowError};
use crate::grains::GrainMixture;
use crate::network::{Reach, ReachNetwork};
use crate::timestep::{TimestepCandidate, TimestepMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeKind {
    Water,
    Sediment,
}

/// Result of the read-only rate phase for one reach.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRate {
    /// Water volume change rate in m³/s.
    Water(f64),
    /// Erosion rate, or `None` when the reach passes on upstream material.
    Sediment(Option<GrainMixture>),
    Unchanged,
}

pub trait FlowScheme: Send + Sync {
    fn scheme_kind(&self) -> SchemeKind;

    fn name(&self) -> &'static str;

    /// Checks the scheme against the network it is about to route.
    fn validate(&self, _network: &ReachNetwork, _ctx: &SimulationContext) -> Result<()> {
        Ok(())
    }

    fn calculate_change_rate(&self, network: &ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<ChangeRate>;

    fn hand_down_change_rate(&self, _network: &mut ReachNetwork, _index: usize, _ctx: &SimulationContext) -> Result<()> {
        Ok(())
    }

    fn update_change_rate_depending_parameters(
        &self,
        _network: &mut ReachNetwork,
        _index: usize,
        _ctx: &SimulationContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Stability bounds contributed by one reach.
    fn timestep_candidates(&self, network: &ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<Vec<TimestepCandidate>>;

    /// Smallest admissible timestep of this scheme, `None` if unbounded.
    fn calculate_time_step(
        &self,
        network: &ReachNetwork,
        ctx: &SimulationContext,
        monitor: &TimestepMonitor,
    ) -> Result<Option<TimestepCandidate>> {
        let per_reach = par_map(network.len(), |i| self.timestep_candidates(network, i, ctx))?;
        monitor.reduce(&per_reach.concat(), network)
    }

    fn calculate_change(&self, network: &mut ReachNetwork, index: usize, dt: f64, ctx: &SimulationContext) -> Result<()>;

    fn hand_down_change(&self, _network: &mut ReachNetwork, _index: usize, _dt: f64, _ctx: &SimulationContext) -> Result<()> {
        Ok(())
    }

    fn apply_change(&self, network: &mut ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<()>;

    fn update_other_parameters(&self, network: &mut ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<()>;

    fn hand_down_other_parameters(&self, network: &mut ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<()>;
}

/// Stores the outcome of the rate phase in the reach it belongs to.
pub fn store_change_rate(reach: &mut Reach, rate: ChangeRate) {
    match rate {
        ChangeRate::Water(r) => reach.state.water_volume_change_rate = r,
        ChangeRate::Sediment(Some(erosion_rate)) => {
            reach.state.erosion_rate = erosion_rate;
            reach.capacity_bypass = false;
        }
        ChangeRate::Sediment(None) => {
            reach.state.erosion_rate = reach.state.erosion_rate.zeroed();
            reach.capacity_bypass = true;
        }
        ChangeRate::Unchanged => {}
    }
}

/// Maps `f` over all reach indices, in parallel with the `threading` feature.
pub(crate) fn par_map<T, F>(len: usize, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> Result<T> + Send + Sync,
{
    #[cfg(feature = "threading")]
    {
        use rayon::prelude::*;
        (0..len).into_par_iter().map(f).collect()
    }
    #[cfg(not(feature = "threading"))]
    {
        (0..len).map(f).collect()
    }
}

/// `C · min(L, L_downstream) / v` for a non-margin reach moving at `velocity`.
pub(crate) fn cfl_candidate(
    network: &ReachNetwork,
    index: usize,
    velocity: f64,
    bound: &'static str,
    ctx: &SimulationContext,
) -> Option<TimestepCandidate> {
    let reach = network.reach(index);
    let down = network.downstream_of(index)?;
    if reach.is_margin() || !(velocity > 0.0) {
        return None;
    }
    Some(TimestepCandidate {
        dt: ctx.numerics.cfl_number * reach.state.length.min(down.state.length) / velocity,
        index,
        bound,
    })
}

// ── Water schemes ────────────────────────────────────────────────────────────

/// Water routing scheme; always the first scheme of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaterScheme {
    ExplicitKinematicWave,
    ImplicitKinematicWave {
        maximum_time_step: f64,
        #[serde(default = "default_check_cfl")]
        check_cfl: bool,
    },
    UniformDischarge {
        maximum_time_step: f64,
    },
}

fn default_check_cfl() -> bool {
    true
}

impl Default for WaterScheme {
    fn default() -> Self {
        WaterScheme::ImplicitKinematicWave {
            maximum_time_step: 60.0,
            check_cfl: true,
        }
    }
}

impl WaterScheme {
    fn maximum_time_step(&self) -> Option<f64> {
        match self {
            WaterScheme::ExplicitKinematicWave => None,
            WaterScheme::ImplicitKinematicWave { maximum_time_step, .. }
            | WaterScheme::UniformDischarge { maximum_time_step } => Some(*maximum_time_step),
        }
    }
}

impl FlowScheme for WaterScheme {
    fn scheme_kind(&self) -> SchemeKind {
        SchemeKind::Water
    }

    fn name(&self) -> &'static str {
        match self {
            WaterScheme::ExplicitKinematicWave => "explicit_kinematic_wave",
            WaterScheme::ImplicitKinematicWave { .. } => "implicit_kinematic_wave",
            WaterScheme::UniformDischarge { .. } => "uniform_discharge",
        }
    }

    fn validate(&self, network: &ReachNetwork, ctx: &SimulationContext) -> Result<()> {
        if let Some(max) = self.maximum_time_step() {
            if !(max > 0.0) {
                return Err(SedflowError::invalid("water.maximum_time_step", "must be positive"));
            }
        }
        match self {
            WaterScheme::ExplicitKinematicWave => {
                for reach in network.reaches().iter().filter(|r| r.upstream.len() > 2) {
                    warn!(
                        target: "sedflow::flow",
                        location = %network.label(reach.index),
                        upstream = reach.upstream.len(),
                        "explicit.wide_confluence"
                    );
                }
                Ok(())
            }
            WaterScheme::ImplicitKinematicWave { .. } => implicit::validate(network, ctx),
            WaterScheme::UniformDischarge { .. } => Ok(()),
        }
    }

    fn calculate_change_rate(&self, network: &ReachNetwork, index: usize, _ctx: &SimulationContext) -> Result<ChangeRate> {
        Ok(match self {
            WaterScheme::ExplicitKinematicWave => ChangeRate::Water(explicit::change_rate(network, index)),
            _ => ChangeRate::Unchanged,
        })
    }

    fn timestep_candidates(&self, network: &ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<Vec<TimestepCandidate>> {
        let mut out = Vec::new();
        if index == 0 {
            if let Some(dt) = self.maximum_time_step() {
                out.push(TimestepCandidate { dt, index, bound: "maximum time step" });
            }
        }
        match self {
            WaterScheme::ExplicitKinematicWave => out.extend(explicit::timestep_candidates(network, index, ctx)),
            WaterScheme::ImplicitKinematicWave { check_cfl: true, .. } => {
                let velocity = network.reach(index).state.flow_velocity;
                out.extend(cfl_candidate(network, index, velocity, "water CFL", ctx));
            }
            _ => {}
        }
        Ok(out)
    }

    fn calculate_change(&self, network: &mut ReachNetwork, index: usize, dt: f64, ctx: &SimulationContext) -> Result<()> {
        match self {
            WaterScheme::ExplicitKinematicWave => {
                let state = &mut network.reach_mut(index).state;
                state.water_volume_change = state.water_volume_change_rate * dt;
                Ok(())
            }
            WaterScheme::ImplicitKinematicWave { .. } => implicit::calculate_change(network, index, dt, ctx),
            WaterScheme::UniformDischarge { .. } => {
                uniform::calculate_change(network, index);
                Ok(())
            }
        }
    }

    fn apply_change(&self, network: &mut ReachNetwork, index: usize, _ctx: &SimulationContext) -> Result<()> {
        if matches!(self, WaterScheme::UniformDischarge { .. }) {
            return Ok(());
        }
        apply_volume_change(network.reach_mut(index));
        Ok(())
    }

    fn update_other_parameters(&self, network: &mut ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<()> {
        if network.reach(index).is_upstream_margin() {
            return Ok(());
        }
        let resistance = &ctx.methods.flow_resistance;
        match self {
            WaterScheme::ExplicitKinematicWave => {
                let reach = network.reach(index);
                let (discharge, velocity) = resistance.discharge_and_velocity(reach, reach.state.maximum_water_depth, ctx);
                let state = &mut network.reach_mut(index).state;
                state.discharge = discharge;
                state.flow_velocity = velocity;
            }
            WaterScheme::ImplicitKinematicWave { .. } => {
                let reach = network.reach(index);
                let velocity = resistance.velocity_from_depth(reach, reach.state.maximum_water_depth, ctx);
                network.reach_mut(index).state.flow_velocity = velocity;
            }
            WaterScheme::UniformDischarge { .. } => uniform::update_depth(network, index, ctx)?,
        }
        Ok(())
    }

    fn hand_down_other_parameters(&self, network: &mut ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<()> {
        hand_down_water_slopes(network, index, ctx)
    }
}

/// New depth from the stored water volume change.  Upstream margins keep
/// their boundary depth.
pub(crate) fn apply_volume_change(reach: &mut Reach) {
    if reach.is_upstream_margin() {
        return;
    }
    let volume = reach.water_volume() + reach.state.water_volume_change;
    let depth = reach.channel.geometry().depth_from_area(volume / reach.state.length);
    reach.state.maximum_water_depth = depth;
}

/// Re-evaluates the water energy slope, and the sediment energy slope when it
/// follows the water energy slope.
pub(crate) fn hand_down_water_slopes(network: &mut ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<()> {
    let methods = &ctx.methods;
    let water = methods.water_energy_slope.evaluate(network, index, ctx)?;
    network.reach_mut(index).state.water_energy_slope = water;
    if methods.sediment_energy_slope.depends_on_water_energy_slope() {
        let sediment = methods.sediment_energy_slope.evaluate(network, index, ctx)?;
        network.reach_mut(index).state.sediment_energy_slope = sediment;
    }
    Ok(())
}

/// Sum of the discharges entering a reach.
pub(crate) fn upstream_discharge(network: &ReachNetwork, index: usize) -> f64 {
    network.upstream_sum(index, |r| r.state.discharge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tests::{descriptor, test_context};

    #[test]
    fn stored_bypass_zeroes_erosion_rate() {
        let mut net = ReachNetwork::from_descriptors(vec![descriptor(1, None, 1.0)]).unwrap();
        let reach = net.reach_mut(1);
        reach.state.erosion_rate = reach.strata.active().clone();
        store_change_rate(reach, ChangeRate::Sediment(None));
        assert!(reach.state.erosion_rate.is_zero());
        assert!(reach.capacity_bypass, "bypass flag must be set");
        store_change_rate(reach, ChangeRate::Water(-2.0));
        assert_eq!(reach.state.water_volume_change_rate, -2.0);
    }

    #[test]
    fn maximum_time_step_is_reported_once() {
        let net = ReachNetwork::from_descriptors(vec![descriptor(1, Some(2), 2.0), descriptor(2, None, 1.0)]).unwrap();
        let ctx = test_context();
        let scheme = WaterScheme::UniformDischarge { maximum_time_step: 30.0 };
        let best = scheme
            .calculate_time_step(&net, &ctx, &TimestepMonitor::default())
            .unwrap()
            .unwrap();
        assert_eq!(best.dt, 30.0);
        let total: usize = (0..net.len())
            .map(|i| scheme.timestep_candidates(&net, i, &ctx).unwrap().len())
            .sum();
        assert_eq!(total, 1, "maximum must be proposed by a single reach");
    }

    #[test]
    fn volume_change_updates_depth_except_at_upstream_margin() {
        let mut net = ReachNetwork::from_descriptors(vec![descriptor(1, None, 1.0)]).unwrap();
        for i in 0..2 {
            let state = &mut net.reach_mut(i).state;
            state.maximum_water_depth = 0.4;
            state.water_volume_change = 50.0;
            apply_volume_change(net.reach_mut(i));
        }
        assert_eq!(net.reach(0).state.maximum_water_depth, 0.4, "margin depth is a boundary value");
        assert!((net.reach(1).state.maximum_water_depth - 0.5).abs() < 1e-12);
    }
}
