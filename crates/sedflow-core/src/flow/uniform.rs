//! Uniform discharge: every reach instantly passes on what enters it, and the
//! water depth is the equilibrium depth of that discharge.
use super::upstream_discharge;
use crate::context::SimulationContext;
use crate::error::Result;
use crate::network::ReachNetwork;

pub fn calculate_change(network: &mut ReachNetwork, index: usize) {
    if network.reach(index).is_upstream_margin() {
        return;
    }
    let inflow = upstream_discharge(network, index);
    let state = &mut network.reach_mut(index).state;
    state.water_volume_change = 0.0;
    state.water_volume_change_rate = 0.0;
    state.discharge = inflow;
}

pub fn update_depth(network: &mut ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<()> {
    let reach = network.reach(index);
    let (depth, velocity) = ctx
        .methods
        .flow_resistance
        .depth_and_velocity(reach, reach.state.discharge, ctx)?;
    let state = &mut network.reach_mut(index).state;
    state.maximum_water_depth = depth;
    state.flow_velocity = velocity;
    Ok(())
}
