//! Explicit kinematic wave: forward Euler on the water volume of each reach.
use super::{cfl_candidate, upstream_discharge};
use crate::context::SimulationContext;
use crate::network::ReachNetwork;
use crate::timestep::TimestepCandidate;

/// Fraction of the stored water volume a reach may lose in one step.
const MAXIMUM_DRAIN_FRACTION: f64 = 0.75;

/// `Σ Q_upstream − Q` for regular reaches, zero on margins.
pub fn change_rate(network: &ReachNetwork, index: usize) -> f64 {
    let reach = network.reach(index);
    if reach.is_margin() {
        return 0.0;
    }
    upstream_discharge(network, index) - reach.state.discharge
}

pub fn timestep_candidates(network: &ReachNetwork, index: usize, ctx: &SimulationContext) -> Vec<TimestepCandidate> {
    let reach = network.reach(index);
    if reach.is_margin() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(2);
    let rate = reach.state.water_volume_change_rate;
    if rate < 0.0 {
        out.push(TimestepCandidate {
            dt: MAXIMUM_DRAIN_FRACTION * reach.water_volume() / rate.abs(),
            index,
            bound: "water drain",
        });
    }
    out.extend(cfl_candidate(network, index, reach.state.flow_velocity, "water CFL", ctx));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{store_change_rate, FlowScheme, WaterScheme};
    use crate::network::tests::{descriptor, test_context};
    use approx::assert_relative_eq;

    fn two_reaches() -> ReachNetwork {
        let mut net =
            ReachNetwork::from_descriptors(vec![descriptor(1, Some(2), 2.0), descriptor(2, None, 1.0)]).unwrap();
        for (i, q, h, v) in [(0, 3.0, 0.5, 1.2), (1, 2.0, 0.5, 0.8), (2, 5.0, 0.6, 1.6), (3, 5.0, 0.6, 1.6)] {
            let s = &mut net.reach_mut(i).state;
            s.discharge = q;
            s.maximum_water_depth = h;
            s.flow_velocity = v;
        }
        net
    }

    #[test]
    fn rate_balances_inflow_and_outflow() {
        let net = two_reaches();
        assert_relative_eq!(change_rate(&net, 1), 1.0);
        assert_relative_eq!(change_rate(&net, 2), -3.0);
        assert_eq!(change_rate(&net, 0), 0.0, "upstream margin has no rate");
        assert_eq!(change_rate(&net, 3), 0.0, "downstream margin has no rate");
    }

    #[test]
    fn draining_reach_limits_timestep() {
        let mut net = two_reaches();
        let ctx = test_context();
        let scheme = WaterScheme::ExplicitKinematicWave;
        for i in 0..net.len() {
            let rate = scheme.calculate_change_rate(&net, i, &ctx).unwrap();
            store_change_rate(net.reach_mut(i), rate);
        }
        let candidates = timestep_candidates(&net, 2, &ctx);
        let drain = candidates.iter().find(|c| c.bound == "water drain").unwrap();
        assert_relative_eq!(drain.dt, 0.75 * 0.6 * 5.0 * 100.0 / 3.0);
        let cfl = candidates.iter().find(|c| c.bound == "water CFL").unwrap();
        assert_relative_eq!(cfl.dt, 0.5 * 100.0 / 1.6);
        assert!(timestep_candidates(&net, 3, &ctx).is_empty(), "margins propose nothing");
    }
}
