//! Implicit kinematic wave.
//!
//! With `Q(V) = b V^c + addition` the water volume of a reach obeys
//! `dV/dt = a − b V^c`, `a = Σ Q_upstream − addition`.  For `a = 0` the
//! equation integrates exactly.  Otherwise the right-hand side is expanded to
//! second order around the current volume, giving a Riccati equation whose
//! solution is evaluated in complex arithmetic.
use num_complex::Complex64;

use super::upstream_discharge;
use crate::context::SimulationContext;
use crate::error::{Result, SedflowError};
use crate::network::ReachNetwork;

pub fn validate(network: &ReachNetwork, ctx: &SimulationContext) -> Result<()> {
    for reach in network.reaches().iter().filter(|r| !r.is_upstream_margin()) {
        if ctx.methods.flow_resistance.discharge_of_volume(reach, ctx).is_none() {
            return Err(SedflowError::NotAPowerLaw {
                location: network.label(reach.index),
            });
        }
    }
    Ok(())
}

/// Water volume after `dt` under `dV/dt = a − b V^c`.
pub fn advance_volume(volume: f64, a: f64, b: f64, c: f64, dt: f64) -> Result<f64> {
    if a == 0.0 {
        return Ok(((volume.powf(1.0 - c)) + b * (c - 1.0) * dt).powf(1.0 / (1.0 - c)));
    }
    if !(c > 1.0 && c < 10.0) {
        return Err(SedflowError::ImplicitExponentOutOfRange { exponent: c });
    }
    let aa = -0.5 * b * c * (c - 1.0) * volume.powf(c - 2.0);
    let bb = -2.0 * volume * (c - 2.0) / (c - 1.0);
    let cc = a / aa + volume * volume * (c - 2.0) / c;
    let root = Complex64::new(bb * bb - 4.0 * cc, 0.0).sqrt();
    let p1 = 0.5 * (-bb + root);
    let p2 = 0.5 * (-bb - root);
    let v = Complex64::new(volume, 0.0);
    let x = (v - p1) / (v - p2) * (aa * (p1 - p2) * dt).exp();
    let next = ((p1 - p2 * x) / (1.0 - x)).re;
    if next.is_finite() && next >= 0.0 {
        Ok(next)
    } else {
        // Dry reaches leave the range of the expansion.
        Ok(integrate_rk4(volume, a, b, c, dt))
    }
}

/// Classical Runge–Kutta integration with substeps resolving the relaxation
/// time at the equilibrium volume.
pub(crate) fn integrate_rk4(volume: f64, a: f64, b: f64, c: f64, dt: f64) -> f64 {
    let f = |v: f64| a - b * v.max(0.0).powf(c);
    let equilibrium = if a > 0.0 { (a / b).powf(1.0 / c) } else { volume };
    let stiffness = b * c * equilibrium.max(volume).max(f64::MIN_POSITIVE).powf(c - 1.0);
    let steps = ((dt * stiffness * 4.0).ceil() as usize).clamp(16, 1_000_000);
    let h = dt / steps as f64;
    let mut v = volume;
    for _ in 0..steps {
        let k1 = f(v);
        let k2 = f(v + 0.5 * h * k1);
        let k3 = f(v + 0.5 * h * k2);
        let k4 = f(v + h * k3);
        v = (v + h / 6.0 * (k1 + 2.0 * k2 + 2.0 * k3 + k4)).max(0.0);
    }
    v
}

/// Advances one reach; upstream discharges must already be current, so this
/// runs in canonical order.
pub fn calculate_change(network: &mut ReachNetwork, index: usize, dt: f64, ctx: &SimulationContext) -> Result<()> {
    let reach = network.reach(index);
    if reach.is_upstream_margin() {
        return Ok(());
    }
    let law = ctx
        .methods
        .flow_resistance
        .discharge_of_volume(reach, ctx)
        .ok_or_else(|| SedflowError::NotAPowerLaw {
            location: network.label(index),
        })?;
    let inflow = upstream_discharge(network, index);
    let volume = reach.water_volume();
    let next = advance_volume(volume, inflow - law.addition, law.factor, law.exponent, dt)?;

    let state = &mut network.reach_mut(index).state;
    state.water_volume_change = next - volume;
    state.water_volume_change_rate = state.water_volume_change / dt;
    state.discharge = inflow - state.water_volume_change_rate;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowScheme, WaterScheme};
    use crate::network::tests::{descriptor, test_context};
    use approx::assert_relative_eq;

    fn reference(volume: f64, a: f64, b: f64, c: f64, dt: f64) -> f64 {
        let mut v = volume;
        let n = 100_000;
        let h = dt / n as f64;
        let f = |v: f64| a - b * v.powf(c);
        for _ in 0..n {
            let k1 = f(v);
            let k2 = f(v + 0.5 * h * k1);
            let k3 = f(v + 0.5 * h * k2);
            let k4 = f(v + h * k3);
            v += h / 6.0 * (k1 + 2.0 * k2 + 2.0 * k3 + k4);
        }
        v
    }

    #[test]
    fn draining_without_inflow_is_exact() {
        for c in [1.3, 1.8, 2.5, 4.0, 7.5] {
            let got = advance_volume(3.0, 0.0, 0.4, c, 2.0).unwrap();
            let want = reference(3.0, 0.0, 0.4, c, 2.0);
            assert_relative_eq!(got, want, max_relative = 1e-8);
        }
    }

    /// Relaxation time of `dV/dt = a − b V^c` at `volume`.
    fn relaxation_time(volume: f64, b: f64, c: f64) -> f64 {
        1.0 / (b * c * volume.powf(c - 1.0))
    }

    fn relative_error(start: f64, a: f64, b: f64, c: f64, dt: f64) -> f64 {
        let got = advance_volume(start, a, b, c, dt).unwrap();
        let want = reference(start, a, b, c, dt);
        ((got - want) / want).abs()
    }

    #[test]
    fn riccati_solution_is_exact_for_quadratic_outflow() {
        let (a, b, c): (f64, f64, f64) = (1.0, 0.5, 2.0);
        let equilibrium = (a / b).sqrt();
        for start in [0.1 * equilibrium, 0.8 * equilibrium, 1.25 * equilibrium, 3.0 * equilibrium] {
            for relaxations in [0.1, 1.0, 3.0] {
                let dt = relaxations * relaxation_time(start, b, c);
                let got = advance_volume(start, a, b, c, dt).unwrap();
                assert_relative_eq!(got, reference(start, a, b, c, dt), max_relative = 1e-9);
            }
        }
    }

    #[test]
    fn riccati_solution_tracks_runge_kutta() {
        let (a, b): (f64, f64) = (1.0, 0.5);
        for c in [1.2, 1.67, 2.0, 3.0, 5.0, 9.0] {
            let equilibrium = (a / b).powf(1.0 / c);
            for start in [0.8 * equilibrium, 1.25 * equilibrium] {
                let dt = 0.01 * relaxation_time(start, b, c);
                let error = relative_error(start, a, b, c, dt);
                assert!(error < 1e-6, "c = {c}, start {start}: relative error {error:e}");
            }
        }
    }

    #[test]
    fn riccati_error_shrinks_with_fourth_power_of_step() {
        let (a, b): (f64, f64) = (1.0, 0.5);
        for c in [3.0, 5.0, 9.0] {
            let equilibrium = (a / b).powf(1.0 / c);
            for start in [0.8 * equilibrium, 1.25 * equilibrium] {
                let dt = 0.1 * relaxation_time(start, b, c);
                let coarse = relative_error(start, a, b, c, dt);
                let fine = relative_error(start, a, b, c, 0.5 * dt);
                assert!(coarse < 1e-3, "c = {c}, start {start}: relative error {coarse:e}");
                assert!(
                    coarse > 10.0 * fine,
                    "c = {c}, start {start}: halving the step took the error from {coarse:e} to {fine:e}"
                );
            }
        }
    }

    #[test]
    fn exponent_outside_range_is_rejected() {
        assert!(matches!(
            advance_volume(1.0, 1.0, 1.0, 0.9, 1.0),
            Err(SedflowError::ImplicitExponentOutOfRange { .. })
        ));
        assert!(advance_volume(1.0, 0.0, 1.0, 12.0, 1.0).is_ok(), "no inflow needs no range check");
    }

    #[test]
    fn dry_reach_fills_towards_equilibrium() {
        let v = advance_volume(0.0, 2.0, 0.5, 5.0 / 3.0, 100.0).unwrap();
        let equilibrium = (2.0f64 / 0.5).powf(0.6);
        assert_relative_eq!(v, equilibrium, max_relative = 1e-6);
    }

    #[test]
    fn change_conserves_water() {
        let mut net =
            ReachNetwork::from_descriptors(vec![descriptor(1, Some(2), 2.0), descriptor(2, None, 1.0)]).unwrap();
        let ctx = test_context();
        let scheme = WaterScheme::ImplicitKinematicWave { maximum_time_step: 10.0, check_cfl: false };
        for i in 0..net.len() {
            let state = &mut net.reach_mut(i).state;
            state.maximum_water_depth = 0.3;
            state.water_energy_slope = 0.01;
            state.bedslope = 0.01;
        }
        net.reach_mut(0).state.discharge = 4.0;
        scheme.validate(&net, &ctx).unwrap();
        let before = net.reach(1).water_volume();
        scheme.calculate_change(&mut net, 1, 10.0, &ctx).unwrap();
        let s = &net.reach(1).state;
        let change = s.water_volume_change;
        assert_relative_eq!(change, (4.0 - s.discharge) * 10.0, epsilon = 1e-9);
        assert!(change > 0.0, "inflow above outflow must fill the reach");
        scheme.apply_change(&mut net, 1, &ctx).unwrap();
        assert_relative_eq!(net.reach(1).water_volume(), before + change, epsilon = 1e-9);
    }
}
