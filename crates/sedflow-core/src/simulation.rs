//! The simulation driver: owns the network, the context and the flow
//! schemes, and advances them through adaptively sized timesteps.
use tracing::{debug, info};

use crate::channel::{active_width, bed_shear_stress};
use crate::config::{Parameters, SimulationConfig};
use crate::context::SimulationContext;
use crate::error::{Result, SedflowError};
use crate::flow::{par_map, store_change_rate, FlowScheme, SchemeKind, SedimentRouter, WaterScheme};
use crate::network::ReachNetwork;
use crate::timeseries::{Boundaries, InstantaneousSedimentInput, TimeSeries};
use crate::timestep::{min_candidate, TimestepMonitor};

/// Water must lead, and every scheme after it routes sediment.
pub fn check_scheme_order(schemes: &[&dyn FlowScheme]) -> Result<()> {
    match schemes.split_first() {
        Some((first, rest))
            if first.scheme_kind() == SchemeKind::Water
                && rest.iter().all(|s| s.scheme_kind() == SchemeKind::Sediment) =>
        {
            Ok(())
        }
        _ => Err(SedflowError::SchemeOrder),
    }
}

pub struct Simulation {
    network: ReachNetwork,
    ctx: SimulationContext,
    water: WaterScheme,
    sediment: Option<SedimentRouter>,
    monitor: TimestepMonitor,
    /// Time series with the canonical index they act on.
    series: Vec<(usize, TimeSeries)>,
    inputs: Vec<(usize, InstantaneousSedimentInput)>,
    steps: u64,
}

impl Simulation {
    /// Wires and initialises a simulation.
    pub fn new(
        network: ReachNetwork,
        ctx: SimulationContext,
        water: WaterScheme,
        sediment: Option<SedimentRouter>,
        monitor: TimestepMonitor,
        boundaries: Boundaries,
    ) -> Result<Self> {
        let (fractions, diameters) = (network.fraction_count(), ctx.physics.grain_diameters.len());
        if fractions != diameters {
            return Err(SedflowError::GrainClassMismatch { fractions, diameters });
        }
        boundaries.validate(&network)?;
        let series: Vec<(usize, TimeSeries)> = boundaries
            .time_series
            .into_iter()
            .map(|s| Ok((s.target(&network)?, s)))
            .collect::<Result<_>>()?;
        let inputs: Vec<(usize, InstantaneousSedimentInput)> = boundaries
            .instantaneous_inputs
            .into_iter()
            .map(|s| Ok((s.target(&network)?, s)))
            .collect::<Result<_>>()?;
        let mut sim = Self {
            network,
            ctx,
            water,
            sediment,
            monitor,
            series,
            inputs,
            steps: 0,
        };
        check_scheme_order(&sim.schemes())?;
        for scheme in sim.schemes() {
            scheme.validate(&sim.network, &sim.ctx)?;
        }
        sim.initialise()?;
        Ok(sim)
    }

    pub fn from_config(config: SimulationConfig) -> Result<Self> {
        let network = ReachNetwork::from_descriptors(config.reaches)?;
        let mut ctx = SimulationContext::new(config.parameters.physics, config.parameters.numerics, config.methods)?;
        if !config.elapsed.is_finite() || config.elapsed < 0.0 {
            return Err(SedflowError::invalid("elapsed", "must be a finite, non-negative time"));
        }
        ctx.elapsed = config.elapsed;
        Self::new(network, ctx, config.water, config.sediment, config.monitor, config.boundaries)
    }

    fn schemes(&self) -> Vec<&dyn FlowScheme> {
        let mut schemes: Vec<&dyn FlowScheme> = vec![&self.water];
        if let Some(sediment) = &self.sediment {
            schemes.push(sediment);
        }
        schemes
    }

    pub fn network(&self) -> &ReachNetwork {
        &self.network
    }

    pub fn context(&self) -> &SimulationContext {
        &self.ctx
    }

    pub fn elapsed(&self) -> f64 {
        self.ctx.elapsed
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Brings slopes, hydraulics, active widths and shear stresses in line
    /// with the stored elevations and water depths.
    pub fn initialise(&mut self) -> Result<()> {
        let (net, ctx) = (&mut self.network, &self.ctx);
        let methods = &ctx.methods;

        let bedslopes = methods.bedslope.evaluate_all(net, ctx)?;
        for (i, slope) in bedslopes.into_iter().enumerate() {
            net.reach_mut(i).state.bedslope = slope;
        }
        let water = methods.water_energy_slope.evaluate_all(net, ctx)?;
        for (i, slope) in water.into_iter().enumerate() {
            net.reach_mut(i).state.water_energy_slope = slope;
        }
        let margin = net.downstream_margin();
        let state = &mut net.reach_mut(margin).state;
        state.water_energy_slope = state.bedslope;
        let sediment = methods.sediment_energy_slope.evaluate_all(net, ctx)?;
        for (i, slope) in sediment.into_iter().enumerate() {
            net.reach_mut(i).state.sediment_energy_slope = slope;
        }

        for i in 0..net.len() {
            let reach = net.reach(i);
            if reach.is_upstream_margin() {
                let (depth, velocity) = methods.flow_resistance.depth_and_velocity(reach, reach.state.discharge, ctx)?;
                let state = &mut net.reach_mut(i).state;
                state.maximum_water_depth = depth;
                state.flow_velocity = velocity;
            }
        }
        for i in (0..net.len()).rev() {
            self.water.update_other_parameters(net, i, ctx)?;
        }
        for i in 0..net.len() {
            refresh_bed_state(net, i, ctx)?;
        }
        info!(
            target: "sedflow::simulation",
            reaches = net.len(),
            water = self.water.name(),
            sediment = self.sediment.is_some(),
            elapsed = ctx.elapsed,
            finish = ctx.numerics.finish,
            "simulation.initialised"
        );
        Ok(())
    }

    /// Advances the simulation by one adaptive timestep and returns it.
    pub fn step(&mut self) -> Result<f64> {
        let elapsed = self.ctx.elapsed;
        let remaining = self.ctx.numerics.finish - elapsed;

        for (index, series) in self.series.iter_mut().filter(|(_, s)| s.is_water()) {
            series.apply(&mut self.network, *index, elapsed, &self.ctx)?;
        }

        let schemes: Vec<&dyn FlowScheme> = match &self.sediment {
            Some(sediment) => vec![&self.water, sediment],
            None => vec![&self.water],
        };
        let (net, ctx) = (&mut self.network, &self.ctx);
        let mut bounds = Vec::with_capacity(schemes.len());
        for scheme in &schemes {
            let rates = par_map(net.len(), |i| scheme.calculate_change_rate(net, i, ctx))?;
            for (i, rate) in rates.into_iter().enumerate() {
                store_change_rate(net.reach_mut(i), rate);
            }
            for i in 0..net.len() {
                scheme.hand_down_change_rate(net, i, ctx)?;
                if scheme.scheme_kind() == SchemeKind::Sediment {
                    for (_, series) in self.series.iter_mut().filter(|(t, s)| *t == i && !s.is_water()) {
                        series.apply(net, i, elapsed, ctx)?;
                    }
                }
            }
            for i in 0..net.len() {
                scheme.update_change_rate_depending_parameters(net, i, ctx)?;
            }
            bounds.extend(scheme.calculate_time_step(net, ctx, &self.monitor)?);
        }

        let bound = min_candidate(bounds);
        let proposed = bound.map_or(remaining, |b| b.dt * ctx.numerics.timestep_factor);
        let last = proposed >= remaining;
        let dt = if last { remaining } else { proposed };

        for scheme in &schemes {
            for i in 0..net.len() {
                scheme.calculate_change(net, i, dt, ctx)?;
            }
            for i in 0..net.len() {
                scheme.hand_down_change(net, i, dt, ctx)?;
            }
        }
        if self.sediment.is_some() {
            let mut pending = Vec::with_capacity(self.inputs.len());
            for (index, input) in self.inputs.drain(..) {
                if input.is_due(elapsed, dt) {
                    input.apply(net, index, dt)?;
                } else {
                    pending.push((index, input));
                }
            }
            self.inputs = pending;
        }
        for scheme in &schemes {
            for i in 0..net.len() {
                scheme.apply_change(net, i, ctx)?;
            }
            for i in (0..net.len()).rev() {
                scheme.update_other_parameters(net, i, ctx)?;
            }
            for i in 0..net.len() {
                scheme.hand_down_other_parameters(net, i, ctx)?;
            }
        }
        for i in 0..net.len() {
            refresh_bed_state(net, i, ctx)?;
        }
        self.series.retain(|(_, s)| !s.is_exhausted());

        self.ctx.elapsed = if last { self.ctx.numerics.finish } else { elapsed + dt };
        self.ctx.timestep = Some(dt);
        self.steps += 1;
        if !self.ctx.elapsed.is_finite() {
            return Err(SedflowError::NonFiniteTime);
        }
        debug!(
            target: "sedflow::simulation",
            step = self.steps,
            dt,
            elapsed = self.ctx.elapsed,
            bound = bound.map_or("remaining time", |b| b.bound),
            location = %bound.map_or_else(String::new, |b| self.network.label(b.index)),
            "step.committed"
        );
        Ok(dt)
    }

    /// Steps until the finish time is reached.
    pub fn run(&mut self) -> Result<()> {
        check_scheme_order(&self.schemes())?;
        info!(
            target: "sedflow::simulation",
            elapsed = self.ctx.elapsed,
            finish = self.ctx.numerics.finish,
            "simulation.started"
        );
        while !self.ctx.finished() {
            if let Some(dt) = self.ctx.timestep {
                let threshold = self.ctx.numerics.termination_threshold;
                if dt < threshold {
                    return Err(self.timestep_too_small(dt, threshold));
                }
            }
            self.step()?;
        }
        info!(
            target: "sedflow::simulation",
            steps = self.steps,
            elapsed = self.ctx.elapsed,
            small_timesteps = self.monitor.outputs(),
            "simulation.finished"
        );
        Ok(())
    }

    fn timestep_too_small(&self, dt: f64, threshold: f64) -> SedflowError {
        let flattest = self
            .network
            .reaches()
            .iter()
            .filter(|r| !r.is_margin())
            .min_by(|a, b| a.state.bedslope.total_cmp(&b.state.bedslope));
        SedflowError::TimestepTooSmall {
            dt,
            threshold,
            bedslope: flattest.map_or(f64::NAN, |r| r.state.bedslope),
            location: flattest.map_or_else(String::new, |r| self.network.label(r.index)),
        }
    }

    /// Current state in configuration form.
    pub fn export_config(&self) -> SimulationConfig {
        SimulationConfig {
            parameters: Parameters {
                physics: self.ctx.physics.clone(),
                numerics: self.ctx.numerics.clone(),
            },
            methods: self.ctx.methods.clone(),
            water: self.water.clone(),
            sediment: self.sediment.clone(),
            monitor: self.monitor.clone(),
            reaches: self.network.to_descriptors(),
            boundaries: Boundaries {
                time_series: self.series.iter().map(|(_, s)| s.clone()).collect(),
                instantaneous_inputs: self.inputs.iter().map(|(_, s)| s.clone()).collect(),
            },
            elapsed: self.ctx.elapsed,
        }
    }
}

/// Active width and bed shear stress from the current hydraulics.
fn refresh_bed_state(network: &mut ReachNetwork, index: usize, ctx: &SimulationContext) -> Result<()> {
    let width = active_width(network.reach(index));
    network.reach_mut(index).state.active_width = width;
    let location = network.label(index);
    let tau = bed_shear_stress(network.reach(index), &location, ctx)?;
    network.reach_mut(index).state.bed_shear_stress = tau;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelBehaviour;
    use crate::context::{NumericalParameters, PhysicalParameters, ReachMethods};
    use crate::network::tests::{descriptor, gravel};
    use crate::network::ReachDescriptor;
    use crate::strata::Stratigraphy;
    use crate::timeseries::{SeriesValues, TimeSeriesEntry};
    use crate::velocity::BedloadVelocityModel;
    use approx::assert_relative_eq;

    fn series_config(reaches: Vec<ReachDescriptor>, finish: f64) -> SimulationConfig {
        SimulationConfig {
            parameters: Parameters {
                physics: PhysicalParameters::default(),
                numerics: NumericalParameters {
                    finish,
                    ..NumericalParameters::default()
                },
            },
            methods: ReachMethods::default(),
            water: WaterScheme::default(),
            sediment: None,
            monitor: TimestepMonitor::default(),
            reaches,
            boundaries: Boundaries::default(),
            elapsed: 0.0,
        }
    }

    /// Three reaches in series on a uniform slope of 0.01, fed with 12 m³/s.
    fn three_reaches(finish: f64) -> SimulationConfig {
        let mut reaches = vec![
            descriptor(1, Some(2), 3.0),
            descriptor(2, Some(3), 2.0),
            descriptor(3, None, 1.0),
        ];
        reaches[0].discharge = 12.0;
        series_config(reaches, finish)
    }

    #[test]
    fn water_settles_to_inflow_and_sediment_stays_in_balance() {
        let mut water_only = Simulation::from_config(three_reaches(1800.0)).unwrap();
        water_only.run().unwrap();
        let net = water_only.network();
        for i in 1..net.len() {
            assert_relative_eq!(net.reach(i).state.discharge, 12.0, max_relative = 1e-6);
        }

        let mut config = water_only.export_config();
        config.parameters.numerics.finish = 5400.0;
        config.sediment = Some(SedimentRouter::default());
        let before: Vec<f64> = config.reaches.iter().map(|r| r.elevation).collect();
        let mut sim = Simulation::from_config(config).unwrap();
        assert_eq!(sim.elapsed(), 1800.0, "restart resumes the clock");
        sim.run().unwrap();
        assert_eq!(sim.elapsed(), 5400.0);

        let net = sim.network();
        for (id, z0) in (1..=3).zip(before) {
            let reach = net.reach(net.canonical_index(id).unwrap());
            assert!(reach.state.erosion_rate.overall_volume() > 0.0, "reach {id} must transport");
            assert_relative_eq!(
                reach.state.deposition_rate.overall_volume(),
                reach.state.erosion_rate.overall_volume(),
                max_relative = 1e-6
            );
            assert!((reach.state.elevation - z0).abs() < 1e-3, "reach {id} bed moved in steady state");
            assert_relative_eq!(reach.state.discharge, 12.0, max_relative = 1e-6);
        }
    }

    #[test]
    fn sediment_mass_is_conserved_over_a_run() {
        let mut config = three_reaches(1200.0);
        for r in &mut config.reaches {
            r.maximum_water_depth = 0.5;
            r.discharge = 12.0;
        }
        config.reaches[1].elevation = 2.3;
        config.sediment = Some(SedimentRouter::default());
        let mut sim = Simulation::from_config(config).unwrap();
        let stored = |sim: &Simulation| -> f64 {
            sim.network()
                .reaches()
                .iter()
                .filter(|r| !r.is_margin())
                .map(|r| r.strata.overall_volume() * 5.0 * r.state.length)
                .sum()
        };
        let start = stored(&sim);
        let (mut fed, mut left) = (0.0, 0.0);
        while !sim.context().finished() {
            sim.step().unwrap();
            let net = sim.network();
            let first = net.canonical_index(1).unwrap();
            let last = net.canonical_index(3).unwrap();
            fed += net.reach(first).state.deposition.overall_volume();
            left += net.reach(last).state.erosion.overall_volume();
        }
        let end = stored(&sim);
        assert!(left > 0.0, "material must leave the outlet");
        assert_relative_eq!(end - start, fed - left, max_relative = 1e-6, epsilon = 1e-9);
    }

    /// Reaches in series with the given elevations, all fed with 12 m³/s,
    /// routing bedload over uniform discharge.
    fn bedload_series(elevations: &[f64], width: f64, finish: f64) -> SimulationConfig {
        let count = elevations.len() as i64;
        let reaches = (1..)
            .zip(elevations)
            .map(|(id, &z)| {
                let mut d = descriptor(id, (id < count).then_some(id + 1), z);
                d.discharge = 12.0;
                d.channel = ChannelBehaviour::rectangular(width);
                d
            })
            .collect();
        let mut config = series_config(reaches, finish);
        config.water = WaterScheme::UniformDischarge { maximum_time_step: 1e5 };
        config.methods.bedload_velocity = BedloadVelocityModel::TransportRatePerArea { moving_layer_thickness: 1.0 };
        config.sediment = Some(SedimentRouter::default());
        config
    }

    fn two_cell_slope(net: &ReachNetwork, index: usize) -> f64 {
        let reach = net.reach(index);
        let down = net.downstream_of(index).unwrap();
        (reach.state.elevation - down.state.elevation) / reach.state.length
    }

    /// Runs `config` to its finish, checking every committed step against the
    /// active layer and bed slope bounds.  Returns the largest share of each
    /// bound used by any step.
    fn bound_usage(config: SimulationConfig, case: &str) -> (f64, f64) {
        let router = config.sediment.clone().unwrap();
        let share = router.maximum_fraction_of_active_layer_to_be_eroded;
        let max_change = router.maximum_relative_two_cell_bed_slope_change;
        let mut sim = Simulation::from_config(config).unwrap();
        let (mut active_usage, mut slope_usage) = (0.0_f64, 0.0_f64);
        while !sim.context().finished() {
            let net = sim.network();
            let before: Vec<(usize, f64, f64)> = net
                .reaches()
                .iter()
                .filter(|r| !r.is_margin())
                .map(|r| (r.index, r.strata.active().overall_volume(), two_cell_slope(net, r.index)))
                .collect();
            let dt = sim.step().unwrap();
            assert!(dt > 0.0 && dt.is_finite(), "{case}: dt {dt}");
            let net = sim.network();
            for (i, active, slope) in before {
                let label = net.label(i);
                let eroded = net.reach(i).state.erosion_per_unit_bed_surface.overall_volume();
                let used = eroded / (share * active);
                assert!(used <= 1.0 + 1e-9, "{case}, {label}: eroded {eroded} of an active layer of {active}");
                active_usage = active_usage.max(used);

                let after = two_cell_slope(net, i);
                assert!(after > 0.0, "{case}, {label}: bed slope {slope} became {after}");
                let used = ((after - slope) / slope).abs() / max_change;
                assert!(used <= 1.0 + 1e-9, "{case}, {label}: bed slope went from {slope} to {after}");
                slope_usage = slope_usage.max(used);
            }
            assert!(
                net.reaches().iter().all(|r| r.state.maximum_water_depth >= 0.0),
                "{case}: negative water depth"
            );
        }
        (active_usage, slope_usage)
    }

    #[test]
    fn steps_respect_every_stability_bound() {
        for width in [3.0, 5.0, 10.0] {
            // Uniform slope over a thin active layer: erosion is balanced by
            // deposition, so only the active layer limits the step.
            let mut config = bedload_series(&[1.0 + 100.0 * 0.03, 1.0], width, 600.0);
            for r in &mut config.reaches {
                r.strata = Stratigraphy::new(vec![gravel().scaled(0.01).unwrap(), gravel().scaled(4.0).unwrap()]).unwrap();
            }
            let case = format!("thin active layer, width {width}");
            let (active, _) = bound_usage(config, &case);
            assert!(active > 0.9, "{case}: the active layer bound never limited a step ({active})");

            // A steep reach feeding a nearly flat one that cannot pass the
            // material on: the flat reach aggrades, limited by its bed slope.
            let flat = 1.0 + 100.0 * 5e-4;
            let config = bedload_series(&[flat + 100.0 * 0.05, flat, 1.0], width, 600.0);
            let case = format!("aggrading reach, width {width}");
            let (_, slope) = bound_usage(config, &case);
            assert!(slope > 0.9, "{case}: the bed slope bound never limited a step ({slope})");
        }
    }

    #[test]
    fn mismatched_grain_diameters_are_rejected() {
        let mut config = three_reaches(60.0);
        config.parameters.physics.grain_diameters = vec![0.002, 0.01, 0.05];
        config.sediment = Some(SedimentRouter::default());
        assert!(matches!(
            Simulation::from_config(config),
            Err(SedflowError::GrainClassMismatch { fractions: 4, diameters: 3 })
        ));
    }

    #[test]
    fn monitor_aborts_after_its_budget() {
        let mut config = three_reaches(600.0);
        config.monitor = TimestepMonitor::new(1e9, 2);
        let mut sim = Simulation::from_config(config).unwrap();
        let err = sim.run().unwrap_err();
        assert!(
            matches!(err, SedflowError::TimestepOutputBudgetExhausted { count } if count >= 2),
            "unexpected error {err}"
        );
    }

    #[test]
    fn tiny_timestep_names_flattest_reach() {
        let mut config = three_reaches(600.0);
        config.parameters.numerics.termination_threshold = 1e9;
        config.reaches[0].elevation = 2.05;
        let mut sim = Simulation::from_config(config).unwrap();
        match sim.run() {
            Err(SedflowError::TimestepTooSmall { location, .. }) => assert_eq!(location, "reach 1"),
            other => panic!("expected a timestep abort, got {other:?}"),
        }
    }

    #[test]
    fn scheme_order_is_enforced() {
        let water = WaterScheme::default();
        let sediment = SedimentRouter::default();
        let (w, s): (&dyn FlowScheme, &dyn FlowScheme) = (&water, &sediment);
        assert!(check_scheme_order(&[w, s]).is_ok());
        assert!(matches!(check_scheme_order(&[s, w]), Err(SedflowError::SchemeOrder)));
        assert!(matches!(check_scheme_order(&[w, w]), Err(SedflowError::SchemeOrder)));
        assert!(matches!(check_scheme_order(&[]), Err(SedflowError::SchemeOrder)));
    }

    #[test]
    fn discharge_series_drives_the_outlet() {
        let mut config = three_reaches(3600.0);
        config.boundaries.time_series.push(TimeSeries {
            reach: 1,
            surplus: false,
            values: SeriesValues::Discharge {
                entries: vec![
                    TimeSeriesEntry { elapsed: 0.0, value: 12.0 },
                    TimeSeriesEntry { elapsed: 600.0, value: 6.0 },
                    TimeSeriesEntry { elapsed: 1e6, value: 6.0 },
                ],
            },
        });
        let mut sim = Simulation::from_config(config).unwrap();
        sim.run().unwrap();
        let net = sim.network();
        let outlet = net.canonical_index(3).unwrap();
        assert_relative_eq!(net.reach(outlet).state.discharge, 6.0, max_relative = 1e-4);
        let exported = sim.export_config();
        assert_eq!(exported.boundaries.time_series.len(), 1, "unfinished series must be exported");
    }

    #[test]
    fn export_round_trips_through_json() {
        let mut config = three_reaches(300.0);
        config.sediment = Some(SedimentRouter::default());
        let mut sim = Simulation::from_config(config).unwrap();
        sim.run().unwrap();
        let exported = sim.export_config();
        let json = exported.to_json_string().unwrap();
        let restarted = Simulation::from_config(SimulationConfig::from_json_str(&json).unwrap()).unwrap();
        let again = restarted.export_config();
        assert_relative_eq!(again.elapsed, exported.elapsed, max_relative = 1e-12);
        assert_eq!(again.reaches.len(), exported.reaches.len());
        for (a, b) in again.reaches.iter().zip(&exported.reaches) {
            assert_eq!((a.id, a.downstream), (b.id, b.downstream));
            assert_relative_eq!(a.elevation, b.elevation, max_relative = 1e-12);
            assert_relative_eq!(a.discharge, b.discharge, max_relative = 1e-12);
            assert_relative_eq!(a.maximum_water_depth, b.maximum_water_depth, max_relative = 1e-12);
            assert_eq!(a.strata.len(), b.strata.len());
            for (la, lb) in a.strata.layers.iter().zip(&b.strata.layers) {
                assert_relative_eq!(la.overall_volume(), lb.overall_volume(), max_relative = 1e-12);
            }
        }
    }
}
