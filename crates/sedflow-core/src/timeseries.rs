//! Boundary inputs: time series of discharge, water depth or erosion rate,
//! and one-shot sediment inputs.
//!
//! A series targets the upstream margin in front of the named reach when
//! there is one, and the reach itself otherwise.  Values between two entries
//! are interpolated linearly; entries that lie in the past are dropped, and a
//! series falls silent after its last entry.
use serde::{Deserialize, Serialize};

use crate::context::SimulationContext;
use crate::error::{Result, SedflowError};
use crate::grains::GrainMixture;
use crate::network::ReachNetwork;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesEntry<T> {
    pub elapsed: f64,
    pub value: T,
}

pub trait Interpolate: Sized {
    fn interpolate(a: &Self, b: &Self, t: f64) -> Result<Self>;
}

impl Interpolate for f64 {
    fn interpolate(a: &Self, b: &Self, t: f64) -> Result<Self> {
        Ok(a + t * (b - a))
    }
}

impl Interpolate for GrainMixture {
    fn interpolate(a: &Self, b: &Self, t: f64) -> Result<Self> {
        GrainMixture::interpolate_linearly(a, b, t)
    }
}

/// Drops the entries before `elapsed` that no longer bracket it and returns
/// the interpolated value, or `None` outside the covered time span.
fn value_at<T: Interpolate + Clone>(entries: &mut Vec<TimeSeriesEntry<T>>, elapsed: f64) -> Result<Option<T>> {
    let passed = entries.windows(2).take_while(|w| w[1].elapsed <= elapsed).count();
    entries.drain(..passed);
    if entries.len() == 1 && elapsed > entries[0].elapsed {
        entries.clear();
    }
    match entries.as_slice() {
        [] => Ok(None),
        [first, ..] if elapsed < first.elapsed => Ok(None),
        [only] => Ok((elapsed == only.elapsed).then(|| only.value.clone())),
        [a, b, ..] => {
            let t = (elapsed - a.elapsed) / (b.elapsed - a.elapsed);
            T::interpolate(&a.value, &b.value, t).map(Some)
        }
    }
}

fn check_ordered<T>(entries: &[TimeSeriesEntry<T>], reach: i64) -> Result<()> {
    let ordered = entries.windows(2).all(|w| w[0].elapsed < w[1].elapsed);
    if !ordered || entries.iter().any(|e| !e.elapsed.is_finite()) {
        return Err(SedflowError::invalid(
            "boundaries.entries",
            format!("time series at reach {reach} must be strictly increasing in time"),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "property", rename_all = "snake_case")]
pub enum SeriesValues {
    Discharge { entries: Vec<TimeSeriesEntry<f64>> },
    MaximumWaterDepth { entries: Vec<TimeSeriesEntry<f64>> },
    ErosionRate { entries: Vec<TimeSeriesEntry<GrainMixture>> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// User id of the reach the series feeds.
    pub reach: i64,
    /// Add the value to the current state instead of replacing it.
    #[serde(default)]
    pub surplus: bool,
    #[serde(flatten)]
    pub values: SeriesValues,
}

impl TimeSeries {
    pub fn validate(&self) -> Result<()> {
        match &self.values {
            SeriesValues::Discharge { entries } | SeriesValues::MaximumWaterDepth { entries } => {
                check_ordered(entries, self.reach)?;
                if !self.surplus && entries.iter().any(|e| !(e.value >= 0.0)) {
                    return Err(SedflowError::invalid(
                        "boundaries.value",
                        format!("water boundary at reach {} must be non-negative", self.reach),
                    ));
                }
                Ok(())
            }
            SeriesValues::ErosionRate { entries } => check_ordered(entries, self.reach),
        }
    }

    pub fn is_water(&self) -> bool {
        !matches!(self.values, SeriesValues::ErosionRate { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        match &self.values {
            SeriesValues::Discharge { entries } | SeriesValues::MaximumWaterDepth { entries } => entries.is_empty(),
            SeriesValues::ErosionRate { entries } => entries.is_empty(),
        }
    }

    /// Canonical index the series acts on.
    pub fn target(&self, network: &ReachNetwork) -> Result<usize> {
        network
            .upstream_margin_of(self.reach)
            .or_else(|| network.canonical_index(self.reach))
            .ok_or_else(|| SedflowError::invalid("boundaries.reach", format!("unknown reach {}", self.reach)))
    }

    /// Writes the value at `elapsed` into the reach at `index`.
    pub fn apply(&mut self, network: &mut ReachNetwork, index: usize, elapsed: f64, ctx: &SimulationContext) -> Result<()> {
        let resistance = &ctx.methods.flow_resistance;
        let surplus = self.surplus;
        match &mut self.values {
            SeriesValues::Discharge { entries } => {
                let Some(value) = value_at(entries, elapsed)? else { return Ok(()) };
                let reach = network.reach(index);
                let discharge = (if surplus { reach.state.discharge + value } else { value }).max(0.0);
                let (depth, velocity) = resistance.depth_and_velocity(reach, discharge, ctx)?;
                let state = &mut network.reach_mut(index).state;
                state.discharge = discharge;
                state.maximum_water_depth = depth;
                state.flow_velocity = velocity;
            }
            SeriesValues::MaximumWaterDepth { entries } => {
                let Some(value) = value_at(entries, elapsed)? else { return Ok(()) };
                let reach = network.reach(index);
                let depth = (if surplus { reach.state.maximum_water_depth + value } else { value }).max(0.0);
                let (discharge, velocity) = resistance.discharge_and_velocity(reach, depth, ctx);
                let state = &mut network.reach_mut(index).state;
                state.maximum_water_depth = depth;
                state.discharge = discharge;
                state.flow_velocity = velocity;
            }
            SeriesValues::ErosionRate { entries } => {
                let Some(value) = value_at(entries, elapsed)? else { return Ok(()) };
                let rate = &mut network.reach_mut(index).state.erosion_rate;
                if surplus {
                    rate.add(&value)?;
                } else {
                    rate.check_compatible(&value)?;
                    *rate = value;
                }
            }
        }
        Ok(())
    }
}

/// Sediment dumped into a reach once, during the step covering `elapsed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantaneousSedimentInput {
    pub reach: i64,
    pub elapsed: f64,
    pub sediment: GrainMixture,
}

impl InstantaneousSedimentInput {
    pub fn target(&self, network: &ReachNetwork) -> Result<usize> {
        network
            .canonical_index(self.reach)
            .ok_or_else(|| SedflowError::invalid("boundaries.reach", format!("unknown reach {}", self.reach)))
    }

    pub fn is_due(&self, elapsed: f64, dt: f64) -> bool {
        self.elapsed >= elapsed && self.elapsed <= elapsed + dt
    }

    /// Adds the input to the pending deposition of the reach.  Ephemeral
    /// kinds go straight into their insertion layer.
    pub fn apply(&self, network: &mut ReachNetwork, index: usize, dt: f64) -> Result<()> {
        let reach = network.reach_mut(index);
        let mut ephemeral = self.sediment.zeroed();
        let mut settling = self.sediment.clone();
        for (e, s) in ephemeral.components_mut().iter_mut().zip(settling.components_mut()) {
            if s.kind.is_ephemeral() {
                std::mem::swap(&mut e.fractions, &mut s.fractions);
            }
        }
        if !ephemeral.is_zero() {
            let per_unit = reach.per_unit_bed_surface(&ephemeral)?;
            reach.strata.insert(&per_unit)?;
        }
        reach.state.deposition.add(&settling)?;
        reach.state.deposition_rate.add(&settling.scaled(1.0 / dt)?)?;
        reach.state.deposition_per_unit_bed_surface = reach.per_unit_bed_surface(&reach.state.deposition)?;
        Ok(())
    }
}

/// All boundary inputs of a simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Boundaries {
    #[serde(default)]
    pub time_series: Vec<TimeSeries>,
    #[serde(default)]
    pub instantaneous_inputs: Vec<InstantaneousSedimentInput>,
}

impl Boundaries {
    pub fn validate(&self, network: &ReachNetwork) -> Result<()> {
        for series in &self.time_series {
            series.validate()?;
            series.target(network)?;
        }
        for input in &self.instantaneous_inputs {
            input.target(network)?;
            network.reach(0).strata.active().check_compatible(&input.sediment)?;
        }
        Ok(())
    }
}
