//! River reach network: an index arena of reaches ordered from upstream to
//! downstream, padded with synthetic boundary reaches.
//!
//! Canonical indices increase downstream.  Every headwater reach gets an
//! upstream margin in front of it and the outlet is followed by a single
//! downstream margin, so interior stencils never fall off the network.
pub mod build;

pub use build::ReachDescriptor;

use crate::channel::{ChannelBehaviour, Sill};
use crate::error::Result;
use crate::grains::GrainMixture;
use crate::strata::Stratigraphy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachKind {
    Regular,
    UpstreamMargin,
    DownstreamMargin,
}

/// Time-varying hydraulic and sediment state of a reach.
#[derive(Debug, Clone, PartialEq)]
pub struct ReachState {
    pub elevation: f64,
    pub length: f64,
    pub discharge: f64,
    pub flow_velocity: f64,
    pub maximum_water_depth: f64,
    pub bed_shear_stress: f64,
    pub active_width: f64,
    pub bedslope: f64,
    pub water_energy_slope: f64,
    pub sediment_energy_slope: f64,
    pub water_volume_change: f64,
    pub water_volume_change_rate: f64,
    pub erosion_rate: GrainMixture,
    pub deposition_rate: GrainMixture,
    pub erosion: GrainMixture,
    pub deposition: GrainMixture,
    pub erosion_per_unit_bed_surface: GrainMixture,
    pub deposition_per_unit_bed_surface: GrainMixture,
}

impl ReachState {
    /// Zero sediment fluxes shaped like `template`.
    pub(crate) fn clear_sediment(&mut self, template: &GrainMixture) {
        let zero = template.zeroed();
        self.erosion_rate = zero.clone();
        self.deposition_rate = zero.clone();
        self.erosion = zero.clone();
        self.deposition = zero.clone();
        self.erosion_per_unit_bed_surface = zero.clone();
        self.deposition_per_unit_bed_surface = zero;
    }
}

#[derive(Debug, Clone)]
pub struct Reach {
    pub index: usize,
    /// User id of the reach, or of the reach a margin is attached to.
    pub user_id: i64,
    pub kind: ReachKind,
    pub downstream: Option<usize>,
    pub upstream: Vec<usize>,
    pub state: ReachState,
    pub strata: Stratigraphy,
    pub channel: ChannelBehaviour,
    pub sill: Option<Sill>,
    /// Set when the capacity could not be evaluated this step; the erosion
    /// rate is then the sum of the upstream erosion rates.
    pub(crate) capacity_bypass: bool,
}

impl Reach {
    pub fn is_upstream_margin(&self) -> bool {
        self.kind == ReachKind::UpstreamMargin
    }

    pub fn is_downstream_margin(&self) -> bool {
        self.kind == ReachKind::DownstreamMargin
    }

    pub fn is_margin(&self) -> bool {
        self.kind != ReachKind::Regular
    }

    pub fn water_level(&self) -> f64 {
        self.state.elevation + self.state.maximum_water_depth
    }

    /// `z + h + v²/2g`.
    pub fn hydraulic_head(&self, gravity: f64) -> f64 {
        let v = self.state.flow_velocity;
        self.water_level() + v * v / (2.0 * gravity)
    }

    pub fn cross_sectional_area(&self) -> f64 {
        self.channel
            .geometry()
            .cross_sectional_area(self.state.maximum_water_depth)
    }

    pub fn water_volume(&self) -> f64 {
        self.cross_sectional_area() * self.state.length
    }

    /// Converts an overall reach volume into a volume per unit active bed.
    pub fn per_unit_bed_surface(&self, overall: &GrainMixture) -> Result<GrainMixture> {
        self.channel
            .per_unit_bed_surface(overall, self.state.active_width, self.state.length)
    }
}

#[derive(Debug, Clone)]
pub struct ReachNetwork {
    reaches: Vec<Reach>,
}

impl ReachNetwork {
    pub fn len(&self) -> usize {
        self.reaches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reaches.is_empty()
    }

    pub fn reaches(&self) -> &[Reach] {
        &self.reaches
    }

    pub fn reach(&self, index: usize) -> &Reach {
        &self.reaches[index]
    }

    pub fn reach_mut(&mut self, index: usize) -> &mut Reach {
        &mut self.reaches[index]
    }

    pub fn downstream_of(&self, index: usize) -> Option<&Reach> {
        self.reaches[index].downstream.map(|d| &self.reaches[d])
    }

    pub fn upstream_of(&self, index: usize) -> impl Iterator<Item = &Reach> + '_ {
        self.reaches[index].upstream.iter().map(move |&u| &self.reaches[u])
    }

    /// Canonical index of the regular reach with the given user id.
    pub fn canonical_index(&self, user_id: i64) -> Option<usize> {
        self.reaches
            .iter()
            .find(|r| r.kind == ReachKind::Regular && r.user_id == user_id)
            .map(|r| r.index)
    }

    /// User id of a reach; margins report the reach they are attached to.
    pub fn user_id(&self, index: usize) -> i64 {
        self.reaches[index].user_id
    }

    /// Upstream margin feeding the regular reach with the given user id.
    pub fn upstream_margin_of(&self, user_id: i64) -> Option<usize> {
        self.reaches
            .iter()
            .find(|r| r.is_upstream_margin() && r.user_id == user_id)
            .map(|r| r.index)
    }

    /// Number of grain-size classes the reach mixtures carry.
    pub fn fraction_count(&self) -> usize {
        self.reaches[0].strata.active().fraction_count()
    }

    /// Index of the single downstream margin (always the last reach).
    pub fn downstream_margin(&self) -> usize {
        self.reaches.len() - 1
    }

    /// Human readable location used in diagnostics.
    pub fn label(&self, index: usize) -> String {
        let reach = &self.reaches[index];
        match reach.kind {
            ReachKind::Regular => format!("reach {}", reach.user_id),
            ReachKind::UpstreamMargin => format!("upstream margin at reach {}", reach.user_id),
            ReachKind::DownstreamMargin => "downstream margin".to_string(),
        }
    }

    /// Sum of a quantity over the upstream neighbours of a reach.
    pub fn upstream_sum<F>(&self, index: usize, f: F) -> f64
    where
        F: Fn(&Reach) -> f64,
    {
        self.upstream_of(index).map(f).sum()
    }
}
