//! Construction of a [`ReachNetwork`] from an unordered list of user reaches,
//! and export back into that form.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Reach, ReachKind, ReachNetwork, ReachState};
use crate::channel::{ChannelBehaviour, Sill};
use crate::error::{Result, SedflowError};
use crate::strata::Stratigraphy;

/// User description of one reach.  `downstream` names the user id of the
/// reach it drains into; only the outlet omits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReachDescriptor {
    pub id: i64,
    #[serde(default)]
    pub downstream: Option<i64>,
    pub length: f64,
    pub elevation: f64,
    #[serde(default)]
    pub discharge: f64,
    #[serde(default)]
    pub maximum_water_depth: f64,
    #[serde(default)]
    pub flow_velocity: f64,
    #[serde(default)]
    pub bedslope: f64,
    #[serde(default)]
    pub water_energy_slope: f64,
    #[serde(default)]
    pub sediment_energy_slope: f64,
    pub strata: Stratigraphy,
    pub channel: ChannelBehaviour,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sill: Option<Sill>,
}

impl ReachDescriptor {
    fn validate(&self) -> Result<()> {
        if self.id == i64::MIN || self.id == i64::MAX {
            return Err(SedflowError::ReservedReachId { id: self.id });
        }
        if !(self.length > 0.0) {
            return Err(SedflowError::invalid("reach.length", format!("reach {} needs a positive length", self.id)));
        }
        if !self.elevation.is_finite() {
            return Err(SedflowError::invalid("reach.elevation", format!("reach {} has no finite elevation", self.id)));
        }
        if self.discharge < 0.0 || self.maximum_water_depth < 0.0 {
            return Err(SedflowError::invalid(
                "reach.hydraulics",
                format!("reach {} has negative discharge or depth", self.id),
            ));
        }
        if self.strata.is_empty() {
            return Err(SedflowError::invalid("reach.strata", format!("reach {} has no strata layers", self.id)));
        }
        self.channel.geometry().validate()?;
        if let Some(sill) = &self.sill {
            sill.weir.validate()?;
        }
        Ok(())
    }

    fn to_reach(&self, index: usize, kind: ReachKind) -> Reach {
        let template = self.strata.active();
        Reach {
            index,
            user_id: self.id,
            kind,
            downstream: None,
            upstream: Vec::new(),
            state: ReachState {
                elevation: self.elevation,
                length: self.length,
                discharge: self.discharge,
                flow_velocity: self.flow_velocity,
                maximum_water_depth: self.maximum_water_depth,
                bed_shear_stress: 0.0,
                active_width: 0.0,
                bedslope: self.bedslope,
                water_energy_slope: self.water_energy_slope,
                sediment_energy_slope: self.sediment_energy_slope,
                water_volume_change: 0.0,
                water_volume_change_rate: 0.0,
                erosion_rate: template.zeroed(),
                deposition_rate: template.zeroed(),
                erosion: template.zeroed(),
                deposition: template.zeroed(),
                erosion_per_unit_bed_surface: template.zeroed(),
                deposition_per_unit_bed_surface: template.zeroed(),
            },
            strata: self.strata.clone(),
            channel: self.channel.clone(),
            sill: self.sill.clone(),
            capacity_bypass: false,
        }
    }
}

impl ReachNetwork {
    /// Builds the canonical network: user ids are sorted, every headwater
    /// reach gets an upstream margin, the outlet a downstream margin, and
    /// margin elevations are extrapolated from their neighbours.
    pub fn from_descriptors(descriptors: Vec<ReachDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(SedflowError::EmptyNetwork);
        }
        let mut by_id = BTreeMap::new();
        for d in descriptors {
            d.validate()?;
            let id = d.id;
            if by_id.insert(id, d).is_some() {
                return Err(SedflowError::DuplicateReachId { id });
            }
        }
        let first = by_id.values().next().map(|d| d.strata.active().clone());
        if let Some(template) = first {
            for d in by_id.values() {
                for layer in &d.strata.layers {
                    template.check_compatible(layer)?;
                }
            }
        }

        // ── Canonical numbering with upstream margins ───────────────────────
        let mut reaches: Vec<Reach> = Vec::with_capacity(by_id.len() * 2 + 1);
        let mut upstream_of: HashMap<i64, Vec<usize>> = HashMap::new();
        let mut canonical: HashMap<i64, usize> = HashMap::new();
        for (&id, d) in &by_id {
            if !upstream_of.contains_key(&id) {
                let margin = d.to_reach(reaches.len(), ReachKind::UpstreamMargin);
                upstream_of.insert(id, vec![margin.index]);
                reaches.push(margin);
            }
            let mut reach = d.to_reach(reaches.len(), ReachKind::Regular);
            reach.upstream = upstream_of.get(&id).cloned().unwrap_or_default();
            canonical.insert(id, reach.index);
            if let Some(down) = d.downstream {
                upstream_of.entry(down).or_default().push(reach.index);
            }
            reaches.push(reach);
        }
        let last = reaches.len() - 1;
        let mut outlet = reaches[last].clone();
        outlet.index = reaches.len();
        outlet.kind = ReachKind::DownstreamMargin;
        outlet.upstream = vec![last];
        reaches.push(outlet);
        let margin_index = reaches.len() - 1;

        // ── Resolve downstream ids ──────────────────────────────────────────
        let outlet_id = reaches[last].user_id;
        for reach in reaches.iter_mut() {
            match reach.kind {
                ReachKind::UpstreamMargin => reach.downstream = Some(reach.index + 1),
                ReachKind::DownstreamMargin => reach.downstream = None,
                ReachKind::Regular => {
                    let id = reach.user_id;
                    let named = by_id.get(&id).and_then(|d| d.downstream);
                    reach.downstream = match (named, id == outlet_id) {
                        (None, true) => Some(margin_index),
                        (Some(_), true) => return Err(SedflowError::OutletHasDownstream { reach: id }),
                        (None, false) => return Err(SedflowError::MissingDownstream { reach: id }),
                        (Some(down), false) => {
                            let target = *canonical
                                .get(&down)
                                .ok_or(SedflowError::UnknownDownstream { reach: id, downstream: down })?;
                            if target <= reach.index {
                                return Err(SedflowError::UnorderedReaches { reach: id, downstream: down });
                            }
                            Some(target)
                        }
                    };
                }
            }
        }

        let mut network = ReachNetwork { reaches };
        network.set_margin_elevations();
        info!(
            target: "sedflow::network",
            reaches = by_id.len(),
            margins = network.len() - by_id.len(),
            "network.built"
        );
        Ok(network)
    }

    /// Upstream margins continue the slope of the two reaches below them;
    /// the downstream margin continues the mean slope into the outlet,
    /// measured from the outlet's sill crest if that is higher.
    fn set_margin_elevations(&mut self) {
        for i in 0..self.reaches.len() {
            if !self.reaches[i].is_upstream_margin() {
                continue;
            }
            let Some(d) = self.reaches[i].downstream else { continue };
            let Some(dd) = self.reaches[d].downstream else { continue };
            let length = self.reaches[i].state.length;
            let e_d = self.reaches[d].state.elevation;
            let slope = (e_d - self.reaches[dd].state.elevation) / length;
            self.reaches[i].state.elevation = e_d + slope * length;
            self.reaches[i].state.bedslope = slope;
        }

        let m = self.downstream_margin();
        let outlet = self.reaches[m].upstream[0];
        let e_up = self.reaches[outlet].state.elevation;
        let top_edge = self.reaches[m]
            .sill
            .as_ref()
            .map_or(e_up, |s| e_up.max(s.top_edge_elevation));
        let upstream = &self.reaches[outlet].upstream;
        let slope = upstream
            .iter()
            .map(|&u| (self.reaches[u].state.elevation - top_edge) / self.reaches[u].state.length)
            .sum::<f64>()
            / upstream.len().max(1) as f64;
        let margin = &mut self.reaches[m];
        margin.state.elevation = e_up - slope * margin.state.length;
        margin.state.bedslope = slope;
        margin.sill = None;
    }

    /// The regular reaches in their current state, keyed by user id.
    pub fn to_descriptors(&self) -> Vec<ReachDescriptor> {
        self.reaches
            .iter()
            .filter(|r| r.kind == ReachKind::Regular)
            .map(|r| ReachDescriptor {
                id: r.user_id,
                downstream: self
                    .downstream_of(r.index)
                    .filter(|d| d.kind == ReachKind::Regular)
                    .map(|d| d.user_id),
                length: r.state.length,
                elevation: r.state.elevation,
                discharge: r.state.discharge,
                maximum_water_depth: r.state.maximum_water_depth,
                flow_velocity: r.state.flow_velocity,
                bedslope: r.state.bedslope,
                water_energy_slope: r.state.water_energy_slope,
                sediment_energy_slope: r.state.sediment_energy_slope,
                strata: r.strata.clone(),
                channel: r.channel.clone(),
                sill: r.sill.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tests::descriptor;
    use approx::assert_relative_eq;

    /// Two headwaters (1, 2) joining at 3, which drains into 5.
    fn confluence() -> Vec<ReachDescriptor> {
        vec![
            descriptor(5, None, 1.0),
            descriptor(2, Some(3), 4.0),
            descriptor(3, Some(5), 2.0),
            descriptor(1, Some(3), 3.0),
        ]
    }

    #[test]
    fn confluence_gets_margins_in_canonical_order() {
        let net = ReachNetwork::from_descriptors(confluence()).unwrap();
        let kinds: Vec<ReachKind> = net.reaches().iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ReachKind::UpstreamMargin,
                ReachKind::Regular,
                ReachKind::UpstreamMargin,
                ReachKind::Regular,
                ReachKind::Regular,
                ReachKind::Regular,
                ReachKind::DownstreamMargin,
            ]
        );
        assert_eq!(net.canonical_index(3), Some(4));
        assert_eq!(net.reach(4).upstream, vec![1, 3], "both headwaters feed the confluence");
        for r in net.reaches() {
            if let Some(d) = r.downstream {
                assert!(d > r.index, "{} drains upstream", net.label(r.index));
            }
            if !r.is_upstream_margin() {
                assert!(!r.upstream.is_empty(), "{} has no inflow", net.label(r.index));
            }
        }
        assert_eq!(net.label(0), "upstream margin at reach 1");
        assert_eq!(net.label(6), "downstream margin");
    }

    #[test]
    fn margin_elevations_extrapolate_neighbour_slopes() {
        let net = ReachNetwork::from_descriptors(confluence()).unwrap();
        // Margin of reach 1: 3.0 + (3.0 - 2.0) = 4.0.
        assert_relative_eq!(net.reach(0).state.elevation, 4.0);
        // Downstream margin: mean slope of 3 into 5 is 0.01, continued below 5.
        assert_relative_eq!(net.reach(6).state.elevation, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn downstream_margin_measures_from_sill_crest() {
        let mut reaches = vec![descriptor(1, Some(2), 3.0), descriptor(2, None, 2.0)];
        reaches[1].sill = Some(Sill {
            top_edge_elevation: 2.5,
            weir: crate::channel::PoleniSill { overfall_width: 5.0, poleni_factor: 0.577 },
        });
        let net = ReachNetwork::from_descriptors(reaches).unwrap();
        let m = net.downstream_margin();
        assert_relative_eq!(net.reach(m).state.elevation, 2.0 - 0.5, epsilon = 1e-12);
        assert!(net.reach(m).sill.is_none(), "margin must not keep the sill");
        assert!(net.reach(m - 1).sill.is_some());
    }

    #[test]
    fn export_rebuilds_identical_topology() {
        let net = ReachNetwork::from_descriptors(confluence()).unwrap();
        let again = ReachNetwork::from_descriptors(net.to_descriptors()).unwrap();
        assert_eq!(net.len(), again.len());
        for (a, b) in net.reaches().iter().zip(again.reaches()) {
            assert_eq!((a.user_id, a.kind, a.downstream), (b.user_id, b.kind, b.downstream));
            assert_eq!(a.upstream, b.upstream);
            assert_relative_eq!(a.state.elevation, b.state.elevation);
        }
        assert_eq!(net.to_descriptors(), again.to_descriptors());
    }

    #[test]
    fn invalid_topologies_are_rejected() {
        let dup = vec![descriptor(1, Some(2), 2.0), descriptor(1, Some(2), 2.0), descriptor(2, None, 1.0)];
        assert!(matches!(
            ReachNetwork::from_descriptors(dup),
            Err(SedflowError::DuplicateReachId { id: 1 })
        ));

        let reserved = vec![descriptor(i64::MAX, None, 1.0)];
        assert!(matches!(
            ReachNetwork::from_descriptors(reserved),
            Err(SedflowError::ReservedReachId { .. })
        ));

        let unknown = vec![descriptor(1, Some(7), 2.0), descriptor(2, None, 1.0)];
        assert!(matches!(
            ReachNetwork::from_descriptors(unknown),
            Err(SedflowError::UnknownDownstream { reach: 1, downstream: 7 })
        ));

        let upward = vec![descriptor(1, None, 2.0), descriptor(2, Some(1), 1.0)];
        assert!(ReachNetwork::from_descriptors(upward).is_err(), "drains against the ordering");

        let two_outlets = vec![descriptor(1, None, 2.0), descriptor(2, None, 1.0)];
        assert!(matches!(
            ReachNetwork::from_descriptors(two_outlets),
            Err(SedflowError::MissingDownstream { reach: 1 })
        ));

        assert!(matches!(ReachNetwork::from_descriptors(vec![]), Err(SedflowError::EmptyNetwork)));
    }

    #[test]
    fn reach_without_strata_is_rejected() {
        let mut reaches = vec![descriptor(1, Some(2), 2.0), descriptor(2, None, 1.0)];
        reaches[1].strata.layers.clear();
        assert!(matches!(
            ReachNetwork::from_descriptors(reaches),
            Err(SedflowError::InvalidParameter { .. })
        ));
    }
}
