//! Grain kinds and their per-kind exchange rules with a stratigraphy.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SedflowError};

/// Kind of material tracked in a [`GrainMixture`](super::GrainMixture).
///
/// The derived ordering is the canonical order of components inside a mixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GrainKind {
    /// Ordinary bed material.
    Normal,
    /// Marked material following the same rules as `Normal`, used to trace
    /// the path of a sediment pulse.
    Tracer,
    /// Ephemeral material: cannot be deposited, disappears entirely once
    /// eroded, enters the bed only by insertion into `insertion_layer`.
    FishEggs { insertion_layer: usize },
}

impl fmt::Display for GrainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrainKind::Normal => write!(f, "normal"),
            GrainKind::Tracer => write!(f, "tracer"),
            GrainKind::FishEggs { insertion_layer } => {
                write!(f, "fish eggs (layer {insertion_layer})")
            }
        }
    }
}

impl GrainKind {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, GrainKind::FishEggs { .. })
    }

    /// Layer that receives this kind on insertion.
    pub fn insertion_layer(&self) -> usize {
        match self {
            GrainKind::FishEggs { insertion_layer } => *insertion_layer,
            _ => 0,
        }
    }

    pub(crate) fn deposit(&self, layer: &mut [f64], amount: &[f64]) -> Result<()> {
        if self.is_ephemeral() {
            if amount.iter().any(|&a| a > 0.0) {
                return Err(SedflowError::EphemeralDeposition {
                    kind: self.to_string(),
                });
            }
            return Ok(());
        }
        for (l, a) in layer.iter_mut().zip(amount) {
            *l += a;
        }
        Ok(())
    }

    /// Removes `request` from `layer` and returns what was actually removed.
    pub(crate) fn erode(&self, layer: &mut [f64], request: &[f64]) -> Vec<f64> {
        let removed = self.potential_erosion(layer, request);
        for (l, r) in layer.iter_mut().zip(&removed) {
            *l = (*l - r).max(0.0);
        }
        removed
    }

    pub(crate) fn potential_erosion(&self, layer: &[f64], request: &[f64]) -> Vec<f64> {
        if self.is_ephemeral() {
            // Any erosion at all releases every egg in the active layer.
            if request.iter().any(|&r| r > 0.0) {
                layer.to_vec()
            } else {
                vec![0.0; layer.len()]
            }
        } else {
            layer
                .iter()
                .zip(request)
                .map(|(&l, &r)| r.max(0.0).min(l))
                .collect()
        }
    }
}
