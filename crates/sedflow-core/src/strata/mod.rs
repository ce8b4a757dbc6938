//! Layered bed composition of a reach, stored per unit bed surface so that a
//! layer's overall volume equals its thickness.  Layer 0 is the active layer.
pub mod sorting;

pub use sorting::{BreakUpConditions, ContinuousSorting, ShearStressSorting, StrataSorting, ThresholdBasedSorting};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SedflowError};
use crate::grains::{GrainComponent, GrainMixture};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StratigraphyFields")]
pub struct Stratigraphy {
    pub layers: Vec<GrainMixture>,
    /// Sublayer composition remembered by shear-stress based sorting for the
    /// moment the sublayer has been used up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sublayer_memory: Option<GrainMixture>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub break_up: Option<BreakUpConditions>,
}

/// Unchecked serialized form, validated by [`Stratigraphy::new`].
#[derive(Deserialize)]
struct StratigraphyFields {
    layers: Vec<GrainMixture>,
    #[serde(default)]
    sublayer_memory: Option<GrainMixture>,
    #[serde(default)]
    break_up: Option<BreakUpConditions>,
}

impl TryFrom<StratigraphyFields> for Stratigraphy {
    type Error = SedflowError;

    fn try_from(fields: StratigraphyFields) -> Result<Self> {
        let mut strata = Stratigraphy::new(fields.layers)?;
        if let Some(memory) = &fields.sublayer_memory {
            strata.active().check_compatible(memory)?;
        }
        strata.sublayer_memory = fields.sublayer_memory;
        strata.break_up = fields.break_up;
        Ok(strata)
    }
}

impl Stratigraphy {
    pub fn new(layers: Vec<GrainMixture>) -> Result<Self> {
        let first = layers
            .first()
            .ok_or_else(|| SedflowError::invalid("strata", "at least one layer is required"))?;
        for layer in &layers[1..] {
            first.check_compatible(layer)?;
        }
        Ok(Self {
            layers,
            sublayer_memory: None,
            break_up: None,
        })
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn active(&self) -> &GrainMixture {
        &self.layers[0]
    }

    pub fn layer(&self, index: usize) -> Option<&GrainMixture> {
        self.layers.get(index)
    }

    pub fn overall_volume(&self) -> f64 {
        self.layers.iter().map(GrainMixture::overall_volume).sum()
    }

    /// Adds `material` to the active layer.
    pub fn deposit(&mut self, material: &GrainMixture) -> Result<()> {
        let active = &mut self.layers[0];
        active.check_compatible(material)?;
        for (layer, amount) in active.components_mut().iter_mut().zip(material.components()) {
            layer.kind.deposit(&mut layer.fractions, &amount.fractions)?;
        }
        active.check_finite("deposit")
    }

    /// Removes `request` from the active layer, returning what was removed.
    pub fn erode(&mut self, request: &GrainMixture) -> Result<GrainMixture> {
        let active = &mut self.layers[0];
        active.check_compatible(request)?;
        let removed = active
            .components_mut()
            .iter_mut()
            .zip(request.components())
            .map(|(layer, wanted)| GrainComponent {
                kind: layer.kind,
                fractions: layer.kind.erode(&mut layer.fractions, &wanted.fractions),
            })
            .collect();
        active.check_finite("erode")?;
        GrainMixture::new(removed)
    }

    /// What [`erode`](Self::erode) would remove, without mutating.
    pub fn potential_erosion(&self, request: &GrainMixture) -> Result<GrainMixture> {
        let active = &self.layers[0];
        active.check_compatible(request)?;
        let removed = active
            .components()
            .iter()
            .zip(request.components())
            .map(|(layer, wanted)| GrainComponent {
                kind: layer.kind,
                fractions: layer.kind.potential_erosion(&layer.fractions, &wanted.fractions),
            })
            .collect();
        GrainMixture::new(removed)
    }

    /// Places each kind of `material` into its insertion layer.
    pub fn insert(&mut self, material: &GrainMixture) -> Result<()> {
        let layers = self.layers.len();
        self.layers[0].check_compatible(material)?;
        for component in material.components() {
            let index = component.kind.insertion_layer();
            let target = self
                .layers
                .get_mut(index)
                .ok_or(SedflowError::MissingInsertionLayer { layer: index, layers })?;
            if let Some(slot) = target.components_mut().iter_mut().find(|c| c.kind == component.kind) {
                for (s, v) in slot.fractions.iter_mut().zip(&component.fractions) {
                    *s += v;
                }
            }
            target.check_finite("insert")?;
        }
        Ok(())
    }
}
