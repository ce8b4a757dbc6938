//! Volumes of sediment split by grain kind and grain-size class.
//!
//! A [`GrainMixture`] holds one abundance vector per [`GrainKind`], all of the
//! same length (one entry per grain-size class).  Components are kept sorted
//! by kind so two mixtures with the same kinds line up index by index.
//! Entries are volumes and never become negative: subtraction and erosion
//! clamp at what is present.
pub mod kind;

pub use kind::GrainKind;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SedflowError};

/// Abundances of a single grain kind, one entry per grain-size class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrainComponent {
    pub kind: GrainKind,
    pub fractions: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<GrainComponent>", into = "Vec<GrainComponent>")]
pub struct GrainMixture {
    components: Vec<GrainComponent>,
}

impl TryFrom<Vec<GrainComponent>> for GrainMixture {
    type Error = SedflowError;

    fn try_from(components: Vec<GrainComponent>) -> Result<Self> {
        GrainMixture::new(components)
    }
}

impl From<GrainMixture> for Vec<GrainComponent> {
    fn from(mixture: GrainMixture) -> Self {
        mixture.components
    }
}

impl GrainMixture {
    /// Validates and sorts the components.
    pub fn new(mut components: Vec<GrainComponent>) -> Result<Self> {
        components.sort_by_key(|c| c.kind);
        for pair in components.windows(2) {
            if pair[0].kind == pair[1].kind {
                return Err(SedflowError::DuplicateGrainKind {
                    kind: pair[0].kind.to_string(),
                });
            }
        }
        if let Some(first) = components.first() {
            let expected = first.fractions.len();
            for c in &components {
                if c.fractions.len() != expected {
                    return Err(SedflowError::FractionCountMismatch {
                        expected,
                        found: c.fractions.len(),
                    });
                }
                if let Some(&value) = c.fractions.iter().find(|v| !(**v >= 0.0) || !v.is_finite()) {
                    return Err(SedflowError::NegativeAbundance {
                        kind: c.kind.to_string(),
                        value,
                    });
                }
            }
        }
        Ok(Self { components })
    }

    /// Mixture consisting of ordinary bed material only.
    pub fn normal(fractions: Vec<f64>) -> Result<Self> {
        Self::new(vec![GrainComponent {
            kind: GrainKind::Normal,
            fractions,
        }])
    }

    pub fn components(&self) -> &[GrainComponent] {
        &self.components
    }

    pub(crate) fn components_mut(&mut self) -> &mut [GrainComponent] {
        &mut self.components
    }

    pub fn kinds(&self) -> Vec<GrainKind> {
        self.components.iter().map(|c| c.kind).collect()
    }

    pub fn fraction_count(&self) -> usize {
        self.components.first().map_or(0, |c| c.fractions.len())
    }

    pub fn component(&self, kind: GrainKind) -> Option<&GrainComponent> {
        self.components.iter().find(|c| c.kind == kind)
    }

    fn kinds_label(&self) -> String {
        self.components
            .iter()
            .map(|c| c.kind.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Fails unless both mixtures carry the same kinds and class count.
    pub fn check_compatible(&self, other: &GrainMixture) -> Result<()> {
        let same_kinds = self.components.len() == other.components.len()
            && self
                .components
                .iter()
                .zip(&other.components)
                .all(|(a, b)| a.kind == b.kind);
        if !same_kinds {
            return Err(SedflowError::GrainKindMismatch {
                left: self.kinds_label(),
                right: other.kinds_label(),
            });
        }
        if self.fraction_count() != other.fraction_count() {
            return Err(SedflowError::FractionCountMismatch {
                expected: self.fraction_count(),
                found: other.fraction_count(),
            });
        }
        Ok(())
    }

    // ── Arithmetic ───────────────────────────────────────────────────────────

    pub fn add(&mut self, other: &GrainMixture) -> Result<()> {
        self.check_compatible(other)?;
        for (mine, theirs) in self.components.iter_mut().zip(&other.components) {
            for (m, t) in mine.fractions.iter_mut().zip(&theirs.fractions) {
                *m += t;
            }
        }
        self.check_finite("add")
    }

    /// Removes up to `other` per entry and returns the amount actually removed.
    pub fn subtract(&mut self, other: &GrainMixture) -> Result<GrainMixture> {
        let removed = self.potential_subtraction(other)?;
        for (mine, gone) in self.components.iter_mut().zip(&removed.components) {
            for (m, g) in mine.fractions.iter_mut().zip(&gone.fractions) {
                *m = (*m - g).max(0.0);
            }
        }
        self.check_finite("subtract")?;
        Ok(removed)
    }

    /// What [`subtract`](Self::subtract) would remove, without mutating.
    pub fn potential_subtraction(&self, other: &GrainMixture) -> Result<GrainMixture> {
        self.check_compatible(other)?;
        let components = self
            .components
            .iter()
            .zip(&other.components)
            .map(|(mine, theirs)| GrainComponent {
                kind: mine.kind,
                fractions: mine
                    .fractions
                    .iter()
                    .zip(&theirs.fractions)
                    .map(|(&m, &t)| t.max(0.0).min(m))
                    .collect(),
            })
            .collect();
        Ok(GrainMixture { components })
    }

    pub fn scale(&mut self, factor: f64) -> Result<()> {
        if !(factor >= 0.0) {
            return Err(SedflowError::NegativeScale { factor });
        }
        for c in &mut self.components {
            for v in &mut c.fractions {
                *v *= factor;
            }
        }
        self.check_finite("scale")
    }

    pub fn scaled(&self, factor: f64) -> Result<GrainMixture> {
        let mut result = self.clone();
        result.scale(factor)?;
        Ok(result)
    }

    /// Same kinds and class count, all entries zero.
    pub fn zeroed(&self) -> GrainMixture {
        GrainMixture {
            components: self
                .components
                .iter()
                .map(|c| GrainComponent {
                    kind: c.kind,
                    fractions: vec![0.0; c.fractions.len()],
                })
                .collect(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.components
            .iter()
            .all(|c| c.fractions.iter().all(|&v| v == 0.0))
    }

    /// Rescaled to the given overall volume, zero if currently empty.
    pub fn normalized_to(&self, volume: f64) -> Result<GrainMixture> {
        let overall = self.overall_volume();
        if overall > 0.0 {
            self.scaled(volume / overall)
        } else {
            Ok(self.zeroed())
        }
    }

    pub fn fraction(&self, kind: GrainKind, index: usize) -> Option<f64> {
        self.component(kind).and_then(|c| c.fractions.get(index).copied())
    }

    pub fn set_fraction(&mut self, kind: GrainKind, index: usize, value: f64) -> Result<()> {
        if !(value >= 0.0) || !value.is_finite() {
            return Err(SedflowError::NegativeAbundance {
                kind: kind.to_string(),
                value,
            });
        }
        let count = self.fraction_count();
        let component = self
            .components
            .iter_mut()
            .find(|c| c.kind == kind)
            .ok_or_else(|| SedflowError::UnknownGrainKind {
                kind: kind.to_string(),
            })?;
        let slot = component
            .fractions
            .get_mut(index)
            .ok_or(SedflowError::FractionIndexOutOfRange { index, count })?;
        *slot = value;
        Ok(())
    }

    /// Linear blend of two compatible mixtures; `t` is clamped to [0, 1].
    pub fn interpolate_linearly(a: &GrainMixture, b: &GrainMixture, t: f64) -> Result<GrainMixture> {
        a.check_compatible(b)?;
        if t <= 0.0 {
            return Ok(a.clone());
        }
        if t >= 1.0 {
            return Ok(b.clone());
        }
        let components = a
            .components
            .iter()
            .zip(&b.components)
            .map(|(ca, cb)| GrainComponent {
                kind: ca.kind,
                fractions: ca
                    .fractions
                    .iter()
                    .zip(&cb.fractions)
                    .map(|(&x, &y)| x + t * (y - x))
                    .collect(),
            })
            .collect();
        Ok(GrainMixture { components })
    }

    /// Spreads a kind-summed abundance per class over the kinds of `base`,
    /// proportionally to their share in `base`.  Classes empty in `base` are
    /// split equally.
    pub fn distribute_fractional_abundance(per_fraction: &[f64], base: &GrainMixture) -> Result<GrainMixture> {
        if per_fraction.len() != base.fraction_count() {
            return Err(SedflowError::FractionCountMismatch {
                expected: base.fraction_count(),
                found: per_fraction.len(),
            });
        }
        let overall = base.overall_fractional_abundance();
        let equal_share = 1.0 / base.components.len().max(1) as f64;
        let components = base
            .components
            .iter()
            .map(|c| GrainComponent {
                kind: c.kind,
                fractions: per_fraction
                    .iter()
                    .zip(&c.fractions)
                    .zip(&overall)
                    .map(|((&value, &share), &total)| {
                        if total == 0.0 {
                            value * equal_share
                        } else {
                            value * share / total
                        }
                    })
                    .collect(),
            })
            .collect();
        GrainMixture::new(components)
    }

    // ── Statistics ───────────────────────────────────────────────────────────

    /// Abundance per class summed over all kinds.
    pub fn overall_fractional_abundance(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.fraction_count()];
        for c in &self.components {
            for (s, v) in sums.iter_mut().zip(&c.fractions) {
                *s += v;
            }
        }
        sums
    }

    pub fn overall_volume(&self) -> f64 {
        self.overall_fractional_abundance().iter().sum()
    }

    /// Normalised cumulative abundance per class (empty mixture gives zeros).
    pub fn cumulative_fractional_abundance(&self) -> Vec<f64> {
        let overall = self.overall_fractional_abundance();
        let total: f64 = overall.iter().sum();
        let mut running = 0.0;
        overall
            .iter()
            .map(|v| {
                running += v;
                if total > 0.0 {
                    running / total
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Diameter below which `percentile` percent of the volume lies,
    /// interpolated log-linearly between class diameters.  NaN if empty or
    /// if `diameters` does not match the fraction count.
    pub fn percentile_diameter(&self, diameters: &[f64], percentile: f64) -> f64 {
        let cumulative = self.cumulative_fractional_abundance();
        if self.overall_volume() <= 0.0 || diameters.is_empty() || diameters.len() != cumulative.len() {
            return f64::NAN;
        }
        let rank = percentile * 0.01;
        let upper = cumulative
            .iter()
            .position(|&c| c >= rank)
            .unwrap_or(cumulative.len() - 1);
        if upper == 0 {
            return diameters[0];
        }
        let lower = upper - 1;
        let (d_lo, d_hi) = (diameters[lower].ln(), diameters[upper].ln());
        let (c_lo, c_hi) = (cumulative[lower], cumulative[upper]);
        if c_hi <= c_lo {
            return diameters[upper];
        }
        (d_lo + (d_hi - d_lo) * (rank - c_lo) / (c_hi - c_lo)).exp()
    }

    pub fn arithmetic_mean_diameter(&self, diameters: &[f64]) -> f64 {
        let overall = self.overall_fractional_abundance();
        let total: f64 = overall.iter().sum();
        if total <= 0.0 {
            return f64::NAN;
        }
        overall.iter().zip(diameters).map(|(p, d)| p * d).sum::<f64>() / total
    }

    pub fn geometric_mean_diameter(&self, diameters: &[f64]) -> f64 {
        let overall = self.overall_fractional_abundance();
        let total: f64 = overall.iter().sum();
        if total <= 0.0 {
            return f64::NAN;
        }
        overall
            .iter()
            .zip(diameters)
            .map(|(p, d)| d.powf(p / total))
            .product()
    }

    /// Volume of the classes whose diameter lies within the closed range.
    pub fn volume_within_diameter_range(&self, diameters: &[f64], first: f64, second: f64) -> f64 {
        let (lo, hi) = if first <= second { (first, second) } else { (second, first) };
        self.overall_fractional_abundance()
            .iter()
            .zip(diameters)
            .filter(|(_, &d)| d >= lo && d <= hi)
            .map(|(v, _)| v)
            .sum()
    }

    #[cfg(debug_assertions)]
    pub(crate) fn check_finite(&self, operation: &'static str) -> Result<()> {
        if self
            .components
            .iter()
            .any(|c| c.fractions.iter().any(|v| v.is_nan()))
        {
            return Err(SedflowError::NotANumber { operation });
        }
        Ok(())
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    pub(crate) fn check_finite(&self, _operation: &'static str) -> Result<()> {
        Ok(())
    }
}
