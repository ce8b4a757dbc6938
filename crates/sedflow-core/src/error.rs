//! Error taxonomy for network construction, grain algebra, routing and
//! configuration.  Every variant is fatal for the run that raised it.
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SedflowError {
    // ── Network topology ─────────────────────────────────────────────────────
    #[error("reach network contains no reaches")]
    EmptyNetwork,
    #[error("duplicate reach id {id}")]
    DuplicateReachId { id: i64 },
    #[error("reach id {id} is reserved")]
    ReservedReachId { id: i64 },
    #[error("reach {reach} drains into unknown reach {downstream}")]
    UnknownDownstream { reach: i64, downstream: i64 },
    #[error("reach {reach} drains into reach {downstream}, which is not further downstream")]
    UnorderedReaches { reach: i64, downstream: i64 },
    #[error("reach {reach} has no downstream reach but is not the outlet")]
    MissingDownstream { reach: i64 },
    #[error("outlet reach {reach} must not name a downstream reach")]
    OutletHasDownstream { reach: i64 },

    // ── Grain algebra ────────────────────────────────────────────────────────
    #[error("grain kinds do not match: [{left}] vs [{right}]")]
    GrainKindMismatch { left: String, right: String },
    #[error("duplicate grain kind {kind}")]
    DuplicateGrainKind { kind: String },
    #[error("expected {expected} grain fractions, found {found}")]
    FractionCountMismatch { expected: usize, found: usize },
    #[error("invalid fractional abundance {value} for {kind} grains")]
    NegativeAbundance { kind: String, value: f64 },
    #[error("strata carry {fractions} grain fractions but {diameters} grain diameters are configured")]
    GrainClassMismatch { fractions: usize, diameters: usize },
    #[error("fraction index {index} out of range for {count} fractions")]
    FractionIndexOutOfRange { index: usize, count: usize },
    #[error("grain kind {kind} is not part of the mixture")]
    UnknownGrainKind { kind: String },
    #[error("invalid scaling factor {factor} for grains")]
    NegativeScale { factor: f64 },
    #[error("grain mixture contains NaN after {operation}")]
    NotANumber { operation: &'static str },
    #[error("{kind} grains are ephemeral and cannot be deposited")]
    EphemeralDeposition { kind: String },
    #[error("insertion layer {layer} does not exist in a stratigraphy of {layers} layers")]
    MissingInsertionLayer { layer: usize, layers: usize },
    #[error("{strategy} requires {expected} strata layers, found {found}")]
    StrataLayerCount {
        strategy: &'static str,
        expected: &'static str,
        found: usize,
    },

    // ── Model applicability ──────────────────────────────────────────────────
    #[error("implicit kinematic wave requires 1 < exponent < 10, found {exponent}")]
    ImplicitExponentOutOfRange { exponent: f64 },
    #[error("discharge is not a power law of water volume at {location}")]
    NotAPowerLaw { location: String },
    #[error("gradient of {property} is not defined across the sill downstream of {location}")]
    UnsupportedSillProperty { property: String, location: String },
    #[error("gradient weighting by {property} is not supported")]
    UnsupportedWeighting { property: String },
    #[error("negative sediment energy slope {slope} at {location}")]
    NegativeEnergySlope { slope: f64, location: String },
    #[error("negative active perimeter {perimeter}")]
    NegativePerimeter { perimeter: f64 },
    #[error("root finding for {quantity} did not converge")]
    RootNotFound { quantity: &'static str },

    // ── Numerical guards ─────────────────────────────────────────────────────
    #[error(
        "timestep {dt} s fell below the termination threshold of {threshold} s; \
         smallest bed slope {bedslope} at {location}"
    )]
    TimestepTooSmall {
        dt: f64,
        threshold: f64,
        bedslope: f64,
        location: String,
    },
    #[error("reported {count} timesteps below the monitoring threshold; aborting")]
    TimestepOutputBudgetExhausted { count: usize },
    #[error("simulation time became non-finite")]
    NonFiniteTime,

    // ── Configuration ────────────────────────────────────────────────────────
    #[error("water flow must be the first flow scheme, sediment flow must follow it")]
    SchemeOrder,
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("failed to parse simulation config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read simulation config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SedflowError>;

impl SedflowError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        SedflowError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}
