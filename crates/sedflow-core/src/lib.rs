//! Bedload and water routing through a one-dimensional network of river
//! reaches.
//!
//! A [`Simulation`] owns a [`ReachNetwork`], the shared
//! [`SimulationContext`] and the flow schemes.  Every step evaluates change
//! rates, picks the largest timestep all stability bounds allow, and commits
//! water depths, discharges, bed elevations and stratigraphies.
pub mod capacity;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod flow;
pub mod gradient;
pub mod grains;
pub mod network;
pub mod simulation;
pub mod strata;
pub mod timeseries;
pub mod timestep;
pub mod velocity;

pub use config::SimulationConfig;
pub use context::SimulationContext;
pub use error::{Result, SedflowError};
pub use flow::{FlowScheme, SedimentRouter, WaterScheme};
pub use grains::{GrainKind, GrainMixture};
pub use network::{Reach, ReachDescriptor, ReachNetwork};
pub use simulation::Simulation;
pub use strata::Stratigraphy;
