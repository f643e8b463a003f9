//! Deciding which tool calls a response really carries.
//!
//! `normalizer` is the entry point; `leaked` and `literal` recover calls that
//! the upstream wrote into the text as Python dict literals.

pub mod leaked;
pub mod literal;
pub mod normalizer;

pub use normalizer::{process, Normalized, NormalizerContext};
