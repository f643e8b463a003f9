//! Translation between the canonical chat model and each family's dialect.
//!
//! Requests go canonical → provider through `request`; upstream answers come
//! back through `response`, or chunk by chunk through `streaming`. Everything
//! here is pure (no I/O).

pub mod anthropic;
pub mod anthropic_types;
pub mod canonical;
pub mod decoder;
pub mod google;
pub mod google_types;
pub mod openai;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
pub mod upstream_types;
