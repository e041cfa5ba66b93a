//! Rudder Core - shared types for the release lifecycle engine
//!
//! This crate provides the foundational types used throughout Rudder:
//! - `ChartMetadata` / `Chart`: which chart a revision was produced from
//! - `Values`: release config with deep merge support
//! - `manifest`: splitting and identifying documents of a YAML stream
//! - `Renderer`: the seam to the external template renderer

pub mod chart;
pub mod error;
pub mod manifest;
pub mod render;
pub mod values;

pub use chart::{Chart, ChartMetadata};
pub use error::{CoreError, RenderError, Result};
pub use manifest::{Document, ResourceHead, ResourceKey, join_manifests, parse_documents, split_manifests};
pub use render::{PassthroughRenderer, Renderer};
pub use values::Values;
