//! Renderer seam
//!
//! Template rendering is an external collaborator. The lifecycle engine only
//! needs "chart + config in, manifest text out".

use crate::chart::Chart;
use crate::error::RenderError;
use crate::values::Values;

/// Renders a chart with a config into a multi-document manifest
pub trait Renderer: Send + Sync {
    fn render(&self, chart: &Chart, values: &Values) -> Result<String, RenderError>;
}

/// Renderer that emits the chart's templates verbatim, in path order
///
/// Useful for pre-rendered charts and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRenderer;

impl Renderer for PassthroughRenderer {
    fn render(&self, chart: &Chart, _values: &Values) -> Result<String, RenderError> {
        Ok(crate::manifest::join_manifests(chart.templates.values()))
    }
}
