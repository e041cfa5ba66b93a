//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid chart metadata: {message}")]
    InvalidChart { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("Invalid manifest document {index}: {message}")]
    InvalidDocument { index: usize, message: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Error reported by a [`Renderer`](crate::Renderer).
///
/// The lifecycle engine surfaces it to callers unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("render failed{}: {message}", location(.template))]
pub struct RenderError {
    /// Template that failed, when the renderer knows it
    pub template: Option<String>,
    /// Renderer message
    pub message: String,
}

impl RenderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            template: None,
            message: message.into(),
        }
    }

    pub fn in_template(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            template: Some(template.into()),
            message: message.into(),
        }
    }
}

fn location(template: &Option<String>) -> String {
    template
        .as_ref()
        .map(|t| format!(" in '{}'", t))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_display() {
        let err = RenderError::in_template("deployment.yaml", "undefined variable 'image'");
        assert_eq!(
            err.to_string(),
            "render failed in 'deployment.yaml': undefined variable 'image'"
        );

        let err = RenderError::new("boom");
        assert_eq!(err.to_string(), "render failed: boom");

        let source: &dyn std::error::Error = &err;
        assert!(source.source().is_none());
    }
}
