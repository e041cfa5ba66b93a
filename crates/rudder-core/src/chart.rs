//! Chart identity as seen by the release engine
//!
//! Chart loading and packaging live outside this workspace; the engine only
//! needs to know which chart a revision came from and to hand the chart to a
//! [`Renderer`](crate::Renderer).

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};
use crate::values::Values;

/// Chart metadata recorded on every revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// Chart name (required)
    pub name: String,

    /// Chart version (required, SemVer)
    pub version: Version,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Version of the packaged application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

impl ChartMetadata {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: None,
            app_version: None,
        }
    }

    /// Parse `name` and a SemVer string
    pub fn parse(name: impl Into<String>, version: &str) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::InvalidChart {
                message: "chart name must not be empty".to_string(),
            });
        }
        Ok(Self::new(name, Version::parse(version)?))
    }
}

/// A loaded chart: metadata, raw templates and default values
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chart {
    pub metadata: ChartMetadata,

    /// Template path -> template source, opaque to the engine
    #[serde(default)]
    pub templates: BTreeMap<String, String>,

    /// Chart default values
    #[serde(default)]
    pub values: Values,
}

impl Chart {
    pub fn new(metadata: ChartMetadata) -> Self {
        Self {
            metadata,
            templates: BTreeMap::new(),
            values: Values::new(),
        }
    }

    /// Add a template (builder style)
    pub fn with_template(mut self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.templates.insert(path.into(), source.into());
        self
    }
}
