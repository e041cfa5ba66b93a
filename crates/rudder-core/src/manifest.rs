//! Multi-document manifest handling
//!
//! Rendered charts and stored revisions keep their resources as one YAML
//! stream. This module splits that stream into documents and reads just
//! enough of each document (apiVersion, kind, metadata) to identify it.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};

/// Separator used when joining documents back into a stream
pub const DOCUMENT_SEPARATOR: &str = "\n---\n";

/// Minimal view of a Kubernetes resource document
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHead {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: HeadMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HeadMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ResourceHead {
    /// Parse the head of a single YAML document
    pub fn parse(doc: &str) -> Result<Self> {
        let head: ResourceHead = serde_yaml::from_str(doc)?;
        Ok(head)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    /// Identity of this resource, defaulting the namespace
    pub fn key(&self, default_namespace: &str) -> ResourceKey {
        ResourceKey {
            kind: self.kind.clone(),
            namespace: self
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
            name: self.metadata.name.clone(),
        }
    }
}

/// Identity of a live resource: kind, namespace and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// A manifest document together with its parsed head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub head: ResourceHead,
    pub content: String,
}

/// Split a YAML stream into its non-empty documents, in order
pub fn split_manifests(manifest: &str) -> Vec<String> {
    manifest
        .split("\n---")
        .map(|chunk| chunk.strip_prefix("---").unwrap_or(chunk))
        .map(|doc| doc.trim_matches('\n').trim_end())
        .filter(|doc| !is_blank_document(doc))
        .map(str::to_string)
        .collect()
}

/// Split and parse every document of a YAML stream
pub fn parse_documents(manifest: &str) -> Result<Vec<Document>> {
    split_manifests(manifest)
        .into_iter()
        .enumerate()
        .map(|(index, content)| {
            let head = ResourceHead::parse(&content).map_err(|e| CoreError::InvalidDocument {
                index,
                message: e.to_string(),
            })?;
            Ok(Document { head, content })
        })
        .collect()
}

/// Join documents into a single YAML stream
pub fn join_manifests<I, S>(docs: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    docs.into_iter()
        .map(|d| d.as_ref().trim().to_string())
        .collect::<Vec<_>>()
        .join(DOCUMENT_SEPARATOR)
}

/// Empty or comment-only documents carry no resource
fn is_blank_document(doc: &str) -> bool {
    doc.lines()
        .all(|l| l.trim().is_empty() || l.trim().starts_with('#'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = r#"---
apiVersion: v1
kind: ConfigMap
metadata:
  name: app-config
data:
  key: value
---
# just a comment
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: app
  namespace: prod
  annotations:
    helm.sh/resource-policy: keep
"#;

    #[test]
    fn test_split_skips_empty_and_comment_documents() {
        let docs = split_manifests(STREAM);
        assert_eq!(docs.len(), 2);
        assert!(docs[0].starts_with("apiVersion: v1"));
        assert!(docs[1].contains("kind: Deployment"));
    }

    #[test]
    fn test_split_empty() {
        assert!(split_manifests("").is_empty());
        assert!(split_manifests("---\n---\n").is_empty());
    }

    #[test]
    fn test_split_keeps_separators_inside_values() {
        let stream = "kind: ConfigMap\ndata:\n  banner: a---b\n";
        assert_eq!(split_manifests(stream).len(), 1);
    }

    #[test]
    fn test_parse_documents_heads() {
        let docs = parse_documents(STREAM).unwrap();
        assert_eq!(docs[0].head.kind, "ConfigMap");
        assert_eq!(docs[0].head.metadata.name, "app-config");
        assert_eq!(
            docs[1].head.annotation("helm.sh/resource-policy"),
            Some("keep")
        );

        let key = docs[0].head.key("default");
        assert_eq!(key.to_string(), "default/ConfigMap/app-config");
        assert_eq!(docs[1].head.key("default").namespace, "prod");
    }

    #[test]
    fn test_parse_documents_invalid() {
        let err = parse_documents("kind: [unterminated").unwrap_err();
        assert!(matches!(err, CoreError::InvalidDocument { index: 0, .. }));
    }

    #[test]
    fn test_join_manifests() {
        let joined = join_manifests(["kind: A\n", "kind: B"]);
        assert_eq!(joined, "kind: A\n---\nkind: B");
        assert_eq!(split_manifests(&joined).len(), 2);
    }
}
