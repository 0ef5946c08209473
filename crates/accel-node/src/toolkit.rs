//! OpenShift driver toolkit compatibility
//!
//! On OpenShift the driver can be built with the per-OS-build driver toolkit
//! image. The cluster publishes the available images as tags of the
//! `driver-toolkit` ImageStream; a node is compatible when its OS build has a
//! tag there.

use std::collections::{BTreeMap, BTreeSet};

/// Namespace holding the driver toolkit ImageStream
pub const IMAGE_STREAM_NAMESPACE: &str = "openshift";

/// Name of the driver toolkit ImageStream
pub const IMAGE_STREAM_NAME: &str = "driver-toolkit";

/// OS build to toolkit image, as published by the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompatibilityIndex {
    images: BTreeMap<String, String>,
}

impl CompatibilityIndex {
    /// Build from `(tag name, from.name)` pairs
    pub fn from_tags<I, K, V>(tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            images: tags
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parse the `spec.tags` of an ImageStream object
    ///
    /// Tags without a `from.name` are skipped.
    pub fn from_image_stream(object: &serde_json::Value) -> Self {
        let tags = object
            .pointer("/spec/tags")
            .and_then(|t| t.as_array())
            .into_iter()
            .flatten()
            .filter_map(|tag| {
                let name = tag.get("name")?.as_str()?;
                let image = tag.pointer("/from/name")?.as_str()?;
                Some((name.to_string(), image.to_string()))
            });
        Self::from_tags(tags)
    }

    /// Toolkit image for an OS build
    pub fn image_for(&self, build: &str) -> Option<&str> {
        self.images.get(build).map(String::as_str)
    }

    /// Number of published builds
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// True when nothing is published
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Driver toolkit decision for one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverToolkitState {
    /// Platform is OpenShift and the policy asks for the toolkit
    pub requested: bool,
    /// Drivers will be built with the toolkit
    pub enabled: bool,
    /// The compatibility index exists
    pub has_index: bool,
    /// At least one accelerator node reported an OS build
    pub has_compatible_nodes: bool,
    /// OS builds observed on accelerator nodes
    pub os_builds: BTreeSet<String>,
    /// Toolkit image per observed build that the index covers
    pub images: BTreeMap<String, String>,
}

impl DriverToolkitState {
    /// Decide whether the toolkit can be used
    ///
    /// Precompiled drivers never use it. Otherwise it is enabled only when
    /// requested, the index exists and at least one observed build is in it.
    pub fn evaluate(
        requested: bool,
        precompiled: bool,
        index: Option<&CompatibilityIndex>,
        os_builds: BTreeSet<String>,
    ) -> Self {
        let has_compatible_nodes = !os_builds.is_empty();
        if precompiled || !requested {
            return Self {
                requested,
                has_compatible_nodes,
                os_builds,
                ..Default::default()
            };
        }

        let images: BTreeMap<String, String> = index
            .map(|idx| {
                os_builds
                    .iter()
                    .filter_map(|b| idx.image_for(b).map(|i| (b.clone(), i.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            requested,
            enabled: index.is_some() && !images.is_empty(),
            has_index: index.is_some(),
            has_compatible_nodes,
            os_builds,
            images,
        }
    }

    /// Observed builds that have no toolkit image
    pub fn missing_builds(&self) -> impl Iterator<Item = &str> {
        self.os_builds
            .iter()
            .filter(|b| !self.images.contains_key(*b))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builds(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn index() -> CompatibilityIndex {
        CompatibilityIndex::from_tags([
            ("414.92.202305", "quay.io/dtk@sha256:aa"),
            ("414.92.202306", "quay.io/dtk@sha256:bb"),
        ])
    }

    #[test]
    fn enabled_when_index_covers_an_observed_build() {
        let idx = index();
        let state =
            DriverToolkitState::evaluate(true, false, Some(&idx), builds(&["414.92.202305", "x"]));
        assert!(state.enabled);
        assert!(state.has_index);
        assert!(state.has_compatible_nodes);
        assert_eq!(state.images.len(), 1);
        assert_eq!(state.missing_builds().collect::<Vec<_>>(), vec!["x"]);
    }

    #[test]
    fn disabled_without_index() {
        let state = DriverToolkitState::evaluate(true, false, None, builds(&["414.92.202305"]));
        assert!(!state.enabled);
        assert!(!state.has_index);
        assert!(state.has_compatible_nodes);
    }

    #[test]
    fn disabled_when_no_build_matches() {
        let idx = index();
        let state = DriverToolkitState::evaluate(true, false, Some(&idx), builds(&["999"]));
        assert!(!state.enabled);
        assert!(state.has_index);
    }

    /// Story: precompiled drivers switch the toolkit off even when requested
    #[test]
    fn story_precompiled_disables_toolkit() {
        let idx = index();
        let state =
            DriverToolkitState::evaluate(true, true, Some(&idx), builds(&["414.92.202305"]));
        assert!(state.requested);
        assert!(!state.enabled);
        assert!(state.images.is_empty());
    }

    #[test]
    fn parses_image_stream_tags() {
        let stream = serde_json::json!({
            "apiVersion": "image.openshift.io/v1",
            "kind": "ImageStream",
            "spec": {
                "tags": [
                    { "name": "414.92.202305", "from": { "kind": "DockerImage", "name": "quay.io/dtk@sha256:aa" } },
                    { "name": "latest" }
                ]
            }
        });
        let idx = CompatibilityIndex::from_image_stream(&stream);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.image_for("414.92.202305"), Some("quay.io/dtk@sha256:aa"));
        assert!(CompatibilityIndex::from_image_stream(&serde_json::json!({})).is_empty());
    }
}
