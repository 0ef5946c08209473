//! Stage operations backed by pre-rendered manifests.
//!
//! Each stage reads `<assets>/<stage-name>/*.yaml` once at startup, one
//! operation per YAML document, in file name order. At apply time only the
//! namespace, the owner reference, the runtime class and the operand images
//! are stamped onto the stored object. When drivers are built with the
//! OpenShift driver toolkit, the driver DaemonSet is applied once per OS
//! build, each copy pinned to its build's nodes and toolkit image.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::Resource;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use accel_common::crd::ReconciliationStatus;
use accel_common::Error;
use accel_node::labels::OSTREE_VERSION;

use super::{Stage, StageInput, StageKind, StageOperation};

/// Kinds that never carry a namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "MutatingWebhookConfiguration",
    "Namespace",
    "PodSecurityPolicy",
    "PriorityClass",
    "RuntimeClass",
    "SecurityContextConstraints",
    "ValidatingWebhookConfiguration",
];

/// Driver pod container that runs the driver toolkit image
pub const DRIVER_TOOLKIT_CONTAINER: &str = "openshift-driver-toolkit-ctr";

/// Label naming the OS build a per-build driver DaemonSet serves
pub const DRIVER_TOOLKIT_BUILD_LABEL: &str = "openshift.driver-toolkit.rhcos";

/// Apply one manifest by server-side apply; DaemonSets also gate on rollout
pub struct ManifestOperation {
    stage: StageKind,
    source: String,
    kind: String,
    name: String,
    object: Value,
}

impl ManifestOperation {
    /// Wrap a parsed manifest document
    ///
    /// Fails when `apiVersion`, `kind` or `metadata.name` is missing.
    pub fn new(stage: StageKind, source: impl Into<String>, object: Value) -> Result<Self, Error> {
        let source = source.into();
        let field = |pointer: &str| {
            object
                .pointer(pointer)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| Error::manifest(&source, format!("missing {pointer}")))
        };
        field("/apiVersion")?;
        let kind = field("/kind")?;
        let name = field("/metadata/name")?;

        Ok(Self {
            stage,
            source,
            kind,
            name,
            object,
        })
    }

    fn is_cluster_scoped(&self) -> bool {
        CLUSTER_SCOPED_KINDS.contains(&self.kind.as_str())
    }

    /// The object as it will be applied
    pub fn render(&self, input: &StageInput<'_>) -> Result<Value, Error> {
        let mut object = self.object.clone();
        let spec = &input.policy.spec;

        let metadata = object
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::manifest(&self.source, "metadata is not a map"))?;
        if !self.is_cluster_scoped() {
            metadata.insert("namespace".into(), json!(input.namespace));
        }
        if let Some(owner) = input.policy.controller_owner_ref(&()) {
            let owners = serde_json::to_value(vec![owner])
                .map_err(|e| Error::serialization_for_kind("OwnerReference", e.to_string()))?;
            metadata.insert("ownerReferences".into(), owners);
        }

        if self.kind == "RuntimeClass" {
            object["handler"] = json!(spec.operator.runtime_class);
        }

        if let Some(pod) = object
            .pointer_mut("/spec/template/spec")
            .and_then(Value::as_object_mut)
        {
            self.stamp_pod(pod, input)?;
        }

        Ok(object)
    }

    /// Every object to apply, keyed by name
    ///
    /// This is the rendered manifest, except for the driver DaemonSet while
    /// the driver toolkit is enabled: that yields one copy per OS build with
    /// a toolkit image.
    pub fn objects(&self, input: &StageInput<'_>) -> Result<Vec<(String, Value)>, Error> {
        let base = self.render(input)?;
        let per_build =
            self.stage == StageKind::Driver && self.kind == "DaemonSet" && input.toolkit.enabled;
        if !per_build {
            return Ok(vec![(self.name.clone(), base)]);
        }

        input
            .toolkit
            .images
            .iter()
            .map(|(build, image)| {
                let name = format!("{}-{}", self.name, build);
                let object = self.driver_for_build(base.clone(), &name, build, image)?;
                Ok((name, object))
            })
            .collect()
    }

    fn driver_for_build(
        &self,
        mut object: Value,
        name: &str,
        build: &str,
        image: &str,
    ) -> Result<Value, Error> {
        let not_a_map = |path: &str| Error::manifest(&self.source, format!("{path} is not a map"));

        map_at(&mut object, &["metadata"])
            .ok_or_else(|| not_a_map("metadata"))?
            .insert("name".into(), json!(name));
        for path in [
            ["metadata", "labels"].as_slice(),
            &["spec", "selector", "matchLabels"],
            &["spec", "template", "metadata", "labels"],
        ] {
            map_at(&mut object, path)
                .ok_or_else(|| not_a_map(&path.join(".")))?
                .insert(DRIVER_TOOLKIT_BUILD_LABEL.into(), json!(build));
        }
        map_at(&mut object, &["spec", "template", "spec", "nodeSelector"])
            .ok_or_else(|| not_a_map("spec.template.spec.nodeSelector"))?
            .insert(OSTREE_VERSION.into(), json!(build));

        if let Some(toolkit) = object
            .pointer_mut("/spec/template/spec/containers")
            .and_then(Value::as_array_mut)
            .and_then(|containers| {
                containers.iter_mut().find(|c| {
                    c.get("name").and_then(Value::as_str) == Some(DRIVER_TOOLKIT_CONTAINER)
                })
            })
            .and_then(Value::as_object_mut)
        {
            toolkit.insert("image".into(), json!(image));
        }

        Ok(object)
    }

    fn stamp_pod(&self, pod: &mut Map<String, Value>, input: &StageInput<'_>) -> Result<(), Error> {
        let spec = &input.policy.spec;
        let resolve = |kind| {
            spec.image_path(kind)
                .map_err(|e| Error::manifest(&self.source, e.to_string()))
        };

        if pod.contains_key("runtimeClassName") {
            pod.insert(
                "runtimeClassName".into(),
                json!(spec.operator.runtime_class),
            );
        }

        if let Some(component) = self.stage.component() {
            if let Some(main) = pod
                .get_mut("containers")
                .and_then(|c| c.get_mut(0))
                .and_then(Value::as_object_mut)
            {
                main.insert("image".into(), json!(resolve(component)?));
                main.insert(
                    "imagePullPolicy".into(),
                    json!(spec.image_spec(component).pull_policy()),
                );
                if self.stage == StageKind::ContainerToolkit {
                    set_env(main, "RUNTIME", input.runtime.as_str());
                }
            }
        }

        if let Some(inits) = pod.get_mut("initContainers").and_then(Value::as_array_mut) {
            for init in inits.iter_mut().filter_map(Value::as_object_mut) {
                let unset = init
                    .get("image")
                    .and_then(Value::as_str)
                    .map_or(true, str::is_empty);
                if unset {
                    init.insert("image".into(), json!(resolve(self.stage.init_component())?));
                }
            }
        }

        Ok(())
    }
}

/// The map at `path`, created empty where missing
fn map_at<'v>(object: &'v mut Value, path: &[&str]) -> Option<&'v mut Map<String, Value>> {
    let mut current = object;
    for key in path {
        current = current
            .as_object_mut()?
            .entry(*key)
            .or_insert_with(|| json!({}));
    }
    current.as_object_mut()
}

fn set_env(container: &mut Map<String, Value>, name: &str, value: &str) {
    let env = container
        .entry("env")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(env) = env.as_array_mut() else {
        return;
    };
    match env
        .iter_mut()
        .find(|e| e.get("name").and_then(Value::as_str) == Some(name))
    {
        Some(existing) => existing["value"] = json!(value),
        None => env.push(json!({ "name": name, "value": value })),
    }
}

#[async_trait]
impl StageOperation for ManifestOperation {
    fn describe(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    async fn run(&self, input: &StageInput<'_>) -> Result<ReconciliationStatus, Error> {
        let mut status = ReconciliationStatus::Ready;
        for (name, object) in self.objects(input)? {
            input.kube.apply_manifest(&object).await?;
            debug!(kind = %self.kind, %name, source = %self.source, "applied manifest");

            if self.kind != "DaemonSet" {
                continue;
            }
            let ready = input
                .kube
                .get_daemonset(input.namespace, &name)
                .await?
                .is_some_and(|ds| daemonset_ready(&ds));
            if !ready {
                status = ReconciliationStatus::NotReady;
            }
        }
        Ok(status)
    }
}

/// Every scheduled pod is available and updated
///
/// A DaemonSet without status has not been observed by its controller yet.
pub fn daemonset_ready(ds: &DaemonSet) -> bool {
    ds.status.as_ref().is_some_and(|s| {
        let desired = s.desired_number_scheduled;
        s.number_available.unwrap_or(0) == desired
            && s.updated_number_scheduled.unwrap_or(0) == desired
    })
}

/// Load one stage from `<assets_dir>/<stage-name>/`
///
/// A missing directory yields an empty stage, which is always Ready.
pub fn load_stage(assets_dir: &Path, kind: StageKind) -> Result<Stage, Error> {
    let dir = assets_dir.join(kind.name());
    if !dir.is_dir() {
        debug!(stage = %kind, dir = %dir.display(), "no manifests for stage");
        return Ok(Stage::new(kind, Vec::new()));
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
        .map_err(|e| Error::manifest(dir.display().to_string(), e.to_string()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file() && matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"))
        })
        .collect();
    files.sort();

    let mut operations: Vec<Box<dyn StageOperation>> = Vec::new();
    for path in files {
        let source = path.display().to_string();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::manifest(&source, e.to_string()))?;
        for document in serde_yaml::Deserializer::from_str(&content) {
            let value =
                Value::deserialize(document).map_err(|e| Error::manifest(&source, e.to_string()))?;
            if value.is_null() {
                continue;
            }
            operations.push(Box::new(ManifestOperation::new(kind, &source, value)?));
        }
    }

    info!(stage = %kind, operations = operations.len(), "loaded stage manifests");
    Ok(Stage::new(kind, operations))
}

/// Load every stage in deployment order
pub fn load_stages(assets_dir: &Path) -> Result<Vec<Stage>, Error> {
    StageKind::ALL
        .iter()
        .map(|kind| load_stage(assets_dir, *kind))
        .collect()
}
