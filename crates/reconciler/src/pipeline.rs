//! Job specification for scanning one image.
//!
//! The job runs two steps against a shared scratch volume: an SBOM scanner
//! that writes `/data/syft.json`, and the dependency analyzer that reads it
//! and reports the [`JVM_DEPENDENCIES_OUTPUT`] and [`IMAGE_DIGEST_OUTPUT`]
//! results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::resolver::ImageNameResolver;

/// Output carrying the comma separated dependency list.
pub const JVM_DEPENDENCIES_OUTPUT: &str = "JVM_DEPENDENCIES";

/// Output carrying the digest of the scanned image.
pub const IMAGE_DIGEST_OUTPUT: &str = "IMAGE_DIGEST";

/// Logical name of the analyzer image.
pub const ANALYZER_IMAGE_NAME: &str = "build-request-processor";

/// Variable that overrides the analyzer image reference.
pub const ANALYZER_IMAGE_ENV: &str = "JVM_BUILD_SERVICE_REQPROCESSOR_IMAGE";

/// Step that writes the SBOM.
pub const SCAN_STEP: &str = "scan";

/// Step that analyzes the SBOM and reports the results.
pub const ANALYZE_STEP: &str = "analyze";

const SCRATCH_VOLUME: &str = "data";
const SCRATCH_MOUNT_PATH: &str = "/data";
const SBOM_PATH: &str = "/data/syft.json";
const RUN_AS_USER: i64 = 0;

/// Image tags ending in this suffix are rebuilt in place and must be re-pulled.
const MUTABLE_TAG_SUFFIX: &str = "dev";

/// When the executor pulls a step image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
}

impl PullPolicy {
    /// Pick the pull policy for an image reference.
    pub fn for_image(image: &str) -> Self {
        if image.ends_with(MUTABLE_TAG_SUFFIX) {
            Self::Always
        } else {
            Self::IfNotPresent
        }
    }
}

/// Job-level result, a pass-through reference to a step result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub name: String,
    pub value: String,
}

/// Ephemeral scratch volume shared by all steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub empty_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Compute resources of a step, keyed by resource name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

impl ResourceRequirements {
    /// Request and limit the same amount of memory.
    pub fn guaranteed_memory(quantity: &str) -> Self {
        let memory = BTreeMap::from([("memory".to_string(), quantity.to_string())]);
        Self {
            requests: memory.clone(),
            limits: memory,
        }
    }
}

/// One step of the job; steps run sequentially in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    pub image: String,
    pub image_pull_policy: PullPolicy,
    pub run_as_user: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    /// Names of the results the step reports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<String>,
}

/// Specification handed to the job executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub results: Vec<JobResult>,
    pub volumes: Vec<Volume>,
    pub steps: Vec<Step>,
}

impl JobSpec {
    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }
}

/// Builds job specs for scan requests.
#[derive(Debug, Clone, Default)]
pub struct JobSpecBuilder {
    config: PipelineConfig,
}

impl JobSpecBuilder {
    /// Create a builder.
    pub const fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Resolve the analyzer image and build the spec for `image`.
    pub async fn build(&self, image: &str, resolver: &dyn ImageNameResolver) -> Result<JobSpec> {
        let analyzer_image = resolver
            .resolve(ANALYZER_IMAGE_NAME, ANALYZER_IMAGE_ENV)
            .await?;
        Ok(self.assemble(image, &analyzer_image))
    }

    /// Build the spec once the analyzer image is known.
    pub fn assemble(&self, image: &str, analyzer_image: &str) -> JobSpec {
        let pull_policy = PullPolicy::for_image(image);

        let scan = Step {
            name: SCAN_STEP.to_string(),
            image: self.config.scanner_image.clone(),
            image_pull_policy: pull_policy,
            run_as_user: RUN_AS_USER,
            script: Some(format!(
                "syft \"{image}\" --output cyclonedx-json={SBOM_PATH}"
            )),
            args: Vec::new(),
            resources: ResourceRequirements::guaranteed_memory(&self.config.scan_memory),
            env: step_env(),
            volume_mounts: scratch_mounts(),
            results: Vec::new(),
        };

        let analyze = Step {
            name: ANALYZE_STEP.to_string(),
            image: analyzer_image.to_string(),
            image_pull_policy: pull_policy,
            run_as_user: RUN_AS_USER,
            script: None,
            args: vec![
                "analyse-dependencies".to_string(),
                "image".to_string(),
                "--task-run-name=$(context.taskRun.name)".to_string(),
                "-s".to_string(),
                SBOM_PATH.to_string(),
                "--output-all-dependencies".to_string(),
                image.to_string(),
            ],
            resources: ResourceRequirements::guaranteed_memory(&self.config.analyze_memory),
            env: step_env(),
            volume_mounts: scratch_mounts(),
            results: vec![
                JVM_DEPENDENCIES_OUTPUT.to_string(),
                IMAGE_DIGEST_OUTPUT.to_string(),
            ],
        };

        JobSpec {
            results: [JVM_DEPENDENCIES_OUTPUT, IMAGE_DIGEST_OUTPUT]
                .into_iter()
                .map(|name| JobResult {
                    name: name.to_string(),
                    value: format!("$(steps.{ANALYZE_STEP}.results.{name})"),
                })
                .collect(),
            volumes: vec![Volume {
                name: SCRATCH_VOLUME.to_string(),
                empty_dir: true,
            }],
            steps: vec![scan, analyze],
        }
    }
}

fn step_env() -> Vec<EnvVar> {
    vec![EnvVar {
        name: "JAVA_OPTS".to_string(),
        value: "-XX:+CrashOnOutOfMemoryError".to_string(),
    }]
}

fn scratch_mounts() -> Vec<VolumeMount> {
    vec![VolumeMount {
        name: SCRATCH_VOLUME.to_string(),
        mount_path: SCRATCH_MOUNT_PATH.to_string(),
    }]
}
