//! CLI command handlers.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::info;

use jvmscan_reconciler::{
    EnvImageResolver, IMAGE_DIGEST_OUTPUT, InMemoryStore, JVM_DEPENDENCIES_OUTPUT, JobSpecBuilder,
    ObjectKey, ReconcileAction, Reconciler, ReconcilerConfig, ScanRequest, TracingStore,
    parse_dependencies,
};

use crate::cli::Commands;

/// Execute a CLI command.
pub async fn execute_command(command: Commands, config: ReconcilerConfig) -> Result<()> {
    match command {
        Commands::Parse { result } => cmd_parse(&result),

        Commands::Pipeline { image } => cmd_pipeline(config, &image).await,

        Commands::Simulate {
            image,
            namespace,
            name,
            dependencies,
            digest,
        } => cmd_simulate(config, ObjectKey::new(namespace, name), image, dependencies, digest).await,
    }
}

/// Print parsed dependency records.
fn cmd_parse(raw: &str) -> Result<()> {
    let records = parse_dependencies(raw);
    info!(records = records.len(), "Parsed dependency result");
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

/// Print the job spec for an image.
async fn cmd_pipeline(config: ReconcilerConfig, image: &str) -> Result<()> {
    let resolver = EnvImageResolver::new(config.images.clone());
    let spec = JobSpecBuilder::new(config.pipeline)
        .build(image, &resolver)
        .await
        .context("Failed to build job spec")?;
    print!("{}", serde_yaml::to_string(&spec)?);
    Ok(())
}

/// Drive one scan request through creation, job completion and result
/// recording, then print the final request.
async fn cmd_simulate(
    config: ReconcilerConfig,
    key: ObjectKey,
    image: String,
    dependencies: Option<String>,
    digest: Option<String>,
) -> Result<()> {
    let store = Arc::new(TracingStore::new(InMemoryStore::new()));
    let reconciler = Reconciler::builder()
        .with_store(store.clone())
        .with_config(config)
        .build()?;

    store
        .inner()
        .insert_request(ScanRequest::new(key.namespace.clone(), key.name.clone(), image))
        .await;

    let started = reconciler.reconcile(&key).await?;
    info!(action = %started.action.description(), "Request reconciled");

    if let ReconcileAction::ScanStarted {
        job: Some(job_key), ..
    } = started.action
    {
        reconciler.reconcile(&job_key).await?;

        let outputs = [
            (JVM_DEPENDENCIES_OUTPUT, dependencies),
            (IMAGE_DIGEST_OUTPUT, digest),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|value| (name.to_string(), value)))
        .collect::<BTreeMap<_, _>>();
        store.inner().complete_job(&job_key, outputs).await?;

        let finished = reconciler.reconcile(&job_key).await?;
        info!(action = %finished.action.description(), "Job reconciled");
    }

    let Some(request) = store.inner().request(&key).await else {
        bail!("scan request {key} disappeared during simulation");
    };
    println!("{}", serde_json::to_string_pretty(&request)?);
    Ok(())
}
