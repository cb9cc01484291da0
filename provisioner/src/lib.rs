//! One-shot provisioner for Neon-managed Postgres topologies.
//!
//! Reads a declarative description from the environment, resolves or
//! creates the organization -> project -> branch -> endpoint ->
//! roles/databases hierarchy through the control-plane API, and writes
//! connection artifacts for downstream consumers.

pub mod config;
pub mod errors;
pub mod output;
pub mod reconcile;

use config::{Mode, ProvisionerConfig, vars};
use errors::ProvisionError;
use neon_api::NeonApiClient;

/// Runs one provisioning pass and returns the process exit code. A stale
/// failure artifact is removed up front; on failure a fresh one is written
/// best-effort and the error is reported on stderr.
pub async fn run(config: &ProvisionerConfig) -> i32 {
    output::delete_failure_artifact(&config.output_file_path);
    tracing::info!(
        mode = %config.mode,
        create_resources = config.mode.allows_create(),
        pooled = config.use_connection_pooler,
        output = %config.output_file_path.display(),
        "Neon provisioner starting"
    );

    match try_run(config).await {
        Ok(()) => 0,
        Err(error) => {
            output::try_write_failure_artifact(Some(&config.output_file_path), &error);
            eprintln!("Neon provisioner failed: {error}");
            1
        }
    }
}

async fn try_run(config: &ProvisionerConfig) -> Result<(), ProvisionError> {
    let client = build_client(config)?;

    match config.mode {
        Mode::Suspend | Mode::Resume => {
            // Validated at config time.
            let project_id = config
                .project_id
                .as_deref()
                .ok_or(ProvisionError::MissingVariable(vars::PROJECT_ID))?;
            let endpoint_id = config
                .endpoint_id
                .as_deref()
                .ok_or(ProvisionError::MissingVariable(vars::ENDPOINT_ID))?;

            if config.mode == Mode::Suspend {
                client.suspend_endpoint(project_id, endpoint_id).await?;
                tracing::info!(%project_id, %endpoint_id, "Neon endpoint suspended");
            } else {
                client.start_endpoint(project_id, endpoint_id).await?;
                tracing::info!(%project_id, %endpoint_id, "Neon endpoint resumed");
            }
            Ok(())
        }
        Mode::Attach | Mode::Provision => {
            let result = reconcile::reconcile(&client, config).await?;
            output::write_outputs(&config.output_file_path, &result)?;
            tracing::info!(
                mode = %config.mode,
                project_id = %result.project_id,
                branch_id = %result.branch_id,
                endpoint_id = %result.endpoint_id,
                output = %config.output_file_path.display(),
                "Neon provisioner completed"
            );
            Ok(())
        }
    }
}

fn build_client(config: &ProvisionerConfig) -> Result<NeonApiClient, ProvisionError> {
    let client = match &config.api_base_url {
        Some(base_url) => NeonApiClient::with_base_url(&config.api_key, base_url)?,
        None => NeonApiClient::new(&config.api_key)?,
    };
    Ok(client)
}
