use crate::config::{DatabaseSpec, ProvisionerConfig};
use crate::errors::ProvisionError;
use chrono::{DateTime, Utc};
use neon_api::NeonApiClient;
use neon_api::types::{
    AnonymizationOptions, BranchCreateOptions, BranchRestoreOptions, ConnectionInfo,
    ProjectCreateOptions,
};
use serde::Serialize;
use uuid::Uuid;

/// Aggregate result of a successful reconciliation run.
///
/// Serialized with PascalCase keys; downstream consumers read this document
/// directly.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProvisionerOutput {
    pub project_id: String,
    pub branch_id: String,
    pub endpoint_id: String,
    pub default_database_name: String,
    pub default_role_name: String,
    pub default_connection_uri: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub endpoint_type: String,
    pub databases: Vec<DatabaseOutput>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseOutput {
    pub resource_name: String,
    pub database_name: String,
    pub role_name: String,
    pub connection_uri: String,
    pub host: String,
    pub port: u16,
    pub password: String,
}

/// Walks the hierarchy organization -> project -> branch -> endpoint ->
/// roles/databases, resolving existing resources or creating missing ones
/// where the mode permits. Any stage failure aborts the remaining stages.
pub async fn reconcile(
    client: &NeonApiClient,
    config: &ProvisionerConfig,
) -> Result<ProvisionerOutput, ProvisionError> {
    let organization_id = resolve_organization_id(client, config).await?;
    tracing::info!(
        organization_id = organization_id.as_deref().unwrap_or("<default>"),
        "organization resolved"
    );

    let project_id = resolve_project_id(client, config, organization_id.as_deref()).await?;
    tracing::info!(%project_id, "project resolved");

    let branch_id = resolve_branch_id(client, config, &project_id).await?;
    tracing::info!(%branch_id, ephemeral = config.use_ephemeral_branch, "branch resolved");

    if config.mode.allows_create() && config.branch_restore_enabled {
        tracing::info!(%branch_id, "applying branch restore options");
        let source_branch_id = match &config.restore_source_branch_id {
            Some(id) => Some(id.clone()),
            None => Some(resolve_parent_branch_id(client, config, &project_id).await?),
        };
        client
            .restore_branch(
                &project_id,
                &branch_id,
                &BranchRestoreOptions {
                    source_branch_id,
                    source_lsn: config.restore_source_lsn.clone(),
                    source_timestamp: config.restore_source_timestamp,
                    preserve_under_name: config.restore_preserve_under_name.clone(),
                },
            )
            .await?;
    }

    if config.mode.allows_create() && config.branch_set_as_default {
        tracing::info!(%branch_id, "setting branch as project default");
        client.set_default_branch(&project_id, &branch_id).await?;
    }

    let endpoint_id = resolve_endpoint_id(client, config, &project_id, &branch_id).await?;
    tracing::info!(%endpoint_id, "endpoint resolved");

    // The default database comes first; additional specs follow in list
    // order, and a failure on one aborts the rest.
    let mut specs = vec![DatabaseSpec {
        resource_name: String::new(),
        database_name: config.database_name.clone(),
        role_name: config.role_name.clone(),
    }];
    specs.extend(config.database_specs.iter().cloned());

    let mut databases = Vec::with_capacity(specs.len());
    for spec in &specs {
        tracing::info!(
            resource = %spec.resource_name,
            database = %spec.database_name,
            role = %spec.role_name,
            "ensuring role and database"
        );
        ensure_role(client, config, &project_id, &branch_id, &spec.role_name).await?;
        ensure_database(client, config, &project_id, &branch_id, spec).await?;

        let connection_uri = client
            .get_connection_uri(
                &project_id,
                &branch_id,
                Some(&endpoint_id),
                &spec.database_name,
                &spec.role_name,
                config.use_connection_pooler,
            )
            .await?;
        let connection = ConnectionInfo::parse(&connection_uri)?;
        tracing::info!(
            resource = %spec.resource_name,
            database = %spec.database_name,
            host = %connection.host,
            port = connection.port,
            "connection URI resolved"
        );

        databases.push(DatabaseOutput {
            resource_name: spec.resource_name.clone(),
            database_name: spec.database_name.clone(),
            role_name: spec.role_name.clone(),
            connection_uri,
            host: connection.host,
            port: connection.port,
            password: connection.password,
        });
    }

    // Construction order guarantees the first entry is the default spec.
    let default_output = databases[0].clone();

    Ok(ProvisionerOutput {
        project_id,
        branch_id,
        endpoint_id,
        default_database_name: config.database_name.clone(),
        default_role_name: config.role_name.clone(),
        default_connection_uri: default_output.connection_uri,
        host: default_output.host,
        port: default_output.port,
        password: default_output.password,
        endpoint_type: config.endpoint_type.clone(),
        databases,
    })
}

/// Never creates: an explicit id or name that cannot be resolved is fatal.
async fn resolve_organization_id(
    client: &NeonApiClient,
    config: &ProvisionerConfig,
) -> Result<Option<String>, ProvisionError> {
    if let Some(organization_id) = &config.organization_id {
        let organization = client
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| {
                ProvisionError::NotFound(format!(
                    "Neon organization '{organization_id}' was not found"
                ))
            })?;
        return Ok(Some(organization.id));
    }

    let Some(organization_name) = &config.organization_name else {
        return Ok(None);
    };

    let organization = client
        .find_organization_by_name(organization_name)
        .await?
        .ok_or_else(|| {
            ProvisionError::NotFound(format!(
                "Neon organization '{organization_name}' was not found"
            ))
        })?;
    Ok(Some(organization.id))
}

async fn resolve_project_id(
    client: &NeonApiClient,
    config: &ProvisionerConfig,
    organization_id: Option<&str>,
) -> Result<String, ProvisionError> {
    if let Some(project_id) = &config.project_id {
        return Ok(project_id.clone());
    }

    let Some(project_name) = &config.project_name else {
        return Err(ProvisionError::missing_project_reference());
    };

    if let Some(existing) = client
        .find_project_by_name(project_name, organization_id)
        .await?
    {
        tracing::info!(name = %project_name, project_id = %existing.id, "using existing project");
        return Ok(existing.id);
    }

    if !config.mode.allows_create() || !config.create_project_if_missing {
        return Err(ProvisionError::NotFound(format!(
            "Neon project '{project_name}' was not found and project creation is not enabled"
        )));
    }

    let created = client
        .create_project(&ProjectCreateOptions {
            name: project_name.clone(),
            region_id: config.region_id.clone(),
            postgres_version: config.postgres_version,
            organization_id: organization_id.map(str::to_string),
            branch_name: config
                .branch_name
                .clone()
                .unwrap_or_else(|| "main".to_string()),
            database_name: config.database_name.clone(),
            role_name: config.role_name.clone(),
        })
        .await?;
    tracing::info!(name = %project_name, project_id = %created.id, "created project");

    Ok(created.id)
}

/// Precedence: ephemeral mode wins outright, then explicit id, then name
/// lookup, then the project's default branch.
async fn resolve_branch_id(
    client: &NeonApiClient,
    config: &ProvisionerConfig,
    project_id: &str,
) -> Result<String, ProvisionError> {
    if config.use_ephemeral_branch {
        if !config.mode.allows_create() {
            return Err(ProvisionError::Config(
                "ephemeral branch mode requires 'provision' mode".to_string(),
            ));
        }
        return create_ephemeral_branch(client, config, project_id).await;
    }

    if let Some(branch_id) = &config.branch_id {
        // Used as-is; the API surfaces an error downstream if it is invalid.
        return Ok(branch_id.clone());
    }

    if let Some(branch_name) = &config.branch_name {
        if let Some(branch) = client.find_branch_by_name(project_id, branch_name).await? {
            tracing::info!(name = %branch_name, branch_id = %branch.id, "using existing branch");
            return Ok(branch.id);
        }

        if !config.mode.allows_create() || !config.create_branch_if_missing {
            return Err(ProvisionError::NotFound(format!(
                "Neon branch '{branch_name}' was not found and branch creation is not enabled"
            )));
        }

        let parent_branch_id = resolve_parent_branch_id(client, config, project_id).await?;
        return create_named_branch(client, config, project_id, branch_name, &parent_branch_id)
            .await;
    }

    let default_branch = client.get_default_branch(project_id).await?;
    tracing::info!(branch_id = %default_branch.id, name = %default_branch.name, "using default branch");
    Ok(default_branch.id)
}

/// Deletes every prior branch carrying the configured prefix, then creates
/// a fresh branch named `prefix + random hex` with a 24 hour expiry.
async fn create_ephemeral_branch(
    client: &NeonApiClient,
    config: &ProvisionerConfig,
    project_id: &str,
) -> Result<String, ProvisionError> {
    let prefix = &config.ephemeral_branch_prefix;
    tracing::info!(%prefix, "preparing ephemeral branch");

    delete_branches_with_prefix(client, project_id, prefix).await?;

    let parent_branch_id = resolve_parent_branch_id(client, config, project_id).await?;
    let branch_name = format!("{prefix}{}", Uuid::new_v4().simple());
    let expires_at = Utc::now() + chrono::Duration::days(1);
    tracing::info!(name = %branch_name, expires_at = %expires_at.to_rfc3339(), "creating ephemeral branch");

    let options = branch_create_options(config, Some(expires_at));
    let created = if config.anonymization_enabled {
        client
            .create_anonymized_branch(
                project_id,
                &branch_name,
                Some(&parent_branch_id),
                &options,
                &anonymization_options(config),
            )
            .await?
    } else {
        client
            .create_branch(project_id, &branch_name, Some(&parent_branch_id), &options)
            .await?
    };
    tracing::info!(branch_id = %created.id, "created ephemeral branch");

    Ok(created.id)
}

async fn delete_branches_with_prefix(
    client: &NeonApiClient,
    project_id: &str,
    prefix: &str,
) -> Result<(), ProvisionError> {
    let prefix_lower = prefix.to_ascii_lowercase();
    for branch in client.list_branches(project_id).await? {
        if !branch.name.to_ascii_lowercase().starts_with(&prefix_lower) {
            continue;
        }

        tracing::info!(branch_id = %branch.id, name = %branch.name, "deleting prior ephemeral branch");
        client.delete_branch(project_id, &branch.id).await?;
    }

    Ok(())
}

async fn resolve_parent_branch_id(
    client: &NeonApiClient,
    config: &ProvisionerConfig,
    project_id: &str,
) -> Result<String, ProvisionError> {
    if let Some(parent_branch_id) = &config.parent_branch_id {
        return Ok(parent_branch_id.clone());
    }

    if let Some(parent_branch_name) = &config.parent_branch_name {
        let parent = client
            .find_branch_by_name(project_id, parent_branch_name)
            .await?
            .ok_or_else(|| {
                ProvisionError::NotFound(format!(
                    "parent branch '{parent_branch_name}' was not found"
                ))
            })?;
        return Ok(parent.id);
    }

    let default_branch = client.get_default_branch(project_id).await?;
    Ok(default_branch.id)
}

fn branch_create_options(
    config: &ProvisionerConfig,
    expires_at: Option<DateTime<Utc>>,
) -> BranchCreateOptions {
    BranchCreateOptions {
        endpoint_type: config.endpoint_type.clone(),
        init_source: config
            .branch_init_source
            .clone()
            .unwrap_or_else(|| "parent-data".to_string()),
        expires_at: expires_at.or(config.branch_expires_at),
        parent_lsn: config.branch_parent_lsn.clone(),
        parent_timestamp: config.branch_parent_timestamp,
        protected: config.branch_protected,
        archived: config.branch_archived,
    }
}

fn anonymization_options(config: &ProvisionerConfig) -> AnonymizationOptions {
    AnonymizationOptions {
        start_anonymization: config.anonymization_start,
        masking_rules: config.masking_rules.clone(),
    }
}

async fn create_named_branch(
    client: &NeonApiClient,
    config: &ProvisionerConfig,
    project_id: &str,
    branch_name: &str,
    parent_branch_id: &str,
) -> Result<String, ProvisionError> {
    let options = branch_create_options(config, None);
    let created = if config.anonymization_enabled {
        client
            .create_anonymized_branch(
                project_id,
                branch_name,
                Some(parent_branch_id),
                &options,
                &anonymization_options(config),
            )
            .await?
    } else {
        client
            .create_branch(project_id, branch_name, Some(parent_branch_id), &options)
            .await?
    };
    tracing::info!(name = %branch_name, branch_id = %created.id, "created branch");

    Ok(created.id)
}

async fn resolve_endpoint_id(
    client: &NeonApiClient,
    config: &ProvisionerConfig,
    project_id: &str,
    branch_id: &str,
) -> Result<String, ProvisionError> {
    if let Some(endpoint_id) = &config.endpoint_id {
        return Ok(endpoint_id.clone());
    }

    let endpoint_type = &config.endpoint_type;
    if let Some(endpoint) = client
        .get_endpoint_by_type(project_id, branch_id, endpoint_type)
        .await?
    {
        tracing::info!(r#type = %endpoint_type, endpoint_id = %endpoint.id, "using existing endpoint");
        return Ok(endpoint.id);
    }

    if !config.mode.allows_create() || !config.create_endpoint_if_missing {
        return Err(ProvisionError::NotFound(format!(
            "no Neon endpoint of type '{endpoint_type}' was found for branch '{branch_id}' \
             and endpoint creation is not enabled"
        )));
    }

    let created = client
        .create_endpoint(project_id, branch_id, endpoint_type)
        .await?;
    tracing::info!(r#type = %endpoint_type, endpoint_id = %created.id, "created endpoint");
    Ok(created.id)
}

async fn ensure_role(
    client: &NeonApiClient,
    config: &ProvisionerConfig,
    project_id: &str,
    branch_id: &str,
    role_name: &str,
) -> Result<(), ProvisionError> {
    if client.find_role(project_id, branch_id, role_name).await? {
        tracing::info!(role = %role_name, %branch_id, "role exists");
        return Ok(());
    }

    if !config.mode.allows_create() {
        return Err(ProvisionError::NotFound(format!(
            "Neon role '{role_name}' was not found on branch '{branch_id}' \
             and role creation is not enabled"
        )));
    }

    client.create_role(project_id, branch_id, role_name).await?;
    tracing::info!(role = %role_name, %branch_id, "created role");
    Ok(())
}

async fn ensure_database(
    client: &NeonApiClient,
    config: &ProvisionerConfig,
    project_id: &str,
    branch_id: &str,
    spec: &DatabaseSpec,
) -> Result<(), ProvisionError> {
    if client
        .find_database(project_id, branch_id, &spec.database_name)
        .await?
    {
        tracing::info!(database = %spec.database_name, %branch_id, "database exists");
        return Ok(());
    }

    if !config.mode.allows_create() {
        return Err(ProvisionError::NotFound(format!(
            "Neon database '{}' was not found on branch '{branch_id}' \
             and database creation is not enabled",
            spec.database_name
        )));
    }

    client
        .create_database(project_id, branch_id, &spec.database_name, &spec.role_name)
        .await?;
    tracing::info!(database = %spec.database_name, owner = %spec.role_name, %branch_id, "created database");
    Ok(())
}
