use crate::retry::RetryPolicy;
use crate::types::{
    AnonymizationOptions, BranchCreateOptions, BranchInfo, BranchRestoreOptions, EndpointInfo,
    MaskingRule, OrganizationInfo, ProjectCreateOptions, ProjectInfo,
};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::{Duration, sleep};

const DEFAULT_BASE_URL: &str = "https://console.neon.tech/api/v2/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("neon-provisioner/", env!("CARGO_PKG_VERSION"));

#[derive(thiserror::Error, Debug)]
pub enum NeonApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid API base URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),
    #[error("API key is not a valid header value")]
    InvalidApiKey,
    #[error("Neon API request failed with status {status} ({reason}): {body}")]
    Api {
        status: u16,
        reason: String,
        body: String,
    },
    #[error("malformed Neon API response: {0}")]
    MalformedResponse(String),
    #[error("project '{0}' does not have a default branch")]
    NoDefaultBranch(String),
}

/// Retrying client bound to one Neon control-plane API.
///
/// Each operation issues one logical request. Write operations go through
/// the retry policy; lookups do not, and a 404 on a lookup is an absence
/// result rather than an error. The client holds no local cache.
pub struct NeonApiClient {
    client: reqwest::Client,
    base_url: Url,
    retry_policy: RetryPolicy,
}

impl NeonApiClient {
    pub fn new(api_key: &str) -> Result<Self, NeonApiError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Client against a non-default control plane, used by tests and
    /// self-hosted deployments.
    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, NeonApiError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| NeonApiError::InvalidApiKey)?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        // Url::join drops the last path segment without a trailing slash.
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }

        Ok(NeonApiClient {
            client,
            base_url: Url::parse(&base)?,
            retry_policy: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub async fn get_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationInfo>, NeonApiError> {
        let url = self.endpoint(&format!("organizations/{organization_id}"))?;
        let Some(response) = self.send_optional(Method::GET, url, None).await? else {
            return Ok(None);
        };

        let envelope = response.json::<OrganizationResponse>().await?;
        envelope.into_info(organization_id).map(Some)
    }

    pub async fn find_organization_by_name(
        &self,
        organization_name: &str,
    ) -> Result<Option<OrganizationInfo>, NeonApiError> {
        let url = self.endpoint("users/me/organizations")?;
        let response = self.send(Method::GET, url, None, false).await?;
        let listing = response.json::<OrganizationsResponse>().await?;

        Ok(listing
            .organizations
            .into_iter()
            .find(|org| org.name.eq_ignore_ascii_case(organization_name))
            .map(|org| OrganizationInfo {
                id: org.id,
                name: org.name,
            }))
    }

    pub async fn find_project_by_name(
        &self,
        project_name: &str,
        organization_id: Option<&str>,
    ) -> Result<Option<ProjectInfo>, NeonApiError> {
        let mut url = self.endpoint("projects")?;
        url.query_pairs_mut()
            .append_pair("search", project_name)
            .append_pair("limit", "100");
        if let Some(org_id) = organization_id {
            url.query_pairs_mut().append_pair("org_id", org_id);
        }

        let response = self.send(Method::GET, url, None, false).await?;
        let listing = response.json::<ProjectsResponse>().await?;

        Ok(listing
            .projects
            .into_iter()
            .find(|project| project.name.eq_ignore_ascii_case(project_name))
            .map(|project| ProjectInfo {
                id: project.id,
                name: project.name,
            }))
    }

    pub async fn create_project(
        &self,
        options: &ProjectCreateOptions,
    ) -> Result<ProjectInfo, NeonApiError> {
        let mut project = json!({
            "name": options.name,
            "branch": {
                "name": options.branch_name,
                "database_name": options.database_name,
                "role_name": options.role_name,
            },
        });
        if let Some(region_id) = &options.region_id {
            project["region_id"] = json!(region_id);
        }
        if let Some(pg_version) = options.postgres_version {
            project["pg_version"] = json!(pg_version);
        }
        if let Some(org_id) = &options.organization_id {
            project["org_id"] = json!(org_id);
        }

        let url = self.endpoint("projects")?;
        let response = self
            .send(Method::POST, url, Some(json!({ "project": project })), true)
            .await?;
        let envelope = response.json::<ProjectEnvelope>().await?;

        Ok(ProjectInfo {
            id: envelope.project.id,
            name: envelope.project.name,
        })
    }

    pub async fn list_branches(&self, project_id: &str) -> Result<Vec<BranchInfo>, NeonApiError> {
        let mut url = self.endpoint(&format!("projects/{project_id}/branches"))?;
        url.query_pairs_mut().append_pair("limit", "100");

        let response = self.send(Method::GET, url, None, false).await?;
        let listing = response.json::<BranchesResponse>().await?;

        Ok(listing
            .branches
            .into_iter()
            .map(|branch| BranchInfo {
                id: branch.id,
                name: branch.name,
            })
            .collect())
    }

    pub async fn find_branch_by_name(
        &self,
        project_id: &str,
        branch_name: &str,
    ) -> Result<Option<BranchInfo>, NeonApiError> {
        let mut url = self.endpoint(&format!("projects/{project_id}/branches"))?;
        url.query_pairs_mut()
            .append_pair("search", branch_name)
            .append_pair("limit", "100");

        let response = self.send(Method::GET, url, None, false).await?;
        let listing = response.json::<BranchesResponse>().await?;

        Ok(listing
            .branches
            .into_iter()
            .find(|branch| branch.name.eq_ignore_ascii_case(branch_name))
            .map(|branch| BranchInfo {
                id: branch.id,
                name: branch.name,
            }))
    }

    pub async fn get_default_branch(&self, project_id: &str) -> Result<BranchInfo, NeonApiError> {
        let mut url = self.endpoint(&format!("projects/{project_id}/branches"))?;
        url.query_pairs_mut().append_pair("limit", "100");

        let response = self.send(Method::GET, url, None, false).await?;
        let listing = response.json::<BranchesResponse>().await?;

        listing
            .branches
            .into_iter()
            .find(|branch| branch.default)
            .map(|branch| BranchInfo {
                id: branch.id,
                name: branch.name,
            })
            .ok_or_else(|| NeonApiError::NoDefaultBranch(project_id.to_string()))
    }

    pub async fn create_branch(
        &self,
        project_id: &str,
        branch_name: &str,
        parent_branch_id: Option<&str>,
        options: &BranchCreateOptions,
    ) -> Result<BranchInfo, NeonApiError> {
        let payload = json!({
            "branch": branch_payload(branch_name, parent_branch_id, options),
            "endpoints": [{ "type": options.endpoint_type }],
        });

        let url = self.endpoint(&format!("projects/{project_id}/branches"))?;
        let response = self.send(Method::POST, url, Some(payload), true).await?;
        let envelope = response.json::<BranchEnvelope>().await?;

        Ok(BranchInfo {
            id: envelope.branch.id,
            name: envelope.branch.name,
        })
    }

    pub async fn create_anonymized_branch(
        &self,
        project_id: &str,
        branch_name: &str,
        parent_branch_id: Option<&str>,
        options: &BranchCreateOptions,
        anonymization: &AnonymizationOptions,
    ) -> Result<BranchInfo, NeonApiError> {
        let payload = json!({
            "branch_create": {
                "branch": branch_payload(branch_name, parent_branch_id, options),
                "endpoints": [{ "type": options.endpoint_type }],
            },
            "masking_rules": anonymization
                .masking_rules
                .iter()
                .map(masking_rule_payload)
                .collect::<Vec<_>>(),
            "start_anonymization": anonymization.start_anonymization,
        });

        let url = self.endpoint(&format!("projects/{project_id}/branch_anonymized"))?;
        let response = self.send(Method::POST, url, Some(payload), true).await?;
        let envelope = response.json::<BranchEnvelope>().await?;

        Ok(BranchInfo {
            id: envelope.branch.id,
            name: envelope.branch.name,
        })
    }

    pub async fn restore_branch(
        &self,
        project_id: &str,
        branch_id: &str,
        options: &BranchRestoreOptions,
    ) -> Result<(), NeonApiError> {
        let mut payload = json!({});
        if let Some(source_branch_id) = &options.source_branch_id {
            payload["source_branch_id"] = json!(source_branch_id);
        }
        if let Some(source_lsn) = &options.source_lsn {
            payload["source_lsn"] = json!(source_lsn);
        }
        if let Some(source_timestamp) = &options.source_timestamp {
            payload["source_timestamp"] = json!(source_timestamp.to_rfc3339());
        }
        if let Some(preserve_under_name) = &options.preserve_under_name {
            payload["preserve_under_name"] = json!(preserve_under_name);
        }

        let url = self.endpoint(&format!("projects/{project_id}/branches/{branch_id}/restore"))?;
        self.send(Method::POST, url, Some(payload), true).await?;
        Ok(())
    }

    pub async fn set_default_branch(
        &self,
        project_id: &str,
        branch_id: &str,
    ) -> Result<(), NeonApiError> {
        let url = self.endpoint(&format!(
            "projects/{project_id}/branches/{branch_id}/set_as_default"
        ))?;
        self.send(Method::POST, url, None, true).await?;
        Ok(())
    }

    /// Deletes a branch; a branch that is already gone is not an error.
    pub async fn delete_branch(
        &self,
        project_id: &str,
        branch_id: &str,
    ) -> Result<(), NeonApiError> {
        let url = self.endpoint(&format!("projects/{project_id}/branches/{branch_id}"))?;
        self.send_optional(Method::DELETE, url, None).await?;
        Ok(())
    }

    pub async fn find_role(
        &self,
        project_id: &str,
        branch_id: &str,
        role_name: &str,
    ) -> Result<bool, NeonApiError> {
        let url = self.endpoint(&format!("projects/{project_id}/branches/{branch_id}/roles"))?;
        let response = self.send(Method::GET, url, None, false).await?;
        let listing = response.json::<RolesResponse>().await?;

        Ok(listing
            .roles
            .iter()
            .any(|role| role.name.eq_ignore_ascii_case(role_name)))
    }

    pub async fn create_role(
        &self,
        project_id: &str,
        branch_id: &str,
        role_name: &str,
    ) -> Result<(), NeonApiError> {
        let url = self.endpoint(&format!("projects/{project_id}/branches/{branch_id}/roles"))?;
        self.send(
            Method::POST,
            url,
            Some(json!({ "role": { "name": role_name } })),
            true,
        )
        .await?;
        Ok(())
    }

    pub async fn find_database(
        &self,
        project_id: &str,
        branch_id: &str,
        database_name: &str,
    ) -> Result<bool, NeonApiError> {
        let url = self.endpoint(&format!(
            "projects/{project_id}/branches/{branch_id}/databases"
        ))?;
        let response = self.send(Method::GET, url, None, false).await?;
        let listing = response.json::<DatabasesResponse>().await?;

        Ok(listing
            .databases
            .iter()
            .any(|database| database.name.eq_ignore_ascii_case(database_name)))
    }

    pub async fn create_database(
        &self,
        project_id: &str,
        branch_id: &str,
        database_name: &str,
        owner_name: &str,
    ) -> Result<(), NeonApiError> {
        let url = self.endpoint(&format!(
            "projects/{project_id}/branches/{branch_id}/databases"
        ))?;
        self.send(
            Method::POST,
            url,
            Some(json!({
                "database": { "name": database_name, "owner_name": owner_name }
            })),
            true,
        )
        .await?;
        Ok(())
    }

    pub async fn get_endpoint_by_type(
        &self,
        project_id: &str,
        branch_id: &str,
        endpoint_type: &str,
    ) -> Result<Option<EndpointInfo>, NeonApiError> {
        let url = self.endpoint(&format!(
            "projects/{project_id}/branches/{branch_id}/endpoints"
        ))?;
        let response = self.send(Method::GET, url, None, false).await?;
        let listing = response.json::<EndpointsResponse>().await?;

        Ok(listing
            .endpoints
            .into_iter()
            .find(|endpoint| {
                endpoint
                    .endpoint_type
                    .as_deref()
                    .is_some_and(|t| t.eq_ignore_ascii_case(endpoint_type))
            })
            .map(EndpointRecord::into_info))
    }

    pub async fn create_endpoint(
        &self,
        project_id: &str,
        branch_id: &str,
        endpoint_type: &str,
    ) -> Result<EndpointInfo, NeonApiError> {
        let url = self.endpoint(&format!("projects/{project_id}/endpoints"))?;
        let response = self
            .send(
                Method::POST,
                url,
                Some(json!({
                    "endpoint": { "branch_id": branch_id, "type": endpoint_type }
                })),
                true,
            )
            .await?;
        let envelope = response.json::<EndpointEnvelope>().await?;
        Ok(envelope.endpoint.into_info())
    }

    pub async fn suspend_endpoint(
        &self,
        project_id: &str,
        endpoint_id: &str,
    ) -> Result<(), NeonApiError> {
        let url = self.endpoint(&format!(
            "projects/{project_id}/endpoints/{endpoint_id}/suspend"
        ))?;
        self.send(Method::POST, url, None, true).await?;
        Ok(())
    }

    pub async fn start_endpoint(
        &self,
        project_id: &str,
        endpoint_id: &str,
    ) -> Result<(), NeonApiError> {
        let url = self.endpoint(&format!(
            "projects/{project_id}/endpoints/{endpoint_id}/start"
        ))?;
        self.send(Method::POST, url, None, true).await?;
        Ok(())
    }

    pub async fn get_connection_uri(
        &self,
        project_id: &str,
        branch_id: &str,
        endpoint_id: Option<&str>,
        database_name: &str,
        role_name: &str,
        pooled: bool,
    ) -> Result<String, NeonApiError> {
        let mut url = self.endpoint(&format!("projects/{project_id}/connection_uri"))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("branch_id", branch_id)
                .append_pair("database_name", database_name)
                .append_pair("role_name", role_name);
            if let Some(endpoint_id) = endpoint_id {
                query.append_pair("endpoint_id", endpoint_id);
            }
            if pooled {
                query.append_pair("pooled", "true");
            }
        }

        let response = self.send(Method::GET, url, None, true).await?;
        let envelope = response.json::<ConnectionUriResponse>().await?;

        if envelope.uri.is_empty() {
            return Err(NeonApiError::MalformedResponse(
                "connection URI response contained an empty uri".to_string(),
            ));
        }

        Ok(envelope.uri)
    }

    fn endpoint(&self, path: &str) -> Result<Url, NeonApiError> {
        Ok(self.base_url.join(path)?)
    }

    /// One logical request. When `retryable` is set, transient statuses are
    /// retried under the client's policy; any other non-success status (or
    /// an exhausted budget) surfaces as `NeonApiError::Api`.
    async fn send(
        &self,
        method: Method,
        url: Url,
        payload: Option<Value>,
        retryable: bool,
    ) -> Result<reqwest::Response, NeonApiError> {
        let mut attempt = 0u32;
        loop {
            let mut request = self.client.request(method.clone(), url.clone());
            if let Some(body) = &payload {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if retryable && self.retry_policy.should_retry(status, attempt) {
                attempt += 1;
                tracing::debug!(%status, attempt, "retrying Neon API request");
                sleep(self.retry_policy.delay(attempt)).await;
                continue;
            }

            return Err(api_error(response).await);
        }
    }

    /// Like `send` without retries, but a 404 is an absence result.
    async fn send_optional(
        &self,
        method: Method,
        url: Url,
        payload: Option<Value>,
    ) -> Result<Option<reqwest::Response>, NeonApiError> {
        let mut request = self.client.request(method, url);
        if let Some(body) = &payload {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_success() {
            return Ok(Some(response));
        }

        Err(api_error(response).await)
    }
}

async fn api_error(response: reqwest::Response) -> NeonApiError {
    let status = response.status();
    let reason = status
        .canonical_reason()
        .unwrap_or("unknown status")
        .to_string();
    let body = response.text().await.unwrap_or_default();
    NeonApiError::Api {
        status: status.as_u16(),
        reason,
        body,
    }
}

fn branch_payload(
    branch_name: &str,
    parent_branch_id: Option<&str>,
    options: &BranchCreateOptions,
) -> Value {
    let mut branch = json!({
        "name": branch_name,
        "parent_id": parent_branch_id,
        "init_source": options.init_source,
    });

    if let Some(protected) = options.protected {
        branch["protected"] = json!(protected);
    }
    if let Some(expires_at) = &options.expires_at {
        branch["expires_at"] = json!(expires_at.to_rfc3339());
    }
    if let Some(parent_lsn) = &options.parent_lsn {
        branch["parent_lsn"] = json!(parent_lsn);
    }
    if let Some(parent_timestamp) = &options.parent_timestamp {
        branch["parent_timestamp"] = json!(parent_timestamp.to_rfc3339());
    }
    if let Some(archived) = options.archived {
        branch["archived"] = json!(archived);
    }

    branch
}

fn masking_rule_payload(rule: &MaskingRule) -> Value {
    let mut payload = json!({
        "database_name": rule.database_name,
        "schema_name": rule.schema_name,
        "table_name": rule.table_name,
        "column_name": rule.column_name,
        "masking_function": rule.masking_function,
    });

    if let Some(masking_value) = &rule.masking_value {
        payload["masking_value"] = json!(masking_value);
    }

    payload
}

#[derive(Deserialize)]
struct OrganizationRecord {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct OrganizationsResponse {
    #[serde(default)]
    organizations: Vec<OrganizationRecord>,
}

// The organization endpoint returns either a bare record or one wrapped in
// an `organization` envelope.
#[derive(Deserialize)]
struct OrganizationResponse {
    organization: Option<OrganizationRecord>,
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl OrganizationResponse {
    fn into_info(self, fallback_name: &str) -> Result<OrganizationInfo, NeonApiError> {
        if let Some(organization) = self.organization {
            let name = if organization.name.is_empty() {
                fallback_name.to_string()
            } else {
                organization.name
            };
            return Ok(OrganizationInfo {
                id: organization.id,
                name,
            });
        }

        let id = self.id.ok_or_else(|| {
            NeonApiError::MalformedResponse(
                "organization response did not include an organization id".to_string(),
            )
        })?;
        Ok(OrganizationInfo {
            id,
            name: self.name.unwrap_or_else(|| fallback_name.to_string()),
        })
    }
}

#[derive(Deserialize)]
struct ProjectRecord {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct ProjectsResponse {
    #[serde(default)]
    projects: Vec<ProjectRecord>,
}

#[derive(Deserialize)]
struct ProjectEnvelope {
    project: ProjectRecord,
}

#[derive(Deserialize)]
struct BranchRecord {
    id: String,
    name: String,
    #[serde(default)]
    default: bool,
}

#[derive(Deserialize)]
struct BranchesResponse {
    #[serde(default)]
    branches: Vec<BranchRecord>,
}

#[derive(Deserialize)]
struct BranchEnvelope {
    branch: BranchRecord,
}

#[derive(Deserialize)]
struct NamedRecord {
    name: String,
}

#[derive(Deserialize)]
struct RolesResponse {
    #[serde(default)]
    roles: Vec<NamedRecord>,
}

#[derive(Deserialize)]
struct DatabasesResponse {
    #[serde(default)]
    databases: Vec<NamedRecord>,
}

#[derive(Deserialize)]
struct EndpointRecord {
    id: String,
    #[serde(default)]
    host: Option<String>,
    #[serde(rename = "type", default)]
    endpoint_type: Option<String>,
    #[serde(default)]
    pooler_enabled: Option<bool>,
}

impl EndpointRecord {
    fn into_info(self) -> EndpointInfo {
        EndpointInfo {
            id: self.id,
            host: self.host,
            endpoint_type: self.endpoint_type,
            pooler_enabled: self.pooler_enabled,
        }
    }
}

#[derive(Deserialize)]
struct EndpointEnvelope {
    endpoint: EndpointRecord,
}

#[derive(Deserialize)]
struct EndpointsResponse {
    #[serde(default)]
    endpoints: Vec<EndpointRecord>,
}

#[derive(Deserialize)]
struct ConnectionUriResponse {
    uri: String,
}
