//! In-process stand-in for the Neon control plane. Keeps the full topology
//! in memory and records every request so tests can assert on which calls
//! the reconciler issued.

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type Shared = Arc<Mutex<MockState>>;

#[derive(Default)]
pub struct MockState {
    pub organizations: Vec<(String, String)>,
    pub projects: Vec<MockProject>,
    /// (method, path) per request, query strings stripped.
    pub requests: Vec<(String, String)>,
    /// (project id, branch id, body) per restore call.
    pub restore_payloads: Vec<(String, String, Value)>,
    counter: u64,
}

pub struct MockProject {
    pub id: String,
    pub name: String,
    pub branches: Vec<MockBranch>,
    pub endpoints: Vec<MockEndpoint>,
}

pub struct MockBranch {
    pub id: String,
    pub name: String,
    pub default: bool,
    pub roles: Vec<String>,
    /// (database name, owner role name)
    pub databases: Vec<(String, String)>,
}

pub struct MockEndpoint {
    pub id: String,
    pub branch_id: String,
    pub endpoint_type: String,
    pub host: String,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}-{}", self.counter)
    }

    /// Seeds a project with a default `main` branch, a read_write endpoint,
    /// and the stock `neondb`/`neondb_owner` pair.
    pub fn add_project(&mut self, name: &str) -> (String, String) {
        let project_id = self.next_id("proj");
        let branch_id = self.next_id("br");
        let endpoint_id = self.next_id("ep");
        let host = format!("{endpoint_id}.mock.neon.local");

        self.projects.push(MockProject {
            id: project_id.clone(),
            name: name.to_string(),
            branches: vec![MockBranch {
                id: branch_id.clone(),
                name: "main".to_string(),
                default: true,
                roles: vec!["neondb_owner".to_string()],
                databases: vec![("neondb".to_string(), "neondb_owner".to_string())],
            }],
            endpoints: vec![MockEndpoint {
                id: endpoint_id,
                branch_id: branch_id.clone(),
                endpoint_type: "read_write".to_string(),
                host,
            }],
        });

        (project_id, branch_id)
    }

    pub fn add_branch(&mut self, project_id: &str, name: &str) -> String {
        let branch_id = self.next_id("br");
        let endpoint_id = self.next_id("ep");
        let host = format!("{endpoint_id}.mock.neon.local");

        let project = self.project_mut(project_id);
        project.branches.push(MockBranch {
            id: branch_id.clone(),
            name: name.to_string(),
            default: false,
            roles: Vec::new(),
            databases: Vec::new(),
        });
        project.endpoints.push(MockEndpoint {
            id: endpoint_id,
            branch_id: branch_id.clone(),
            endpoint_type: "read_write".to_string(),
            host,
        });

        branch_id
    }

    pub fn project(&self, project_id: &str) -> &MockProject {
        self.projects
            .iter()
            .find(|project| project.id == project_id)
            .expect("unknown project id")
    }

    fn project_mut(&mut self, project_id: &str) -> &mut MockProject {
        self.projects
            .iter_mut()
            .find(|project| project.id == project_id)
            .expect("unknown project id")
    }

    pub fn branch_names(&self, project_id: &str) -> Vec<String> {
        self.project(project_id)
            .branches
            .iter()
            .map(|branch| branch.name.clone())
            .collect()
    }
}

pub struct MockControlPlane {
    pub base_url: String,
    pub state: Shared,
}

impl MockControlPlane {
    pub async fn spawn() -> Self {
        let state: Shared = Arc::new(Mutex::new(MockState::default()));

        let router = Router::new()
            .route("/projects", get(list_projects).post(create_project))
            .route("/organizations/{org_id}", get(get_organization))
            .route("/users/me/organizations", get(list_organizations))
            .route(
                "/projects/{project_id}/branches",
                get(list_branches).post(create_branch),
            )
            .route(
                "/projects/{project_id}/branch_anonymized",
                post(create_anonymized_branch),
            )
            .route(
                "/projects/{project_id}/branches/{branch_id}",
                delete(delete_branch),
            )
            .route(
                "/projects/{project_id}/branches/{branch_id}/restore",
                post(restore_branch),
            )
            .route(
                "/projects/{project_id}/branches/{branch_id}/set_as_default",
                post(set_default_branch),
            )
            .route(
                "/projects/{project_id}/branches/{branch_id}/roles",
                get(list_roles).post(create_role),
            )
            .route(
                "/projects/{project_id}/branches/{branch_id}/databases",
                get(list_databases).post(create_database),
            )
            .route(
                "/projects/{project_id}/branches/{branch_id}/endpoints",
                get(list_endpoints),
            )
            .route("/projects/{project_id}/endpoints", post(create_endpoint))
            .route(
                "/projects/{project_id}/endpoints/{endpoint_id}/suspend",
                post(ok_empty_endpoint),
            )
            .route(
                "/projects/{project_id}/endpoints/{endpoint_id}/start",
                post(ok_empty_endpoint),
            )
            .route("/projects/{project_id}/connection_uri", get(connection_uri))
            .layer(middleware::from_fn_with_state(state.clone(), record_request))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock control plane");
        let addr = listener.local_addr().expect("mock local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve mock");
        });

        MockControlPlane {
            base_url: format!("http://{addr}/"),
            state,
        }
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().requests.clone()
    }
}

async fn record_request(State(state): State<Shared>, request: Request, next: Next) -> Response {
    state
        .lock()
        .unwrap()
        .requests
        .push((request.method().to_string(), request.uri().path().to_string()));
    next.run(request).await
}

async fn list_projects(State(state): State<Shared>) -> Json<Value> {
    let state = state.lock().unwrap();
    let projects: Vec<Value> = state
        .projects
        .iter()
        .map(|project| json!({ "id": project.id, "name": project.name }))
        .collect();
    Json(json!({ "projects": projects }))
}

async fn create_project(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = state.lock().unwrap();

    let project = &body["project"];
    let name = project["name"].as_str().unwrap_or_default().to_string();
    let branch_name = project["branch"]["name"].as_str().unwrap_or("main").to_string();
    let database_name = project["branch"]["database_name"]
        .as_str()
        .unwrap_or("neondb")
        .to_string();
    let role_name = project["branch"]["role_name"]
        .as_str()
        .unwrap_or("neondb_owner")
        .to_string();

    let project_id = state.next_id("proj");
    let branch_id = state.next_id("br");
    let endpoint_id = state.next_id("ep");
    let host = format!("{endpoint_id}.mock.neon.local");

    state.projects.push(MockProject {
        id: project_id.clone(),
        name: name.clone(),
        branches: vec![MockBranch {
            id: branch_id.clone(),
            name: branch_name,
            default: true,
            roles: vec![role_name.clone()],
            databases: vec![(database_name, role_name)],
        }],
        endpoints: vec![MockEndpoint {
            id: endpoint_id,
            branch_id,
            endpoint_type: "read_write".to_string(),
            host,
        }],
    });

    Json(json!({ "project": { "id": project_id, "name": name } }))
}

async fn get_organization(
    State(state): State<Shared>,
    Path(org_id): Path<String>,
) -> Response {
    let state = state.lock().unwrap();
    match state.organizations.iter().find(|(id, _)| *id == org_id) {
        Some((id, name)) => {
            Json(json!({ "organization": { "id": id, "name": name } })).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_organizations(State(state): State<Shared>) -> Json<Value> {
    let state = state.lock().unwrap();
    let organizations: Vec<Value> = state
        .organizations
        .iter()
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect();
    Json(json!({ "organizations": organizations }))
}

async fn list_branches(State(state): State<Shared>, Path(project_id): Path<String>) -> Response {
    let state = state.lock().unwrap();
    let Some(project) = state.projects.iter().find(|p| p.id == project_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let branches: Vec<Value> = project
        .branches
        .iter()
        .map(|branch| json!({ "id": branch.id, "name": branch.name, "default": branch.default }))
        .collect();
    Json(json!({ "branches": branches })).into_response()
}

fn insert_branch(state: &mut MockState, project_id: &str, body: &Value) -> Value {
    let name = body["branch"]["name"].as_str().unwrap_or_default().to_string();
    let endpoint_type = body["endpoints"][0]["type"]
        .as_str()
        .unwrap_or("read_write")
        .to_string();

    let branch_id = state.next_id("br");
    let endpoint_id = state.next_id("ep");
    let host = format!("{endpoint_id}.mock.neon.local");

    let project = state
        .projects
        .iter_mut()
        .find(|p| p.id == project_id)
        .expect("unknown project id");
    project.branches.push(MockBranch {
        id: branch_id.clone(),
        name: name.clone(),
        default: false,
        roles: Vec::new(),
        databases: Vec::new(),
    });
    project.endpoints.push(MockEndpoint {
        id: endpoint_id,
        branch_id: branch_id.clone(),
        endpoint_type,
        host,
    });

    json!({ "branch": { "id": branch_id, "name": name } })
}

async fn create_branch(
    State(state): State<Shared>,
    Path(project_id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let mut state = state.lock().unwrap();
    let branch = insert_branch(&mut state, &project_id, &body);
    (StatusCode::CREATED, Json(branch))
}

async fn create_anonymized_branch(
    State(state): State<Shared>,
    Path(project_id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let mut state = state.lock().unwrap();
    let branch = insert_branch(&mut state, &project_id, &body["branch_create"]);
    (StatusCode::CREATED, Json(branch))
}

async fn delete_branch(
    State(state): State<Shared>,
    Path((project_id, branch_id)): Path<(String, String)>,
) -> Response {
    let mut state = state.lock().unwrap();
    let Some(project) = state.projects.iter_mut().find(|p| p.id == project_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let before = project.branches.len();
    project.branches.retain(|branch| branch.id != branch_id);
    if project.branches.len() == before {
        return StatusCode::NOT_FOUND.into_response();
    }
    project.endpoints.retain(|endpoint| endpoint.branch_id != branch_id);

    Json(json!({})).into_response()
}

async fn set_default_branch(
    State(state): State<Shared>,
    Path((project_id, branch_id)): Path<(String, String)>,
) -> Response {
    let mut state = state.lock().unwrap();
    let Some(project) = state.projects.iter_mut().find(|p| p.id == project_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    for branch in &mut project.branches {
        branch.default = branch.id == branch_id;
    }
    Json(json!({})).into_response()
}

fn with_branch<R>(
    state: &Shared,
    project_id: &str,
    branch_id: &str,
    apply: impl FnOnce(&mut MockBranch) -> R,
) -> Option<R> {
    let mut state = state.lock().unwrap();
    state
        .projects
        .iter_mut()
        .find(|p| p.id == project_id)
        .and_then(|project| {
            project
                .branches
                .iter_mut()
                .find(|branch| branch.id == branch_id)
        })
        .map(apply)
}

async fn list_roles(
    State(state): State<Shared>,
    Path((project_id, branch_id)): Path<(String, String)>,
) -> Response {
    match with_branch(&state, &project_id, &branch_id, |branch| {
        branch
            .roles
            .iter()
            .map(|role| json!({ "name": role }))
            .collect::<Vec<_>>()
    }) {
        Some(roles) => Json(json!({ "roles": roles })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn create_role(
    State(state): State<Shared>,
    Path((project_id, branch_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let role_name = body["role"]["name"].as_str().unwrap_or_default().to_string();
    match with_branch(&state, &project_id, &branch_id, |branch| {
        branch.roles.push(role_name.clone());
    }) {
        Some(()) => (StatusCode::CREATED, Json(json!({}))).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_databases(
    State(state): State<Shared>,
    Path((project_id, branch_id)): Path<(String, String)>,
) -> Response {
    match with_branch(&state, &project_id, &branch_id, |branch| {
        branch
            .databases
            .iter()
            .map(|(name, _)| json!({ "name": name }))
            .collect::<Vec<_>>()
    }) {
        Some(databases) => Json(json!({ "databases": databases })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn create_database(
    State(state): State<Shared>,
    Path((project_id, branch_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let name = body["database"]["name"].as_str().unwrap_or_default().to_string();
    let owner = body["database"]["owner_name"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    match with_branch(&state, &project_id, &branch_id, |branch| {
        branch.databases.push((name.clone(), owner.clone()));
    }) {
        Some(()) => (StatusCode::CREATED, Json(json!({}))).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_endpoints(
    State(state): State<Shared>,
    Path((project_id, branch_id)): Path<(String, String)>,
) -> Response {
    let state = state.lock().unwrap();
    let Some(project) = state.projects.iter().find(|p| p.id == project_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let endpoints: Vec<Value> = project
        .endpoints
        .iter()
        .filter(|endpoint| endpoint.branch_id == branch_id)
        .map(|endpoint| {
            json!({ "id": endpoint.id, "type": endpoint.endpoint_type, "host": endpoint.host })
        })
        .collect();
    Json(json!({ "endpoints": endpoints })).into_response()
}

async fn create_endpoint(
    State(state): State<Shared>,
    Path(project_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    let branch_id = body["endpoint"]["branch_id"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let endpoint_type = body["endpoint"]["type"]
        .as_str()
        .unwrap_or("read_write")
        .to_string();

    let endpoint_id = state.next_id("ep");
    let host = format!("{endpoint_id}.mock.neon.local");

    let Some(project) = state.projects.iter_mut().find(|p| p.id == project_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    project.endpoints.push(MockEndpoint {
        id: endpoint_id.clone(),
        branch_id,
        endpoint_type: endpoint_type.clone(),
        host: host.clone(),
    });

    (
        StatusCode::CREATED,
        Json(json!({ "endpoint": { "id": endpoint_id, "type": endpoint_type, "host": host } })),
    )
        .into_response()
}

async fn restore_branch(
    State(state): State<Shared>,
    Path((project_id, branch_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state
        .lock()
        .unwrap()
        .restore_payloads
        .push((project_id, branch_id, body));
    Json(json!({}))
}

async fn ok_empty_endpoint(
    Path((_project_id, _endpoint_id)): Path<(String, String)>,
) -> Json<Value> {
    Json(json!({}))
}

async fn connection_uri(
    State(state): State<Shared>,
    Path(project_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let state = state.lock().unwrap();
    let Some(project) = state.projects.iter().find(|p| p.id == project_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let branch_id = params.get("branch_id").cloned().unwrap_or_default();
    let database_name = params.get("database_name").cloned().unwrap_or_default();
    let role_name = params.get("role_name").cloned().unwrap_or_default();

    let host = project
        .endpoints
        .iter()
        .find(|endpoint| endpoint.branch_id == branch_id)
        .map(|endpoint| endpoint.host.clone())
        .unwrap_or_else(|| "unknown.mock.neon.local".to_string());
    let password = format!("pw-{branch_id}-{database_name}");
    let uri = format!("postgresql://{role_name}:{password}@{host}/{database_name}");

    Json(json!({ "uri": uri })).into_response()
}
