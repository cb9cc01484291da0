use crate::config::vars;

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("required environment variable '{0}' was not provided")]
    MissingVariable(&'static str),
    #[error(
        "unsupported mode '{0}'. Allowed values are 'attach', 'provision', 'suspend', and 'resume'"
    )]
    UnsupportedMode(String),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    NotFound(String),
    #[error("invalid JSON in {variable}: {source}")]
    InvalidJson {
        variable: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Neon API error: {0}")]
    Api(#[from] neon_api::NeonApiError),
    #[error("invalid connection URI: {0}")]
    InvalidConnectionUri(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize provisioner output: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl ProvisionError {
    pub(crate) fn missing_project_reference() -> Self {
        ProvisionError::Config(format!(
            "either {} or {} must be provided",
            vars::PROJECT_ID,
            vars::PROJECT_NAME
        ))
    }
}
