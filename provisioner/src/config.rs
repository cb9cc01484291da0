use crate::errors::ProvisionError;
use chrono::{DateTime, Utc};
use neon_api::types::MaskingRule;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// Environment variable names understood by the provisioner.
pub mod vars {
    pub const API_KEY: &str = "NEON_API_KEY";
    pub const MODE: &str = "NEON_MODE";
    pub const OUTPUT_FILE_PATH: &str = "NEON_OUTPUT_FILE_PATH";
    pub const API_BASE_URL: &str = "NEON_API_BASE_URL";

    pub const PROJECT_ID: &str = "NEON_PROJECT_ID";
    pub const PROJECT_NAME: &str = "NEON_PROJECT_NAME";
    pub const CREATE_PROJECT_IF_MISSING: &str = "NEON_CREATE_PROJECT_IF_MISSING";
    pub const REGION_ID: &str = "NEON_REGION_ID";
    pub const POSTGRES_VERSION: &str = "NEON_POSTGRES_VERSION";
    pub const ORGANIZATION_ID: &str = "NEON_ORGANIZATION_ID";
    pub const ORGANIZATION_NAME: &str = "NEON_ORGANIZATION_NAME";

    pub const BRANCH_ID: &str = "NEON_BRANCH_ID";
    pub const BRANCH_NAME: &str = "NEON_BRANCH_NAME";
    pub const PARENT_BRANCH_ID: &str = "NEON_PARENT_BRANCH_ID";
    pub const PARENT_BRANCH_NAME: &str = "NEON_PARENT_BRANCH_NAME";
    pub const BRANCH_PROTECTED: &str = "NEON_BRANCH_PROTECTED";
    pub const BRANCH_INIT_SOURCE: &str = "NEON_BRANCH_INIT_SOURCE";
    pub const BRANCH_EXPIRES_AT: &str = "NEON_BRANCH_EXPIRES_AT";
    pub const BRANCH_PARENT_LSN: &str = "NEON_BRANCH_PARENT_LSN";
    pub const BRANCH_PARENT_TIMESTAMP: &str = "NEON_BRANCH_PARENT_TIMESTAMP";
    pub const BRANCH_ARCHIVED: &str = "NEON_BRANCH_ARCHIVED";
    pub const CREATE_BRANCH_IF_MISSING: &str = "NEON_CREATE_BRANCH_IF_MISSING";
    pub const BRANCH_SET_AS_DEFAULT: &str = "NEON_BRANCH_SET_AS_DEFAULT";
    pub const USE_EPHEMERAL_BRANCH: &str = "NEON_USE_EPHEMERAL_BRANCH";
    pub const EPHEMERAL_BRANCH_PREFIX: &str = "NEON_EPHEMERAL_BRANCH_PREFIX";

    pub const BRANCH_RESTORE_ENABLED: &str = "NEON_BRANCH_RESTORE_ENABLED";
    pub const BRANCH_RESTORE_SOURCE_BRANCH_ID: &str = "NEON_BRANCH_RESTORE_SOURCE_BRANCH_ID";
    pub const BRANCH_RESTORE_SOURCE_LSN: &str = "NEON_BRANCH_RESTORE_SOURCE_LSN";
    pub const BRANCH_RESTORE_SOURCE_TIMESTAMP: &str = "NEON_BRANCH_RESTORE_SOURCE_TIMESTAMP";
    pub const BRANCH_RESTORE_PRESERVE_UNDER_NAME: &str = "NEON_BRANCH_RESTORE_PRESERVE_UNDER_NAME";

    pub const BRANCH_ANONYMIZATION_ENABLED: &str = "NEON_BRANCH_ANONYMIZATION_ENABLED";
    pub const BRANCH_ANONYMIZATION_START: &str = "NEON_BRANCH_ANONYMIZATION_START";
    pub const BRANCH_MASKING_RULES_JSON: &str = "NEON_BRANCH_MASKING_RULES_JSON";

    pub const ENDPOINT_ID: &str = "NEON_ENDPOINT_ID";
    pub const ENDPOINT_TYPE: &str = "NEON_ENDPOINT_TYPE";
    pub const CREATE_ENDPOINT_IF_MISSING: &str = "NEON_CREATE_ENDPOINT_IF_MISSING";

    pub const DATABASE_NAME: &str = "NEON_DATABASE_NAME";
    pub const ROLE_NAME: &str = "NEON_ROLE_NAME";
    pub const USE_CONNECTION_POOLER: &str = "NEON_USE_CONNECTION_POOLER";
    pub const DATABASE_SPECS_JSON: &str = "NEON_DATABASE_SPECS_JSON";
}

/// Blank-is-unset rule applied to every variable: surrounding whitespace is
/// trimmed and an empty result counts as not provided.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Run policy. Only `provision` may create missing resources; `suspend` and
/// `resume` skip the topology walk entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Attach,
    Provision,
    Suspend,
    Resume,
}

impl Mode {
    pub fn allows_create(self) -> bool {
        matches!(self, Mode::Provision)
    }

    fn parse(value: &str) -> Result<Self, ProvisionError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "attach" => Ok(Mode::Attach),
            "provision" => Ok(Mode::Provision),
            "suspend" => Ok(Mode::Suspend),
            "resume" => Ok(Mode::Resume),
            other => Err(ProvisionError::UnsupportedMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            Mode::Attach => "attach",
            Mode::Provision => "provision",
            Mode::Suspend => "suspend",
            Mode::Resume => "resume",
        };
        f.write_str(mode)
    }
}

/// One additional database to provision besides the default one.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseSpec {
    #[serde(default)]
    pub resource_name: String,
    pub database_name: String,
    pub role_name: String,
}

#[derive(Clone, Debug)]
pub struct ProvisionerConfig {
    pub mode: Mode,
    pub api_key: String,
    pub api_base_url: Option<String>,
    pub output_file_path: PathBuf,

    pub organization_id: Option<String>,
    pub organization_name: Option<String>,

    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub create_project_if_missing: bool,
    pub region_id: Option<String>,
    pub postgres_version: Option<u32>,

    pub branch_id: Option<String>,
    pub branch_name: Option<String>,
    pub create_branch_if_missing: bool,
    pub parent_branch_id: Option<String>,
    pub parent_branch_name: Option<String>,
    pub branch_protected: Option<bool>,
    pub branch_archived: Option<bool>,
    pub branch_init_source: Option<String>,
    pub branch_expires_at: Option<DateTime<Utc>>,
    pub branch_parent_lsn: Option<String>,
    pub branch_parent_timestamp: Option<DateTime<Utc>>,
    pub branch_set_as_default: bool,

    pub use_ephemeral_branch: bool,
    pub ephemeral_branch_prefix: String,

    pub branch_restore_enabled: bool,
    pub restore_source_branch_id: Option<String>,
    pub restore_source_lsn: Option<String>,
    pub restore_source_timestamp: Option<DateTime<Utc>>,
    pub restore_preserve_under_name: Option<String>,

    pub anonymization_enabled: bool,
    pub anonymization_start: bool,
    pub masking_rules: Vec<MaskingRule>,

    pub endpoint_id: Option<String>,
    pub endpoint_type: String,
    pub create_endpoint_if_missing: bool,

    pub database_name: String,
    pub role_name: String,
    pub use_connection_pooler: bool,
    pub database_specs: Vec<DatabaseSpec>,
}

impl ProvisionerConfig {
    pub fn from_env(mode_override: Option<Mode>) -> Result<Self, ProvisionError> {
        Self::from_lookup(|name| std::env::var(name).ok(), mode_override)
    }

    /// Builds the configuration from an injectable name -> value lookup, so
    /// tests never have to mutate the process environment.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        mode_override: Option<Mode>,
    ) -> Result<Self, ProvisionError> {
        let optional = |name: &str| non_blank(lookup(name));
        let require = |name: &'static str| {
            optional(name).ok_or(ProvisionError::MissingVariable(name))
        };
        let read = |name: &str, fallback: &str| optional(name).unwrap_or_else(|| fallback.to_string());
        // Only a case-insensitive "true" enables a flag.
        let read_bool = |name: &str| {
            optional(name).is_some_and(|value| value.eq_ignore_ascii_case("true"))
        };
        let read_opt_bool = |name: &str| {
            optional(name).and_then(|value| {
                if value.eq_ignore_ascii_case("true") {
                    Some(true)
                } else if value.eq_ignore_ascii_case("false") {
                    Some(false)
                } else {
                    None
                }
            })
        };
        // Malformed timestamps are treated as unset.
        let read_timestamp = |name: &str| {
            optional(name).and_then(|value| {
                DateTime::parse_from_rfc3339(&value)
                    .ok()
                    .map(|parsed| parsed.with_timezone(&Utc))
            })
        };

        let mode = match mode_override {
            Some(mode) => mode,
            None => Mode::parse(&read(vars::MODE, "attach"))?,
        };

        let database_name = read(vars::DATABASE_NAME, "neondb");
        let role_name = read(vars::ROLE_NAME, &format!("{database_name}_owner"));

        let masking_rules = match optional(vars::BRANCH_MASKING_RULES_JSON) {
            Some(json) => serde_json::from_str::<Vec<MaskingRule>>(&json).map_err(|source| {
                ProvisionError::InvalidJson {
                    variable: vars::BRANCH_MASKING_RULES_JSON,
                    source,
                }
            })?,
            None => Vec::new(),
        };

        let database_specs = match optional(vars::DATABASE_SPECS_JSON) {
            Some(json) => serde_json::from_str::<Vec<DatabaseSpec>>(&json).map_err(|source| {
                ProvisionError::InvalidJson {
                    variable: vars::DATABASE_SPECS_JSON,
                    source,
                }
            })?,
            None => Vec::new(),
        };

        let config = ProvisionerConfig {
            mode,
            api_key: require(vars::API_KEY)?,
            api_base_url: optional(vars::API_BASE_URL),
            output_file_path: PathBuf::from(require(vars::OUTPUT_FILE_PATH)?),

            organization_id: optional(vars::ORGANIZATION_ID),
            organization_name: optional(vars::ORGANIZATION_NAME),

            project_id: optional(vars::PROJECT_ID),
            project_name: optional(vars::PROJECT_NAME),
            create_project_if_missing: read_bool(vars::CREATE_PROJECT_IF_MISSING),
            region_id: optional(vars::REGION_ID),
            postgres_version: optional(vars::POSTGRES_VERSION)
                .and_then(|value| value.parse().ok()),

            branch_id: optional(vars::BRANCH_ID),
            branch_name: optional(vars::BRANCH_NAME),
            create_branch_if_missing: read_bool(vars::CREATE_BRANCH_IF_MISSING),
            parent_branch_id: optional(vars::PARENT_BRANCH_ID),
            parent_branch_name: optional(vars::PARENT_BRANCH_NAME),
            branch_protected: read_opt_bool(vars::BRANCH_PROTECTED),
            branch_archived: read_opt_bool(vars::BRANCH_ARCHIVED),
            branch_init_source: optional(vars::BRANCH_INIT_SOURCE),
            branch_expires_at: read_timestamp(vars::BRANCH_EXPIRES_AT),
            branch_parent_lsn: optional(vars::BRANCH_PARENT_LSN),
            branch_parent_timestamp: read_timestamp(vars::BRANCH_PARENT_TIMESTAMP),
            branch_set_as_default: read_bool(vars::BRANCH_SET_AS_DEFAULT),

            use_ephemeral_branch: read_bool(vars::USE_EPHEMERAL_BRANCH),
            ephemeral_branch_prefix: read(vars::EPHEMERAL_BRANCH_PREFIX, "ephemeral-"),

            branch_restore_enabled: read_bool(vars::BRANCH_RESTORE_ENABLED),
            restore_source_branch_id: optional(vars::BRANCH_RESTORE_SOURCE_BRANCH_ID),
            restore_source_lsn: optional(vars::BRANCH_RESTORE_SOURCE_LSN),
            restore_source_timestamp: read_timestamp(vars::BRANCH_RESTORE_SOURCE_TIMESTAMP),
            restore_preserve_under_name: optional(vars::BRANCH_RESTORE_PRESERVE_UNDER_NAME),

            anonymization_enabled: read_bool(vars::BRANCH_ANONYMIZATION_ENABLED),
            anonymization_start: read_bool(vars::BRANCH_ANONYMIZATION_START),
            masking_rules,

            endpoint_id: optional(vars::ENDPOINT_ID),
            endpoint_type: read(vars::ENDPOINT_TYPE, "read_write"),
            create_endpoint_if_missing: read_bool(vars::CREATE_ENDPOINT_IF_MISSING),

            database_name,
            role_name,
            use_connection_pooler: read_bool(vars::USE_CONNECTION_POOLER),
            database_specs,
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects mode-incompatible combinations before any network call.
    fn validate(&self) -> Result<(), ProvisionError> {
        match self.mode {
            Mode::Suspend | Mode::Resume => {
                if self.project_id.is_none() {
                    return Err(ProvisionError::MissingVariable(vars::PROJECT_ID));
                }
                if self.endpoint_id.is_none() {
                    return Err(ProvisionError::MissingVariable(vars::ENDPOINT_ID));
                }
            }
            Mode::Attach | Mode::Provision => {
                if self.project_id.is_none() && self.project_name.is_none() {
                    return Err(ProvisionError::missing_project_reference());
                }
                if self.use_ephemeral_branch && self.mode != Mode::Provision {
                    return Err(ProvisionError::Config(
                        "ephemeral branch mode requires 'provision' mode".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}
