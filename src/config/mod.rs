/// Configuration management for the flowgate server
///
/// Handles server configuration, database location, and execution limits for the
/// script sandbox, workflow executor and CRUD bridge.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Script sandbox and workflow limits
    pub execution: ExecutionConfig,
    /// CRUD endpoint paging
    pub crud: CrudConfig,
    /// Execution log output
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding endpoint, workflow and data-model definitions plus records
    pub path: String,
}

/// Limits applied to every script and workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Node executions allowed per workflow run
    pub max_iterations: u32,
    /// Lua VM instructions allowed per script call
    pub instruction_limit: u64,
    /// Lua heap ceiling per script call
    pub memory_limit_bytes: usize,
    /// Expose the `http` capability to scripts
    pub allow_http: bool,
    /// Timeout for script HTTP calls
    pub http_timeout_secs: u64,
    /// SQLite databases scripts may query; the first one is bound as `db`
    #[serde(default)]
    pub script_databases: Vec<ScriptDatabaseConfig>,
}

/// A database exposed to scripts under `name`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDatabaseConfig {
    pub name: String,
    pub path: String,
}

/// Paging bounds for CRUD list endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrudConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

/// Execution log sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory receiving one JSON file per workflow run
    pub execution_log_dir: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            instruction_limit: 10_000_000,
            memory_limit_bytes: 64 * 1024 * 1024,
            allow_http: false,
            http_timeout_secs: 10,
            script_databases: Vec::new(),
        }
    }
}

impl Default for CrudConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let execution_defaults = ExecutionConfig::default();
        let crud_defaults = CrudConfig::default();

        Self {
            server: ServerConfig {
                host: std::env::var("FLOWGATE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("FLOWGATE_PORT", 8000),
            },
            database: DatabaseConfig {
                path: std::env::var("FLOWGATE_DB_PATH")
                    .unwrap_or_else(|_| "storage/flowgate.db".to_string()),
            },
            execution: ExecutionConfig {
                max_iterations: env_or("FLOWGATE_MAX_ITERATIONS", execution_defaults.max_iterations),
                instruction_limit: env_or("FLOWGATE_INSTRUCTION_LIMIT", execution_defaults.instruction_limit),
                memory_limit_bytes: env_or("FLOWGATE_MEMORY_LIMIT", execution_defaults.memory_limit_bytes),
                allow_http: env_or("FLOWGATE_ALLOW_HTTP", execution_defaults.allow_http),
                http_timeout_secs: env_or("FLOWGATE_HTTP_TIMEOUT", execution_defaults.http_timeout_secs),
                script_databases: std::env::var("FLOWGATE_SCRIPT_DATABASES")
                    .map(|raw| parse_script_databases(&raw))
                    .unwrap_or_default(),
            },
            crud: CrudConfig {
                default_page_size: env_or("FLOWGATE_PAGE_SIZE", crud_defaults.default_page_size),
                max_page_size: env_or("FLOWGATE_MAX_PAGE_SIZE", crud_defaults.max_page_size),
            },
            logging: LoggingConfig {
                execution_log_dir: std::env::var("FLOWGATE_LOG_DIR")
                    .unwrap_or_else(|_| "storage/workflow_logs".to_string()),
            },
        }
    }
}

/// Parse an environment variable, falling back on absence or parse failure
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `name=path` pairs separated by commas, e.g. `main=storage/app.db,audit=storage/audit.db`
///
/// Entries without a name or path are ignored.
pub fn parse_script_databases(raw: &str) -> Vec<ScriptDatabaseConfig> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, path) = entry.split_once('=')?;
            let (name, path) = (name.trim(), path.trim());
            (!name.is_empty() && !path.is_empty()).then(|| ScriptDatabaseConfig {
                name: name.to_string(),
                path: path.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_defaults() {
        let execution = ExecutionConfig::default();
        assert_eq!(execution.max_iterations, 1000);
        assert!(execution.instruction_limit > 0);
        assert!(!execution.allow_http);
        assert!(execution.script_databases.is_empty());

        let crud = CrudConfig::default();
        assert_eq!(crud.default_page_size, 20);
        assert!(crud.max_page_size >= crud.default_page_size);
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        assert_eq!(env_or("FLOWGATE_TEST_UNSET_VARIABLE", 42u32), 42);
    }

    #[test]
    fn test_parse_script_databases() {
        let parsed = parse_script_databases("main=storage/app.db, audit = /var/audit.db,broken,=x,");
        assert_eq!(
            parsed,
            vec![
                ScriptDatabaseConfig { name: "main".into(), path: "storage/app.db".into() },
                ScriptDatabaseConfig { name: "audit".into(), path: "/var/audit.db".into() },
            ]
        );
    }
}
