// Configuration loading and parsing (convo.toml, credentials.toml).

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CONFIG_DIR: &str = "config";
const DEFAULTS_DIR: &str = "defaults";
const MAIN_FILE: &str = "convo.toml";
const CREDENTIALS_FILE: &str = "credentials.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    Missing { path: PathBuf },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid `{field}`: {message}")]
    Invalid { field: String, message: String },

    #[error("cannot install default config at {path}: {source}")]
    Bootstrap { path: PathBuf, source: io::Error },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub user: UserConfig,
    pub chat: ChatConfig,
    pub reconnect: ReconnectConfig,
    pub credentials: CredentialsConfig,
    pub db_path: String,
}

// ---------------------------------------------------------------------------
// convo.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire convo.toml file.
#[derive(Debug, Clone, Deserialize)]
struct ConvoFile {
    server: ServerConfig,
    user: UserConfig,
    #[serde(default)]
    chat: ChatConfig,
    #[serde(default)]
    reconnect: ReconnectConfig,
    database: DatabaseSection,
}

#[derive(Debug, Clone, Deserialize)]
struct DatabaseSection {
    path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the messaging HTTP API, e.g. `http://localhost:5000`.
    pub base_url: String,
    /// Websocket endpoint for the live feed.
    pub ws_url: String,
}

/// The signed-in user this client acts as.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "client".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub typing_idle_ms: u64,
    pub history_page_size: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            typing_idle_ms: 3000,
            history_page_size: 50,
        }
    }
}

impl ChatConfig {
    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            max_attempts: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    /// Bearer token for both the HTTP API and the websocket handshake.
    pub access_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Read `<base_dir>/config/convo.toml` plus the optional credentials file
/// next to it, then validate. Never touches `defaults/`.
pub(crate) fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join(CONFIG_DIR);

    let file: ConvoFile = parse_toml(&config_dir.join(MAIN_FILE))?;

    let credentials_path = config_dir.join(CREDENTIALS_FILE);
    let credentials = if credentials_path.is_file() {
        parse_toml(&credentials_path)?
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        server: file.server,
        user: file.user,
        chat: file.chat,
        reconnect: file.reconnect,
        credentials,
        db_path: file.database.path,
    };
    validate(&config)?;
    Ok(config)
}

/// Install every file from `defaults/` into `config/` that is not there yet.
/// `*.example` files are templates and never installed. Returns the paths
/// that were written.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join(DEFAULTS_DIR);
    let config_dir = base_dir.join(CONFIG_DIR);

    if !defaults_dir.is_dir() {
        // A hand-made config/ needs no defaults.
        if config_dir.is_dir() {
            return Ok(Vec::new());
        }
        return Err(ConfigError::Missing { path: config_dir });
    }

    std::fs::create_dir_all(&config_dir).map_err(bootstrap(&config_dir))?;

    let mut installed = Vec::new();
    for source in installable_defaults(&defaults_dir)? {
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = config_dir.join(name);
        if install(&source, &target)? {
            installed.push(target);
        }
    }
    installed.sort();
    Ok(installed)
}

/// [`ensure_config_files`] then [`load_config_from`], both relative to the
/// working directory.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(bootstrap(Path::new(".")))?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|_| ConfigError::Missing {
        path: path.to_path_buf(),
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn bootstrap(path: &Path) -> impl FnOnce(io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Bootstrap {
        path: path.to_path_buf(),
        source,
    }
}

fn installable_defaults(defaults_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let entries = std::fs::read_dir(defaults_dir).map_err(bootstrap(defaults_dir))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(bootstrap(defaults_dir))?.path();
        let is_template = path.extension().is_some_and(|ext| ext == "example");
        if path.is_file() && !is_template {
            files.push(path);
        }
    }
    Ok(files)
}

/// Copy `source` to `target` unless `target` exists. `create_new` makes the
/// existence check and the create one step.
fn install(source: &Path, target: &Path) -> Result<bool, ConfigError> {
    let mut out = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(bootstrap(target)(e)),
    };
    let bytes = std::fs::read(source).map_err(bootstrap(source))?;
    io::Write::write_all(&mut out, &bytes).map_err(bootstrap(target))?;
    Ok(true)
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    match reqwest::Url::parse(&config.server.base_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(url) => {
            return Err(invalid(
                "server.base_url",
                format!("scheme must be http or https, got {}", url.scheme()),
            ))
        }
        Err(e) => return Err(invalid("server.base_url", format!("not a valid URL: {e}"))),
    }

    match reqwest::Url::parse(&config.server.ws_url) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
        Ok(url) => {
            return Err(invalid(
                "server.ws_url",
                format!("scheme must be ws or wss, got {}", url.scheme()),
            ))
        }
        Err(e) => return Err(invalid("server.ws_url", format!("not a valid URL: {e}"))),
    }

    if config.user.id.trim().is_empty() {
        return Err(invalid("user.id", "must not be empty"));
    }

    if config.chat.typing_idle_ms == 0 {
        return Err(invalid("chat.typing_idle_ms", "must be > 0"));
    }
    if config.chat.history_page_size == 0 {
        return Err(invalid("chat.history_page_size", "must be > 0"));
    }

    let reconnect = &config.reconnect;
    if reconnect.initial_delay_ms == 0 {
        return Err(invalid("reconnect.initial_delay_ms", "must be > 0"));
    }
    if reconnect.max_delay_ms < reconnect.initial_delay_ms {
        return Err(invalid(
            "reconnect.max_delay_ms",
            format!(
                "must be >= initial_delay_ms ({}), got {}",
                reconnect.initial_delay_ms, reconnect.max_delay_ms
            ),
        ));
    }

    if config.db_path.trim().is_empty() {
        return Err(invalid("database.path", "must not be empty"));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
