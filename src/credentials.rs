//! Registry credentials from the auth files of Docker and Podman.
//!
//! Files are checked in this order:
//!
//! 1. `$REGISTRY_AUTH_FILE`
//! 2. `$XDG_RUNTIME_DIR/containers/auth.json`
//! 3. `$XDG_CONFIG_HOME/containers/auth.json`
//! 4. `$DOCKER_CONFIG/config.json`, or `~/.docker/config.json`
//!
//! In every file, a `credHelpers` entry for the registry has priority
//! over the `auths` entries, and `credsStore` is used when none of them
//! matches.

use std::{
    collections::HashMap,
    fmt, io,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use base64::{engine::general_purpose::STANDARD, Engine};

/// Key used by Docker for the credentials of Docker Hub.
const DOCKER_HUB_SERVER: &str = "https://index.docker.io/v1/";

#[derive(thiserror::Error, Debug)]
pub enum CredentialsError {
    #[error("Cannot read {1}: {0}")]
    Io(io::Error, PathBuf),

    #[error("Invalid JSON in {1}: {0}")]
    Json(serde_json::Error, PathBuf),

    #[error("Invalid auth entry for {0}.")]
    InvalidAuth(String),

    #[error("Credential helper {0} failed: {1}")]
    Helper(String, String),
}

/// Username and password for a registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value for the `Authorization` header.
    pub fn basic_auth(&self) -> String {
        let pair = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(pair))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(serde::Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase")]
struct AuthFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,

    #[serde(default)]
    cred_helpers: HashMap<String, String>,

    creds_store: Option<String>,
}

#[derive(serde::Deserialize, Default, Debug)]
struct AuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// Find the credentials for the registry in `domain`.
///
/// Returns `Ok(None)` if there are no credentials for it.
pub fn lookup(domain: &str) -> Result<Option<Credentials>, CredentialsError> {
    lookup_in(&auth_files(), domain)
}

fn auth_files() -> Vec<PathBuf> {
    let mut files = Vec::new();

    if let Some(path) = std::env::var_os("REGISTRY_AUTH_FILE") {
        files.push(PathBuf::from(path));
    }

    if let Some(dir) = dirs::runtime_dir() {
        files.push(dir.join("containers/auth.json"));
    }

    if let Some(dir) = dirs::config_dir() {
        files.push(dir.join("containers/auth.json"));
    }

    match std::env::var_os("DOCKER_CONFIG") {
        Some(dir) => files.push(Path::new(&dir).join("config.json")),
        None => {
            if let Some(home) = dirs::home_dir() {
                files.push(home.join(".docker/config.json"));
            }
        }
    }

    files
}

pub(crate) fn lookup_in(
    files: &[PathBuf],
    domain: &str,
) -> Result<Option<Credentials>, CredentialsError> {
    let domain = normalize_registry(domain);

    for path in files {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(CredentialsError::Io(e, path.clone())),
        };

        let file: AuthFile =
            serde_json::from_slice(&data).map_err(|e| CredentialsError::Json(e, path.clone()))?;

        tracing::trace!(path = %path.display(), "Checking auth file");

        let helper = file
            .cred_helpers
            .iter()
            .find(|(registry, _)| normalize_registry(registry) == domain);

        if let Some((_, helper)) = helper {
            return run_helper(helper, &domain);
        }

        let entry = file
            .auths
            .iter()
            .find(|(registry, _)| normalize_registry(registry) == domain);

        if let Some((registry, entry)) = entry {
            return decode_entry(registry, entry).map(Some);
        }

        if let Some(store) = &file.creds_store {
            if let Some(credentials) = run_helper(store, &domain)? {
                return Ok(Some(credentials));
            }
        }
    }

    Ok(None)
}

fn decode_entry(registry: &str, entry: &AuthEntry) -> Result<Credentials, CredentialsError> {
    let invalid = || CredentialsError::InvalidAuth(registry.to_owned());

    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Ok(Credentials::new(username, password));
    }

    let auth = entry.auth.as_deref().ok_or_else(invalid)?;
    let decoded = STANDARD.decode(auth.trim()).map_err(|_| invalid())?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;

    let (username, password) = decoded.split_once(':').ok_or_else(invalid)?;
    Ok(Credentials::new(username, password))
}

/// Run `docker-credential-<helper> get`.
fn run_helper(helper: &str, domain: &str) -> Result<Option<Credentials>, CredentialsError> {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct HelperOutput {
        username: String,
        secret: String,
    }

    let program = format!("docker-credential-{helper}");
    let failed = |msg: String| CredentialsError::Helper(program.clone(), msg);

    let server = match domain {
        "docker.io" => DOCKER_HUB_SERVER,
        d => d,
    };

    tracing::debug!(%program, %server, "Running credential helper");

    let mut child = Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| failed(e.to_string()))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(server.as_bytes())
            .map_err(|e| failed(e.to_string()))?;
    }

    let output = child.wait_with_output().map_err(|e| failed(e.to_string()))?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        if stdout.contains("credentials not found") {
            return Ok(None);
        }

        return Err(failed(stdout.trim().to_owned()));
    }

    let output: HelperOutput =
        serde_json::from_str(&stdout).map_err(|e| failed(e.to_string()))?;

    Ok(Some(Credentials::new(output.username, output.secret)))
}

/// Normalize the keys in auth files, so `https://index.docker.io/v1/`
/// and `docker.io` are the same registry.
fn normalize_registry(registry: &str) -> String {
    let registry = registry.trim().to_lowercase();

    let host = registry
        .strip_prefix("https://")
        .or_else(|| registry.strip_prefix("http://"))
        .unwrap_or(&registry);

    let host = host.split('/').next().unwrap_or(host);

    match host {
        "index.docker.io" | "registry-1.docker.io" => "docker.io".to_owned(),
        h => h.to_owned(),
    }
}
