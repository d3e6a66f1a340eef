//! Tunnel link: publish the current tunnel URL as the manifest's `app_url`.
//!
//! The tunnel client prints its public URL to a log. The last one found is
//! written into `manifest.json`, locally and optionally to the GitHub
//! repository that hosts the canonical origin.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shellkit_common::OptionExt;
use thiserror::Error;
use tracing::{debug, info};

const GITHUB_API: &str = "https://api.github.com";
const TOKEN_DIR: &str = "shellkit";
const TOKEN_FILE: &str = "gh_token";

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Tunnel log {0} not found")]
    LogMissing(PathBuf),

    #[error("No trycloudflare.com URL in {0}")]
    UrlNotFound(PathBuf),

    #[error("Manifest {path} is not a JSON object")]
    ManifestShape { path: PathBuf },

    #[error("No GitHub token: pass --token, set GITHUB_TOKEN, or save one with --save-token")]
    MissingToken,

    #[error("GitHub API returned {status}: {body}")]
    GitHub { status: u16, body: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Common(#[from] shellkit_common::ShellKitError),
}

fn tunnel_url_pattern() -> Regex {
    Regex::new(r"https?://[A-Za-z0-9\-]+\.trycloudflare\.com\b").expect("static pattern is valid")
}

/// Last tunnel URL mentioned in `log`.
pub fn extract_tunnel_url(log: &str) -> Option<String> {
    let pattern = tunnel_url_pattern();
    log.lines()
        .rev()
        .find_map(|line| pattern.find(line).map(|m| m.as_str().to_string()))
}

/// Read `path` and extract the last tunnel URL from it.
pub fn tunnel_url_from_log(path: &Path) -> Result<String, TunnelError> {
    if !path.exists() {
        return Err(TunnelError::LogMissing(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    let log = String::from_utf8_lossy(&bytes);
    extract_tunnel_url(&log).ok_or_else(|| TunnelError::UrlNotFound(path.to_path_buf()))
}

/// Set `app_url` in the manifest at `path`, creating it if absent.
/// Returns the serialized manifest as written.
pub fn update_manifest(path: &Path, app_url: &str) -> Result<Vec<u8>, TunnelError> {
    let mut manifest = if path.exists() {
        match serde_json::from_slice::<Value>(&std::fs::read(path)?)? {
            Value::Object(map) => map,
            _ => {
                return Err(TunnelError::ManifestShape {
                    path: path.to_path_buf(),
                })
            }
        }
    } else {
        Map::new()
    };

    manifest.insert("app_url".to_string(), Value::String(app_url.to_string()));
    let bytes = serde_json::to_vec_pretty(&Value::Object(manifest))?;
    std::fs::write(path, &bytes)?;
    info!(path = %path.display(), app_url, "Manifest updated");
    Ok(bytes)
}

/// Path of the saved token file.
pub fn token_path() -> Result<PathBuf, TunnelError> {
    let dir = dirs::config_dir().ok_or_not_found("user config directory")?;
    Ok(dir.join(TOKEN_DIR).join(TOKEN_FILE))
}

/// Resolve a token: explicit value, then `GITHUB_TOKEN`, then the saved file.
pub fn resolve_token(explicit: Option<String>, saved: &Path) -> Result<String, TunnelError> {
    if let Some(token) = explicit.filter(|t| !t.trim().is_empty()) {
        return Ok(token.trim().to_string());
    }
    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }
    }
    match std::fs::read_to_string(saved) {
        Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
        _ => Err(TunnelError::MissingToken),
    }
}

/// Save a token readable only by the current user.
pub fn save_token(path: &Path, token: &str) -> Result<(), TunnelError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!(path = %path.display(), "Token saved");
    Ok(())
}

/// Target file in a GitHub repository.
#[derive(Debug, Clone)]
pub struct RepoFile {
    pub owner: String,
    pub repo: String,
    pub path: String,
}

impl RepoFile {
    fn contents_url(&self) -> String {
        format!(
            "{GITHUB_API}/repos/{}/{}/contents/{}",
            self.owner, self.repo, self.path
        )
    }
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
}

#[derive(Debug, Serialize)]
struct Committer<'a> {
    name: &'a str,
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct PutContents<'a> {
    message: &'a str,
    content: String,
    committer: Committer<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

/// Create or replace `file` with `content` through the contents API.
pub async fn publish(
    client: &reqwest::Client,
    file: &RepoFile,
    content: &[u8],
    message: &str,
    token: &str,
) -> Result<(), TunnelError> {
    let url = file.contents_url();
    let auth = format!("token {token}");

    let existing = client
        .get(&url)
        .header("Authorization", &auth)
        .header("Accept", "application/vnd.github.v3+json")
        .header("User-Agent", "shellctl")
        .send()
        .await?;

    let sha = match existing.status().as_u16() {
        200 => Some(existing.json::<ContentsResponse>().await?.sha),
        404 => None,
        status => {
            return Err(TunnelError::GitHub {
                status,
                body: existing.text().await.unwrap_or_default(),
            })
        }
    };
    debug!(url = %url, sha = ?sha, "Resolved current file sha");

    let body = PutContents {
        message,
        content: STANDARD.encode(content),
        committer: Committer {
            name: "automation-bot",
            email: "bot+automation@local",
        },
        sha,
    };

    let response = client
        .put(&url)
        .header("Authorization", &auth)
        .header("Accept", "application/vnd.github.v3+json")
        .header("User-Agent", "shellctl")
        .json(&body)
        .send()
        .await?;

    match response.status().as_u16() {
        200 | 201 => {
            info!(repo = %file.repo, path = %file.path, "Published to GitHub");
            Ok(())
        }
        status => Err(TunnelError::GitHub {
            status,
            body: response.text().await.unwrap_or_default(),
        }),
    }
}
