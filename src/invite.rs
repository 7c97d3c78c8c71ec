//! Invite-code redemption against the lighthouse.
//!
//! A successful redemption returns a zip holding the host's config bundle,
//! which is unpacked into the bundle directory.

use serde::Serialize;
use std::io::{Cursor, Read};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bundle::{ConfigBundle, BUNDLE_FILES};
use crate::error::InviteError;
use crate::monitor::coordinator_url;

pub const REDEEM_PATH: &str = "/api/client/redeem_invite";
pub const REDEEM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct RedeemRequest<'a> {
    invite_code: &'a str,
    name: &'a str,
    tags: &'a [String],
}

pub struct InviteClient {
    client: reqwest::Client,
}

impl InviteClient {
    pub fn new() -> Result<Self, InviteError> {
        let client = reqwest::Client::builder()
            .timeout(REDEEM_TIMEOUT)
            .build()
            .map_err(|e| InviteError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    /// Redeems `code` and writes the returned bundle. Returns the files written.
    pub async fn redeem(
        &self,
        address: &str,
        code: &str,
        name: &str,
        tags: &[String],
        bundle: &ConfigBundle,
    ) -> Result<Vec<&'static str>, InviteError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(InviteError::EmptyCode);
        }

        let url = coordinator_url(address, REDEEM_PATH);
        info!(url = %url, name = %name, "Redeeming invite code");

        let response = self
            .client
            .post(&url)
            .json(&RedeemRequest {
                invite_code: code,
                name,
                tags,
            })
            .send()
            .await
            .map_err(|e| InviteError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| InviteError::Transport(e.to_string()))?;

        if status != reqwest::StatusCode::OK {
            let detail = rejection_detail(&body)
                .or_else(|| status.canonical_reason().map(str::to_string))
                .unwrap_or_default();
            warn!(status = status.as_u16(), detail = %detail, "Invite rejected");
            return Err(InviteError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }

        let dir = bundle.dir().to_path_buf();
        let body = body.to_vec();
        let written = tokio::task::spawn_blocking(move || unpack_bundle(&body, &dir))
            .await
            .map_err(|e| InviteError::Archive(format!("unpack task failed: {}", e)))??;

        info!(files = ?written, dir = %bundle.dir().display(), "Config bundle installed");
        Ok(written)
    }
}

/// The `detail` field of an error body, or the body itself when it is short text.
fn rejection_detail(body: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        match value.get("detail") {
            Some(serde_json::Value::String(detail)) => return Some(detail.clone()),
            Some(other) => return Some(other.to_string()),
            None => {}
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    (!text.is_empty() && text.len() <= 200).then(|| text.to_string())
}

/// Writes every bundle file found in the archive, matched by base name.
fn unpack_bundle(bytes: &[u8], dir: &Path) -> Result<Vec<&'static str>, InviteError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| InviteError::Archive(e.to_string()))?;

    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| InviteError::Archive(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }

        let Some(base) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        else {
            debug!(name = %entry.name(), "Skipping unsafe archive entry");
            continue;
        };
        let Some(name) = BUNDLE_FILES.iter().copied().find(|f| *f == base) else {
            debug!(name = %entry.name(), "Skipping unrelated archive entry");
            continue;
        };

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;

        let staged = dir.join(format!("{}.partial", name));
        std::fs::write(&staged, &data)?;
        std::fs::rename(&staged, dir.join(name))?;

        if !written.contains(&name) {
            written.push(name);
        }
    }

    if written.is_empty() {
        return Err(InviteError::Archive(
            "archive contains no config bundle files".to_string(),
        ));
    }
    Ok(written)
}
