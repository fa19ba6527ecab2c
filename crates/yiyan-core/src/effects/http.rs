//! HTTP plumbing over ureq: media fetch, JSON GET, JSON POST.
//!
//! Feature-gated behind `http` to keep the default build minimal.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Upper bound for any body we buffer in memory.
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

const TIMEOUT: Duration = Duration::from_secs(20);

/// A response whose status was not treated as an error.
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// GET a media resource fully into memory.
pub fn fetch_bytes(url: &str) -> Result<Vec<u8>, String> {
    let mut response = ureq::get(url)
        .config()
        .timeout_global(Some(TIMEOUT))
        .build()
        .call()
        .map_err(|e| e.to_string())?;
    response
        .body_mut()
        .with_config()
        .limit(MAX_BODY_BYTES)
        .read_to_vec()
        .map_err(|e| e.to_string())
}

/// GET and deserialize JSON. Non-2xx is an error.
pub fn get_json<T: DeserializeOwned>(url: &str) -> Result<T, String> {
    let mut response = ureq::get(url)
        .config()
        .timeout_global(Some(TIMEOUT))
        .build()
        .call()
        .map_err(|e| e.to_string())?;
    response.body_mut().read_json::<T>().map_err(|e| e.to_string())
}

/// POST JSON and hand back status + body whatever the status was.
pub fn post_json<B: Serialize>(url: &str, body: &B) -> Result<RawResponse, String> {
    let mut response = ureq::post(url)
        .config()
        .timeout_global(Some(TIMEOUT))
        .http_status_as_error(false)
        .build()
        .send_json(body)
        .map_err(|e| e.to_string())?;
    let status = response.status().as_u16();
    let body = response
        .body_mut()
        .with_config()
        .limit(MAX_BODY_BYTES)
        .read_to_vec()
        .map_err(|e| e.to_string())?;
    Ok(RawResponse { status, body })
}

/// Extract file extension from a URL, stripping query parameters.
///
/// `"https://example.com/song.mp3?token=abc"` → `Some("mp3")`
pub fn extension_from_url(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    let path = path.split('#').next().unwrap_or(path);
    let segment = path.rsplit('/').next()?;
    let ext = segment.rsplit('.').next()?;
    if ext == segment {
        return None;
    }
    Some(ext.to_lowercase())
}
