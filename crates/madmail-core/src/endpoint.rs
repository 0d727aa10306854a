//! Admin endpoint arithmetic.
//!
//! Endpoints are kept as strings without trailing slashes; `url` is only used
//! to take them apart.

use crate::api::DEFAULT_ADMIN_PATH;
use crate::error::AdminError;
use url::Url;

fn parse(endpoint: &str) -> Result<Url, AdminError> {
    Url::parse(endpoint).map_err(|e| AdminError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

fn strip_trailing_slashes(s: &str) -> String {
    s.trim_end_matches('/').to_string()
}

/// Validate an endpoint and strip trailing slashes.
pub fn normalize(endpoint: &str) -> Result<String, AdminError> {
    let url = parse(endpoint.trim())?;
    if url.cannot_be_a_base() {
        return Err(AdminError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            message: "endpoint must be a hierarchical URL".to_string(),
        });
    }
    Ok(strip_trailing_slashes(url.as_str()))
}

/// Replace the path component of `endpoint` with `path`.
///
/// The result has no trailing slashes, so `https://h/api/admin` relocated to
/// `/secret/` becomes `https://h/secret`.
pub fn relocate(endpoint: &str, path: &str) -> Result<String, AdminError> {
    let mut url = parse(endpoint)?;
    if url.cannot_be_a_base() {
        return Err(AdminError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            message: "endpoint must be a hierarchical URL".to_string(),
        });
    }
    url.set_path(path);
    Ok(strip_trailing_slashes(url.as_str()))
}

/// Where the endpoint lands when the admin path is reset.
pub fn relocate_to_default(endpoint: &str) -> Result<String, AdminError> {
    relocate(endpoint, DEFAULT_ADMIN_PATH)
}

/// Older saved URLs only carried the origin. Give them the default admin
/// path; anything unparsable is returned untouched.
pub fn migrate_saved(endpoint: &str) -> String {
    match Url::parse(endpoint) {
        Ok(url) if url.path().trim_end_matches('/').is_empty() => {
            format!("{}{}", endpoint.trim_end_matches('/'), DEFAULT_ADMIN_PATH)
        }
        _ => endpoint.to_string(),
    }
}

/// Host part of an endpoint, used as the default label of a saved server.
pub fn host_label(endpoint: &str) -> String {
    Url::parse(endpoint)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| endpoint.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relocate_replaces_path_and_strips_slashes() {
        assert_eq!(
            relocate("https://h/api/admin", "/secret/").unwrap(),
            "https://h/secret"
        );
        assert_eq!(
            relocate("https://h:8443/api/admin", "panel").unwrap(),
            "https://h:8443/panel"
        );
    }

    #[test]
    fn reset_relocates_to_default_path() {
        assert_eq!(
            relocate_to_default("https://h/secret").unwrap(),
            "https://h/api/admin"
        );
        assert_eq!(
            relocate_to_default("https://h/api/admin").unwrap(),
            "https://h/api/admin"
        );
    }

    #[test]
    fn relocate_rejects_garbage() {
        assert!(matches!(
            relocate("not a url", "/x"),
            Err(AdminError::InvalidEndpoint { .. })
        ));
        assert!(relocate("mailto:admin@h", "/x").is_err());
    }

    #[test]
    fn normalize_trims_trailing_slashes() {
        assert_eq!(normalize("https://h/api/admin/").unwrap(), "https://h/api/admin");
        assert_eq!(normalize(" https://h/api/admin ").unwrap(), "https://h/api/admin");
        assert!(normalize("").is_err());
    }

    #[test]
    fn migrate_adds_default_path_to_bare_origins() {
        assert_eq!(migrate_saved("https://h"), "https://h/api/admin");
        assert_eq!(migrate_saved("https://h/"), "https://h/api/admin");
        assert_eq!(migrate_saved("https://h/custom"), "https://h/custom");
        assert_eq!(migrate_saved("garbage"), "garbage");
    }

    #[test]
    fn host_label_falls_back_to_input() {
        assert_eq!(host_label("https://mail.example.org/api/admin"), "mail.example.org");
        assert_eq!(host_label("garbage"), "garbage");
    }
}
