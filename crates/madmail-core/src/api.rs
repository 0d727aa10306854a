use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── RPC envelope ────────────────────────────────────────────────────────────

/// Request envelope. Every call is a POST of this object to the single admin
/// endpoint; the logical method and resource travel inside it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub resource: String,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

impl RpcRequest {
    pub fn new(method: &str, resource: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: method.to_string(),
            resource: resource.into(),
            headers: HashMap::new(),
            body,
        }
    }

    pub fn get(resource: impl Into<String>) -> Self {
        Self::new("GET", resource, serde_json::json!({}))
    }

    pub fn post(resource: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new("POST", resource, body)
    }

    /// Attach the bearer token header.
    pub fn authorized(mut self, token: &str) -> Self {
        self.headers
            .insert("Authorization".to_string(), format!("Bearer {}", token));
        self
    }

    /// Body `action` field, if any (used by mutation endpoints).
    pub fn action(&self) -> Option<&str> {
        self.body.get("action").and_then(|v| v.as_str())
    }
}

/// Response envelope. `error != null` is the only failure signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: u16,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(resource: &str, body: serde_json::Value) -> Self {
        Self {
            status: 200,
            resource: resource.to_string(),
            body,
            error: None,
        }
    }

    pub fn failed(resource: &str, status: u16, error: &str) -> Self {
        Self {
            status,
            resource: resource.to_string(),
            body: serde_json::Value::Null,
            error: Some(error.to_string()),
        }
    }
}

// ── Resources ───────────────────────────────────────────────────────────────

pub const STATUS: &str = "/admin/status";
pub const STORAGE: &str = "/admin/storage";
pub const ACCOUNTS: &str = "/admin/accounts";
pub const QUOTA: &str = "/admin/quota";
pub const SETTINGS: &str = "/admin/settings";
pub const BLOCKLIST: &str = "/admin/blocklist";
pub const DNS: &str = "/admin/dns";
pub const QUEUE: &str = "/admin/queue";
pub const RELOAD: &str = "/admin/reload";
pub const RESTART: &str = "/admin/restart";
pub const REGISTRATION: &str = "/admin/registration";

/// Setting key that relocates the admin endpoint itself.
pub const ADMIN_PATH_KEY: &str = "admin_path";
/// Path the admin endpoint lives at when `admin_path` is unset.
pub const DEFAULT_ADMIN_PATH: &str = "/api/admin";

pub fn setting_resource(key: &str) -> String {
    format!("{}/{}", SETTINGS, key)
}

/// Derived setting key controlling whether a port only listens locally.
pub fn port_local_only_key(port_key: &str) -> String {
    format!("{}_local_only", port_key)
}

// ── Response bodies ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    #[serde(default)]
    pub connections: u64,
    #[serde(default)]
    pub unique_ips: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayStats {
    #[serde(default)]
    pub relays: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    #[serde(default)]
    pub registered: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Uptime {
    #[serde(default)]
    pub boot_time: String,
    #[serde(default)]
    pub duration: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailServerStats {
    #[serde(default)]
    pub connection_ips: u64,
    #[serde(default)]
    pub domain_servers: u64,
    #[serde(default)]
    pub ip_servers: u64,
}

/// `/admin/status`, also used as the liveness probe.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub imap: Option<ConnectionStats>,
    #[serde(default)]
    pub turn: Option<RelayStats>,
    #[serde(default)]
    pub shadowsocks: Option<ConnectionStats>,
    #[serde(default)]
    pub users: UserStats,
    #[serde(default)]
    pub uptime: Uptime,
    #[serde(default)]
    pub email_servers: Option<EmailServerStats>,
    #[serde(default)]
    pub sent_messages: u64,
    #[serde(default)]
    pub outbound_messages: u64,
    #[serde(default)]
    pub received_messages: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub percent_used: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateDirUsage {
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseUsage {
    pub driver: String,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageResponse {
    pub disk: DiskUsage,
    pub state_dir: StateDirUsage,
    pub database: Option<DatabaseUsage>,
}

/// Toggle endpoints answer with the state after the action.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToggleStatus {
    pub status: String,
}

/// Result of reading or mutating one setting.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingValue {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub is_set: bool,
    #[serde(default)]
    pub restart_required: Option<bool>,
}

impl SettingValue {
    pub fn unset(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Default::default()
        }
    }

    /// Fill in `key` when the server left it out.
    pub fn with_key(mut self, key: &str) -> Self {
        if self.key.is_empty() {
            self.key = key.to_string();
        }
        self
    }

    pub fn requires_restart(&self) -> bool {
        self.restart_required.unwrap_or(false)
    }
}

/// `/admin/settings`: a flat object mixing plain strings (toggle states,
/// per-port access) and `SettingValue` objects (ports, configuration).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllSettings(pub serde_json::Map<String, serde_json::Value>);

impl AllSettings {
    /// The structured value for `key`, or an unset placeholder.
    pub fn setting(&self, key: &str) -> SettingValue {
        self.0
            .get(key)
            .filter(|v| v.is_object())
            .and_then(|v| serde_json::from_value::<SettingValue>(v.clone()).ok())
            .map(|mut s| {
                if s.key.is_empty() {
                    s.key = key.to_string();
                }
                s
            })
            .unwrap_or_else(|| SettingValue::unset(key))
    }

    /// Plain string entries such as `registration` or `smtp_access`.
    pub fn flag(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Access scope of a port: `"public"` or `"local"`.
    pub fn port_access(&self, port_key: &str) -> Option<&str> {
        self.flag(&format!("{}_access", port_key))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    #[serde(default)]
    pub used_bytes: u64,
    #[serde(default)]
    pub max_bytes: u64,
    #[serde(default)]
    pub is_default_quota: bool,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub first_login_at: i64,
    #[serde(default)]
    pub last_login_at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountList {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateAccountResponse {
    pub email: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaStats {
    pub total_storage_bytes: u64,
    pub accounts_count: u64,
    pub default_quota_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlocklistEntry {
    pub username: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub blocked_at: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlocklistResponse {
    #[serde(default)]
    pub blocked: Vec<BlocklistEntry>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsEntry {
    pub lookup_key: String,
    pub target_host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsListResponse {
    #[serde(default)]
    pub overrides: Vec<DnsEntry>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReloadResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_shape() {
        let req = RpcRequest::post(
            setting_resource("smtp_port"),
            serde_json::json!({ "action": "set", "value": "2525" }),
        )
        .authorized("secret");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(json["resource"], "/admin/settings/smtp_port");
        assert_eq!(json["headers"]["Authorization"], "Bearer secret");
        assert_eq!(json["body"]["value"], "2525");
        assert_eq!(req.action(), Some("set"));
    }

    #[test]
    fn response_envelope_tolerates_missing_fields() {
        let resp: RpcResponse =
            serde_json::from_str(r#"{"status":401,"error":"unauthorized"}"#).unwrap();
        assert_eq!(resp.status, 401);
        assert_eq!(resp.error.as_deref(), Some("unauthorized"));
        assert!(resp.body.is_null());
    }

    #[test]
    fn all_settings_mixes_flags_and_values() {
        let settings: AllSettings = serde_json::from_value(serde_json::json!({
            "registration": "open",
            "smtp_access": "local",
            "smtp_port": { "key": "smtp_port", "value": "25", "is_set": false },
            "admin_path": { "value": "/secret", "is_set": true },
        }))
        .unwrap();

        assert_eq!(settings.flag("registration"), Some("open"));
        assert_eq!(settings.port_access("smtp"), Some("local"));
        assert_eq!(settings.setting("smtp_port").value, "25");

        let admin = settings.setting(ADMIN_PATH_KEY);
        assert_eq!(admin.key, "admin_path");
        assert!(admin.is_set);

        // Strings and missing keys both come back as unset placeholders
        assert_eq!(settings.setting("registration"), SettingValue::unset("registration"));
        assert_eq!(settings.setting("nope"), SettingValue::unset("nope"));
    }

    #[test]
    fn port_local_only_key_is_derived() {
        assert_eq!(port_local_only_key("imap"), "imap_local_only");
    }
}
