use crate::api::{self, RpcRequest, RpcResponse};
use crate::error::AdminError;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Where and as whom a call is made. Cloned into every request so a call
/// always targets the endpoint that was live when it was issued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiTarget {
    pub endpoint: String,
    pub token: String,
}

impl ApiTarget {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    /// URL the envelope is POSTed to.
    pub fn request_url(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }
}

/// Moves one envelope to the server and back.
///
/// `Err` means nothing usable came back (the transport path, status 0). A
/// response carrying an `error` string is still `Ok` here.
#[async_trait::async_trait]
pub trait AdminTransport: Send + Sync + 'static {
    async fn send(&self, endpoint: &str, request: &RpcRequest) -> Result<RpcResponse, String>;
}

/// reqwest-based transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, AdminError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("madmail-admin/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AdminError::Transport {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl AdminTransport for HttpTransport {
    async fn send(&self, endpoint: &str, request: &RpcRequest) -> Result<RpcResponse, String> {
        let resp = self
            .client
            .post(endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        resp.json::<RpcResponse>().await.map_err(|e| e.to_string())
    }
}

/// Typed admin API on top of a transport. No retry policy of its own.
pub struct RemoteAdminClient<T: AdminTransport> {
    transport: Arc<T>,
}

impl<T: AdminTransport> Clone for RemoteAdminClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
        }
    }
}

impl<T: AdminTransport> RemoteAdminClient<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Issue one call and unwrap the envelope.
    pub async fn call(
        &self,
        target: &ApiTarget,
        request: RpcRequest,
    ) -> Result<serde_json::Value, AdminError> {
        let request = request.authorized(&target.token);
        log::debug!("{} {} -> {}", request.method, request.resource, target.request_url());

        let response = self
            .transport
            .send(target.request_url(), &request)
            .await
            .map_err(|message| AdminError::Transport { message })?;

        if let Some(message) = response.error {
            return Err(AdminError::Application {
                status: response.status,
                message,
            });
        }
        Ok(response.body)
    }

    async fn call_typed<R: DeserializeOwned>(
        &self,
        target: &ApiTarget,
        request: RpcRequest,
    ) -> Result<R, AdminError> {
        let resource = request.resource.clone();
        let body = self.call(target, request).await?;
        serde_json::from_value(body).map_err(|e| AdminError::Decode {
            resource,
            message: e.to_string(),
        })
    }

    /// For mutations the envelope's `error` is the only failure signal. A
    /// success body of an unexpected shape falls back to the default value.
    async fn call_lenient<R: DeserializeOwned + Default>(
        &self,
        target: &ApiTarget,
        request: RpcRequest,
    ) -> Result<R, AdminError> {
        let resource = request.resource.clone();
        let body = self.call(target, request).await?;
        Ok(serde_json::from_value(body).unwrap_or_else(|e| {
            log::warn!("Unexpected success body from {}: {}", resource, e);
            R::default()
        }))
    }

    pub async fn status(&self, target: &ApiTarget) -> Result<api::StatusResponse, AdminError> {
        self.call_typed(target, RpcRequest::get(api::STATUS)).await
    }

    pub async fn storage(&self, target: &ApiTarget) -> Result<api::StorageResponse, AdminError> {
        self.call_typed(target, RpcRequest::get(api::STORAGE)).await
    }

    pub async fn settings(&self, target: &ApiTarget) -> Result<api::AllSettings, AdminError> {
        self.call_typed(target, RpcRequest::get(api::SETTINGS)).await
    }

    pub async fn accounts(&self, target: &ApiTarget) -> Result<api::AccountList, AdminError> {
        self.call_typed(target, RpcRequest::get(api::ACCOUNTS)).await
    }

    pub async fn quota(&self, target: &ApiTarget) -> Result<api::QuotaStats, AdminError> {
        self.call_typed(target, RpcRequest::get(api::QUOTA)).await
    }

    pub async fn blocklist(&self, target: &ApiTarget) -> Result<api::BlocklistResponse, AdminError> {
        self.call_typed(target, RpcRequest::get(api::BLOCKLIST)).await
    }

    pub async fn dns(&self, target: &ApiTarget) -> Result<api::DnsListResponse, AdminError> {
        self.call_typed(target, RpcRequest::get(api::DNS)).await
    }

    pub async fn set_setting(
        &self,
        target: &ApiTarget,
        key: &str,
        value: &str,
    ) -> Result<api::SettingValue, AdminError> {
        let body = serde_json::json!({ "action": "set", "value": value });
        let setting: api::SettingValue = self
            .call_lenient(target, RpcRequest::post(api::setting_resource(key), body))
            .await?;
        Ok(setting.with_key(key))
    }

    pub async fn reset_setting(
        &self,
        target: &ApiTarget,
        key: &str,
    ) -> Result<api::SettingValue, AdminError> {
        let body = serde_json::json!({ "action": "reset" });
        let setting: api::SettingValue = self
            .call_lenient(target, RpcRequest::post(api::setting_resource(key), body))
            .await?;
        Ok(setting.with_key(key))
    }

    pub async fn get_toggle(
        &self,
        target: &ApiTarget,
        resource: &str,
    ) -> Result<api::ToggleStatus, AdminError> {
        self.call_typed(target, RpcRequest::get(resource)).await
    }

    pub async fn set_toggle(
        &self,
        target: &ApiTarget,
        resource: &str,
        action: &str,
    ) -> Result<api::ToggleStatus, AdminError> {
        let body = serde_json::json!({ "action": action });
        self.call_lenient(target, RpcRequest::post(resource, body)).await
    }

    pub async fn reload(&self, target: &ApiTarget) -> Result<api::ReloadResponse, AdminError> {
        self.call_lenient(target, RpcRequest::post(api::RELOAD, serde_json::json!({})))
            .await
    }

    pub async fn restart(&self, target: &ApiTarget) -> Result<(), AdminError> {
        self.call(target, RpcRequest::post(api::RESTART, serde_json::json!({})))
            .await
            .map(|_| ())
    }

    pub async fn create_account(
        &self,
        target: &ApiTarget,
    ) -> Result<api::CreateAccountResponse, AdminError> {
        self.call_lenient(target, RpcRequest::post(api::ACCOUNTS, serde_json::json!({})))
            .await
    }

    pub async fn delete_account(&self, target: &ApiTarget, username: &str) -> Result<(), AdminError> {
        let body = serde_json::json!({ "username": username });
        self.call(target, RpcRequest::new("DELETE", api::ACCOUNTS, body))
            .await
            .map(|_| ())
    }

    pub async fn set_default_quota(&self, target: &ApiTarget, max_bytes: u64) -> Result<(), AdminError> {
        let body = serde_json::json!({ "max_bytes": max_bytes });
        self.call(target, RpcRequest::new("PUT", api::QUOTA, body))
            .await
            .map(|_| ())
    }

    pub async fn set_user_quota(
        &self,
        target: &ApiTarget,
        username: &str,
        max_bytes: u64,
    ) -> Result<(), AdminError> {
        let body = serde_json::json!({ "username": username, "max_bytes": max_bytes });
        self.call(target, RpcRequest::new("PUT", api::QUOTA, body))
            .await
            .map(|_| ())
    }

    pub async fn reset_user_quota(&self, target: &ApiTarget, username: &str) -> Result<(), AdminError> {
        let body = serde_json::json!({ "username": username });
        self.call(target, RpcRequest::new("DELETE", api::QUOTA, body))
            .await
            .map(|_| ())
    }

    pub async fn block_user(
        &self,
        target: &ApiTarget,
        username: &str,
        reason: Option<&str>,
    ) -> Result<(), AdminError> {
        let reason = reason.filter(|r| !r.is_empty()).unwrap_or("manually blocked");
        let body = serde_json::json!({ "username": username, "reason": reason });
        self.call(target, RpcRequest::post(api::BLOCKLIST, body))
            .await
            .map(|_| ())
    }

    pub async fn unblock_user(&self, target: &ApiTarget, username: &str) -> Result<(), AdminError> {
        let body = serde_json::json!({ "username": username });
        self.call(target, RpcRequest::new("DELETE", api::BLOCKLIST, body))
            .await
            .map(|_| ())
    }

    pub async fn add_dns(
        &self,
        target: &ApiTarget,
        lookup_key: &str,
        target_host: &str,
        comment: Option<&str>,
    ) -> Result<(), AdminError> {
        let body = serde_json::json!({
            "lookup_key": lookup_key,
            "target_host": target_host,
            "comment": comment.unwrap_or(""),
        });
        self.call(target, RpcRequest::post(api::DNS, body))
            .await
            .map(|_| ())
    }

    pub async fn delete_dns(&self, target: &ApiTarget, lookup_key: &str) -> Result<(), AdminError> {
        let body = serde_json::json!({ "lookup_key": lookup_key });
        self.call(target, RpcRequest::new("DELETE", api::DNS, body))
            .await
            .map(|_| ())
    }

    pub async fn purge_queue(&self, target: &ApiTarget, action: &str) -> Result<(), AdminError> {
        let body = serde_json::json!({ "action": action });
        self.call(target, RpcRequest::post(api::QUEUE, body))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::ScriptedTransport;

    fn target() -> ApiTarget {
        ApiTarget::new("https://h/api/admin/", "tok")
    }

    #[tokio::test]
    async fn call_posts_envelope_to_trimmed_endpoint() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(api::STATUS, Ok(RpcResponse::ok(api::STATUS, serde_json::json!({}))));
        let client = RemoteAdminClient::new(transport.clone());

        client.status(&target()).await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].endpoint, "https://h/api/admin");
        assert_eq!(calls[0].request.method, "GET");
        assert_eq!(
            calls[0].request.headers.get("Authorization").map(String::as_str),
            Some("Bearer tok")
        );
    }

    #[tokio::test]
    async fn error_field_becomes_application_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            &api::setting_resource("smtp_port"),
            Ok(RpcResponse::failed("/admin/settings/smtp_port", 400, "bad port")),
        );
        let client = RemoteAdminClient::new(transport);

        let err = client.set_setting(&target(), "smtp_port", "x").await.unwrap_err();
        assert_eq!(
            err,
            AdminError::Application {
                status: 400,
                message: "bad port".to_string()
            }
        );
    }

    #[tokio::test]
    async fn missing_response_is_a_transport_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(api::RELOAD, Err("connection refused".to_string()));
        let client = RemoteAdminClient::new(transport);

        let err = client.reload(&target()).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(err.status(), 0);
    }

    #[tokio::test]
    async fn undecodable_body_is_reported() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            api::QUOTA,
            Ok(RpcResponse::ok(api::QUOTA, serde_json::json!("nope"))),
        );
        let client = RemoteAdminClient::new(transport);

        assert!(matches!(
            client.quota(&target()).await,
            Err(AdminError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn mutation_with_null_body_still_succeeds() {
        let transport = Arc::new(ScriptedTransport::new());
        let resource = api::setting_resource("smtp_port");
        transport.respond(&resource, Ok(RpcResponse::ok(&resource, serde_json::Value::Null)));
        transport.respond(api::RELOAD, Ok(RpcResponse::ok(api::RELOAD, serde_json::Value::Null)));
        let client = RemoteAdminClient::new(transport);

        let setting = client.set_setting(&target(), "smtp_port", "2525").await.unwrap();
        assert_eq!(setting.key, "smtp_port");
        assert!(!setting.requires_restart());
        assert_eq!(client.reload(&target()).await.unwrap(), api::ReloadResponse::default());
    }

    #[tokio::test]
    async fn block_user_defaults_reason() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = RemoteAdminClient::new(transport.clone());

        client.block_user(&target(), "bob", None).await.unwrap();
        assert_eq!(transport.calls()[0].request.body["reason"], "manually blocked");
    }
}
