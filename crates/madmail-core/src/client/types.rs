use crate::api::{
    AccountList, AllSettings, BlocklistResponse, DnsListResponse, QuotaStats, StatusResponse,
    StorageResponse,
};
use crate::error::AdminError;

/// Connection state owned by the coordinator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    pub endpoint: String,
    pub token: String,
    pub connected: bool,
    /// Set by any applied mutation that needs a restart; cleared by a
    /// successful reload/restart or an admin path relocation.
    pub pending_restart: bool,
    /// Single-flight guard for mutating operations.
    pub busy: bool,
    pub connecting: bool,
    pub refreshing: bool,
    pub connect_error: Option<String>,
    /// A reconnect poll gave up; the server may still be coming back.
    pub restart_stalled: bool,
    /// Bumped by every connect/disconnect. In-flight work started under an
    /// older epoch must not touch the session.
    pub epoch: u64,
}

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum MutationAction {
    Set,
    Reset,
}

/// One setting change as sent to `/admin/settings/{key}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingMutation {
    pub key: String,
    pub action: MutationAction,
    pub value: Option<String>,
}

impl SettingMutation {
    pub fn set(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            action: MutationAction::Set,
            value: Some(value.to_string()),
        }
    }

    pub fn reset(key: &str) -> Self {
        Self {
            key: key.to_string(),
            action: MutationAction::Reset,
            value: None,
        }
    }
}

/// Display resources fetched by a data refresh.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Storage,
    Settings,
    Accounts,
    Quota,
    Status,
    Blocklist,
    Dns,
}

impl Resource {
    pub const ALL: [Resource; 7] = [
        Resource::Storage,
        Resource::Settings,
        Resource::Accounts,
        Resource::Quota,
        Resource::Status,
        Resource::Blocklist,
        Resource::Dns,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Resource::Storage => "storage",
            Resource::Settings => "settings",
            Resource::Accounts => "accounts",
            Resource::Quota => "quota",
            Resource::Status => "status",
            Resource::Blocklist => "blocklist",
            Resource::Dns => "dns",
        }
    }
}

/// Local copies of the display resources. A resource stays `None` until the
/// first successful fetch and keeps its last good value when a later fetch
/// fails.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DashboardData {
    pub status: Option<StatusResponse>,
    pub storage: Option<StorageResponse>,
    pub settings: Option<AllSettings>,
    pub accounts: Option<AccountList>,
    pub quota: Option<QuotaStats>,
    pub blocklist: Option<BlocklistResponse>,
    pub dns: Option<DnsListResponse>,
}

/// What one refresh managed to update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RefreshReport {
    pub updated: Vec<Resource>,
    pub failed: Vec<(Resource, AdminError)>,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Published by the coordinator; consumed by whatever renders the session.
#[derive(Clone, Debug, PartialEq)]
pub enum CoordinatorEvent {
    Notice {
        level: NoticeLevel,
        message: String,
    },
    /// Session established. Persist the credentials, remember the server.
    Connected { endpoint: String, token: String },
    Disconnected,
    /// The admin endpoint moved; persist the new location.
    EndpointChanged { endpoint: String },
    PendingRestart(bool),
    Refreshed {
        updated: Vec<Resource>,
        failed: Vec<Resource>,
    },
    ReconnectStarted { endpoint: String },
    Online { endpoint: String, attempts: u32 },
    StillRestarting { endpoint: String, attempts: u32 },
}

/// Action words used by a toggle resource.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum ToggleVocabulary {
    OpenClose,
    EnableDisable,
}

impl ToggleVocabulary {
    /// Registration opens and closes; every sub-service enables and disables.
    pub fn for_resource(resource: &str) -> Self {
        if resource == crate::api::REGISTRATION {
            ToggleVocabulary::OpenClose
        } else {
            ToggleVocabulary::EnableDisable
        }
    }

    /// Action that flips a resource whose current state is `current`.
    pub fn flip(&self, current: &str) -> &'static str {
        let is_on = current == "enabled" || current == "open";
        match (self, is_on) {
            (ToggleVocabulary::OpenClose, true) => "close",
            (ToggleVocabulary::OpenClose, false) => "open",
            (ToggleVocabulary::EnableDisable, true) => "disable",
            (ToggleVocabulary::EnableDisable, false) => "enable",
        }
    }
}

/// Listening scope of a port.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum PortAccess {
    Public,
    LocalOnly,
}

impl PortAccess {
    /// Parse the `{port}_access` value reported by the server.
    pub fn from_reported(value: &str) -> Self {
        if value == "public" {
            PortAccess::Public
        } else {
            PortAccess::LocalOnly
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            PortAccess::Public => PortAccess::LocalOnly,
            PortAccess::LocalOnly => PortAccess::Public,
        }
    }
}
