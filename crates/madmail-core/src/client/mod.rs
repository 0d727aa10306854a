pub mod coordinator;
pub mod poller;
pub mod refresh;
pub mod rpc;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::ConfigMutationCoordinator;
pub use poller::{PollOutcome, PollPolicy, ReconnectPoller};
pub use rpc::{AdminTransport, ApiTarget, HttpTransport, RemoteAdminClient};
pub use types::{
    CoordinatorEvent, DashboardData, MutationAction, NoticeLevel, PortAccess, RefreshReport,
    Resource, Session, SettingMutation, ToggleVocabulary,
};
