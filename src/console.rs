//! Interactive line console over one coordinator session.

use crate::config::{self, ConsoleSettings};
use crate::updates::ConsoleUpdates;
use anyhow::Result;
use madmail_core::api;
use madmail_core::client::{
    ConfigMutationCoordinator, CoordinatorEvent, HttpTransport, NoticeLevel, Resource,
};
use madmail_core::error::CoordinatorError;
use madmail_core::profiles::ProfileBook;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

const HELP: &str = "\
commands:
  connect URL TOKEN         open a session
  status                    server overview
  refresh                   refetch everything
  set KEY VALUE             change a setting
  reset KEY                 reset a setting to its default
  toggle NAME               flip registration or a service (turn, iroh, shadowsocks, ...)
  port PORT                 flip a port between public and local only
  reload | restart          apply pending changes
  servers                   list saved servers
  use ID | label ID TEXT | forget ID
  accounts | create-account | delete-account USER
  quota [USER] BYTES | reset-quota USER
  block USER [REASON] | unblock USER
  dns-add KEY HOST [COMMENT] | dns-del KEY
  purge ACTION              purge the outbound queue
  check | update            look for / apply a new console build
  disconnect | quit";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Help,
    Connect { url: String, token: String },
    Status,
    Refresh,
    Set { key: String, value: String },
    Reset { key: String },
    Toggle { name: String },
    Port { port: String },
    Reload,
    Restart,
    Servers,
    Use { id: String },
    Label { id: String, label: String },
    Forget { id: String },
    Accounts,
    CreateAccount,
    DeleteAccount { username: String },
    Quota { username: Option<String>, max_bytes: u64 },
    ResetQuota { username: String },
    Block { username: String, reason: Option<String> },
    Unblock { username: String },
    DnsAdd { key: String, host: String, comment: Option<String> },
    DnsDel { key: String },
    Purge { action: String },
    Check,
    Update,
    Disconnect,
    Quit,
}

fn rest(words: &[&str]) -> Option<String> {
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

fn parse_bytes(s: &str) -> Result<u64, String> {
    s.parse::<u64>().map_err(|_| format!("not a byte count: {}", s))
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&verb, args)) = words.split_first() else {
        return Ok(None);
    };
    let usage = || format!("usage error for '{}', try 'help'", verb);

    let cmd = match (verb, args) {
        ("help" | "?", _) => Command::Help,
        ("connect", [url, token]) => Command::Connect {
            url: url.to_string(),
            token: token.to_string(),
        },
        ("status", []) => Command::Status,
        ("refresh", []) => Command::Refresh,
        ("set", [key, value @ ..]) if !value.is_empty() => Command::Set {
            key: key.to_string(),
            value: value.join(" "),
        },
        ("reset", [key]) => Command::Reset { key: key.to_string() },
        ("toggle", [name]) => Command::Toggle { name: name.to_string() },
        ("port", [port]) => Command::Port { port: port.to_string() },
        ("reload", []) => Command::Reload,
        ("restart", []) => Command::Restart,
        ("servers", []) => Command::Servers,
        ("use", [id]) => Command::Use { id: id.to_string() },
        ("label", [id, label @ ..]) if !label.is_empty() => Command::Label {
            id: id.to_string(),
            label: label.join(" "),
        },
        ("forget", [id]) => Command::Forget { id: id.to_string() },
        ("accounts", []) => Command::Accounts,
        ("create-account", []) => Command::CreateAccount,
        ("delete-account", [user]) => Command::DeleteAccount {
            username: user.to_string(),
        },
        ("quota", [bytes]) => Command::Quota {
            username: None,
            max_bytes: parse_bytes(bytes)?,
        },
        ("quota", [user, bytes]) => Command::Quota {
            username: Some(user.to_string()),
            max_bytes: parse_bytes(bytes)?,
        },
        ("reset-quota", [user]) => Command::ResetQuota {
            username: user.to_string(),
        },
        ("block", [user, reason @ ..]) => Command::Block {
            username: user.to_string(),
            reason: rest(reason),
        },
        ("unblock", [user]) => Command::Unblock {
            username: user.to_string(),
        },
        ("dns-add", [key, host, comment @ ..]) => Command::DnsAdd {
            key: key.to_string(),
            host: host.to_string(),
            comment: rest(comment),
        },
        ("dns-del", [key]) => Command::DnsDel { key: key.to_string() },
        ("purge", [action]) => Command::Purge {
            action: action.to_string(),
        },
        ("check", []) => Command::Check,
        ("update", []) => Command::Update,
        ("disconnect", []) => Command::Disconnect,
        ("quit" | "exit", []) => Command::Quit,
        (
            "connect" | "status" | "refresh" | "set" | "reset" | "toggle" | "port" | "reload"
            | "restart" | "servers" | "use" | "label" | "forget" | "accounts" | "create-account"
            | "delete-account" | "quota" | "reset-quota" | "block" | "unblock" | "dns-add"
            | "dns-del" | "purge" | "check" | "update" | "disconnect" | "quit" | "exit",
            _,
        ) => return Err(usage()),
        _ => return Err(format!("unknown command '{}', try 'help'", verb)),
    };
    Ok(Some(cmd))
}

/// Full resource path of a toggle given its short name.
pub fn toggle_resource(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else if name == "registration" {
        api::REGISTRATION.to_string()
    } else {
        format!("/admin/services/{}", name)
    }
}

/// Keep the persisted session and the saved servers in step with the
/// coordinator. Returns whether `settings` changed.
pub fn persist_event(event: &CoordinatorEvent, settings: &mut ConsoleSettings, profiles: &ProfileBook) -> bool {
    match event {
        CoordinatorEvent::Connected { endpoint, token } => {
            if let Err(e) = profiles.save(endpoint, token, None) {
                log::warn!("Failed to save server profile: {}", e);
            }
            settings.remember(endpoint, token);
            true
        }
        CoordinatorEvent::EndpointChanged { endpoint } => {
            settings.last_url = Some(endpoint.clone());
            true
        }
        CoordinatorEvent::Disconnected => {
            settings.forget();
            true
        }
        _ => false,
    }
}

fn describe_event(event: &CoordinatorEvent) -> Option<String> {
    match event {
        CoordinatorEvent::Notice {
            level: NoticeLevel::Info,
            message,
        } => Some(format!("  {}", message)),
        CoordinatorEvent::Notice {
            level: NoticeLevel::Error,
            message,
        } => Some(format!("! {}", message)),
        CoordinatorEvent::Connected { endpoint, .. } => Some(format!("Connected to {}", endpoint)),
        CoordinatorEvent::Disconnected => Some("Disconnected".to_string()),
        CoordinatorEvent::EndpointChanged { endpoint } => {
            Some(format!("Admin endpoint is now {}", endpoint))
        }
        CoordinatorEvent::PendingRestart(true) => {
            Some("Restart pending, run 'reload' to apply".to_string())
        }
        CoordinatorEvent::Refreshed { failed, .. } if !failed.is_empty() => Some(format!(
            "! Could not refresh {}",
            failed.iter().map(Resource::name).collect::<Vec<_>>().join(", ")
        )),
        CoordinatorEvent::ReconnectStarted { endpoint } => Some(format!("Waiting for {}", endpoint)),
        _ => None,
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub struct Console {
    coordinator: ConfigMutationCoordinator<HttpTransport>,
    profiles: ProfileBook,
    settings: Arc<Mutex<ConsoleSettings>>,
    settings_path: PathBuf,
    updates: Option<ConsoleUpdates>,
}

impl Console {
    pub fn new(
        coordinator: ConfigMutationCoordinator<HttpTransport>,
        profiles: ProfileBook,
        settings: ConsoleSettings,
        settings_path: PathBuf,
        updates: Option<ConsoleUpdates>,
    ) -> Self {
        Self {
            coordinator,
            profiles,
            settings: Arc::new(Mutex::new(settings)),
            settings_path,
            updates,
        }
    }

    fn spawn_event_printer(
        &self,
        events: async_channel::Receiver<CoordinatorEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let settings = self.settings.clone();
        let path = self.settings_path.clone();
        let profiles = self.profiles.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let snapshot = {
                    let mut settings = settings.lock();
                    persist_event(&event, &mut settings, &profiles).then(|| settings.clone())
                };
                if let Some(snapshot) = snapshot {
                    if let Err(e) = config::save_settings_to(&path, &snapshot) {
                        log::warn!("Failed to save settings: {:#}", e);
                    }
                }
                if let Some(line) = describe_event(&event) {
                    println!("{}", line);
                }
            }
        })
    }

    pub async fn run(
        self,
        events: async_channel::Receiver<CoordinatorEvent>,
        notices: async_channel::Receiver<String>,
        initial: Option<(String, String)>,
    ) -> Result<()> {
        let printer = self.spawn_event_printer(events);

        match initial {
            Some((url, token)) => self.report(self.coordinator.connect(&url, &token).await),
            None => println!("Not connected. Use 'connect URL TOKEN' or 'servers'."),
        }

        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match parse_command(&line) {
                        Ok(Some(Command::Quit)) => break,
                        Ok(Some(cmd)) => self.dispatch(cmd).await,
                        Ok(None) => {}
                        Err(message) => println!("! {}", message),
                    }
                }
                Ok(notice) = notices.recv() => println!("* {}", notice),
            }
        }

        // Reconnect polls may outlive the loop and keep the channel open
        printer.abort();
        Ok(())
    }

    /// Admin failures already arrived as notices; print everything else.
    fn report<T>(&self, result: Result<T, CoordinatorError>) {
        match result {
            Ok(_) | Err(CoordinatorError::Admin(_)) => {}
            Err(e) => println!("! {}", e),
        }
    }

    async fn dispatch(&self, cmd: Command) {
        let c = &self.coordinator;
        match cmd {
            Command::Help => println!("{}", HELP),
            Command::Connect { url, token } => self.report(c.connect(&url, &token).await),
            Command::Status => self.print_status(),
            Command::Refresh => {
                if c.refresh().await.is_none() {
                    println!("! Nothing refreshed (not connected or already refreshing)");
                }
            }
            Command::Set { key, value } => self.report(c.set(&key, &value).await),
            Command::Reset { key } => self.report(c.reset(&key).await),
            Command::Toggle { name } => {
                let resource = toggle_resource(&name);
                match c.toggle_status(&resource).await {
                    Ok(current) => self.report(c.toggle(&resource, &current.status).await),
                    Err(e) => println!("! {}", e),
                }
            }
            Command::Port { port } => {
                let current = c
                    .data()
                    .settings
                    .as_ref()
                    .and_then(|s| s.port_access(&port).map(str::to_string))
                    .unwrap_or_else(|| "public".to_string());
                self.report(c.toggle_port_access(&port, &current).await);
            }
            Command::Reload => self.report(c.reload().await),
            Command::Restart => self.report(c.restart().await),
            Command::Servers => self.print_servers(),
            Command::Use { id } => match self.profiles.get(&id) {
                Ok(Some(profile)) => self.report(c.connect(&profile.url, &profile.token).await),
                Ok(None) => println!("! No saved server {}", id),
                Err(e) => println!("! {}", e),
            },
            Command::Label { id, label } => match self.profiles.update_label(&id, &label) {
                Ok(true) => println!("  Renamed {}", id),
                Ok(false) => println!("! No saved server {}", id),
                Err(e) => println!("! {}", e),
            },
            Command::Forget { id } => {
                if let Err(e) = self.profiles.remove(&id) {
                    println!("! {}", e);
                }
            }
            Command::Accounts => self.print_accounts(),
            Command::CreateAccount => match c.create_account().await {
                Ok(account) => println!("  {}  password: {}", account.email, account.password),
                Err(e) => self.report::<()>(Err(e)),
            },
            Command::DeleteAccount { username } => self.report(c.delete_account(&username).await),
            Command::Quota {
                username: Some(username),
                max_bytes,
            } => self.report(c.set_user_quota(&username, max_bytes).await),
            Command::Quota {
                username: None,
                max_bytes,
            } => self.report(c.set_default_quota(max_bytes).await),
            Command::ResetQuota { username } => self.report(c.reset_user_quota(&username).await),
            Command::Block { username, reason } => {
                self.report(c.block_user(&username, reason.as_deref()).await)
            }
            Command::Unblock { username } => self.report(c.unblock_user(&username).await),
            Command::DnsAdd { key, host, comment } => {
                self.report(c.add_dns_override(&key, &host, comment.as_deref()).await)
            }
            Command::DnsDel { key } => self.report(c.delete_dns_override(&key).await),
            Command::Purge { action } => self.report(c.purge_queue(&action).await),
            Command::Check => match &self.updates {
                Some(updates) => updates.foreground(),
                None => println!("! No asset origin configured"),
            },
            Command::Update => match &self.updates {
                Some(updates) => match updates.apply().await {
                    Ok(state) => println!("  Console assets reloaded ({:?})", state),
                    Err(e) => println!("! {:#}", e),
                },
                None => println!("! No asset origin configured"),
            },
            Command::Disconnect => c.disconnect(),
            Command::Quit => {}
        }
    }

    fn print_status(&self) {
        let session = self.coordinator.session();
        if !session.connected {
            println!("Not connected");
            return;
        }
        let data = self.coordinator.data();
        println!("Endpoint:  {}", session.endpoint);
        if let Some(status) = &data.status {
            println!("Uptime:    {}", status.uptime.duration);
            println!("Users:     {}", status.users.registered);
            println!(
                "Messages:  {} sent, {} received, {} outbound",
                status.sent_messages, status.received_messages, status.outbound_messages
            );
        }
        if let Some(storage) = &data.storage {
            println!(
                "Disk:      {} of {} used ({:.1}%)",
                format_bytes(storage.disk.used_bytes),
                format_bytes(storage.disk.total_bytes),
                storage.disk.percent_used
            );
        }
        if let Some(settings) = &data.settings {
            if let Some(registration) = settings.flag("registration") {
                println!("Registration: {}", registration);
            }
        }
        if session.pending_restart {
            println!("Restart pending");
        }
        if session.restart_stalled {
            println!("Server may still be restarting");
        }
    }

    fn print_servers(&self) {
        let current = self.coordinator.session().endpoint;
        match self.profiles.list() {
            Ok(servers) if servers.is_empty() => println!("No saved servers"),
            Ok(servers) => {
                for s in servers {
                    let marker = if s.url == current { '*' } else { ' ' };
                    println!("{} {}  {:<20} {}", marker, s.id, s.label, s.url);
                }
            }
            Err(e) => println!("! {}", e),
        }
    }

    fn print_accounts(&self) {
        let Some(list) = self.coordinator.data().accounts else {
            println!("No account data");
            return;
        };
        for account in &list.accounts {
            let quota = if account.is_default_quota {
                "default".to_string()
            } else {
                format_bytes(account.max_bytes)
            };
            println!(
                "{:<40} {:>10} / {}",
                account.username,
                format_bytes(account.used_bytes),
                quota
            );
        }
        println!("{} account(s)", list.total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use madmail_core::profiles::SavedServerProfile;
    use madmail_core::store::MemoryCollection;

    #[test]
    fn parses_commands_with_free_text() {
        assert_eq!(
            parse_command("set smtp_hostname mail example org").unwrap(),
            Some(Command::Set {
                key: "smtp_hostname".to_string(),
                value: "mail example org".to_string()
            })
        );
        assert_eq!(
            parse_command("block bob@x spam wave").unwrap(),
            Some(Command::Block {
                username: "bob@x".to_string(),
                reason: Some("spam wave".to_string())
            })
        );
        assert_eq!(
            parse_command("quota 1048576").unwrap(),
            Some(Command::Quota {
                username: None,
                max_bytes: 1048576
            })
        );
        assert_eq!(parse_command("   ").unwrap(), None);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_command("set onlykey").is_err());
        assert!(parse_command("quota bob lots").is_err());
        assert!(parse_command("frobnicate").unwrap_err().contains("unknown command"));
    }

    #[test]
    fn toggle_names_map_to_resources() {
        assert_eq!(toggle_resource("registration"), "/admin/registration");
        assert_eq!(toggle_resource("turn"), "/admin/services/turn");
        assert_eq!(toggle_resource("/admin/custom"), "/admin/custom");
    }

    #[test]
    fn session_events_are_persisted() {
        let profiles = ProfileBook::new(Arc::new(MemoryCollection::<SavedServerProfile>::new()));
        let mut settings = ConsoleSettings::default();

        let connected = CoordinatorEvent::Connected {
            endpoint: "https://h/api/admin".to_string(),
            token: "t".to_string(),
        };
        assert!(persist_event(&connected, &mut settings, &profiles));
        assert_eq!(settings.last_url.as_deref(), Some("https://h/api/admin"));
        let saved = profiles.list().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].label, "h");

        // Reconnecting to the same server does not duplicate it
        persist_event(&connected, &mut settings, &profiles);
        assert_eq!(profiles.list().unwrap().len(), 1);

        let moved = CoordinatorEvent::EndpointChanged {
            endpoint: "https://h/hidden".to_string(),
        };
        assert!(persist_event(&moved, &mut settings, &profiles));
        assert_eq!(settings.last_url.as_deref(), Some("https://h/hidden"));

        assert!(persist_event(&CoordinatorEvent::Disconnected, &mut settings, &profiles));
        assert_eq!(settings.last_url, None);
        assert_eq!(settings.last_token, None);

        assert!(!persist_event(&CoordinatorEvent::PendingRestart(true), &mut settings, &profiles));
    }

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }
}
