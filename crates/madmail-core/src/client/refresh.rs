use crate::client::rpc::{AdminTransport, ApiTarget, RemoteAdminClient};
use crate::client::types::{DashboardData, RefreshReport, Resource};
use crate::error::AdminError;

fn record<T>(
    resource: Resource,
    result: Result<T, AdminError>,
    slot: &mut Option<T>,
    report: &mut RefreshReport,
) {
    match result {
        Ok(value) => {
            *slot = Some(value);
            report.updated.push(resource);
        }
        Err(e) => {
            log::warn!("Refresh of {} failed: {}", resource.name(), e);
            report.failed.push((resource, e));
        }
    }
}

/// Fetch every display resource concurrently and fold the successes into
/// `data`. A failed resource keeps its previous value.
///
/// `data` is only touched after all fetches joined, so callers can apply the
/// whole result under one lock.
pub async fn fetch_all<T: AdminTransport>(
    client: &RemoteAdminClient<T>,
    target: &ApiTarget,
) -> (DashboardData, RefreshReport) {
    let (storage, settings, accounts, quota, status, blocklist, dns) = tokio::join!(
        client.storage(target),
        client.settings(target),
        client.accounts(target),
        client.quota(target),
        client.status(target),
        client.blocklist(target),
        client.dns(target),
    );

    let mut fetched = DashboardData::default();
    let mut report = RefreshReport::default();
    record(Resource::Storage, storage, &mut fetched.storage, &mut report);
    record(Resource::Settings, settings, &mut fetched.settings, &mut report);
    record(Resource::Accounts, accounts, &mut fetched.accounts, &mut report);
    record(Resource::Quota, quota, &mut fetched.quota, &mut report);
    record(Resource::Status, status, &mut fetched.status, &mut report);
    record(Resource::Blocklist, blocklist, &mut fetched.blocklist, &mut report);
    record(Resource::Dns, dns, &mut fetched.dns, &mut report);
    (fetched, report)
}

/// Replace the resources present in `fetched`, keep the rest.
pub fn merge(data: &mut DashboardData, fetched: DashboardData) {
    let DashboardData {
        status,
        storage,
        settings,
        accounts,
        quota,
        blocklist,
        dns,
    } = fetched;
    if status.is_some() {
        data.status = status;
    }
    if storage.is_some() {
        data.storage = storage;
    }
    if settings.is_some() {
        data.settings = settings;
    }
    if accounts.is_some() {
        data.accounts = accounts;
    }
    if quota.is_some() {
        data.quota = quota;
    }
    if blocklist.is_some() {
        data.blocklist = blocklist;
    }
    if dns.is_some() {
        data.dns = dns;
    }
}
