use crate::endpoint::host_label;
use crate::error::StoreError;
use crate::store::KeyValueCollection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A server the operator has connected to before.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedServerProfile {
    /// Stable UUID, never reused
    pub id: String,
    pub label: String,
    pub url: String,
    pub token: String,
    /// Milliseconds since the Unix epoch
    pub added_at: i64,
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Saved-server picker backed by any key-value collection.
///
/// Profiles are unique by URL from the operator's point of view: saving a URL
/// that is already known updates that profile in place.
#[derive(Clone)]
pub struct ProfileBook {
    store: Arc<dyn KeyValueCollection<SavedServerProfile>>,
}

impl ProfileBook {
    pub fn new(store: Arc<dyn KeyValueCollection<SavedServerProfile>>) -> Self {
        Self { store }
    }

    /// All profiles, most recently added first.
    pub fn list(&self) -> Result<Vec<SavedServerProfile>, StoreError> {
        let mut servers = self.store.get_all()?;
        servers.sort_by(|a, b| b.added_at.cmp(&a.added_at));
        Ok(servers)
    }

    pub fn get(&self, id: &str) -> Result<Option<SavedServerProfile>, StoreError> {
        Ok(self.store.get_all()?.into_iter().find(|s| s.id == id))
    }

    /// Create or update the profile for `url`.
    ///
    /// An existing profile keeps its `id` and `added_at`; its label only
    /// changes when one is given. New profiles default to the URL's host.
    pub fn save(
        &self,
        url: &str,
        token: &str,
        label: Option<&str>,
    ) -> Result<SavedServerProfile, StoreError> {
        let existing = self.store.get_all()?.into_iter().find(|s| s.url == url);

        let profile = match existing {
            Some(found) => SavedServerProfile {
                label: label.map(str::to_string).unwrap_or(found.label),
                token: token.to_string(),
                ..found
            },
            None => SavedServerProfile {
                id: uuid::Uuid::new_v4().to_string(),
                label: label.map(str::to_string).unwrap_or_else(|| host_label(url)),
                url: url.to_string(),
                token: token.to_string(),
                added_at: now_millis(),
            },
        };

        self.store.put(&profile.id, profile.clone())?;
        log::debug!("Saved server profile {} ({})", profile.id, profile.label);
        Ok(profile)
    }

    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete(id)
    }

    /// Rename a profile. Unknown ids are ignored.
    pub fn update_label(&self, id: &str, label: &str) -> Result<bool, StoreError> {
        let Some(mut profile) = self.get(id)? else {
            return Ok(false);
        };
        profile.label = label.to_string();
        self.store.put(id, profile)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonFileCollection, MemoryCollection};

    fn book() -> ProfileBook {
        ProfileBook::new(Arc::new(MemoryCollection::<SavedServerProfile>::new()))
    }

    #[test]
    fn saving_a_known_url_updates_in_place() {
        let book = book();
        let first = book.save("https://a/api/admin", "t1", None).unwrap();
        assert_eq!(first.label, "a");

        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = book.save("https://a/api/admin", "t2", None).unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.added_at, first.added_at);
        assert_eq!(second.token, "t2");
        assert_eq!(second.label, "a");
        assert_eq!(book.list().unwrap().len(), 1);
    }

    #[test]
    fn saving_a_new_url_creates_a_fresh_profile() {
        let book = book();
        let a = book.save("https://a/api/admin", "t", Some("Production")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = book.save("https://b/api/admin", "t", None).unwrap();

        assert_ne!(a.id, b.id);
        let listed = book.list().unwrap();
        assert_eq!(listed.len(), 2);
        // Newest first
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].label, "Production");
    }

    #[test]
    fn explicit_label_overrides_existing_one() {
        let book = book();
        let a = book.save("https://a/api/admin", "t", None).unwrap();
        let renamed = book.save("https://a/api/admin", "t", Some("Staging")).unwrap();
        assert_eq!(renamed.id, a.id);
        assert_eq!(renamed.label, "Staging");
    }

    #[test]
    fn update_label_and_remove() {
        let book = book();
        let a = book.save("https://a/api/admin", "t", None).unwrap();

        assert!(book.update_label(&a.id, "Mail").unwrap());
        assert!(!book.update_label("missing", "x").unwrap());
        assert_eq!(book.get(&a.id).unwrap().unwrap().label, "Mail");

        book.remove(&a.id).unwrap();
        assert!(book.list().unwrap().is_empty());
    }

    #[test]
    fn profiles_survive_a_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        let saved = ProfileBook::new(Arc::new(JsonFileCollection::new(&path)))
            .save("https://a/api/admin", "t", None)
            .unwrap();

        let reopened = ProfileBook::new(Arc::new(JsonFileCollection::new(&path)));
        assert_eq!(reopened.list().unwrap(), vec![saved]);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("addedAt"));
    }
}
