use crate::error::FetchError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use url::Url;

/// Name of the current cache generation. Bump the tag to invalidate every
/// asset cached by an older build.
pub const CACHE_NAME: &str = "madmail-v1";

/// The application shell, relative to the origin.
pub const PRECACHE: [&str; 3] = ["./", "./index.html", "./manifest.json"];

/// Tokens exchanged between the worker and the pages it controls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerMessage {
    SkipWaiting,
    ClearCache,
    CacheCleared,
}

impl WorkerMessage {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "SKIP_WAITING" => Some(WorkerMessage::SkipWaiting),
            "CLEAR_CACHE" => Some(WorkerMessage::ClearCache),
            "CACHE_CLEARED" => Some(WorkerMessage::CacheCleared),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMessage::SkipWaiting => "SKIP_WAITING",
            WorkerMessage::ClearCache => "CLEAR_CACHE",
            WorkerMessage::CacheCleared => "CACHE_CLEARED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetRequest {
    pub method: String,
    pub url: Url,
}

impl AssetRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: "GET".to_string(),
            url,
        }
    }

    fn cache_key(&self) -> &str {
        self.url.as_str()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Where cache misses go.
#[async_trait::async_trait]
pub trait AssetNetwork: Send + Sync + 'static {
    async fn fetch(&self, request: &AssetRequest) -> Result<CachedResponse, FetchError>;
}

pub struct HttpAssetNetwork {
    client: reqwest::Client,
}

impl HttpAssetNetwork {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl AssetNetwork for HttpAssetNetwork {
    async fn fetch(&self, request: &AssetRequest) -> Result<CachedResponse, FetchError> {
        let network = |e: reqwest::Error| FetchError::Network {
            url: request.url.to_string(),
            message: e.to_string(),
        };
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            FetchError::Network {
                url: request.url.to_string(),
                message: e.to_string(),
            }
        })?;
        let resp = self
            .client
            .request(method, request.url.clone())
            .send()
            .await
            .map_err(network)?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(network)?.to_vec();
        Ok(CachedResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Named cache generations, each mapping a request URL to a response.
#[derive(Default)]
pub struct CacheStorage {
    generations: Mutex<BTreeMap<String, BTreeMap<String, CachedResponse>>>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.generations.lock().keys().cloned().collect()
    }

    /// Look a request up in every generation.
    pub fn lookup(&self, key: &str) -> Option<CachedResponse> {
        self.generations
            .lock()
            .values()
            .find_map(|entries| entries.get(key).cloned())
    }

    pub fn put(&self, generation: &str, key: &str, response: CachedResponse) {
        self.generations
            .lock()
            .entry(generation.to_string())
            .or_default()
            .insert(key.to_string(), response);
    }

    /// Insert a batch into one generation, all or nothing.
    pub fn put_all(&self, generation: &str, entries: Vec<(String, CachedResponse)>) {
        self.generations
            .lock()
            .entry(generation.to_string())
            .or_default()
            .extend(entries);
    }

    pub fn delete(&self, generation: &str) -> bool {
        self.generations.lock().remove(generation).is_some()
    }

    pub fn entry_count(&self, generation: &str) -> usize {
        self.generations
            .lock()
            .get(generation)
            .map_or(0, BTreeMap::len)
    }
}

/// How a request is served.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Not intercepted at all. Cross-origin traffic, including the admin API.
    Bypass,
    /// Intercepted but never cached.
    NetworkOnly,
    CacheFirst,
}

pub fn classify(origin: &Url, request: &AssetRequest) -> FetchPolicy {
    if request.url.origin() != origin.origin() {
        return FetchPolicy::Bypass;
    }
    let path = request.url.path();
    if request.method != "GET" || path.contains("/api/") || path.ends_with(crate::version::VERSION_RESOURCE) {
        return FetchPolicy::NetworkOnly;
    }
    FetchPolicy::CacheFirst
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installed,
    Activated,
}

/// Offline cache for the console build.
///
/// Serves same-origin assets cache-first, keeps exactly one generation and
/// answers the page's invalidation requests.
pub struct AssetCacheWorker<N: AssetNetwork> {
    origin: Url,
    cache_name: String,
    network: Arc<N>,
    storage: Arc<CacheStorage>,
    state: Mutex<WorkerState>,
    skip_waiting: AtomicBool,
    clients: Mutex<Vec<async_channel::Sender<String>>>,
}

impl<N: AssetNetwork> AssetCacheWorker<N> {
    pub fn new(origin: Url, network: Arc<N>, storage: Arc<CacheStorage>) -> Self {
        Self::with_cache_name(origin, CACHE_NAME, network, storage)
    }

    pub fn with_cache_name(origin: Url, cache_name: &str, network: Arc<N>, storage: Arc<CacheStorage>) -> Self {
        Self {
            origin,
            cache_name: cache_name.to_string(),
            network,
            storage,
            state: Mutex::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    /// Whether this version asked to take over without waiting for older
    /// pages to close.
    pub fn skips_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Pre-cache the shell into the current generation. Nothing is stored
    /// unless every shell asset was fetched successfully.
    pub async fn install(&self) -> Result<(), FetchError> {
        let mut requests = Vec::with_capacity(PRECACHE.len());
        for path in PRECACHE {
            let url = self.origin.join(path).map_err(|e| FetchError::Network {
                url: path.to_string(),
                message: e.to_string(),
            })?;
            requests.push(AssetRequest::get(url));
        }

        let responses = futures::future::try_join_all(requests.iter().map(|request| async move {
            let response = self.network.fetch(request).await?;
            if !response.is_success() {
                return Err(FetchError::Status {
                    url: request.url.to_string(),
                    status: response.status,
                });
            }
            Ok::<_, FetchError>((request.cache_key().to_string(), response))
        }))
        .await?;

        self.storage.put_all(&self.cache_name, responses);
        self.skip_waiting.store(true, Ordering::SeqCst);
        *self.state.lock() = WorkerState::Installed;
        log::info!("Asset cache {} installed", self.cache_name);
        Ok(())
    }

    /// Drop every other generation and take control of the registered pages.
    pub fn activate(&self) {
        for name in self.storage.keys() {
            if name != self.cache_name {
                self.storage.delete(&name);
                log::info!("Deleted stale asset cache {}", name);
            }
        }
        *self.state.lock() = WorkerState::Activated;
        log::info!(
            "Asset cache {} active, controlling {} page(s)",
            self.cache_name,
            self.clients.lock().len()
        );
    }

    /// Register a page; `CACHE_CLEARED` and future broadcasts go to `reply`.
    pub fn claim(&self, reply: async_channel::Sender<String>) {
        self.clients.lock().push(reply);
    }

    /// Answer an intercepted request. `None` means the request is not
    /// intercepted and the caller fetches it directly.
    pub async fn respond(&self, request: &AssetRequest) -> Option<Result<CachedResponse, FetchError>> {
        match classify(&self.origin, request) {
            FetchPolicy::Bypass => None,
            FetchPolicy::NetworkOnly => Some(self.network.fetch(request).await),
            FetchPolicy::CacheFirst => Some(self.cache_first(request).await),
        }
    }

    async fn cache_first(&self, request: &AssetRequest) -> Result<CachedResponse, FetchError> {
        if let Some(cached) = self.storage.lookup(request.cache_key()) {
            log::debug!("Cache hit {}", request.url);
            return Ok(cached);
        }
        log::debug!("Cache miss {}", request.url);
        let response = self.network.fetch(request).await?;
        if response.is_success() {
            self.storage
                .put(&self.cache_name, request.cache_key(), response.clone());
        }
        Ok(response)
    }

    /// React to one token from a page. Unknown tokens are ignored.
    pub fn handle_message(&self, token: &str) {
        match WorkerMessage::parse(token) {
            Some(WorkerMessage::SkipWaiting) => {
                self.skip_waiting.store(true, Ordering::SeqCst);
            }
            Some(WorkerMessage::ClearCache) => {
                for name in self.storage.keys() {
                    self.storage.delete(&name);
                }
                log::info!("All asset caches cleared");
                self.broadcast(WorkerMessage::CacheCleared);
            }
            _ => log::debug!("Ignoring worker message {:?}", token),
        }
    }

    fn broadcast(&self, message: WorkerMessage) {
        self.clients.lock().retain(|client| {
            match client.try_send(message.as_str().to_string()) {
                Ok(()) => true,
                Err(e) => !e.is_closed(),
            }
        });
    }

    /// Run the worker's message loop until every sender of `inbox` is gone.
    pub fn spawn(worker: Arc<Self>, inbox: async_channel::Receiver<String>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(token) = inbox.recv().await {
                worker.handle_message(&token);
            }
            log::debug!("Asset cache worker inbox closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeNetwork {
        answers: Mutex<HashMap<String, CachedResponse>>,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeNetwork {
        fn serve(&self, url: &str, status: u16, body: &str) {
            self.answers.lock().insert(
                url.to_string(),
                CachedResponse {
                    status,
                    content_type: Some("text/html".to_string()),
                    body: body.as_bytes().to_vec(),
                },
            );
        }

        fn fetch_count(&self, url: &str) -> usize {
            self.fetched.lock().iter().filter(|u| *u == url).count()
        }
    }

    #[async_trait::async_trait]
    impl AssetNetwork for FakeNetwork {
        async fn fetch(&self, request: &AssetRequest) -> Result<CachedResponse, FetchError> {
            let url = request.url.to_string();
            self.fetched.lock().push(url.clone());
            self.answers
                .lock()
                .get(&url)
                .cloned()
                .ok_or(FetchError::Network {
                    url,
                    message: "connection refused".to_string(),
                })
        }
    }

    const ORIGIN: &str = "https://console.example.org/";

    fn shell_network() -> Arc<FakeNetwork> {
        let network = Arc::new(FakeNetwork::default());
        network.serve(ORIGIN, 200, "shell");
        network.serve(&format!("{}index.html", ORIGIN), 200, "shell");
        network.serve(&format!("{}manifest.json", ORIGIN), 200, "{}");
        network
    }

    fn worker(network: Arc<FakeNetwork>) -> AssetCacheWorker<FakeNetwork> {
        AssetCacheWorker::new(Url::parse(ORIGIN).unwrap(), network, Arc::new(CacheStorage::new()))
    }

    fn get(url: &str) -> AssetRequest {
        AssetRequest::get(Url::parse(url).unwrap())
    }

    #[test]
    fn classification() {
        let origin = Url::parse(ORIGIN).unwrap();
        assert_eq!(classify(&origin, &get("https://mail.example.org/api/admin")), FetchPolicy::Bypass);
        assert_eq!(classify(&origin, &get("https://console.example.org/api/admin")), FetchPolicy::NetworkOnly);
        assert_eq!(classify(&origin, &get("https://console.example.org/version.json")), FetchPolicy::NetworkOnly);
        assert_eq!(classify(&origin, &get("https://console.example.org/_app/x.js")), FetchPolicy::CacheFirst);
        let post = AssetRequest {
            method: "POST".to_string(),
            url: Url::parse("https://console.example.org/index.html").unwrap(),
        };
        assert_eq!(classify(&origin, &post), FetchPolicy::NetworkOnly);
    }

    #[test]
    fn unknown_tokens_do_not_parse() {
        assert_eq!(WorkerMessage::parse("CLEAR_CACHE"), Some(WorkerMessage::ClearCache));
        assert_eq!(WorkerMessage::parse("clear_cache"), None);
        assert_eq!(WorkerMessage::CacheCleared.as_str(), "CACHE_CLEARED");
    }

    #[tokio::test]
    async fn install_precaches_shell_and_skips_waiting() {
        let w = worker(shell_network());
        w.install().await.unwrap();

        assert_eq!(w.state(), WorkerState::Installed);
        assert!(w.skips_waiting());
        assert_eq!(w.storage().entry_count(CACHE_NAME), 3);
    }

    #[tokio::test]
    async fn install_is_all_or_nothing() {
        let network = shell_network();
        network.serve(&format!("{}manifest.json", ORIGIN), 404, "");
        let w = worker(network);

        let err = w.install().await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(w.storage().entry_count(CACHE_NAME), 0);
        assert_eq!(w.state(), WorkerState::Parsed);
    }

    #[tokio::test]
    async fn activate_deletes_other_generations() {
        let w = worker(shell_network());
        w.storage().put("madmail-v0", "https://console.example.org/old.js", CachedResponse {
            status: 200,
            content_type: None,
            body: Vec::new(),
        });
        w.install().await.unwrap();

        w.activate();

        assert_eq!(w.storage().keys(), vec![CACHE_NAME.to_string()]);
        assert_eq!(w.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn cache_first_stores_only_successes() {
        let network = shell_network();
        let asset = "https://console.example.org/_app/app.js";
        let missing = "https://console.example.org/_app/gone.js";
        network.serve(asset, 200, "js");
        network.serve(missing, 404, "");
        let w = worker(network.clone());

        for _ in 0..2 {
            assert_eq!(w.respond(&get(asset)).await.unwrap().unwrap().body, b"js");
            assert_eq!(w.respond(&get(missing)).await.unwrap().unwrap().status, 404);
        }
        assert_eq!(network.fetch_count(asset), 1);
        assert_eq!(network.fetch_count(missing), 2);
    }

    #[tokio::test]
    async fn version_and_api_are_never_cached() {
        let network = shell_network();
        let version = "https://console.example.org/version.json";
        network.serve(version, 200, r#"{"version":"1"}"#);
        let w = worker(network.clone());

        w.respond(&get(version)).await.unwrap().unwrap();
        w.respond(&get(version)).await.unwrap().unwrap();
        assert_eq!(network.fetch_count(version), 2);
        assert_eq!(w.storage().lookup(version), None);

        assert!(w.respond(&get("https://mail.example.org/api/admin")).await.is_none());
        assert_eq!(network.fetch_count("https://mail.example.org/api/admin"), 0);
    }

    #[tokio::test]
    async fn clear_cache_empties_storage_and_confirms() {
        let w = Arc::new(worker(shell_network()));
        w.install().await.unwrap();
        w.activate();
        let (page_tx, page_rx) = async_channel::unbounded();
        w.claim(page_tx);
        let (inbox_tx, inbox_rx) = async_channel::unbounded();
        let task = AssetCacheWorker::spawn(w.clone(), inbox_rx);

        inbox_tx.send("HELLO".to_string()).await.unwrap();
        inbox_tx.send("CLEAR_CACHE".to_string()).await.unwrap();

        assert_eq!(page_rx.recv().await.unwrap(), "CACHE_CLEARED");
        assert!(w.storage().keys().is_empty());

        drop(inbox_tx);
        task.await.unwrap();
    }
}
