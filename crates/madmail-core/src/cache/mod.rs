//! Offline caching of the console build and its invalidation.

pub mod handshake;
pub mod worker;

pub use handshake::{HandshakeState, InvalidationHandshake, PageReload, WorkerLink};
pub use worker::{
    AssetCacheWorker, AssetNetwork, AssetRequest, CacheStorage, CachedResponse, FetchPolicy,
    HttpAssetNetwork, WorkerMessage, WorkerState,
};
