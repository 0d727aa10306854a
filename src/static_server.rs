//! Local HTTP server for a console build (SPA with index.html fallback).

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html") => "text/html; charset=utf-8",
        Some("js") | Some("mjs") => "application/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("webp") => "image/webp",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "application/xml; charset=utf-8",
        Some("webmanifest") => "application/manifest+json",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Resolved {
    File(PathBuf),
    Forbidden,
    Missing,
}

/// Map a request path onto `root`. The path is percent-decoded first, and
/// anything in the decoded form that could climb out of `root` is forbidden.
async fn resolve(root: &Path, request_path: &str) -> Resolved {
    let Ok(decoded) = urlencoding::decode(request_path) else {
        return Resolved::Forbidden;
    };
    let relative = decoded.trim_start_matches('/');
    if relative.contains('\\') || relative.contains('\0') {
        return Resolved::Forbidden;
    }
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Resolved::Forbidden;
    }

    let mut candidate = root.join(relative);
    if tokio::fs::metadata(&candidate).await.is_ok_and(|m| m.is_dir()) {
        candidate = candidate.join("index.html");
    }
    if tokio::fs::metadata(&candidate).await.is_ok_and(|m| m.is_file()) {
        Resolved::File(candidate)
    } else {
        Resolved::Missing
    }
}

async fn serve_file(path: &Path) -> Response {
    match tokio::fs::read(path).await {
        Ok(content) => ([(header::CONTENT_TYPE, mime_for(path))], content).into_response(),
        Err(e) => {
            log::warn!("Failed to read {}: {}", path.display(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Read error").into_response()
        }
    }
}

async fn serve_console_asset(State(root): State<Arc<PathBuf>>, uri: Uri) -> Response {
    match resolve(&root, uri.path()).await {
        Resolved::File(path) => serve_file(&path).await,
        Resolved::Forbidden => {
            log::debug!("Rejected path {}", uri.path());
            (StatusCode::FORBIDDEN, "Forbidden").into_response()
        }
        Resolved::Missing => {
            // SPA fallback: client-side routes render from index.html
            let index = root.join("index.html");
            if tokio::fs::metadata(&index).await.is_ok_and(|m| m.is_file()) {
                serve_file(&index).await
            } else {
                (StatusCode::NOT_FOUND, "Not Found").into_response()
            }
        }
    }
}

pub fn build_router(root: PathBuf) -> Router {
    Router::new()
        .fallback(serve_console_asset)
        .with_state(Arc::new(root))
}

/// Serve `root` on 127.0.0.1 until Ctrl-C. Port 0 lets the OS choose.
pub async fn serve(root: PathBuf, port: u16) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("console build not found at {}", root.display()))?;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let local = listener.local_addr()?;
    log::info!("Serving {} on http://{}", root.display(), local);
    println!("http://{}/", local);

    axum::serve(listener, build_router(root))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("static server failed")?;

    log::info!("Static server shut down");
    Ok(())
}
