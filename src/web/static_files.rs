use axum::Router;
use std::path::Path;
use tower_http::services::{ServeDir, ServeFile};

/// Serve the single-page frontend; unknown paths get `index.html` so client
/// side routes survive a reload.
pub fn routes<S>(static_dir: &Path) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let index = static_dir.join("index.html");
    Router::new().fallback_service(ServeDir::new(static_dir).fallback(ServeFile::new(index)))
}
