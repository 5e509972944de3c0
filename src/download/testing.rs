//! Local HTTP server for tests that go through the real client.

use std::time::Duration;

use axum::Router;
use url::Url;

use crate::options::Options;

/// Serves `app` on an ephemeral port and returns its base URL.
pub(crate) async fn serve(app: Router) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{}/", addr)).unwrap()
}

/// Options pointed at a local server, with backoff short enough for tests.
pub(crate) fn local_options(base_url: Url) -> Options {
    Options {
        base_url,
        max_download_retries: 1,
        retry_backoff: Duration::from_millis(1),
        retry_max_backoff: Duration::from_millis(2),
        chunk_size: Some(1024),
        ..Options::default()
    }
}
