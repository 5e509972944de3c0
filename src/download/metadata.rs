//! Works out what kind of file an identifier points to.
//!
//! A file with a playable stream in `get_video_info` is downloaded directly.
//! Otherwise the viewer is asked how many frame pages it serves; how that
//! count is discovered is kept behind [`FrameCountProbe`] since it depends on
//! the viewer's current payload.

use std::future::Future;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::download::retry::{retry, RetryPolicy};
use crate::download::tile::tile_url;
use crate::download::DriveClient;
use crate::error::{DriveError, Result};

const VIDEO_INFO_PATH: &str = "u/0/get_video_info";
const VIEWER_META_PATH: &str = "viewerng/meta";
const XSSI_GUARD: &str = ")]}'";
const DEFAULT_EXTENSION: &str = "mp4";
const MISSING_FILE_ERRORCODE: u32 = 100;
const RESTRICTED_FILE_ERRORCODE: u32 = 150;

/// Upper bound on the frame count of any file, whatever a probe reports.
pub const MAX_FRAMES: usize = 1 << 20;
/// Upper bound on tile rows and columns of a frame.
pub const MAX_GRID_SIDE: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub rows: u32,
    pub cols: u32,
}

impl TileGrid {
    pub const SINGLE: TileGrid = TileGrid { rows: 1, cols: 1 };

    pub fn tile_count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    /// `(row, col)` pairs in row-major order.
    pub fn positions(&self) -> impl Iterator<Item = (u32, u32)> {
        let cols = self.cols;
        (0..self.rows).flat_map(move |row| (0..cols).map(move |col| (row, col)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    Direct { stream_url: Url, byte_size: u64 },
    ViewOnly { total_frames: usize, grid: TileGrid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub identifier: String,
    pub title: Option<String>,
    pub kind: FileKind,
}

impl FileHandle {
    /// Service title when there is one, `video_<id>.mp4` otherwise.
    pub fn default_file_name(&self) -> String {
        let name = self
            .title
            .as_deref()
            .map(|title| title.trim().replace(['/', '\\'], "_"))
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| format!("video_{}", self.identifier));

        with_default_extension(&name)
    }
}

pub fn with_default_extension(name: &str) -> String {
    if std::path::Path::new(name).extension().is_some() {
        name.to_string()
    } else {
        format!("{}.{}", name, DEFAULT_EXTENSION)
    }
}

/// Fields of the form-encoded `get_video_info` reply the resolver cares about.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    pub status_ok: bool,
    pub title: Option<String>,
    pub stream_url: Option<String>,
    pub errorcode: Option<u32>,
    pub reason: Option<String>,
}

impl VideoInfo {
    fn is_missing(&self) -> bool {
        self.errorcode == Some(MISSING_FILE_ERRORCODE)
            || self
                .reason
                .as_deref()
                .map(|reason| reason.to_lowercase().contains("does not exist"))
                .unwrap_or(false)
    }

    fn requires_sign_in(&self) -> bool {
        let reason = self.reason.as_deref().unwrap_or_default().to_lowercase();
        self.errorcode == Some(RESTRICTED_FILE_ERRORCODE)
            || reason.contains("sign in")
            || reason.contains("log in")
            || reason.contains("permission")
    }
}

pub fn parse_video_info(body: &str) -> VideoInfo {
    let mut info = VideoInfo::default();

    for (key, value) in url::form_urlencoded::parse(body.trim().as_bytes()) {
        match key.as_ref() {
            "status" => info.status_ok = value == "ok",
            "title" if info.title.is_none() && !value.trim().is_empty() => {
                info.title = Some(value.into_owned());
            }
            "fmt_stream_map" if info.stream_url.is_none() => {
                // entries look like "<itag>|<url>", comma separated
                info.stream_url = value
                    .split(',')
                    .filter(|entry| entry.contains("videoplayback"))
                    .find_map(|entry| entry.rsplit('|').next())
                    .map(str::to_string);
            }
            "errorcode" => info.errorcode = value.trim().parse().ok(),
            "reason" => info.reason = Some(value.into_owned()),
            _ => {}
        }
    }

    info
}

/// How many frame pages the viewer serves for a file, and how each is tiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerLayout {
    pub total_frames: usize,
    pub grid: TileGrid,
    pub title: Option<String>,
}

#[async_trait]
pub trait FrameCountProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means this probe cannot tell; the next one is tried.
    async fn probe(&self, client: &DriveClient, identifier: &str) -> Result<Option<ViewerLayout>>;
}

/// Reads the page count embedded in the viewer's metadata payload.
pub struct ViewerMetaProbe;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ViewerMeta {
    pages: Option<usize>,
    tile_rows: Option<u32>,
    tile_cols: Option<u32>,
    title: Option<String>,
}

pub fn parse_viewer_meta(body: &str) -> Option<ViewerLayout> {
    let body = body.trim_start();
    let body = body.strip_prefix(XSSI_GUARD).unwrap_or(body);

    let meta: ViewerMeta = match serde_json::from_str(body.trim()) {
        Ok(meta) => meta,
        Err(err) => {
            debug!("viewer metadata is not JSON: {}", err);
            return None;
        }
    };

    let total_frames = meta.pages.filter(|pages| *pages > 0)?;
    let grid = TileGrid {
        rows: meta.tile_rows.unwrap_or(1).max(1),
        cols: meta.tile_cols.unwrap_or(1).max(1),
    };

    if total_frames > MAX_FRAMES || grid.rows > MAX_GRID_SIDE || grid.cols > MAX_GRID_SIDE {
        warn!(
            pages = total_frames,
            rows = grid.rows,
            cols = grid.cols,
            "ignoring implausible viewer metadata"
        );
        return None;
    }

    Some(ViewerLayout { total_frames, grid, title: meta.title })
}

#[async_trait]
impl FrameCountProbe for ViewerMetaProbe {
    fn name(&self) -> &'static str {
        "viewer metadata"
    }

    async fn probe(&self, client: &DriveClient, identifier: &str) -> Result<Option<ViewerLayout>> {
        let url = client.endpoint(VIEWER_META_PATH, &[("id", identifier)])?;

        match client.get_text(&url).await {
            Ok(body) => Ok(parse_viewer_meta(&body)),
            Err(DriveError::NotFound(_)) => Ok(None),
            Err(DriveError::PermanentReject(message)) => {
                debug!("viewer metadata refused: {}", message);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Requests single-tile pages until the viewer answers "not found".
pub struct PageProbe {
    pub max_frames: usize,
}

impl Default for PageProbe {
    fn default() -> Self {
        Self { max_frames: MAX_FRAMES }
    }
}

#[async_trait]
impl FrameCountProbe for PageProbe {
    fn name(&self) -> &'static str {
        "page probe"
    }

    async fn probe(&self, client: &DriveClient, identifier: &str) -> Result<Option<ViewerLayout>> {
        let total_frames = count_pages(self.max_frames, |page| async move {
            let url = tile_url(client, identifier, page, 0, 0)?;
            match client.get(&url).await {
                Ok(_) => Ok(true),
                Err(DriveError::NotFound(_)) => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await?;

        if total_frames == 0 {
            return Ok(None);
        }

        Ok(Some(ViewerLayout { total_frames, grid: TileGrid::SINGLE, title: None }))
    }
}

/// Number of pages `0..n` for which `exists` holds, found by doubling and
/// then bisecting. Never reports more than `max_frames`.
pub async fn count_pages<F, Fut>(max_frames: usize, mut exists: F) -> Result<usize>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    if max_frames == 0 || !exists(0).await? {
        return Ok(0);
    }

    // `lo` exists, `hi` does not (or is the cap)
    let mut lo = 0;
    let mut hi = 1;
    while hi < max_frames && exists(hi).await? {
        lo = hi;
        hi = (hi * 2).min(max_frames);
    }

    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if exists(mid).await? {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    Ok(lo + 1)
}

pub struct MetadataResolver {
    policy: RetryPolicy,
    probes: Vec<Box<dyn FrameCountProbe>>,
}

impl MetadataResolver {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_probes(policy, vec![Box::new(ViewerMetaProbe), Box::new(PageProbe::default())])
    }

    pub fn with_probes(policy: RetryPolicy, probes: Vec<Box<dyn FrameCountProbe>>) -> Self {
        Self { policy, probes }
    }

    pub async fn resolve(
        &self,
        client: &DriveClient,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<FileHandle> {
        let info_url = client.endpoint(
            VIDEO_INFO_PATH,
            &[("docid", identifier), ("drive_originator_app", "303")],
        )?;
        debug!("requesting {}", info_url);

        let body = retry(&self.policy, cancel, "metadata request", |_| client.get_text(&info_url))
            .await
            .map_err(as_metadata_error)?;
        let info = parse_video_info(&body);
        if !info.status_ok {
            debug!(errorcode = ?info.errorcode, "video info refused: {}", info.reason.as_deref().unwrap_or("no reason"));
        }

        if let Some(stream) = info.stream_url.as_deref() {
            let stream_url = Url::parse(stream)
                .map_err(|err| DriveError::Unsupported(format!("unusable stream url: {}", err)))?;

            let byte_size = match client.content_length(&stream_url).await {
                Ok(size) => size,
                Err(err) => {
                    warn!("cannot read stream size, continuing without it: {}", err);
                    0
                }
            };

            info!(byte_size, "{} has a direct stream", identifier);
            return Ok(FileHandle {
                identifier: identifier.to_string(),
                title: info.title,
                kind: FileKind::Direct { stream_url, byte_size },
            });
        }

        if info.is_missing() {
            return Err(DriveError::NotFound(format!("no file with id {}", identifier)));
        }

        for probe in &self.probes {
            let layout = retry(&self.policy, cancel, probe.name(), |_| probe.probe(client, identifier))
                .await
                .map_err(as_metadata_error)?;

            if let Some(layout) = layout {
                info!(
                    frames = layout.total_frames,
                    rows = layout.grid.rows,
                    cols = layout.grid.cols,
                    "{} is view-only ({})",
                    identifier,
                    probe.name()
                );
                return Ok(FileHandle {
                    identifier: identifier.to_string(),
                    title: layout.title.or(info.title),
                    kind: FileKind::ViewOnly { total_frames: layout.total_frames, grid: layout.grid },
                });
            }
            debug!("{} could not count frames for {}", probe.name(), identifier);
        }

        if info.requires_sign_in() {
            return Err(DriveError::AuthRequired(
                info.reason.unwrap_or_else(|| "the file is restricted to signed-in users".into()),
            ));
        }

        Err(DriveError::Unsupported(format!(
            "{} is neither downloadable nor a view-only video",
            identifier
        )))
    }
}

/// A refusal on metadata means the session cannot see the file.
fn as_metadata_error(err: DriveError) -> DriveError {
    match err {
        DriveError::PermanentReject(message) => DriveError::AuthRequired(message),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn grid_positions_are_row_major() {
        let grid = TileGrid { rows: 2, cols: 3 };
        assert_eq!(grid.tile_count(), 6);
        assert_eq!(
            grid.positions().collect::<Vec<_>>(),
            vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]
        );
    }

    #[test]
    fn video_info_with_stream() {
        let body = "status=ok&title=My%20Clip.mov&fmt_stream_map=22%7Chttps%3A%2F%2Fr1.example.com%2Fvideoplayback%3Fid%3D1%2C18%7Chttps%3A%2F%2Fr2.example.com%2Fvideoplayback%3Fid%3D2";
        let info = parse_video_info(body);

        assert!(info.status_ok);
        assert_eq!(info.title.as_deref(), Some("My Clip.mov"));
        assert_eq!(info.stream_url.as_deref(), Some("https://r1.example.com/videoplayback?id=1"));
    }

    #[test]
    fn video_info_failures() {
        let missing = parse_video_info("status=fail&errorcode=100&reason=This+file+does+not+exist.");
        assert!(!missing.status_ok);
        assert!(missing.is_missing());

        let restricted = parse_video_info("status=fail&errorcode=150&reason=You+need+permission");
        assert!(restricted.requires_sign_in());
        assert!(!restricted.is_missing());
        assert!(restricted.stream_url.is_none());
    }

    #[test]
    fn viewer_meta_with_guard_and_grid() {
        let layout = parse_viewer_meta(")]}'\n{\"pages\": 120, \"tileRows\": 3, \"tileCols\": 2, \"title\": \"lecture\"}")
            .unwrap();
        assert_eq!(layout.total_frames, 120);
        assert_eq!(layout.grid, TileGrid { rows: 3, cols: 2 });
        assert_eq!(layout.title.as_deref(), Some("lecture"));

        let single = parse_viewer_meta("{\"pages\": 4}").unwrap();
        assert_eq!(single.grid, TileGrid::SINGLE);

        assert!(parse_viewer_meta("{\"pages\": 0}").is_none());
        assert!(parse_viewer_meta("{\"pages\": 18446744073709551615}").is_none());
        assert!(parse_viewer_meta("{\"pages\": 1048577}").is_none());
        assert!(parse_viewer_meta("{\"pages\": 1048576, \"tileRows\": 64, \"tileCols\": 64}").is_some());
        assert!(parse_viewer_meta("{\"pages\": 10, \"tileRows\": 4294967295}").is_none());
        assert!(parse_viewer_meta("{\"pages\": 10, \"tileCols\": 65}").is_none());
        assert!(parse_viewer_meta("<html>sign in</html>").is_none());
    }

    #[test]
    fn default_file_names() {
        let mut handle = FileHandle {
            identifier: "abc".into(),
            title: Some("  Holiday/Trip ".into()),
            kind: FileKind::ViewOnly { total_frames: 1, grid: TileGrid::SINGLE },
        };
        assert_eq!(handle.default_file_name(), "Holiday_Trip.mp4");

        handle.title = Some("clip.webm".into());
        assert_eq!(handle.default_file_name(), "clip.webm");

        handle.title = Some("   ".into());
        assert_eq!(handle.default_file_name(), "video_abc.mp4");
    }

    async fn count_with(total: usize, max: usize) -> (usize, usize) {
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);
        let count = count_pages(max, move |page| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(page < total) }
        })
        .await
        .unwrap();
        (count, requests.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn page_count_search() {
        for total in [0, 1, 2, 3, 7, 8, 9, 100, 1000] {
            let (count, requests) = count_with(total, 1 << 20).await;
            assert_eq!(count, total, "total {}", total);
            // doubling plus bisection stays logarithmic
            assert!(requests <= 2 * 12 + 2, "{} requests for {} pages", requests, total);
        }

        let (capped, _) = count_with(5000, 64).await;
        assert_eq!(capped, 64);
    }

    #[tokio::test]
    async fn page_count_propagates_errors() {
        let err = count_pages(100, |page| async move {
            if page < 4 {
                Ok(true)
            } else {
                Err(DriveError::PermanentReject("403".into()))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, DriveError::PermanentReject(_)));
    }

    mod resolve {
        use std::collections::HashMap;

        use axum::extract::{Query, State};
        use axum::http::{header, HeaderMap, StatusCode};
        use axum::response::{IntoResponse, Redirect, Response};
        use axum::routing::get;
        use axum::Router;
        use parking_lot::Mutex;

        use super::*;
        use crate::cookies::Session;
        use crate::download::testing::{local_options, serve};

        #[derive(Clone)]
        enum InfoReply {
            Body(StatusCode, &'static str),
            Stream,
            SignIn,
        }

        /// Just enough of the service for the resolver: video info, viewer
        /// metadata, single-tile pages below `pages`, and a sign-in page.
        #[derive(Clone)]
        struct FakeDrive {
            info: InfoReply,
            meta: (StatusCode, &'static str),
            pages: usize,
            hits: Arc<Mutex<Vec<&'static str>>>,
        }

        impl Default for FakeDrive {
            fn default() -> Self {
                Self {
                    info: InfoReply::Body(StatusCode::OK, "status=fail&reason=Playback+unavailable"),
                    meta: (StatusCode::NOT_FOUND, ""),
                    pages: 0,
                    hits: Default::default(),
                }
            }
        }

        async fn video_info(State(drive): State<FakeDrive>, headers: HeaderMap) -> Response {
            drive.hits.lock().push("info");
            match drive.info {
                InfoReply::Body(status, body) => (status, body).into_response(),
                InfoReply::Stream => {
                    let host = headers.get(header::HOST).and_then(|value| value.to_str().ok()).unwrap_or_default();
                    url::form_urlencoded::Serializer::new(String::new())
                        .append_pair("status", "ok")
                        .append_pair("title", "Clip.mov")
                        .append_pair("fmt_stream_map", &format!("18|http://{}/videoplayback?id=7", host))
                        .finish()
                        .into_response()
                }
                InfoReply::SignIn => Redirect::to("/ServiceLogin?continue=drive").into_response(),
            }
        }

        async fn viewer_meta(State(drive): State<FakeDrive>) -> Response {
            drive.hits.lock().push("meta");
            drive.meta.into_response()
        }

        async fn viewer_img(State(drive): State<FakeDrive>, Query(params): Query<HashMap<String, String>>) -> StatusCode {
            drive.hits.lock().push("img");
            match params.get("page").and_then(|page| page.parse::<usize>().ok()) {
                Some(page) if page < drive.pages => StatusCode::OK,
                _ => StatusCode::NOT_FOUND,
            }
        }

        async fn stream(State(drive): State<FakeDrive>) -> &'static str {
            drive.hits.lock().push("stream");
            "video bytes"
        }

        async fn sign_in(State(drive): State<FakeDrive>) -> &'static str {
            drive.hits.lock().push("sign-in");
            "<html>Sign in to continue</html>"
        }

        async fn resolve_against(drive: &FakeDrive) -> Result<FileHandle> {
            let app = Router::new()
                .route("/u/0/get_video_info", get(video_info))
                .route("/viewerng/meta", get(viewer_meta))
                .route("/viewerng/img", get(viewer_img))
                .route("/videoplayback", get(stream))
                .route("/ServiceLogin", get(sign_in))
                .with_state(drive.clone());
            let options = local_options(serve(app).await);
            let client = DriveClient::new(&options, Session::anonymous()).unwrap();

            MetadataResolver::new(options.retry_policy())
                .resolve(&client, "file123", &CancellationToken::new())
                .await
        }

        #[tokio::test]
        async fn playable_file_is_direct() {
            let drive = FakeDrive { info: InfoReply::Stream, ..FakeDrive::default() };

            let handle = resolve_against(&drive).await.unwrap();

            assert_eq!(handle.title.as_deref(), Some("Clip.mov"));
            match handle.kind {
                FileKind::Direct { stream_url, .. } => {
                    assert_eq!(stream_url.path(), "/videoplayback");
                    assert_eq!(stream_url.query(), Some("id=7"));
                }
                other => panic!("expected a direct file, got {:?}", other),
            }
            assert_eq!(drive.hits.lock()[0], "info");
            assert!(!drive.hits.lock().contains(&"meta"));
        }

        #[tokio::test]
        async fn viewer_metadata_is_asked_first() {
            let drive = FakeDrive {
                meta: (StatusCode::OK, ")]}'\n{\"pages\": 30, \"tileRows\": 2, \"tileCols\": 2, \"title\": \"Lecture\"}"),
                pages: 30,
                ..FakeDrive::default()
            };

            let handle = resolve_against(&drive).await.unwrap();

            assert_eq!(handle.title.as_deref(), Some("Lecture"));
            assert_eq!(handle.kind, FileKind::ViewOnly { total_frames: 30, grid: TileGrid { rows: 2, cols: 2 } });
            assert_eq!(*drive.hits.lock(), vec!["info", "meta"]);
        }

        #[tokio::test]
        async fn refused_metadata_falls_back_to_counting_pages() {
            let drive = FakeDrive { meta: (StatusCode::BAD_REQUEST, "bad request"), pages: 7, ..FakeDrive::default() };

            let handle = resolve_against(&drive).await.unwrap();

            assert_eq!(handle.kind, FileKind::ViewOnly { total_frames: 7, grid: TileGrid::SINGLE });
            let hits = drive.hits.lock();
            assert_eq!(&hits[..2], &["info", "meta"]);
            assert!(hits.len() > 2 && hits[2..].iter().all(|hit| *hit == "img"), "{:?}", hits);
        }

        #[tokio::test]
        async fn missing_file_is_not_found() {
            let drive = FakeDrive {
                info: InfoReply::Body(StatusCode::OK, "status=fail&errorcode=100&reason=Not+here"),
                ..FakeDrive::default()
            };

            let err = resolve_against(&drive).await.unwrap_err();

            assert!(matches!(err, DriveError::NotFound(_)), "{}", err);
            assert_eq!(*drive.hits.lock(), vec!["info"]);
        }

        #[tokio::test]
        async fn forbidden_metadata_needs_sign_in() {
            let drive = FakeDrive { info: InfoReply::Body(StatusCode::FORBIDDEN, ""), ..FakeDrive::default() };

            let err = resolve_against(&drive).await.unwrap_err();

            assert!(matches!(err, DriveError::AuthRequired(_)), "{}", err);
            assert_eq!(*drive.hits.lock(), vec!["info"]);
        }

        #[tokio::test]
        async fn redirect_to_sign_in_needs_sign_in() {
            let drive = FakeDrive { info: InfoReply::SignIn, ..FakeDrive::default() };

            let err = resolve_against(&drive).await.unwrap_err();

            assert!(matches!(err, DriveError::AuthRequired(_)), "{}", err);
            assert_eq!(*drive.hits.lock(), vec!["info", "sign-in"]);
        }

        #[tokio::test]
        async fn nothing_to_count_is_unsupported() {
            let drive = FakeDrive::default();

            let err = resolve_against(&drive).await.unwrap_err();

            assert!(matches!(err, DriveError::Unsupported(_)), "{}", err);
            assert_eq!(*drive.hits.lock(), vec!["info", "meta", "img"]);
        }
    }

    #[test]
    fn metadata_refusal_means_sign_in() {
        assert!(matches!(
            as_metadata_error(DriveError::PermanentReject("403".into())),
            DriveError::AuthRequired(_)
        ));
        assert!(matches!(as_metadata_error(DriveError::NotFound("x".into())), DriveError::NotFound(_)));
    }
}
