//! Trace and catalog row streams
//!
//! Both files are CSV with a header; lines starting with `#` are comments.
//! Trace timestamps are anchored against the first row seen, so replays
//! always start at simulated time zero regardless of the trace epoch.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SimError};
use crate::models::{PeerId, Video, VideoId, CLIENT_ID_BASE};

/// One request to replay, with its delay relative to the trace start.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub delay_s: f64,
    /// Already normalized into the client id range.
    pub client_id: PeerId,
    pub video_id: VideoId,
    pub server_id: PeerId,
}

#[derive(Debug, Deserialize)]
struct TraceRow {
    id_client: u64,
    id_video: String,
    id_server: u64,
    req_timestamp: f64,
}

#[derive(Debug, Deserialize)]
struct CatalogRow {
    id_server: u64,
    id_video: String,
    duration: u64,
    size: f64,
    bitrate: f64,
    title: String,
    description: String,
}

fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| SimError::TraceParse(format!("{}: {e}", path.display())))
}

/// Load the request trace. Client ids are offset into the client range and
/// every timestamp is rebased on the first row.
pub fn load_trace(path: &Path) -> Result<Vec<TraceEvent>> {
    let mut events = Vec::new();
    let mut first_timestamp = None;

    for row in reader(path)?.deserialize() {
        let row: TraceRow =
            row.map_err(|e| SimError::TraceParse(format!("{}: {e}", path.display())))?;
        let first = *first_timestamp.get_or_insert(row.req_timestamp);
        events.push(TraceEvent {
            delay_s: row.req_timestamp - first,
            client_id: row.id_client + CLIENT_ID_BASE,
            video_id: row.id_video,
            server_id: row.id_server,
        });
    }

    debug!(path = %path.display(), events = events.len(), "trace loaded");
    Ok(events)
}

/// Load the video catalog as `(server_id, video)` pairs, in file order.
pub fn load_catalog(path: &Path) -> Result<Vec<(PeerId, Video)>> {
    let mut videos = Vec::new();

    for row in reader(path)?.deserialize() {
        let row: CatalogRow =
            row.map_err(|e| SimError::CatalogParse(format!("{}: {e}", path.display())))?;
        videos.push((
            row.id_server,
            Video {
                id: row.id_video,
                duration_s: row.duration,
                size_kb: row.size,
                bitrate_kb_s: row.bitrate,
                title: row.title,
                description: row.description,
            },
        ));
    }

    debug!(path = %path.display(), videos = videos.len(), "catalog loaded");
    Ok(videos)
}
