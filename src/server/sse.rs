//! SSE adapter: per-job progress streams as `text/event-stream`.
//!
//! Frames are `event: <kind>\ndata: <json>\n\n`; the stream terminates after
//! a `job_completed` or `error` event. Late subscribers to a finished job
//! get one synthetic terminal event. Heartbeats come from the progress bus,
//! so idle connections and intermediaries never time out.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream};
use serde_json::json;

use crate::ids::JobId;
use crate::progress::ProgressStream;

use super::AppState;

pub async fn stream_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id = JobId::from(job_id.as_str());
    match state.engine.manager().stream(&job_id).await {
        Ok(progress) => {
            let sse = Sse::new(event_stream(progress));
            ([(header::CACHE_CONTROL, "no-cache")], sse).into_response()
        }
        Err(err) => (
            StatusCode::NOT_FOUND,
            axum::Json(json!({"error": "not_found", "message": err.to_string()})),
        )
            .into_response(),
    }
}

/// Yield SSE frames until the job's terminal event (inclusive), then close.
fn event_stream(progress: ProgressStream) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(progress), |state| async move {
        let mut progress = state?;
        let event = progress.recv().await?;
        let terminal = event.is_terminal();
        let frame = Event::default()
            .event(event.kind())
            .data(event.data().to_string());
        let next = if terminal { None } else { Some(progress) };
        Some((Ok(frame), next))
    })
}
