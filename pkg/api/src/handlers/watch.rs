use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use pkg_state::events::RegistryEvent;
use pkg_types::instance::ActionType;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    #[serde(default)]
    pub app: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
}

/// One registry change as streamed to watchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent {
    pub version: u64,
    pub action: ActionType,
    pub app_name: String,
    pub instance_id: String,
}

fn to_sse(event: &WatchEvent) -> Option<Result<Event, Infallible>> {
    serde_json::to_string(event)
        .ok()
        .map(|data| Ok(Event::default().event("change").data(data)))
}

/// GET /api/v1/watch: SSE stream of registry changes.
///
/// Changes still held in the recent-changes log after `version` are replayed
/// first, then live changes follow.
pub async fn watch_changes(
    State(state): State<AppState>,
    Query(query): Query<WatchQuery>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let app = query.app.map(|a| a.to_uppercase()).unwrap_or_default();
    let from_version = query.version.unwrap_or(0);

    info!("Watch subscription: app='{}', from_version={}", app, from_version);

    // Subscribe before reading the log so nothing falls between the two.
    let rx = state.registry.events().subscribe();
    let buffered = state.registry.recent_changes().changes_since(from_version);
    let replayed_up_to = buffered.current;

    let app_live = app.clone();
    let buffered_stream = tokio_stream::iter(
        buffered
            .changes
            .into_iter()
            .filter(move |c| app.is_empty() || c.record.app_name == app)
            .filter_map(|c| {
                to_sse(&WatchEvent {
                    version: c.version,
                    action: c.action,
                    app_name: c.record.app_name.clone(),
                    instance_id: c.record.instance_id.clone(),
                })
            }),
    );

    let live_stream = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(RegistryEvent::Changed {
            version,
            action,
            app_name,
            instance_id,
            ..
        }) if version > replayed_up_to && (app_live.is_empty() || app_name == app_live) => {
            to_sse(&WatchEvent {
                version,
                action,
                app_name,
                instance_id,
            })
        }
        _ => None,
    });

    Sse::new(buffered_stream.chain(live_stream)).keep_alive(KeepAlive::default())
}
