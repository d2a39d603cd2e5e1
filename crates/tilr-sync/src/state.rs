//! Continuation state persisted under string keys between ticks.

use tilr_core::{
    ContinuationState, Phase, CHUNK_CURSOR_KEY, CYCLE_ID_KEY, FETCH_CURSOR_KEY, TASK_KEY,
};
use tilr_storage::ContinuationStore;
use uuid::Uuid;

use crate::error::{integrity, SyncError};

/// Missing keys read as `IDLE`, zero cursors and no cycle.
pub async fn load_state(store: &dyn ContinuationStore) -> Result<ContinuationState, SyncError> {
    let phase = match store.get(TASK_KEY).await? {
        Some(marker) if !marker.trim().is_empty() => Phase::from_marker(&marker)
            .ok_or_else(|| integrity(format!("unknown {TASK_KEY} marker `{marker}`")))?,
        _ => Phase::Idle,
    };
    let fetch_cursor = read_number(store, FETCH_CURSOR_KEY).await?.unwrap_or_default();
    let chunk_cursor = read_number(store, CHUNK_CURSOR_KEY)
        .await?
        .map(|v| v as usize)
        .unwrap_or_default();
    let cycle_id = match store.get(CYCLE_ID_KEY).await? {
        Some(raw) if !raw.trim().is_empty() => Some(
            Uuid::parse_str(raw.trim())
                .map_err(|_| integrity(format!("invalid {CYCLE_ID_KEY} `{raw}`")))?,
        ),
        _ => None,
    };

    Ok(ContinuationState {
        phase,
        fetch_cursor,
        chunk_cursor,
        cycle_id,
    })
}

async fn read_number(store: &dyn ContinuationStore, key: &str) -> Result<Option<u64>, SyncError> {
    match store.get(key).await? {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| integrity(format!("invalid {key} `{raw}`"))),
        _ => Ok(None),
    }
}

/// Writes every key in one store call, so a failed save leaves the
/// previous phase and cursors in place together.
pub async fn save_state(
    store: &dyn ContinuationStore,
    state: &ContinuationState,
) -> Result<(), SyncError> {
    let fetch_cursor = state.fetch_cursor.to_string();
    let chunk_cursor = state.chunk_cursor.to_string();
    let cycle_id = state.cycle_id.map(|id| id.to_string());
    store
        .apply(&[
            (FETCH_CURSOR_KEY, Some(fetch_cursor.as_str())),
            (CHUNK_CURSOR_KEY, Some(chunk_cursor.as_str())),
            (CYCLE_ID_KEY, cycle_id.as_deref()),
            (TASK_KEY, Some(state.phase.as_str())),
        ])
        .await?;
    Ok(())
}
