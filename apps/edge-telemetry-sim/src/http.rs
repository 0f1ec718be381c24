use crate::publisher::LoopStatus;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;

#[derive(Clone)]
pub struct HttpState {
    pub status: watch::Receiver<LoopStatus>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<LoopStatus> {
    Json(state.status.borrow().clone())
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::LoopState;

    fn status(messages: u64) -> LoopStatus {
        LoopStatus {
            device_id: "dev-a".to_string(),
            state: LoopState::Publishing,
            messages_published: messages,
            inference_attempts: 0,
            inference_failures: 0,
            metrics_recorded: 0,
            last_saved: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn status_reflects_latest_snapshot() {
        let (tx, rx) = watch::channel(status(1));
        let state = HttpState { status: rx };
        tx.send_replace(status(7));

        let Json(body) = get_status(State(state)).await;
        assert_eq!(body.messages_published, 7);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["state"], "publishing");
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        assert_eq!(healthz().await, "ok");
    }
}
