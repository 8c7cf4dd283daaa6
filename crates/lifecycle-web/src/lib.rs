//! Axum admin surface for the reconciler: manual trigger and last-run report.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lifecycle_reconcile::{IncompletePass, ReconcileHandle, ReconcileSummary, Trigger};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "lifecycle-web";

#[derive(Clone)]
pub struct AppState {
    pub handle: ReconcileHandle,
}

impl AppState {
    pub fn new(handle: ReconcileHandle) -> Self {
        Self { handle }
    }
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows_updated: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ReconcileSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/admin/reconcile", post(trigger_handler))
        .route("/admin/reconcile/last", get(last_run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin surface listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.handle.trigger(Trigger::Manual).await {
        Ok(summary) => Json(TriggerResponse {
            ok: true,
            rows_updated: Some(summary.rows_updated()),
            summary: Some(summary),
            error: None,
        })
        .into_response(),
        Err(err) => {
            let message = format!("{err:#}");
            error!(error = %message, "manual reconciliation failed");
            let partial = IncompletePass::summary_of(&err).cloned();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TriggerResponse {
                    ok: false,
                    rows_updated: partial.as_ref().map(ReconcileSummary::rows_updated),
                    summary: partial,
                    error: Some(message),
                }),
            )
                .into_response()
        }
    }
}

async fn last_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.handle.last_run().await {
        Some(last) => Json(last).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no reconciliation has run yet" })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{NaiveDate, TimeZone, Utc};
    use http_body_util::BodyExt;
    use lifecycle_core::{Campaign, CampaignStatus, FixedClock, ReferenceZone};
    use lifecycle_reconcile::Reconciler;
    use lifecycle_storage::MemoryLifecycleStore;
    use tower::ServiceExt;

    async fn seeded_store() -> MemoryLifecycleStore {
        let day = |d| {
            NaiveDate::from_ymd_opt(2024, 1, d)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        };
        let store = MemoryLifecycleStore::new();
        store
            .insert_campaign(Campaign {
                campaign_id: 1,
                start_date: Some(day(10).into()),
                end_date: Some(day(20).into()),
                status: CampaignStatus::Upcoming.into(),
            })
            .await;
        store
    }

    fn state_for(store: &MemoryLifecycleStore) -> AppState {
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 1, 15, 6, 0, 0).unwrap());
        let reconciler = Reconciler::new(Arc::new(store.clone()), ReferenceZone::utc())
            .with_clock(Arc::new(clock));
        AppState::new(ReconcileHandle::new(reconciler))
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_trigger() -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/admin/reconcile")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_healthz() {
        let store = MemoryLifecycleStore::new();
        let resp = app(state_for(&store))
            .oneshot(axum::http::Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn manual_trigger_runs_a_pass_and_reports_updates() {
        let store = seeded_store().await;
        let resp = app(state_for(&store)).oneshot(post_trigger()).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["rows_updated"], 1);
        assert_eq!(body["summary"]["campaigns"]["transitions"][0]["to"], "active");
        assert!(store.campaign(1).await.unwrap().status.is(&CampaignStatus::Active));
    }

    #[tokio::test]
    async fn manual_trigger_reports_failure() {
        let store = seeded_store().await;
        store.set_unavailable(true);
        let resp = app(state_for(&store)).oneshot(post_trigger()).await.unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["rows_updated"], 0);
        assert!(body["error"].as_str().unwrap().contains("listing campaigns"));
        assert!(body["summary"]["participations"]["listing_error"]
            .as_str()
            .unwrap()
            .contains("listing participations"));
    }

    #[tokio::test]
    async fn last_run_is_empty_until_a_pass_runs() {
        let store = seeded_store().await;
        let app = app(state_for(&store));

        let before = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/admin/reconcile/last")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(before.status(), StatusCode::NOT_FOUND);

        app.clone().oneshot(post_trigger()).await.unwrap();

        let after = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/admin/reconcile/last")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(after.status(), StatusCode::OK);
        let body = json_body(after).await;
        assert_eq!(body["outcome"], "succeeded");
        assert_eq!(body["trigger"], "manual");
    }
}
