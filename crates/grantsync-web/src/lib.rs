//! Axum review desk: answers a running sync's region, province and duplicate questions over
//! HTTP and shows the run summary afterwards.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use grantsync_core::EntityKind;
use grantsync_sync::{SyncConfig, SyncRunSummary};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub mod desk;

pub use desk::{
    DeskError, DeskSummary, DuplicateDecision, Pending, PendingPrompt, ProvinceDecision,
    RegionDecision, ReviewDesk, WebOperator, DUPLICATE_OPTIONS,
};

pub const CRATE_NAME: &str = "grantsync-web";

#[derive(Clone)]
pub struct AppState {
    pub desk: Arc<ReviewDesk>,
}

impl AppState {
    pub fn new(desk: Arc<ReviewDesk>) -> Self {
        Self { desk }
    }
}

#[derive(Debug, Deserialize)]
struct RegionChoice {
    city: String,
    region: String,
}

#[derive(Debug, Deserialize)]
struct ProvinceChoice {
    company: String,
    province: String,
}

/// 1 = insert, 2 = skip, 3 = update, 4 = show details.
#[derive(Debug, Deserialize)]
struct DuplicateChoice {
    choice: u8,
    target_id: Option<i64>,
}

#[derive(Template)]
#[template(
    ext = "html",
    source = r#"<!doctype html>
<html>
<head><title>grantsync review desk</title></head>
<body>
<h1>Review desk</h1>
{% if finished %}<p>Run finished. <a href="/summary">Summary</a></p>{% endif %}
<h2>{{ heading }}</h2>
<ul>
{% for line in lines %}<li>{{ line }}</li>
{% endfor %}</ul>
{% if !messages.is_empty() %}<pre>{% for message in messages %}{{ message }}
{% endfor %}</pre>{% endif %}
<p>{{ decided }} decisions taken.</p>
</body>
</html>"#
)]
struct IndexTemplate {
    finished: bool,
    heading: String,
    lines: Vec<String>,
    messages: Vec<String>,
    decided: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/next-city", get(next_city_handler))
        .route("/assign-region", post(assign_region_handler))
        .route("/next-province", get(next_province_handler))
        .route("/assign-province", post(assign_province_handler))
        .route("/next-person-duplicate", get(next_person_handler))
        .route("/resolve-person-duplicate", post(resolve_person_handler))
        .route("/next-company-duplicate", get(next_company_handler))
        .route("/resolve-company-duplicate", post(resolve_company_handler))
        .route("/summary", get(summary_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("GRANTSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

/// Serves the review desk on `port` while one interactive sync run asks its questions
/// through it. The summary stays available until the process is interrupted.
pub async fn serve_review(
    config: SyncConfig,
    fixture: Option<PathBuf>,
    port: u16,
) -> anyhow::Result<SyncRunSummary> {
    let (desk, mut operator) = ReviewDesk::open();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding review desk on port {port}"))?;
    info!(port, "review desk listening");
    let server = tokio::spawn(
        axum::serve(listener, app(AppState::new(Arc::clone(&desk))))
            .with_graceful_shutdown(shutdown_signal())
            .into_future(),
    );

    let outcome = grantsync_sync::run_sync_with(config, fixture, Some(&mut operator)).await;
    match &outcome {
        Ok(summary) => desk.complete(summary.clone()),
        Err(err) => desk.fail(format!("{err:#}")),
    }
    info!("sync finished; summary served at /summary until interrupted");
    server.await.context("review desk server task")??;
    outcome
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c; shutting down");
    }
}

fn idle(desk: &ReviewDesk) -> Json<serde_json::Value> {
    Json(json!({"done": true, "run_finished": desk.is_finished()}))
}

fn desk_error(err: DeskError) -> Response {
    let status = match err {
        DeskError::NothingPending(_) | DeskError::Mismatch { .. } => StatusCode::CONFLICT,
        DeskError::Invalid { .. } | DeskError::UnknownTarget => StatusCode::UNPROCESSABLE_ENTITY,
        DeskError::Closed => StatusCode::GONE,
    };
    (
        status,
        Json(json!({"status": "error", "message": err.to_string()})),
    )
        .into_response()
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let summary = state.desk.summary();
    let (heading, lines, messages) = match state.desk.pending() {
        Some(prompt) => {
            let (heading, lines) = describe(&prompt.pending);
            (heading, lines, prompt.messages)
        }
        None => ("Nothing pending".to_string(), Vec::new(), Vec::new()),
    };
    render_html(IndexTemplate {
        finished: state.desk.is_finished(),
        heading,
        lines,
        messages,
        decided: summary.decision_count(),
    })
}

fn describe(pending: &Pending) -> (String, Vec<String>) {
    match pending {
        Pending::Region { city, options } => {
            (format!("Region for city '{city}'"), options.clone())
        }
        Pending::Province { company } => (format!("Province for company '{company}'"), Vec::new()),
        Pending::Duplicate {
            kind,
            name,
            contact,
            matches,
        } => (
            format!("Possible duplicate {kind}: {name} ({contact})"),
            match_lines(matches),
        ),
        Pending::Target {
            kind,
            purpose,
            matches,
        } => (format!("Choose the {kind} ({purpose:?})"), match_lines(matches)),
    }
}

fn match_lines(matches: &[grantsync_core::CandidateView]) -> Vec<String> {
    matches
        .iter()
        .map(|m| {
            format!(
                "ID {}: {} ({}) similarity {:.2}",
                m.id, m.name, m.contact, m.similarity
            )
        })
        .collect()
}

async fn next_city_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.desk.pending() {
        Some(PendingPrompt {
            pending: Pending::Region { city, options },
            messages,
        }) => Json(json!({"city": city, "options": options, "messages": messages})),
        _ => idle(&state.desk),
    }
}

async fn assign_region_handler(
    State(state): State<Arc<AppState>>,
    Json(choice): Json<RegionChoice>,
) -> Response {
    match state.desk.assign_region(&choice.city, &choice.region) {
        Ok(decision) => Json(json!({"status": "ok", "assigned": decision})).into_response(),
        Err(err) => desk_error(err),
    }
}

async fn next_province_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.desk.pending() {
        Some(PendingPrompt {
            pending: Pending::Province { company },
            messages,
        }) => Json(json!({"company": company, "messages": messages})),
        _ => idle(&state.desk),
    }
}

async fn assign_province_handler(
    State(state): State<Arc<AppState>>,
    Json(choice): Json<ProvinceChoice>,
) -> Response {
    match state.desk.assign_province(&choice.company, &choice.province) {
        Ok(decision) => Json(json!({"status": "ok", "assigned": decision})).into_response(),
        Err(err) => desk_error(err),
    }
}

fn next_duplicate(desk: &ReviewDesk, kind: EntityKind) -> Json<serde_json::Value> {
    match desk.pending() {
        Some(PendingPrompt {
            pending:
                Pending::Duplicate {
                    kind: pending_kind,
                    name,
                    contact,
                    matches,
                },
            messages,
        }) if pending_kind == kind => Json(json!({
            "name": name,
            "contact": contact,
            "matches": matches,
            "options": DUPLICATE_OPTIONS,
            "messages": messages,
        })),
        _ => idle(desk),
    }
}

fn resolve_duplicate(desk: &ReviewDesk, kind: EntityKind, choice: DuplicateChoice) -> Response {
    let target = choice.target_id.map(|id| id.to_string());
    match desk.resolve_duplicate(kind, choice.choice, target.as_deref()) {
        Ok(_) => Json(json!({
            "status": "resolved",
            "action": choice.choice,
            "target": choice.target_id,
        }))
        .into_response(),
        Err(err) => desk_error(err),
    }
}

async fn next_person_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    next_duplicate(&state.desk, EntityKind::Person)
}

async fn resolve_person_handler(
    State(state): State<Arc<AppState>>,
    Json(choice): Json<DuplicateChoice>,
) -> Response {
    resolve_duplicate(&state.desk, EntityKind::Person, choice)
}

async fn next_company_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    next_duplicate(&state.desk, EntityKind::Company)
}

async fn resolve_company_handler(
    State(state): State<Arc<AppState>>,
    Json(choice): Json<DuplicateChoice>,
) -> Response {
    resolve_duplicate(&state.desk, EntityKind::Company, choice)
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Json<DeskSummary> {
    Json(state.desk.summary())
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Server error: {err}")),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use grantsync_adapters::mapping::map_region;
    use grantsync_adapters::{MappingTables, RegionTable};
    use grantsync_core::{
        Company, CompanyId, ExistingCompany, OperatorPort, OperatorReply, PromptRequest,
        Resolution,
    };
    use grantsync_dedupe::{Adjudication, Resolver, SimilarityMetric};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn page(app: &Router, uri: &str) -> String {
        let resp = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Polls `uri` until the sync side has put a prompt of that kind on the desk.
    async fn wait_for(app: &Router, uri: &str) -> Value {
        for _ in 0..500 {
            let (_, body) = call(app, "GET", uri, None).await;
            if body.get("done").is_none() {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("nothing became pending at {uri}");
    }

    fn company(name: &str) -> Company {
        Company {
            name: name.into(),
            address: Some("1 Main St".into()),
            city: Some("Saint John".into()),
            province: Some("NB".into()),
            postal_code: None,
            country: Some("Canada".into()),
            region: Some("SW".into()),
            incorporation_date: None,
        }
    }

    fn existing_company(id: i64, name: &str) -> ExistingCompany {
        ExistingCompany {
            company_id: CompanyId(id),
            name: name.into(),
            address: None,
            city: None,
            province: None,
        }
    }

    #[tokio::test]
    async fn idle_desk_reports_done_and_rejects_answers() {
        let (desk, _operator) = ReviewDesk::open();
        let app = app(AppState::new(desk));

        let (status, body) = call(&app, "GET", "/next-city", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"done": true, "run_finished": false}));

        let (status, body) = call(
            &app,
            "POST",
            "/assign-region",
            Some(json!({"city": "Minto", "region": "NE"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "error");

        let html = page(&app, "/").await;
        assert!(html.contains("Nothing pending"));
    }

    #[tokio::test]
    async fn company_duplicate_is_resolved_through_the_desk() {
        let (desk, mut operator) = ReviewDesk::open();
        let app = app(AppState::new(Arc::clone(&desk)));
        let sync_side = tokio::task::spawn_blocking(move || {
            let existing = vec![
                existing_company(1, "Fundy Marine"),
                existing_company(2, "Fundy Marine Inc"),
                existing_company(3, "Fundy Maritime"),
            ];
            Resolver::new(0.75, SimilarityMetric::RatcliffObershelp).resolve_one(
                company("Fundy Marine Ltd"),
                &existing,
                &mut Adjudication::Interactive(&mut operator),
            )
        });

        let pending = wait_for(&app, "/next-company-duplicate").await;
        assert_eq!(pending["name"], "Fundy Marine Ltd");
        assert_eq!(pending["matches"].as_array().unwrap().len(), 3);
        assert_eq!(pending["matches"][1]["id"], "2");
        assert_eq!(pending["options"][3], "Show details");
        let (_, other_kind) = call(&app, "GET", "/next-person-duplicate", None).await;
        assert_eq!(other_kind["done"], true);

        let (status, _) = call(
            &app,
            "POST",
            "/resolve-company-duplicate",
            Some(json!({"choice": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let again = wait_for(&app, "/next-company-duplicate").await;
        assert!(again["messages"]
            .as_array()
            .unwrap()
            .iter()
            .any(|m| m.as_str().unwrap().contains("New company details:")));

        let (status, body) = call(
            &app,
            "POST",
            "/resolve-company-duplicate",
            Some(json!({"choice": 2, "target_id": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["message"], "target_id must name one of the displayed matches");

        let (status, body) = call(
            &app,
            "POST",
            "/resolve-company-duplicate",
            Some(json!({"choice": 2, "target_id": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "resolved", "action": 2, "target": 2}));

        let Resolution::Skip(skipped) = sync_side.await.unwrap().unwrap() else {
            panic!("expected a skip");
        };
        assert_eq!(skipped.matched, CompanyId(2));

        let (_, summary) = call(&app, "GET", "/summary", None).await;
        assert_eq!(summary["companies"].as_array().unwrap().len(), 1);
        assert_eq!(summary["companies"][0]["action"], "skip");
        assert_eq!(summary["companies"][0]["target_id"], "2");
    }

    #[tokio::test]
    async fn unknown_city_region_comes_from_the_desk() {
        let (desk, mut operator) = ReviewDesk::open();
        let app = app(AppState::new(Arc::clone(&desk)));
        let sync_side = tokio::task::spawn_blocking(move || {
            let tables = MappingTables::embedded().unwrap();
            let mut regions = RegionTable::seeded(&tables);
            let region = map_region("Tabusintac Falls", &mut regions, Some(&mut operator))?;
            Ok::<_, std::io::Error>((region, regions.learned().len()))
        });

        let pending = wait_for(&app, "/next-city").await;
        assert_eq!(pending["city"], "Tabusintac Falls");
        assert_eq!(pending["options"], json!(["NE", "NW", "SE", "SW"]));

        let (status, _) = call(
            &app,
            "POST",
            "/assign-region",
            Some(json!({"city": "Minto", "region": "NE"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = call(
            &app,
            "POST",
            "/assign-region",
            Some(json!({"city": "Tabusintac Falls", "region": "north"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(desk.pending().is_some(), "invalid answers leave the prompt open");

        let (status, body) = call(
            &app,
            "POST",
            "/assign-region",
            Some(json!({"city": "Tabusintac Falls", "region": "ne"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["assigned"], json!({"city": "Tabusintac Falls", "region": "NE"}));

        let (region, learned) = sync_side.await.unwrap().unwrap();
        assert_eq!(region.as_deref(), Some("NE"));
        assert_eq!(learned, 1);
        assert_eq!(desk.summary().cities[0].region, "NE");
    }

    #[tokio::test]
    async fn province_prompt_shows_on_the_index_page() {
        let (desk, mut operator) = ReviewDesk::open();
        let app = app(AppState::new(Arc::clone(&desk)));
        let sync_side = tokio::task::spawn_blocking(move || {
            operator.show("Acme Peat has no province on file");
            operator.ask(&PromptRequest::Province {
                company: "Acme Peat",
            })
        });

        let pending = wait_for(&app, "/next-province").await;
        assert_eq!(pending["company"], "Acme Peat");
        let html = page(&app, "/").await;
        assert!(html.contains("Province for company"));
        assert!(html.contains("has no province on file"));

        let (status, _) = call(
            &app,
            "POST",
            "/assign-province",
            Some(json!({"company": "Acme Peat", "province": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let (status, _) = call(
            &app,
            "POST",
            "/assign-province",
            Some(json!({"company": "Acme Peat", "province": "ns"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let reply = sync_side.await.unwrap().unwrap();
        assert_eq!(reply, OperatorReply::Province("NS".into()));
        assert_eq!(desk.summary().decision_count(), 1);
    }

    #[tokio::test]
    async fn failed_run_releases_a_blocked_operator() {
        let (desk, mut operator) = ReviewDesk::open();
        let app = app(AppState::new(Arc::clone(&desk)));
        let sync_side = tokio::task::spawn_blocking(move || {
            operator.ask(&PromptRequest::Province { company: "Acme" })
        });
        wait_for(&app, "/next-province").await;

        desk.fail("database went away".into());
        let err = sync_side.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        let (_, idle) = call(&app, "GET", "/next-province", None).await;
        assert_eq!(idle, json!({"done": true, "run_finished": true}));
        let (status, _) = call(
            &app,
            "POST",
            "/assign-province",
            Some(json!({"company": "Acme", "province": "NB"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (_, summary) = call(&app, "GET", "/summary", None).await;
        assert_eq!(summary["error"], "database went away");
        assert!(summary["run"].is_null());
    }
}
