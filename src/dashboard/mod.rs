use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::db::models::{FixtureDoc, FixtureKey, MatchScore, TeamScore};
use crate::db::Database;
use crate::engine::{FixtureDetail, MonthDay, RegionFixtures, RegionGroup, Tracker};
use crate::error::{AggregateError, PartialFailure, SubscriptionError};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub tracker: Tracker,
    /// Zone "today" is taken in when a request names no date
    pub zone: FixedOffset,
}

/// Build the Axum router for the dashboard.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/regions", get(regions_handler))
        .route("/api/regions/:region/fixtures", get(region_fixtures_handler))
        .route("/api/matches", get(matches_handler))
        .route("/api/live", get(live_handler))
        .route(
            "/api/regions/:region/competitions/:competition/fixtures",
            post(create_fixture_handler),
        )
        .route(
            "/api/fixtures/:region/:competition/:fixture",
            get(fixture_detail_handler),
        )
        .route(
            "/api/fixtures/:region/:competition/:fixture/scores",
            post(submit_score_handler),
        )
        .route(
            "/api/fixtures/:region/:competition/:fixture/result",
            post(official_result_handler),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

type ApiError = (StatusCode, String);

#[derive(Debug, Deserialize)]
pub struct DateQuery {
    /// "MM-DD" or "YYYY-MM-DD"; today when absent
    pub date: Option<String>,
}

impl DateQuery {
    fn target(&self, zone: FixedOffset) -> Result<MonthDay, ApiError> {
        match self.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            Some(raw) => raw
                .parse()
                .map_err(|e: String| (StatusCode::BAD_REQUEST, e)),
            None => Ok(today(zone)),
        }
    }
}

pub fn today(zone: FixedOffset) -> MonthDay {
    MonthDay::from_date(Utc::now().with_timezone(&zone).date_naive())
}

#[derive(Debug, Serialize)]
pub struct MatchesResponse {
    pub target: MonthDay,
    pub regions: Vec<RegionGroup>,
    pub partial_failure: Option<PartialFailure>,
}

/// Serve the single-page live view.
async fn index_handler() -> impl IntoResponse {
    Html(DASHBOARD_HTML)
}

/// GET /api/regions
async fn regions_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .regions()
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// GET /api/regions/:region/fixtures
async fn region_fixtures_handler(
    State(state): State<Arc<AppState>>,
    Path(region): Path<String>,
) -> Result<Json<RegionFixtures>, ApiError> {
    match state.tracker.region_fixtures(&region).await {
        Ok(Some(listed)) => {
            if let Some(pf) = &listed.partial_failure {
                warn!("Fixtures for {} are incomplete: {}", region, pf);
            }
            Ok(Json(listed))
        }
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("region {} not found", region))),
        Err(e @ AggregateError::TotalFailure(_)) => {
            Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

/// GET /api/fixtures/:region/:competition/:fixture
async fn fixture_detail_handler(
    State(state): State<Arc<AppState>>,
    Path((region, competition, fixture)): Path<(String, String, String)>,
) -> Result<Json<FixtureDetail>, ApiError> {
    let key = FixtureKey::new(region, competition, fixture);
    match state.tracker.fixture_detail(&key).await {
        Ok(Some(detail)) => Ok(Json(detail)),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("fixture {} not found", key))),
        Err(e) => Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}

/// GET /api/matches?date=MM-DD
async fn matches_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DateQuery>,
) -> Result<Json<MatchesResponse>, ApiError> {
    let target = query.target(state.zone)?;
    match state.tracker.aggregate_once(target).await {
        Ok((view, partial_failure)) => {
            if let Some(pf) = &partial_failure {
                warn!("Matches for {} are incomplete: {}", target, pf);
            }
            Ok(Json(MatchesResponse {
                target,
                regions: view.regions,
                partial_failure,
            }))
        }
        Err(e @ AggregateError::TotalFailure(_)) => {
            Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

/// GET /api/live?date=MM-DD (WebSocket)
async fn live_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<DateQuery>,
) -> Result<Response, ApiError> {
    let target = query.target(state.zone)?;
    Ok(ws.on_upgrade(move |socket| live_socket(socket, state, target)))
}

#[derive(Debug, Serialize)]
struct LiveError {
    error: String,
    /// The subscription stopped and will not recover
    fatal: bool,
}

/// Push every view update to the client. A text frame holding a date
/// switches the subscription to that day; closing the socket cancels it.
async fn live_socket(socket: WebSocket, state: Arc<AppState>, target: MonthDay) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let update_tx = tx.clone();
    let error_tx = tx.clone();
    let handle = state.tracker.subscribe(
        target,
        move |update| match serde_json::to_string(&update) {
            Ok(json) => {
                let _ = update_tx.send(json);
            }
            Err(e) => warn!("Failed to encode view update: {}", e),
        },
        move |err: SubscriptionError| {
            let fatal = matches!(err, SubscriptionError::RetriesExhausted { .. });
            let _ = error_tx.send(live_error(err.to_string(), fatal));
        },
    );
    info!("Live client connected for {}", target);

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(text) = outgoing else { break };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => match text.trim().parse::<MonthDay>() {
                    Ok(next) => {
                        debug!("Live client switched to {}", next);
                        if let Err(e) = handle.change_target_date(next) {
                            let _ = tx.send(live_error(e.to_string(), true));
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(live_error(e, false));
                    }
                },
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    handle.cancel();
    info!("Live client disconnected");
}

fn live_error(error: String, fatal: bool) -> String {
    serde_json::to_string(&LiveError { error, fatal })
        .unwrap_or_else(|_| r#"{"error":"unencodable error","fatal":false}"#.to_string())
}

/// POST /api/regions/:region/competitions/:competition/fixtures
async fn create_fixture_handler(
    State(state): State<Arc<AppState>>,
    Path((region, competition)): Path<(String, String)>,
    Json(doc): Json<FixtureDoc>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .insert_fixture(&region, &competition, &doc)
        .map(|()| {
            info!("Fixture {}/{}/{} created", region, competition, doc.id);
            (
                StatusCode::CREATED,
                Json(FixtureKey::new(&region, &competition, &doc.id)),
            )
        })
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct ScoreBody {
    #[serde(alias = "teamA")]
    pub team_a: TeamScore,
    #[serde(alias = "teamB")]
    pub team_b: TeamScore,
    #[serde(default, alias = "submittedBy")]
    pub submitted_by: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// POST /api/fixtures/:region/:competition/:fixture/scores
async fn submit_score_handler(
    State(state): State<Arc<AppState>>,
    Path((region, competition, fixture)): Path<(String, String, String)>,
    Json(body): Json<ScoreBody>,
) -> Result<impl IntoResponse, ApiError> {
    let key = FixtureKey::new(region, competition, fixture);
    state
        .db
        .add_score_submission(
            &key,
            MatchScore::new(body.team_a, body.team_b),
            body.submitted_by.as_deref(),
            body.timestamp.unwrap_or_else(Utc::now),
        )
        .map(|sub| (StatusCode::CREATED, Json(sub)))
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct ResultBody {
    #[serde(alias = "teamA", alias = "homeScore")]
    pub team_a: TeamScore,
    #[serde(alias = "teamB", alias = "awayScore")]
    pub team_b: TeamScore,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, alias = "recordedAt")]
    pub recorded_at: Option<DateTime<Utc>>,
}

/// POST /api/fixtures/:region/:competition/:fixture/result
async fn official_result_handler(
    State(state): State<Arc<AppState>>,
    Path((region, competition, fixture)): Path<(String, String, String)>,
    Json(body): Json<ResultBody>,
) -> Result<impl IntoResponse, ApiError> {
    let key = FixtureKey::new(region, competition, fixture);
    state
        .db
        .record_official_result(
            &key,
            MatchScore::new(body.team_a, body.team_b),
            body.source.as_deref(),
            body.recorded_at.unwrap_or_else(Utc::now),
        )
        .map(|result| (StatusCode::CREATED, Json(result)))
        .map_err(|e| (StatusCode::CONFLICT, e.to_string()))
}

/// Embedded single-file live view (HTML + CSS + JS)
const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Fixture Tracker</title>
<style>
  :root {
    --bg: #0f1117;
    --card: #1a1d27;
    --border: #2a2d3a;
    --accent: #6c63ff;
    --green: #00c896;
    --amber: #ff9800;
    --text: #e0e0e0;
    --muted: #8888aa;
  }
  * { box-sizing: border-box; margin: 0; padding: 0; }
  body {
    background: var(--bg); color: var(--text);
    font-family: 'Segoe UI', system-ui, sans-serif;
  }
  header {
    display: flex; align-items: center; gap: 1rem;
    padding: 1rem 2rem; border-bottom: 1px solid var(--border);
  }
  header h1 { font-size: 1.4rem; font-weight: 700; }
  header input {
    background: var(--card); color: var(--text); border: 1px solid var(--border);
    border-radius: 4px; padding: .3rem .6rem; width: 6rem;
  }
  .status-dot {
    width: 10px; height: 10px; border-radius: 50%;
    background: var(--muted); display: inline-block;
  }
  .status-dot.on { background: var(--green); animation: pulse 1.5s infinite; }
  @keyframes pulse { 0%,100% { opacity: 1; } 50% { opacity: .3; } }
  main { padding: 1.5rem 2rem; display: grid; gap: 1.5rem; }
  .panel {
    background: var(--card); border: 1px solid var(--border);
    border-radius: 10px; overflow: hidden;
  }
  .panel-header { padding: .9rem 1.2rem; border-bottom: 1px solid var(--border); font-weight: 600; }
  table { width: 100%; border-collapse: collapse; }
  td { padding: .65rem 1rem; font-size: .88rem; border-bottom: 1px solid #1e2130; }
  tr:last-child td { border-bottom: none; }
  .pill {
    display: inline-block; padding: .15rem .55rem; border-radius: 20px;
    font-size: .75rem; font-weight: 600;
  }
  .pill.Scheduled { background: rgba(108,99,255,.2); color: var(--accent); }
  .pill.InProgress { background: rgba(0,200,150,.15); color: var(--green); }
  .pill.Completed { background: rgba(136,136,170,.15); color: var(--muted); }
  .official { color: var(--amber); font-size: .75rem; }
  .warn { color: var(--amber); padding: .6rem 1.2rem; font-size: .85rem; }
  .empty { color: var(--muted); text-align: center; padding: 2rem; font-size: .9rem; }
</style>
</head>
<body>
<header>
  <span id="dot" class="status-dot"></span>
  <h1>Fixture Tracker</h1>
  <input id="date" placeholder="MM-DD">
  <span id="rev" style="color: var(--muted); font-size: .8rem;"></span>
</header>
<main id="view"><div class="empty">Connecting…</div></main>
<script>
const view = document.getElementById('view');
const dot = document.getElementById('dot');
const dateInput = document.getElementById('date');
const entities = {'&': '&amp;', '<': '&lt;', '>': '&gt;', '"': '&quot;'};
const esc = s => String(s ?? '').replace(/[&<>"]/g, c => entities[c]);
const team = t => `${t.goals}-${t.points}`;

function render(update) {
  document.getElementById('rev').textContent = `rev ${update.revision}`;
  dateInput.value = update.target;
  const groups = update.view.regions;
  let html = '';
  if (update.partial_failure) {
    const failed = update.partial_failure.failures.length;
    html += `<div class="panel"><div class="warn">
      Some data could not be loaded: ${failed} branch(es)</div></div>`;
  }
  if (!groups.length) {
    html += '<div class="empty">No matches on this day</div>';
  }
  for (const g of groups) {
    html += `<div class="panel"><div class="panel-header">${esc(g.region_name)}</div><table>`;
    for (const m of g.matches) {
      const s = m.current_score;
      html += `<tr>
        <td>${esc(m.time)}</td>
        <td>${esc(m.competition_name)}</td>
        <td>${esc(m.home_team)} <b>${team(s.team_a)}</b>
            – <b>${team(s.team_b)}</b> ${esc(m.away_team)}
            ${m.is_official ? '<span class="official">official</span>' : ''}</td>
        <td><span class="pill ${m.status}">${m.status}</span></td>
      </tr>`;
    }
    html += '</table></div>';
  }
  view.innerHTML = html;
}

function connect() {
  const params = new URLSearchParams(location.search);
  const q = params.get('date') ? `?date=${encodeURIComponent(params.get('date'))}` : '';
  const scheme = location.protocol === 'https:' ? 'wss' : 'ws';
  const ws = new WebSocket(`${scheme}://${location.host}/api/live${q}`);
  ws.onopen = () => dot.classList.add('on');
  ws.onclose = () => { dot.classList.remove('on'); setTimeout(connect, 3000); };
  ws.onmessage = ev => {
    const msg = JSON.parse(ev.data);
    if (msg.error) { console.warn(msg.error); return; }
    render(msg);
  };
  dateInput.onchange = () => ws.send(dateInput.value.trim());
}
connect();
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TrackerSettings;
    use chrono::Offset;

    fn state() -> Arc<AppState> {
        let db = Database::open_in_memory().unwrap();
        db.seed_demo().unwrap();
        let tracker = Tracker::new(Arc::new(db.clone()), TrackerSettings::default());
        Arc::new(AppState {
            db,
            tracker,
            zone: Utc.fix(),
        })
    }

    fn on(date: &str) -> Query<DateQuery> {
        Query(DateQuery {
            date: Some(date.into()),
        })
    }

    #[tokio::test]
    async fn test_matches_for_demo_day() {
        let Json(body) = matches_handler(State(state()), on("05-15")).await.unwrap();
        assert_eq!(body.target.to_string(), "05-15");
        assert_eq!(body.regions.len(), 2);
        assert!(body.partial_failure.is_none());
    }

    #[tokio::test]
    async fn test_matches_rejects_bad_date() {
        let err = matches_handler(State(state()), on("15-05")).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_score_then_result_flow() {
        let state = state();
        let path = || {
            Path((
                "mayo".to_string(),
                "senior-football-championship".to_string(),
                "F1".to_string(),
            ))
        };
        let score = ScoreBody {
            team_a: TeamScore::new(3, 4),
            team_b: TeamScore::new(0, 5),
            submitted_by: None,
            timestamp: None,
        };
        assert!(submit_score_handler(State(state.clone()), path(), Json(score))
            .await
            .is_ok());

        let result = || ResultBody {
            team_a: TeamScore::new(3, 6),
            team_b: TeamScore::new(0, 7),
            source: Some("referee".into()),
            recorded_at: None,
        };
        assert!(official_result_handler(State(state.clone()), path(), Json(result()))
            .await
            .is_ok());
        let err = official_result_handler(State(state.clone()), path(), Json(result()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, StatusCode::CONFLICT);

        let Json(body) = matches_handler(State(state), on("2025-05-15")).await.unwrap();
        let f1 = body.regions[0]
            .matches
            .iter()
            .find(|m| m.fixture_id == "F1")
            .unwrap();
        assert!(f1.is_official);
        let official = MatchScore::new(TeamScore::new(3, 6), TeamScore::new(0, 7));
        assert_eq!(f1.current_score, official);
    }

    fn f1_path() -> Path<(String, String, String)> {
        Path((
            "mayo".to_string(),
            "senior-football-championship".to_string(),
            "F1".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_fixture_detail_and_not_found() {
        let state = state();
        let Json(detail) = fixture_detail_handler(State(state.clone()), f1_path())
            .await
            .unwrap();
        assert_eq!(detail.fixture.fixture_id, "F1");
        assert_eq!(detail.history.len(), 2);
        assert!(detail.history[0].timestamp > detail.history[1].timestamp);

        let missing = Path(("mayo".to_string(), "nope".to_string(), "F1".to_string()));
        let err = fixture_detail_handler(State(state), missing).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_region_fixtures_sorted_and_not_found() {
        let state = state();
        let Json(sligo) = region_fixtures_handler(State(state.clone()), Path("sligo".into()))
            .await
            .unwrap();
        assert_eq!(sligo.region.name, "Sligo");
        assert_eq!(sligo.matches.len(), 1);
        assert_eq!(sligo.matches[0].fixture_id, "F3");

        let err = region_fixtures_handler(State(state), Path("kerry".into()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }
}
