//! HTTP surface
//!
//! ```text
//! GET    /healthz                           liveness plus a few gauges
//! GET    /v1/sessions                       every routed student
//! POST   /v1/sessions/{student}             route (provision on first use)
//! DELETE /v1/sessions/{student}             save and tear the sandbox down
//! POST   /v1/sessions/{student}/heartbeat   keep the sandbox from idling out
//! GET    /v1/workspace/{student}/{path..}   read a file through the grants
//! PUT    /v1/workspace/{student}/{path..}   write a file through the grants
//! POST   /v1/webhooks/submission            queue a submission for grading (202)
//! ```
//!
//! Errors are returned as `application/problem+json`.

use crate::config::ServerConfig;
use labfleet_core::{Fleet, FleetError, ProvisionError, ResourceProfile, SubmissionEvent};
use labfleet_workspace::{StoreError, StudentId, WorkspacePath};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::path::Tail;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Header carrying the shared webhook secret
pub const WEBHOOK_TOKEN_HEADER: &str = "x-labfleet-token";

#[derive(Debug)]
struct Unauthorized;

impl warp::reject::Reject for Unauthorized {}

#[derive(Debug, Default, Deserialize)]
struct OpenSessionQuery {
    resources: Option<String>,
}

#[derive(Serialize)]
struct Problem<'a> {
    title: &'a str,
    status: u16,
    detail: String,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    sandboxes: usize,
    pending_reports: usize,
}

#[derive(Serialize)]
struct Written {
    path: WorkspacePath,
    hash: String,
}

#[derive(Serialize)]
struct Accepted<'a> {
    status: &'static str,
    student_id: &'a StudentId,
    exercise_id: &'a labfleet_workspace::ExerciseId,
}

fn problem(status: StatusCode, title: &str, detail: impl Into<String>) -> Response {
    let body = Problem {
        title,
        status: status.as_u16(),
        detail: detail.into(),
    };
    warp::reply::with_header(
        warp::reply::with_status(warp::reply::json(&body), status),
        "content-type",
        "application/problem+json",
    )
    .into_response()
}

/// Status code for a fleet error
fn error_status(err: &FleetError) -> StatusCode {
    match err {
        FleetError::InvalidId(_) => StatusCode::BAD_REQUEST,
        FleetError::Policy(_) if err.is_access_denied() => StatusCode::FORBIDDEN,
        FleetError::Policy(_) => StatusCode::BAD_REQUEST,
        FleetError::UnknownExercise(_) | FleetError::Store(StoreError::NotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        FleetError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
        FleetError::Provision(ProvisionError::Rejected { .. }) => StatusCode::BAD_GATEWAY,
        FleetError::Provision(_) | FleetError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn fleet_error(err: &FleetError) -> Response {
    let status = error_status(err);
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    } else if err.is_access_denied() {
        tracing::warn!(error = %err, "request denied");
    }
    let title = match status {
        StatusCode::SERVICE_UNAVAILABLE => "try again later",
        s => s.canonical_reason().unwrap_or("error"),
    };
    problem(status, title, err.to_string())
}

fn parse_student(raw: &str) -> Result<StudentId, Response> {
    StudentId::new(raw).map_err(|e| problem(StatusCode::BAD_REQUEST, "invalid student id", e.to_string()))
}

async fn healthz(fleet: Arc<Fleet>) -> Result<Response, Infallible> {
    let body = Health {
        status: "ok",
        version: labfleet_core::VERSION,
        sandboxes: fleet.router().live_count().await,
        pending_reports: fleet.outbox().pending(),
    };
    Ok(warp::reply::json(&body).into_response())
}

async fn list_sessions(fleet: Arc<Fleet>) -> Result<Response, Infallible> {
    let sessions = fleet.router().sessions().await;
    Ok(warp::reply::json(&sessions).into_response())
}

async fn open_session(
    raw: String,
    query: OpenSessionQuery,
    fleet: Arc<Fleet>,
) -> Result<Response, Infallible> {
    let student = match parse_student(&raw) {
        Ok(student) => student,
        Err(response) => return Ok(response),
    };
    let resources = match query.resources.as_deref().map(str::parse::<ResourceProfile>) {
        None => None,
        Some(Ok(resources)) => Some(resources),
        Some(Err(e)) => return Ok(problem(StatusCode::BAD_REQUEST, "invalid resources", e)),
    };
    Ok(match fleet.open_session(&student, resources).await {
        Ok(instance) => warp::reply::json(&instance).into_response(),
        Err(e) => fleet_error(&e),
    })
}

async fn close_session(raw: String, fleet: Arc<Fleet>) -> Result<Response, Infallible> {
    let student = match parse_student(&raw) {
        Ok(student) => student,
        Err(response) => return Ok(response),
    };
    Ok(match fleet.close_session(&student).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => problem(StatusCode::NOT_FOUND, "no session", format!("{student} has no sandbox")),
        Err(e) => fleet_error(&e),
    })
}

async fn heartbeat(raw: String, fleet: Arc<Fleet>) -> Result<Response, Infallible> {
    let student = match parse_student(&raw) {
        Ok(student) => student,
        Err(response) => return Ok(response),
    };
    Ok(if fleet.heartbeat(&student).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        problem(StatusCode::NOT_FOUND, "no session", format!("{student} has no sandbox"))
    })
}

fn parse_file(raw: &str, tail: &Tail) -> Result<(StudentId, WorkspacePath), Response> {
    let student = parse_student(raw)?;
    let path = tail
        .as_str()
        .parse::<WorkspacePath>()
        .map_err(|e| problem(StatusCode::BAD_REQUEST, "invalid path", e.to_string()))?;
    Ok((student, path))
}

async fn read_file(raw: String, tail: Tail, fleet: Arc<Fleet>) -> Result<Response, Infallible> {
    let (student, path) = match parse_file(&raw, &tail) {
        Ok(parsed) => parsed,
        Err(response) => return Ok(response),
    };
    Ok(match fleet.read_file(&student, &path).await {
        Ok(body) => body.into_response(),
        Err(e) => fleet_error(&e),
    })
}

async fn write_file(
    raw: String,
    tail: Tail,
    body: Bytes,
    fleet: Arc<Fleet>,
) -> Result<Response, Infallible> {
    let (student, path) = match parse_file(&raw, &tail) {
        Ok(parsed) => parsed,
        Err(response) => return Ok(response),
    };
    Ok(match fleet.write_file(&student, &path, &body).await {
        Ok(hash) => warp::reply::json(&Written {
            path,
            hash: hash.to_string(),
        })
        .into_response(),
        Err(e) => fleet_error(&e),
    })
}

async fn submission_webhook(event: SubmissionEvent, fleet: Arc<Fleet>) -> Result<Response, Infallible> {
    let body = Accepted {
        status: "queued",
        student_id: &event.student_id,
        exercise_id: &event.exercise_id,
    };
    let accepted = warp::reply::with_status(warp::reply::json(&body), StatusCode::ACCEPTED).into_response();
    Ok(match fleet.submit(event) {
        Ok(()) => accepted,
        Err(e) => fleet_error(&e),
    })
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let response = if err.is_not_found() {
        problem(StatusCode::NOT_FOUND, "not found", "no such route")
    } else if err.find::<Unauthorized>().is_some() {
        problem(StatusCode::UNAUTHORIZED, "unauthorized", "missing or wrong webhook token")
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        problem(StatusCode::BAD_REQUEST, "malformed body", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        problem(StatusCode::BAD_REQUEST, "malformed query", e.to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        problem(StatusCode::PAYLOAD_TOO_LARGE, "payload too large", "body exceeds the configured limit")
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        problem(StatusCode::LENGTH_REQUIRED, "length required", "content-length header is required")
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        problem(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported media type", "expected application/json")
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        problem(StatusCode::METHOD_NOT_ALLOWED, "method not allowed", "method not allowed")
    } else {
        tracing::error!(rejection = ?err, "unhandled rejection");
        problem(StatusCode::INTERNAL_SERVER_ERROR, "internal error", "unhandled rejection")
    };
    Ok(response)
}

fn with_fleet(fleet: Arc<Fleet>) -> impl Filter<Extract = (Arc<Fleet>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&fleet))
}

fn authorized(expected: Option<String>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>(WEBHOOK_TOKEN_HEADER)
        .and_then(move |given: Option<String>| {
            let expected = expected.clone();
            async move {
                match expected {
                    Some(expected) if given.as_deref() != Some(expected.as_str()) => {
                        Err(warp::reject::custom(Unauthorized))
                    }
                    _ => Ok(()),
                }
            }
        })
        .untuple_one()
}

/// Every route, with rejections turned into problem responses
pub fn routes(
    fleet: Arc<Fleet>,
    config: &ServerConfig,
    webhook_token: Option<String>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let health = warp::path!("healthz")
        .and(warp::get())
        .and(with_fleet(Arc::clone(&fleet)))
        .and_then(healthz);

    let sessions = warp::path!("v1" / "sessions")
        .and(warp::get())
        .and(with_fleet(Arc::clone(&fleet)))
        .and_then(list_sessions);

    let open = warp::path!("v1" / "sessions" / String)
        .and(warp::post())
        .and(warp::query::<OpenSessionQuery>())
        .and(with_fleet(Arc::clone(&fleet)))
        .and_then(open_session);

    let close = warp::path!("v1" / "sessions" / String)
        .and(warp::delete())
        .and(with_fleet(Arc::clone(&fleet)))
        .and_then(close_session);

    let beat = warp::path!("v1" / "sessions" / String / "heartbeat")
        .and(warp::post())
        .and(with_fleet(Arc::clone(&fleet)))
        .and_then(heartbeat);

    let read = warp::path!("v1" / "workspace" / String / ..)
        .and(warp::path::tail())
        .and(warp::get())
        .and(with_fleet(Arc::clone(&fleet)))
        .and_then(read_file);

    let write = warp::path!("v1" / "workspace" / String / ..)
        .and(warp::path::tail())
        .and(warp::put())
        .and(warp::body::content_length_limit(config.max_body_bytes))
        .and(warp::body::bytes())
        .and(with_fleet(Arc::clone(&fleet)))
        .and_then(write_file);

    let webhook = warp::path!("v1" / "webhooks" / "submission")
        .and(warp::post())
        .and(authorized(webhook_token))
        .and(warp::body::content_length_limit(config.max_body_bytes))
        .and(warp::body::json::<SubmissionEvent>())
        .and(with_fleet(fleet))
        .and_then(submission_webhook);

    health
        .or(sessions)
        .or(open)
        .or(close)
        .or(beat)
        .or(read)
        .or(write)
        .or(webhook)
        .recover(handle_rejection)
        .with(warp::trace::request())
}

/// Bind the listener; the returned future serves until `shutdown` resolves
///
/// # Errors
/// Returns the bind error if the address is unavailable.
pub fn bind(
    fleet: Arc<Fleet>,
    config: &ServerConfig,
    webhook_token: Option<String>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error> {
    let routes = routes(fleet, config, webhook_token);
    warp::serve(routes).try_bind_with_graceful_shutdown(config.bind, shutdown)
}
