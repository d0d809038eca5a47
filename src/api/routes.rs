//! warp filters and handlers

use super::auth::{basic_auth, Unauthorized};
use crate::message::{prepare_payload, FailureResponse, SendMqttResponse};
use crate::service::BridgeService;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::convert::Infallible;
use tracing::{debug, warn, Instrument};
use warp::http::StatusCode;
use warp::path::Tail;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Largest request body accepted by `/sendmqtt`
pub const MAX_BODY_BYTES: u64 = 256 * 1024;

const SERVER_HEADER: &str = concat!("Arkadiko/v", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
struct BodyTooLarge;

impl warp::reject::Reject for BodyTooLarge {}

#[derive(Debug)]
struct UnreadableBody;

impl warp::reject::Reject for UnreadableBody {}

/// All API routes, with auth, version headers and rejection handling applied
pub fn routes(
    service: BridgeService,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let auth = basic_auth(&service.context().config().basicauth);

    let health_route = warp::path("healthcheck")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(healthcheck);

    let send_route = warp::path("sendmqtt")
        .and(warp::post())
        .and(auth.clone())
        .and(warp::path::tail())
        .and(warp::query::<HashMap<String, String>>())
        .and(limited_body(MAX_BODY_BYTES))
        .and(with_service(service.clone()))
        .and_then(send_mqtt);

    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(auth)
        .and(with_service(service))
        .and_then(metrics);

    health_route
        .or(send_route)
        .or(metrics_route)
        .recover(handle_rejection)
        .with(warp::reply::with::header("server", SERVER_HEADER))
        .with(warp::reply::with::header("arkadiko-server", SERVER_HEADER))
}

fn with_service(
    service: BridgeService,
) -> impl Filter<Extract = (BridgeService,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

/// Request body capped at `limit` bytes, with or without a Content-Length header
fn limited_body(limit: u64) -> impl Filter<Extract = (Bytes,), Error = Rejection> + Clone {
    warp::header::optional::<u64>("content-length")
        .and(warp::body::stream())
        .and_then(move |declared: Option<u64>, body| async move {
            if declared.is_some_and(|len| len > limit) {
                return Err(warp::reject::custom(BodyTooLarge));
            }
            read_limited(body, limit).await
        })
}

async fn read_limited<S, B>(body: S, limit: u64) -> Result<Bytes, Rejection>
where
    S: Stream<Item = Result<B, warp::Error>>,
    B: Buf,
{
    let mut body = Box::pin(body);
    let mut collected = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| {
            debug!(error = %e, "Failed to read request body");
            warp::reject::custom(UnreadableBody)
        })?;
        if (collected.len() + chunk.remaining()) as u64 > limit {
            return Err(warp::reject::custom(BodyTooLarge));
        }
        collected.put(chunk);
    }
    Ok(collected.freeze())
}

/// Topic carried in the path tail: percent-decoded, trailing slash dropped
pub fn topic_from_tail(tail: &str) -> String {
    let decoded = percent_decode_str(tail).decode_utf8_lossy();
    decoded.trim_end_matches('/').to_string()
}

fn failure(status: StatusCode, reason: impl Into<String>) -> Response {
    warp::reply::with_status(warp::reply::json(&FailureResponse::new(reason)), status)
        .into_response()
}

async fn send_mqtt(
    tail: Tail,
    query: HashMap<String, String>,
    body: Bytes,
    service: BridgeService,
) -> Result<Response, Infallible> {
    let topic = topic_from_tail(tail.as_str());
    let retained = query.get("retained").map(String::as_str) == Some("true");
    let source = query.get("source").cloned().unwrap_or_default();

    let span = crate::request_span!(
        route = "sendmqtt",
        topic = %topic,
        retained,
        source = %source
    );

    async move {
        if topic.is_empty() {
            return Ok(failure(StatusCode::BAD_REQUEST, "topic must not be empty"));
        }

        let (payload, encoded) = match prepare_payload(&body) {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!(error = %e, "Rejected malformed payload");
                return Ok(failure(StatusCode::BAD_REQUEST, e.to_string()));
            }
        };

        match service
            .send_message(&topic, Bytes::from(encoded), retained)
            .await
        {
            Ok(result) => {
                let response = SendMqttResponse {
                    topic: result.topic,
                    retained: result.retained,
                    payload,
                };
                Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::OK)
                    .into_response())
            }
            Err(e) => {
                let status = StatusCode::from_u16(e.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                Ok(failure(status, e.public_reason()))
            }
        }
    }
    .instrument(span)
    .await
}

async fn healthcheck(service: BridgeService) -> Result<Response, Infallible> {
    let context = service.context();
    match context.publisher_if_ready() {
        Some(publisher) if publisher.is_connected() => {
            let working = context.config().healthcheck.working_text.trim().to_string();
            Ok(warp::reply::with_status(working, StatusCode::OK).into_response())
        }
        Some(publisher) => {
            warn!(transport = publisher.name(), "Healthcheck failed: transport disconnected");
            Ok(failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{} transport is not connected", publisher.name()),
            ))
        }
        None => Ok(failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "publisher is not initialized",
        )),
    }
}

async fn metrics(service: BridgeService) -> Result<Response, Infallible> {
    let snapshot = service.context().metrics().get_metrics();
    Ok(warp::reply::json(&snapshot).into_response())
}

async fn handle_rejection(rejection: Rejection) -> Result<Response, Infallible> {
    if rejection.find::<Unauthorized>().is_some() {
        let response = warp::reply::with_header(
            failure(StatusCode::UNAUTHORIZED, "Unauthorized"),
            "www-authenticate",
            "Basic realm=\"Restricted\"",
        );
        return Ok(response.into_response());
    }

    if rejection.is_not_found() {
        return Ok(failure(StatusCode::NOT_FOUND, "Not Found"));
    }

    if rejection.find::<BodyTooLarge>().is_some() {
        return Ok(failure(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"));
    }

    if rejection.find::<UnreadableBody>().is_some() {
        return Ok(failure(StatusCode::BAD_REQUEST, "request body could not be read"));
    }

    if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(failure(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"));
    }

    warn!(rejection = ?rejection, "Unhandled rejection");
    Ok(failure(StatusCode::BAD_REQUEST, "Bad Request"))
}
