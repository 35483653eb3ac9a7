//! Admin routes.
//!
//! Route-for-route rendition of the resource hierarchy:
//!
//! ```text
//! GET    /                          list vhosts
//! DELETE /                          clear vhosts
//! POST   /:vhost                    add vhost         (302 -> resource)
//! GET    /:vhost                    show vhost
//! DELETE /:vhost                    delete vhost      (202)
//! PUT    /:vhost/token              rotate token      (302 -> resource)
//! GET    /:vhost/channels           list channels
//! DELETE /:vhost/channels           clear channels    (202)
//! POST   /:vhost/channels/:channel  add channel       (302 -> resource)
//! GET    /:vhost/channels/:channel  show channel
//! DELETE /:vhost/channels/:channel  delete channel    (202)
//! GET    /:vhost/workers            list workers
//! ```

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::debug;

use crate::context::Context;
use crate::error::EngineError;
use crate::token::secure_compare;
use crate::vhost::Vhost;

const COOKIE_HEADER: &str = "x-webrocket-cookie";

/// Build the admin router bound to a context.
pub fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/", get(list_vhosts).delete(clear_vhosts))
        .route(
            "/:vhost",
            post(add_vhost).get(show_vhost).delete(delete_vhost),
        )
        .route("/:vhost/token", put(regenerate_token))
        .route(
            "/:vhost/channels",
            get(list_channels).delete(clear_channels),
        )
        .route(
            "/:vhost/channels/:channel",
            post(add_channel).get(show_channel).delete(delete_channel),
        )
        .route("/:vhost/workers", get(list_workers))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&ctx),
            authenticate,
        ))
        .with_state(ctx)
}

/// Cookie check plus the echo of the cookie on every response.
async fn authenticate(
    State(ctx): State<Arc<Context>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(COOKIE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !secure_compare(presented, &ctx.cookie()) {
        debug!("admin request with bad cookie");
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "access denied" })))
            .into_response();
    }
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.cookie()) {
        response.headers_mut().insert(COOKIE_HEADER, value);
    }
    response
}

// Vhosts
// ----------------------------------------------------------------------

async fn list_vhosts(State(ctx): State<Arc<Context>>) -> Response {
    let vhosts: Vec<Value> = ctx.vhosts().iter().map(|v| vhost_entry(v)).collect();
    Json(json!({ "vhosts": vhosts })).into_response()
}

async fn add_vhost(State(ctx): State<Arc<Context>>, Path(vhost): Path<String>) -> Response {
    let path = format!("/{}", vhost);
    match ctx.add_vhost(&path) {
        Ok(_) => found(&path),
        Err(err) => error_response(&err),
    }
}

async fn show_vhost(State(ctx): State<Arc<Context>>, Path(vhost): Path<String>) -> Response {
    let path = format!("/{}", vhost);
    match ctx.vhost(&path) {
        Ok(vhost) => Json(json!({ "vhost": vhost_details(&vhost) })).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn delete_vhost(State(ctx): State<Arc<Context>>, Path(vhost): Path<String>) -> Response {
    let path = format!("/{}", vhost);
    match ctx.delete_vhost(&path) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn clear_vhosts(State(ctx): State<Arc<Context>>) -> Response {
    match ctx.clear_vhosts() {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn regenerate_token(State(ctx): State<Arc<Context>>, Path(vhost): Path<String>) -> Response {
    let path = format!("/{}", vhost);
    let vhost = match ctx.vhost(&path) {
        Ok(vhost) => vhost,
        Err(err) => return error_response(&err),
    };
    match vhost.generate_access_token() {
        Ok(_) => found(&path),
        Err(err) => error_response(&err),
    }
}

// Channels
// ----------------------------------------------------------------------

async fn list_channels(State(ctx): State<Arc<Context>>, Path(vhost): Path<String>) -> Response {
    let path = format!("/{}", vhost);
    let vhost = match ctx.vhost(&path) {
        Ok(vhost) => vhost,
        Err(err) => return error_response(&err),
    };
    let channels: Vec<Value> = vhost
        .channels()
        .iter()
        .map(|channel| {
            json!({
                "name": channel.name(),
                "subscribers": { "size": channel.subscriber_count() },
                "links": links(&[
                    ("self", &format!("{}/channels/{}", path, channel.name())),
                    ("vhost", &path),
                ]),
            })
        })
        .collect();
    Json(json!({ "channels": channels })).into_response()
}

async fn add_channel(
    State(ctx): State<Arc<Context>>,
    Path((vhost, channel)): Path<(String, String)>,
) -> Response {
    let path = format!("/{}", vhost);
    let target = match ctx.vhost(&path) {
        Ok(vhost) => vhost,
        Err(err) => return error_response(&err),
    };
    match target.open_channel(&channel, None) {
        Ok(_) => found(&format!("{}/channels/{}", path, channel)),
        Err(err) => error_response(&err),
    }
}

async fn show_channel(
    State(ctx): State<Arc<Context>>,
    Path((vhost, channel)): Path<(String, String)>,
) -> Response {
    let path = format!("/{}", vhost);
    let target = match ctx.vhost(&path) {
        Ok(vhost) => vhost,
        Err(err) => return error_response(&err),
    };
    match target.channel(&channel) {
        Ok(channel) => Json(json!({
            "channel": {
                "name": channel.name(),
                "subscribers": { "size": channel.subscriber_count() },
                "links": links(&[
                    ("self", &format!("{}/channels/{}", path, channel.name())),
                    ("vhost", &path),
                ]),
            }
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn delete_channel(
    State(ctx): State<Arc<Context>>,
    Path((vhost, channel)): Path<(String, String)>,
) -> Response {
    let path = format!("/{}", vhost);
    let target = match ctx.vhost(&path) {
        Ok(vhost) => vhost,
        Err(err) => return error_response(&err),
    };
    match target.delete_channel(&channel) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn clear_channels(State(ctx): State<Arc<Context>>, Path(vhost): Path<String>) -> Response {
    let path = format!("/{}", vhost);
    let target = match ctx.vhost(&path) {
        Ok(vhost) => vhost,
        Err(err) => return error_response(&err),
    };
    match target.delete_all_channels() {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(&err),
    }
}

// Workers
// ----------------------------------------------------------------------

async fn list_workers(State(ctx): State<Arc<Context>>, Path(vhost): Path<String>) -> Response {
    let path = format!("/{}", vhost);
    let target = match ctx.vhost(&path) {
        Ok(vhost) => vhost,
        Err(err) => return error_response(&err),
    };
    let workers: Vec<Value> = target
        .lobby()
        .workers()
        .iter()
        .map(|worker| {
            json!({
                "id": worker.id().to_string(),
                "links": links(&[
                    ("self", &format!("{}/workers/{}", path, worker.id())),
                    ("vhost", &path),
                ]),
            })
        })
        .collect();
    Json(json!({ "workers": workers })).into_response()
}

// Helpers
// ----------------------------------------------------------------------

fn vhost_entry(vhost: &Arc<Vhost>) -> Value {
    json!({
        "path": vhost.path(),
        "accessToken": vhost.access_token(),
        "links": links(&[("self", vhost.path())]),
    })
}

fn vhost_details(vhost: &Arc<Vhost>) -> Value {
    json!({
        "path": vhost.path(),
        "accessToken": vhost.access_token(),
        "channels": { "size": vhost.channels().len() },
        "links": links(&[
            ("channels", &format!("{}/channels", vhost.path())),
            ("self", vhost.path()),
        ]),
    })
}

fn links(pairs: &[(&str, &str)]) -> Value {
    Value::Array(
        pairs
            .iter()
            .map(|(rel, href)| json!({ "rel": rel, "href": href }))
            .collect(),
    )
}

fn found(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

fn error_response(err: &EngineError) -> Response {
    let code = match err {
        EngineError::VhostNotFound(_) | EngineError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Unauthorized | EngineError::Forbidden => StatusCode::FORBIDDEN,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    (code, Json(json!({ "error": err.to_string() }))).into_response()
}
