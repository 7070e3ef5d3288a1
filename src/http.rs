// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The HTTP control surface: a thin adapter that parses form or JSON
//! bodies and posts requests onto the server's queue.
//!
//! Dispatch is method-first, as in the original surface: POST and PUT
//! select the mutating handlers, every other method the read handlers, and
//! a path unknown to the selected handler set is the "unhandled URL" error.
//! Failures of any kind answer 500 with a fixed generic body; the real
//! error goes to the log.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use slog::{Logger, error, info, o};
use tokio::net::TcpListener;

use crate::server::Server;
use crate::source::{ConfigError, SourceConfig};

const ERROR_BODY: &str =
    "An error occurred; please refer to the logs for more information";

#[derive(Clone)]
struct AppState {
    server: Arc<Server>,
    log: Logger,
}

/// Binds the HTTP listener on `addr` and serves until failure.
pub async fn serve(server: Arc<Server>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("HTTP bind to {}", addr))?;
    let log = server.log().new(o!("component" => "http"));
    info!(log, "listening for HTTP requests"; "addr" => %addr);
    axum::serve(listener, router(server)).await.context("HTTP server")?;
    Ok(())
}

/// The control-surface routes, shared by the listener and by tests.
pub fn router(server: Arc<Server>) -> Router {
    let log = server.log().new(o!("component" => "http"));
    let state = AppState { server, log };
    Router::new()
        .route("/source/add", any(source_add))
        .route("/source/delete", any(source_delete))
        .route("/source/update", any(source_update))
        .route("/source/list", any(source_list))
        .route("/dns/dump", any(dns_dump))
        .route("/favicon.ico", any(favicon))
        .fallback(unhandled)
        .with_state(state)
}

fn is_mutating(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT
}

fn unhandled_url() -> anyhow::Error {
    anyhow!("unhandled URL")
}

impl AppState {
    fn log_request(&self, method: &Method, path: &str) {
        if self.server.verbose() {
            info!(self.log, "request"; "method" => %method, "path" => path);
        }
    }

    /// Answers 500 with the generic body; the real error only reaches the
    /// logs.
    fn fail(&self, method: &Method, path: &str, err: anyhow::Error) -> Response {
        error!(
            self.log,
            "request failed";
            "method" => %method,
            "path" => path,
            "error" => %err,
        );
        (StatusCode::INTERNAL_SERVER_ERROR, ERROR_BODY).into_response()
    }

    /// Parses the request body into a config map.  A JSON content type
    /// selects the JSON decoder, anything else is treated as an URL-encoded
    /// form.  Keys outside the recognized namespaces are dropped; the zone
    /// and own host name are injected for generators parameterized by them.
    fn parse_body(
        &self,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<SourceConfig, ConfigError> {
        let mut conf = SourceConfig::new();
        let is_json = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "application/json");
        if is_json {
            conf.merge_json(body.as_ref())?;
        } else {
            conf.merge_form(body.as_ref())?;
        }
        conf.put("dns.zone", self.server.zone().browser());
        conf.put("dns.self", self.server.self_host().browser());
        Ok(conf)
    }
}

async fn source_add(
    State(st): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const PATH: &str = "/source/add";
    st.log_request(&method, PATH);
    if !is_mutating(&method) {
        return st.fail(&method, PATH, unhandled_url());
    }
    let result = async {
        let conf = st.parse_body(&headers, &body)?;
        let name = conf.required("source.name")?.to_string();
        conf.required("source.type")?;
        st.server
            .add_source(&name, conf)
            .await
            .map_err(|err| anyhow!("cannot add source: {}", err))?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => st.fail(&method, PATH, err),
    }
}

async fn source_delete(
    State(st): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const PATH: &str = "/source/delete";
    st.log_request(&method, PATH);
    if !is_mutating(&method) {
        return st.fail(&method, PATH, unhandled_url());
    }
    let result = async {
        let conf = st.parse_body(&headers, &body)?;
        let name = conf.required("source.name")?;
        st.server
            .delete_source(name)
            .await
            .map_err(|err| anyhow!("cannot remove source: {}", err))?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => st.fail(&method, PATH, err),
    }
}

async fn source_update(
    State(st): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const PATH: &str = "/source/update";
    st.log_request(&method, PATH);
    if !is_mutating(&method) {
        return st.fail(&method, PATH, unhandled_url());
    }
    let result = async {
        let conf = st.parse_body(&headers, &body)?;
        let name = conf.required("source.name")?;
        st.server
            .update_source(name)
            .await
            .map_err(|err| anyhow!("cannot update source: {}", err))?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => st.fail(&method, PATH, err),
    }
}

async fn source_list(State(st): State<AppState>, method: Method) -> Response {
    const PATH: &str = "/source/list";
    st.log_request(&method, PATH);
    if is_mutating(&method) {
        return st.fail(&method, PATH, unhandled_url());
    }
    let body = st.server.list_sources().await;
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

async fn dns_dump(State(st): State<AppState>, method: Method) -> Response {
    const PATH: &str = "/dns/dump";
    st.log_request(&method, PATH);
    if is_mutating(&method) {
        return st.fail(&method, PATH, unhandled_url());
    }
    let mut out = Vec::new();
    if let Err(err) = st.server.write_dump(&mut out).await {
        return st.fail(&method, PATH, anyhow!(err));
    }
    ([(header::CONTENT_TYPE, "text/plain")], out).into_response()
}

async fn favicon(State(st): State<AppState>, method: Method) -> Response {
    const PATH: &str = "/favicon.ico";
    st.log_request(&method, PATH);
    if is_mutating(&method) {
        return st.fail(&method, PATH, unhandled_url());
    }
    // Shut up on bogus requests.
    (StatusCode::NOT_FOUND, "404 page not found\n").into_response()
}

async fn unhandled(
    State(st): State<AppState>,
    method: Method,
    uri: Uri,
) -> Response {
    st.log_request(&method, uri.path());
    st.fail(&method, uri.path(), unhandled_url())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::Config;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    async fn test_router() -> Router {
        let server = Server::start(
            test_logger(),
            Config {
                zone: "lan".to_string(),
                self_host: "localhost".to_string(),
                ttl: Duration::from_secs(3600),
                save: None,
                verbose: false,
            },
        )
        .await
        .unwrap();
        router(server)
    }

    async fn send(
        app: &Router,
        method: &str,
        path: &str,
        content_type: Option<&str>,
        body: &str,
    ) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(ct) = content_type {
            builder = builder.header("content-type", ct);
        }
        let req = builder.body(Body::from(body.to_string())).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    const FORM: Option<&str> = Some("application/x-www-form-urlencoded");

    #[tokio::test]
    async fn test_add_list_dump_form() {
        let app = test_router().await;
        let (status, body) = send(
            &app,
            "POST",
            "/source/add",
            FORM,
            "source.name=s&source.type=static&config.key=foo.lan&config.val=1.2.3.4",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());

        let (status, body) = send(&app, "GET", "/source/list", None, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "s static\n");

        let (status, body) = send(&app, "GET", "/dns/dump", None, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "1.2.3.4\tfoo.lan\n");
    }

    #[tokio::test]
    async fn test_add_json_body() {
        let app = test_router().await;
        let (status, _) = send(
            &app,
            "PUT",
            "/source/add",
            Some("application/json"),
            r#"{"source.name":"j","source.type":"static","config.key":"a.lan","config.val":"2.3.4.5"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, "GET", "/source/list", None, "").await;
        assert_eq!(body, "j static\n");
    }

    #[tokio::test]
    async fn test_form_duplicate_key_takes_last_value() {
        let app = test_router().await;
        let (status, _) = send(
            &app,
            "POST",
            "/source/add",
            FORM,
            "source.name=s&source.type=static&config.key=foo.lan\
             &config.val=1.1.1.1&config.val=2.2.2.2",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, dump) = send(&app, "GET", "/dns/dump", None, "").await;
        assert_eq!(dump, "2.2.2.2\tfoo.lan\n");
    }

    #[tokio::test]
    async fn test_add_missing_required_key() {
        let app = test_router().await;
        let (status, body) =
            send(&app, "POST", "/source/add", FORM, "source.type=static").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, ERROR_BODY);
    }

    #[tokio::test]
    async fn test_delete_and_errors() {
        let app = test_router().await;
        send(
            &app,
            "POST",
            "/source/add",
            FORM,
            "source.name=s&source.type=static&config.key=foo.lan&config.val=1.2.3.4",
        )
        .await;

        let (status, _) =
            send(&app, "POST", "/source/delete", FORM, "source.name=s").await;
        assert_eq!(status, StatusCode::OK);

        // Second delete: the source is gone.
        let (status, body) =
            send(&app, "POST", "/source/delete", FORM, "source.name=s").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, ERROR_BODY);

        let (_, list) = send(&app, "GET", "/source/list", None, "").await;
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_update_round_trip() {
        let app = test_router().await;
        send(
            &app,
            "POST",
            "/source/add",
            FORM,
            "source.name=s&source.type=static&config.key=foo.lan&config.val=1.2.3.4",
        )
        .await;
        let (status, _) =
            send(&app, "PUT", "/source/update", FORM, "source.name=s").await;
        assert_eq!(status, StatusCode::OK);
        let (_, dump) = send(&app, "GET", "/dns/dump", None, "").await;
        assert_eq!(dump, "1.2.3.4\tfoo.lan\n");
    }

    #[tokio::test]
    async fn test_method_first_dispatch() {
        let app = test_router().await;

        // A read method on a mutating path is an unhandled URL.
        let (status, body) = send(&app, "GET", "/source/add", None, "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, ERROR_BODY);

        // And a mutating method on a read path likewise.
        let (status, _) = send(&app, "POST", "/source/list", FORM, "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, _) = send(&app, "POST", "/dns/dump", FORM, "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_favicon_and_unknown_paths() {
        let app = test_router().await;
        let (status, _) = send(&app, "GET", "/favicon.ico", None, "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, "GET", "/nonsense", None, "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, ERROR_BODY);
    }
}
