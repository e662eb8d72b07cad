use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, StreamExt};
use opentelemetry::KeyValue;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{info, warn, Instrument};

use crate::auth::CredentialScheme;
use crate::error::GatewayError;
use crate::route::{parse_request_path, Action, Route, RouteTriple};
use crate::state::{AppState, InflightGuard};
use crate::streaming::StreamTranscoder;
use crate::translate::{convert_request_body, convert_response_body};

struct RequestContext {
    request_id: String,
    path: String,
    route: &'static str,
    action: &'static str,
    start: Instant,
}

pub async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    let request_id = next_request_id();
    let span = tracing::info_span!(
        "gateway.request",
        request_id = %request_id,
        route = tracing::field::Empty,
        action = tracing::field::Empty
    );
    dispatch(state, req, request_id).instrument(span).await
}

async fn dispatch(state: AppState, req: Request, request_id: String) -> Response {
    let mut ctx = RequestContext {
        request_id,
        path: req.uri().path().to_string(),
        route: "passthrough",
        action: "none",
        start: Instant::now(),
    };
    let route = parse_request_path(&ctx.path);
    if let Route::Matched(triple) = &route {
        ctx.route = "matched";
        ctx.action = Action::parse(&triple.action)
            .map(|a| a.as_str())
            .unwrap_or("unsupported");
    }
    let span = tracing::Span::current();
    span.record("route", ctx.route);
    span.record("action", ctx.action);
    state.metrics.requests.add(
        1,
        &[
            KeyValue::new("route", ctx.route),
            KeyValue::new("action", ctx.action),
        ],
    );

    let Some(inflight) = state.try_acquire() else {
        return fail(&state, &ctx, GatewayError::Overloaded);
    };

    let result = match route {
        Route::Matched(triple) => forward_matched(&state, &ctx, triple, req, inflight).await,
        Route::Passthrough => forward_passthrough(&state, req, inflight).await,
    };

    let latency_ms = ctx.start.elapsed().as_millis();
    state.metrics.latency_ms.record(
        latency_ms as f64,
        &[KeyValue::new("route", ctx.route)],
    );
    match result {
        Ok(resp) => {
            info!(
                request_id = %ctx.request_id,
                route = ctx.route,
                action = ctx.action,
                status = resp.status().as_u16(),
                latency_ms = latency_ms,
                "request completed"
            );
            resp
        }
        Err(err) => fail(&state, &ctx, err),
    }
}

async fn forward_matched(
    state: &AppState,
    ctx: &RequestContext,
    triple: RouteTriple,
    req: Request,
    inflight: InflightGuard,
) -> Result<Response, GatewayError> {
    let route = triple.resolve()?;
    if !state
        .guard
        .check(CredentialScheme::HeaderOrQueryKey, req.headers(), req.uri())
    {
        return Err(GatewayError::Auth);
    }

    let (parts, body) = req.into_parts();
    let raw = axum::body::to_bytes(body, state.config.server.max_body_bytes)
        .await
        .map_err(|e| GatewayError::BodyRead(e.to_string()))?;
    let translated = convert_request_body(&raw, route.action, &route.model, &state.config.translate)
        .map_err(|e| {
            warn!(
                request_id = %ctx.request_id,
                raw = %String::from_utf8_lossy(&raw),
                "request body rejected"
            );
            GatewayError::RequestDecode(e)
        })?;
    if state.config.observability.dump_bodies {
        info!(
            request_id = %ctx.request_id,
            "backend request: {}",
            String::from_utf8_lossy(&translated)
        );
    }

    let mut headers = filtered_headers(
        &parts.headers,
        &[
            header::HOST,
            header::CONTENT_LENGTH,
            header::ACCEPT_ENCODING,
            header::CONTENT_TYPE,
        ],
    );
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let url = state.config.backend_url(&route.upstream_path, parts.uri.query());
    let mut builder = state
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(translated);
    if !route.action.is_stream()
        && let Some(timeout) = state.config.read_timeout()
    {
        builder = builder.timeout(timeout);
    }
    let resp = builder
        .send()
        .await
        .map_err(|e| GatewayError::Transport(e.without_url()))?;

    let status = resp.status();
    if status != StatusCode::OK {
        info!(
            request_id = %ctx.request_id,
            status = status.as_u16(),
            "backend returned non-200, passing through"
        );
        return Ok(relay_response(resp, inflight));
    }

    if route.action.is_stream() {
        Ok(stream_response(state, ctx, resp, inflight))
    } else {
        buffered_response(state, ctx, resp, route.action).await
    }
}

async fn buffered_response(
    state: &AppState,
    ctx: &RequestContext,
    resp: reqwest::Response,
    action: Action,
) -> Result<Response, GatewayError> {
    let mut headers = filtered_headers(
        resp.headers(),
        &[
            header::CONTENT_LENGTH,
            header::CONTENT_ENCODING,
            header::CONTENT_TYPE,
        ],
    );
    let raw = resp
        .bytes()
        .await
        .map_err(|e| GatewayError::ResponseRead(e.to_string()))?;
    if state.config.observability.dump_bodies {
        info!(
            request_id = %ctx.request_id,
            "backend response: {}",
            String::from_utf8_lossy(&raw)
        );
    }
    let converted = convert_response_body(&raw, action).map_err(|e| {
        warn!(
            request_id = %ctx.request_id,
            raw = %String::from_utf8_lossy(&raw),
            "backend response rejected"
        );
        GatewayError::ResponseDecode(e)
    })?;

    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(converted.len()));
    let mut out = Response::new(Body::from(converted));
    *out.headers_mut() = headers;
    Ok(out)
}

fn stream_response(
    state: &AppState,
    ctx: &RequestContext,
    resp: reqwest::Response,
    inflight: InflightGuard,
) -> Response {
    let mut headers = filtered_headers(resp.headers(), &[header::CONTENT_LENGTH]);
    headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

    let transcoder = StreamTranscoder::new(
        state.config.limits.stream_buffer,
        state.config.server.max_body_bytes,
        state.config.observability.dump_bodies,
    );
    let (body, done) = transcoder.spawn(resp.bytes_stream());

    let metrics = state.metrics.clone();
    let request_id = ctx.request_id.clone();
    let start = ctx.start;
    tokio::spawn(
        async move {
            let outcome = done.await;
            drop(inflight);
            match outcome {
                Ok(outcome) => {
                    if outcome.diagnostics > 0 {
                        metrics.stream_diagnostics.add(outcome.diagnostics, &[]);
                    }
                    info!(
                        request_id = %request_id,
                        end = ?outcome.end,
                        chunks = outcome.chunks,
                        diagnostics = outcome.diagnostics,
                        latency_ms = start.elapsed().as_millis(),
                        "stream finished"
                    );
                }
                Err(_) => warn!(request_id = %request_id, "stream task ended without an outcome"),
            }
        }
        .in_current_span(),
    );

    let mut out = Response::new(Body::from_stream(body));
    *out.headers_mut() = headers;
    out
}

async fn forward_passthrough(
    state: &AppState,
    req: Request,
    inflight: InflightGuard,
) -> Result<Response, GatewayError> {
    if !state
        .guard
        .check(CredentialScheme::BearerOrQueryKey, req.headers(), req.uri())
    {
        return Err(GatewayError::Auth);
    }

    let (parts, body) = req.into_parts();
    let url = state.config.backend_url(parts.uri.path(), parts.uri.query());
    let mut builder = state
        .client
        .request(parts.method, url)
        .headers(filtered_headers(&parts.headers, &[header::HOST]));
    if carries_body(&parts.headers) {
        let data = body
            .into_data_stream()
            .map(|result| result.map_err(|err| std::io::Error::other(err.to_string())));
        builder = builder.body(reqwest::Body::wrap_stream(data));
    }
    let resp = builder
        .send()
        .await
        .map_err(|e| GatewayError::Transport(e.without_url()))?;
    Ok(relay_response(resp, inflight))
}

fn relay_response(resp: reqwest::Response, inflight: InflightGuard) -> Response {
    let status = resp.status();
    let headers = filtered_headers(resp.headers(), &[]);
    let mut out = Response::new(Body::from_stream(GuardedStream {
        inner: Box::pin(resp.bytes_stream()),
        _inflight: inflight,
    }));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

struct GuardedStream<S> {
    inner: Pin<Box<S>>,
    _inflight: InflightGuard,
}

impl<S: Stream> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn filtered_headers(headers: &HeaderMap, strip: &[HeaderName]) -> HeaderMap {
    // Headers named in `Connection` are hop-by-hop too.
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|n| n.trim().to_ascii_lowercase())
        .filter(|n| !n.is_empty())
        .collect();
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || strip.contains(name)
            || named.iter().any(|n| n == name.as_str())
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn carries_body(headers: &HeaderMap) -> bool {
    headers.contains_key(header::TRANSFER_ENCODING)
        || headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .is_some_and(|len| len > 0)
}

fn fail(state: &AppState, ctx: &RequestContext, err: GatewayError) -> Response {
    state
        .metrics
        .errors
        .add(1, &[KeyValue::new("type", err.kind())]);
    warn!(
        request_id = %ctx.request_id,
        route = ctx.route,
        action = ctx.action,
        path = %ctx.path,
        status = err.status().as_u16(),
        error_type = err.kind(),
        latency_ms = ctx.start.elapsed().as_millis(),
        error = %err,
        "request failed"
    );
    err.into_response()
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("req-{}-{}", ts, seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::init_metrics_noop;
    use axum::Router;
    use axum::http::Method;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Recorded {
        method: Method,
        path: String,
        query: Option<String>,
        headers: HeaderMap,
        body: Vec<u8>,
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Recorded>>>);

    impl Recorder {
        fn calls(&self) -> Vec<Recorded> {
            self.0.lock().expect("lock").clone()
        }
    }

    fn backend(
        recorder: Recorder,
        status: StatusCode,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    ) -> Router {
        Router::new().fallback(move |req: Request| {
            let recorder = recorder.clone();
            let headers = headers.clone();
            async move {
                let (parts, body_in) = req.into_parts();
                let bytes = axum::body::to_bytes(body_in, usize::MAX)
                    .await
                    .expect("backend body");
                recorder.0.lock().expect("lock").push(Recorded {
                    method: parts.method,
                    path: parts.uri.path().to_string(),
                    query: parts.uri.query().map(str::to_string),
                    headers: parts.headers,
                    body: bytes.to_vec(),
                });
                let mut resp = Response::new(Body::from(body));
                *resp.status_mut() = status;
                for (name, value) in headers {
                    resp.headers_mut().insert(
                        HeaderName::from_static(name),
                        HeaderValue::from_static(value),
                    );
                }
                resp
            }
        })
    }

    async fn spawn_backend(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{}", addr)
    }

    fn state_for(base_url: &str, api_key: Option<&str>) -> AppState {
        let mut config = Config::default();
        config.backend.base_url = base_url.to_string();
        config.auth.api_key = api_key.map(str::to_string);
        let counter = Arc::new(AtomicU64::new(0));
        AppState::new(config, init_metrics_noop(counter.clone()), counter).expect("state")
    }

    fn request(method: Method, uri: &str, headers: &[(&str, &str)], body: &str) -> Request {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        resp.into_body()
            .collect()
            .await
            .expect("collect")
            .to_bytes()
            .to_vec()
    }

    async fn body_json(resp: Response) -> Value {
        serde_json::from_slice(&body_bytes(resp).await).expect("json body")
    }

    const SCENARIO_A: &str = r#"{"contents":[{"parts":[{"text":"Hello"}]}],"generationConfig":{"maxOutputTokens":100,"stopSequences":["\n\n"],"responseMimeType":"text/plain"}}"#;
    const SCENARIO_B: &str = r#"{"id":"chatcmpl-1","object":"chat.completion","model":"gemma3:1b","choices":[{"index":0,"message":{"role":"assistant","content":"Hi"},"finish_reason":"stop"}],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#;

    #[tokio::test]
    async fn generate_content_is_translated_both_ways() {
        let recorder = Recorder::default();
        let url = spawn_backend(backend(
            recorder.clone(),
            StatusCode::OK,
            vec![("content-type", "application/json; charset=utf-8")],
            SCENARIO_B,
        ))
        .await;
        let state = state_for(&url, Some("secret"));

        let resp = proxy(
            State(state),
            request(
                Method::POST,
                "/v1beta/models/gemma-3-1b-it:generateContent?key=secret",
                &[("accept-encoding", "gzip"), ("x-trace", "abc")],
                SCENARIO_A,
            ),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
        let length: usize = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .expect("content-length");
        let bytes = body_bytes(resp).await;
        assert_eq!(bytes.len(), length);
        let value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(
            value,
            json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "Hi"}]},
                    "index": 0,
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 1, "totalTokenCount": 2},
                "modelVersion": "gemma-3-1b-it"
            })
        );

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.method, Method::POST);
        assert_eq!(call.path, "/v1/chat/completions");
        assert_eq!(call.query.as_deref(), Some("key=secret"));
        assert!(call.headers.get(header::ACCEPT_ENCODING).is_none());
        assert_eq!(call.headers.get("x-trace").and_then(|v| v.to_str().ok()), Some("abc"));
        assert_eq!(
            call.headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
        let sent: Value = serde_json::from_slice(&call.body).expect("backend json");
        assert_eq!(sent["model"], "gemma3:1b");
        assert_eq!(sent["messages"], json!([{"role": "user", "content": "Hello"}]));
        assert_eq!(sent["max_tokens"], 100);
        assert_eq!(sent["stop"], json!(["\n\n"]));
        assert_eq!(sent["response_format"], json!({"type": "text"}));
        assert_eq!(sent["stream"], false);
        assert!(sent.get("stream_options").is_none());
    }

    #[tokio::test]
    async fn stream_generate_content_emits_one_line_per_chunk() {
        let recorder = Recorder::default();
        let sse = "data: {\"model\":\"gemma3:4b\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"},\"finish_reason\":null}]}\n\n\
                   data: {\"model\":\"gemma3:4b\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" there\"},\"finish_reason\":\"stop\"}]}\n\n\
                   data: [DONE]\n\n";
        let url = spawn_backend(backend(
            recorder.clone(),
            StatusCode::OK,
            vec![("content-type", "text/event-stream")],
            sse,
        ))
        .await;
        let state = state_for(&url, Some("secret"));

        let resp = proxy(
            State(state.clone()),
            request(
                Method::POST,
                "/v1beta/models/gemma-3-4b-it:streamGenerateContent?alt=sse",
                &[("x-goog-api-key", "secret")],
                r#"{"contents":[{"role":"user","parts":[{"text":"Hi"}]}]}"#,
            ),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(
            resp.headers().get(header::TRANSFER_ENCODING).and_then(|v| v.to_str().ok()),
            Some("chunked")
        );
        let text = String::from_utf8(body_bytes(resp).await).expect("utf8");
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["candidates"][0]["content"]["parts"][0]["text"], "Hello");
        assert_eq!(lines[1]["candidates"][0]["content"]["parts"][0]["text"], " there");
        assert_eq!(lines[1]["candidates"][0]["finishReason"], "STOP");
        assert_eq!(lines[1]["modelVersion"], "gemma-3-4b-it");

        let sent: Value = serde_json::from_slice(&recorder.calls()[0].body).expect("json");
        assert_eq!(sent["stream"], true);
        assert_eq!(sent["stream_options"], json!({"include_usage": true}));
        assert_eq!(recorder.calls()[0].query.as_deref(), Some("alt=sse"));
    }

    #[tokio::test]
    async fn non_200_is_relayed_unchanged_on_matched_route() {
        let recorder = Recorder::default();
        let body = r#"{"error":{"message":"model \"gemma3:1b\" not found"}}"#;
        let url = spawn_backend(backend(
            recorder.clone(),
            StatusCode::NOT_FOUND,
            vec![("content-type", "application/json"), ("x-backend", "ollama")],
            body,
        ))
        .await;
        let state = state_for(&url, None);

        let resp = proxy(
            State(state),
            request(Method::POST, "/v1/models/gemma-3-1b-it:generateContent", &[], SCENARIO_A),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers().get("x-backend").and_then(|v| v.to_str().ok()), Some("ollama"));
        assert_eq!(body_bytes(resp).await, body.as_bytes());
    }

    #[tokio::test]
    async fn wrong_key_is_rejected_before_forwarding() {
        let recorder = Recorder::default();
        let url = spawn_backend(backend(recorder.clone(), StatusCode::OK, vec![], SCENARIO_B)).await;
        let state = state_for(&url, Some("secret"));

        let resp = proxy(
            State(state.clone()),
            request(
                Method::POST,
                "/v1beta/models/gemma-3-1b-it:generateContent",
                &[("x-goog-api-key", "nope")],
                SCENARIO_A,
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(resp).await["error"]["status"], "PERMISSION_DENIED");

        let resp = proxy(
            State(state),
            request(Method::POST, "/v1beta/models/gemma-3-1b-it:generateContent", &[], SCENARIO_A),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn unsupported_route_is_404_without_backend_contact() {
        let recorder = Recorder::default();
        let url = spawn_backend(backend(recorder.clone(), StatusCode::OK, vec![], SCENARIO_B)).await;
        let state = state_for(&url, None);

        for uri in [
            "/v1beta/models/gemma-3-1b-it:countTokens",
            "/v2/models/gemma-3-1b-it:generateContent",
        ] {
            let resp = proxy(State(state.clone()), request(Method::POST, uri, &[], SCENARIO_A)).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{}", uri);
            let value = body_json(resp).await;
            assert_eq!(value["error"]["code"], 404);
            assert_eq!(value["error"]["status"], "NOT_FOUND");
        }
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn undecodable_request_body_is_500_without_backend_contact() {
        let recorder = Recorder::default();
        let url = spawn_backend(backend(recorder.clone(), StatusCode::OK, vec![], SCENARIO_B)).await;
        let state = state_for(&url, None);

        let resp = proxy(
            State(state),
            request(Method::POST, "/v1beta/models/gemma-3-1b-it:generateContent", &[], "{nope"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn undecodable_backend_reply_replaces_200_with_500() {
        let recorder = Recorder::default();
        let url = spawn_backend(backend(recorder.clone(), StatusCode::OK, vec![], "not json")).await;
        let state = state_for(&url, None);

        let resp = proxy(
            State(state),
            request(Method::POST, "/v1beta/models/gemma-3-1b-it:generateContent", &[], SCENARIO_A),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["error"]["status"], "INTERNAL");
        assert_eq!(recorder.calls().len(), 1);
    }

    #[tokio::test]
    async fn generate_answer_bodies_are_forwarded_untouched() {
        let recorder = Recorder::default();
        let reply = r#"{"answer":{"content":{"parts":[{"text":"42"}]}}}"#;
        let url = spawn_backend(backend(
            recorder.clone(),
            StatusCode::OK,
            vec![("content-type", "text/plain")],
            reply,
        ))
        .await;
        let state = state_for(&url, None);
        let payload = r#"{"contents": [ {"parts":[{"text":"q"}]} ], "answerStyle":"VERBOSE"}"#;

        let resp = proxy(
            State(state),
            request(Method::POST, "/v1beta/models/aqa:generateAnswer", &[], payload),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
        assert_eq!(body_bytes(resp).await, reply.as_bytes());

        let calls = recorder.calls();
        assert_eq!(calls[0].path, "/v1/chat/completions");
        assert_eq!(calls[0].body, payload.as_bytes());
    }

    #[tokio::test]
    async fn passthrough_relays_request_and_response() {
        let recorder = Recorder::default();
        let url = spawn_backend(backend(
            recorder.clone(),
            StatusCode::CREATED,
            vec![("content-type", "application/x-ndjson"), ("x-backend", "ollama")],
            "{\"status\":\"success\"}\n",
        ))
        .await;
        let state = state_for(&url, Some("secret"));
        let payload = r#"{"model":"gemma3:1b"}"#;
        let length = payload.len().to_string();

        let resp = proxy(
            State(state),
            request(
                Method::POST,
                "/api/pull?insecure=true",
                &[
                    ("authorization", "Bearer secret"),
                    ("content-type", "application/json"),
                    ("content-length", length.as_str()),
                ],
                payload,
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get("x-backend").and_then(|v| v.to_str().ok()), Some("ollama"));
        assert_eq!(body_bytes(resp).await, b"{\"status\":\"success\"}\n");

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, Method::POST);
        assert_eq!(calls[0].path, "/api/pull");
        assert_eq!(calls[0].query.as_deref(), Some("insecure=true"));
        assert_eq!(calls[0].body, payload.as_bytes());
        assert_eq!(
            calls[0].headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer secret")
        );
    }

    #[tokio::test]
    async fn passthrough_uses_bearer_or_bare_query_key() {
        let recorder = Recorder::default();
        let url = spawn_backend(backend(recorder.clone(), StatusCode::OK, vec![], "{\"models\":[]}")).await;
        let state = state_for(&url, Some("secret"));

        let resp = proxy(State(state.clone()), request(Method::GET, "/api/tags?key=secret", &[], "")).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = proxy(
            State(state.clone()),
            request(Method::GET, "/api/tags?key=secret", &[("authorization", "Bearer wrong")], ""),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = proxy(
            State(state),
            request(Method::GET, "/api/tags", &[("x-goog-api-key", "secret")], ""),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        assert_eq!(recorder.calls().len(), 1);
        assert!(recorder.calls()[0].body.is_empty());
    }

    #[tokio::test]
    async fn passthrough_non_200_is_relayed_verbatim() {
        let recorder = Recorder::default();
        let url = spawn_backend(backend(
            recorder.clone(),
            StatusCode::SERVICE_UNAVAILABLE,
            vec![("retry-after", "3")],
            "warming up",
        ))
        .await;
        let state = state_for(&url, None);

        let resp = proxy(State(state), request(Method::GET, "/api/ps", &[], "")).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get("retry-after").and_then(|v| v.to_str().ok()), Some("3"));
        assert_eq!(body_bytes(resp).await, b"warming up");
    }

    #[tokio::test]
    async fn unreachable_backend_is_502() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let state = state_for(&format!("http://{}", addr), None);

        let resp = proxy(
            State(state),
            request(Method::POST, "/v1beta/models/gemma-3-1b-it:generateContent", &[], SCENARIO_A),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(resp).await["error"]["status"], "UNAVAILABLE");
    }

    #[tokio::test]
    async fn inflight_limit_returns_429() {
        let mut config = Config::default();
        config.limits.max_inflight = 1;
        let counter = Arc::new(AtomicU64::new(0));
        let state = AppState::new(config, init_metrics_noop(counter.clone()), counter).expect("state");
        let _held = state.try_acquire().expect("permit");

        let resp = proxy(
            State(state),
            request(Method::POST, "/v1beta/models/gemma-3-1b-it:generateContent", &[], SCENARIO_A),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(resp).await["error"]["status"], "RESOURCE_EXHAUSTED");
    }

    #[test]
    fn hop_by_hop_and_named_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::HOST, HeaderValue::from_static("gateway"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));

        let out = filtered_headers(&headers, &[header::HOST]);
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert!(out.get(header::HOST).is_none());
        assert_eq!(out.get_all("x-multi").iter().count(), 2);
    }

    #[test]
    fn headers_named_in_connection_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.append(header::CONNECTION, HeaderValue::from_static("close, X-Session-Hop"));
        headers.append(header::CONNECTION, HeaderValue::from_static("x-other-hop"));
        headers.insert("x-session-hop", HeaderValue::from_static("1"));
        headers.insert("x-other-hop", HeaderValue::from_static("2"));
        headers.insert("x-kept", HeaderValue::from_static("3"));

        let out = filtered_headers(&headers, &[]);
        assert!(out.get("x-session-hop").is_none());
        assert!(out.get("x-other-hop").is_none());
        assert_eq!(out.get("x-kept").and_then(|v| v.to_str().ok()), Some("3"));
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn connection_named_headers_are_not_forwarded() {
        let recorder = Recorder::default();
        let url = spawn_backend(backend(recorder.clone(), StatusCode::OK, vec![], "{}")).await;
        let state = state_for(&url, None);

        let resp = proxy(
            State(state),
            request(
                Method::GET,
                "/api/version",
                &[("connection", "x-hop"), ("x-hop", "secret-ish"), ("x-end", "kept")],
                "",
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let calls = recorder.calls();
        assert!(calls[0].headers.get("x-hop").is_none());
        assert_eq!(calls[0].headers.get("x-end").and_then(|v| v.to_str().ok()), Some("kept"));
    }

    #[tokio::test]
    async fn percent_encoded_action_separator_is_routed() {
        let recorder = Recorder::default();
        let url = spawn_backend(backend(recorder.clone(), StatusCode::OK, vec![], SCENARIO_B)).await;
        let state = state_for(&url, None);

        let resp = proxy(
            State(state),
            request(
                Method::POST,
                "/v1beta/models/gemma-3-1b-it%3AgenerateContent",
                &[],
                SCENARIO_A,
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["modelVersion"], "gemma-3-1b-it");
        let calls = recorder.calls();
        assert_eq!(calls[0].path, "/v1/chat/completions");
        let sent: Value = serde_json::from_slice(&calls[0].body).expect("json");
        assert_eq!(sent["model"], "gemma3:1b");
    }

    #[test]
    fn body_presence_follows_framing_headers() {
        let mut headers = HeaderMap::new();
        assert!(!carries_body(&headers));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(!carries_body(&headers));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        assert!(carries_body(&headers));

        let mut chunked = HeaderMap::new();
        chunked.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert!(carries_body(&chunked));
    }

    #[test]
    fn request_ids_are_unique() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(a.starts_with("req-"));
        assert_ne!(a, b);
    }
}
