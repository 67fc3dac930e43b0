//! Forwarding of admitted requests to the upstream.

use axum::body::Body;
use axum::extract::{ConnectInfo, OriginalUri, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use reqwest::Url;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::UpstreamConfig;
use crate::error::{RatekeeperError, Result};

/// Largest request body buffered before forwarding.
const MAX_REQUEST_BODY: usize = 2 * 1024 * 1024;

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe a single connection and must not be relayed.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Relays requests to a single upstream base URL.
pub struct Forwarder {
    client: reqwest::Client,
    upstream: Url,
}

impl Forwarder {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let upstream = Url::parse(&config.url)
            .map_err(|e| RatekeeperError::Config(format!("invalid upstream url: {}", e)))?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            // Redirects belong to the caller
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| RatekeeperError::Config(format!("cannot build upstream client: {}", e)))?;

        Ok(Self { client, upstream })
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Map an inbound URI onto the upstream.
    ///
    /// Scheme and authority come from the upstream. The inbound path is
    /// appended to the upstream path with exactly one slash between them, and
    /// the two queries are joined with `&`.
    pub fn target_url(&self, uri: &Uri) -> Url {
        let mut target = self.upstream.clone();

        let path = join_path(self.upstream.path(), uri.path());
        target.set_path(&path);

        let query = match (self.upstream.query(), uri.query()) {
            (Some(base), Some(extra)) if !base.is_empty() && !extra.is_empty() => {
                Some(format!("{}&{}", base, extra))
            }
            (Some(base), _) if !base.is_empty() => Some(base.to_string()),
            (_, Some(extra)) if !extra.is_empty() => Some(extra.to_string()),
            _ => None,
        };
        target.set_query(query.as_deref());

        target
    }

    /// Send `request` to the upstream and stream its response back.
    pub async fn forward(&self, original_uri: &Uri, request: Request) -> Result<Response> {
        let target = self.target_url(original_uri);
        let (parts, body) = request.into_parts();

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        // The client derives Host from the target URL
        if let Some(host) = headers.remove(header::HOST) {
            headers.insert(X_FORWARDED_HOST, host);
        }
        if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            append_forwarded_for(&mut headers, peer);
        }

        let body = axum::body::to_bytes(body, MAX_REQUEST_BODY)
            .await
            .map_err(|e| RatekeeperError::BadRequest(format!("unreadable request body: {}", e)))?;

        debug!(method = %parts.method, target = %target, "Forwarding request");

        let upstream = self
            .client
            .request(parts.method, target)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// Handler for every admitted request.
pub async fn proxy(
    State(forwarder): State<Arc<Forwarder>>,
    OriginalUri(original_uri): OriginalUri,
    request: Request,
) -> Response {
    match forwarder.forward(&original_uri, request).await {
        Ok(response) => response,
        Err(RatekeeperError::Upstream(e)) => {
            error!(upstream = %forwarder.upstream(), error = %e, "Upstream request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
        Err(RatekeeperError::BadRequest(reason)) => {
            debug!(reason = %reason, "Rejecting malformed request");
            StatusCode::BAD_REQUEST.into_response()
        }
        Err(e) => {
            error!(error = %e, "Could not forward request");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: &SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    fn forwarder(url: &str) -> Forwarder {
        Forwarder::new(&UpstreamConfig {
            url: url.to_string(),
            connect_timeout_ms: 1000,
        })
        .unwrap()
    }

    fn target(base: &str, uri: &str) -> String {
        forwarder(base).target_url(&uri.parse().unwrap()).to_string()
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/test", "/"), "/test/");
        assert_eq!(join_path("/test/", "/a"), "/test/a");
        assert_eq!(join_path("/test", "a"), "/test/a");
        assert_eq!(join_path("/", "/a/b"), "/a/b");
    }

    #[test]
    fn test_target_url_rewrites_scheme_and_host() {
        assert_eq!(
            target("http://localhost:3000/test", "/"),
            "http://localhost:3000/test/"
        );
        assert_eq!(
            target("https://api.internal", "/v1/items"),
            "https://api.internal/v1/items"
        );
    }

    #[test]
    fn test_target_url_merges_queries() {
        assert_eq!(
            target("http://up/base?token=1", "/x?page=2"),
            "http://up/base/x?token=1&page=2"
        );
        assert_eq!(target("http://up/base?token=1", "/x"), "http://up/base/x?token=1");
        assert_eq!(target("http://up/base", "/x?page=2"), "http://up/base/x?page=2");
        assert_eq!(target("http://up/base", "/x"), "http://up/base/x");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn test_append_forwarded_for() {
        let peer: SocketAddr = "198.51.100.7:4000".parse().unwrap();

        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, &peer);
        assert_eq!(headers[&X_FORWARDED_FOR], "198.51.100.7");

        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.1"));
        append_forwarded_for(&mut headers, &peer);
        assert_eq!(headers[&X_FORWARDED_FOR], "203.0.113.1, 198.51.100.7");
    }

    async fn spawn_upstream(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_forward_relays_response_and_headers() {
        let upstream = Router::new().route(
            "/base/echo",
            get(|headers: HeaderMap| async move {
                let forwarded_host = headers
                    .get("x-forwarded-host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let host = headers
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                (
                    StatusCode::ACCEPTED,
                    [("x-upstream", "yes")],
                    format!("{}|{}", forwarded_host, host),
                )
            }),
        );
        let addr = spawn_upstream(upstream).await;
        let forwarder = Arc::new(forwarder(&format!("http://{}/base", addr)));

        let mut request = axum::http::Request::builder()
            .uri("/echo")
            .header(header::HOST, "gateway.example.com")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("192.0.2.10:5555".parse().unwrap()));

        let response = forwarder
            .forward(&"/echo".parse().unwrap(), request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()["x-upstream"], "yes");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(body.to_vec()).unwrap(),
            format!("gateway.example.com|{}", addr)
        );
    }

    #[tokio::test]
    async fn test_redirects_are_passed_through() {
        let upstream = Router::new().route(
            "/old",
            get(|| async { axum::response::Redirect::temporary("/new") }),
        );
        let addr = spawn_upstream(upstream).await;
        let forwarder = forwarder(&format!("http://{}", addr));

        let request = axum::http::Request::builder()
            .uri("/old")
            .body(Body::empty())
            .unwrap();
        let response = forwarder
            .forward(&"/old".parse().unwrap(), request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "/new");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let app = Router::new()
            .route("/", get(proxy))
            .with_state(Arc::new(forwarder(&format!("http://{}", addr))));

        let request = axum::http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let response = tower::ServiceExt::oneshot(app, request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
