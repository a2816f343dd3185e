//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::config::Args;
use crate::rate_limit::spawn_cleanup_task;
use crate::routes;
use crate::service::LexiconService;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub service: Arc<LexiconService>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(args: Args, service: Arc<LexiconService>) -> Self {
        Self {
            args,
            service,
            started_at: Instant::now(),
        }
    }
}

/// Run the HTTP server
pub async fn run(state: Arc<AppState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!("Lexicon listening on {}", state.args.listen);

    // Prune expired rate-limit windows every 60 seconds
    spawn_cleanup_task(state.service.rate_limiter(), Duration::from_secs(60));

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let subject = client_subject(req.headers(), addr, &state.args.trusted_proxies);

    debug!("[{}] {} {}", subject, method, path);

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            routes::health_check(Arc::clone(&state)).await
        }

        (Method::GET, "/api/v1/stats") => routes::stats(Arc::clone(&state)),

        (Method::GET, "/api/v1/entries/resolve") => {
            routes::handle_resolve(Arc::clone(&state), &subject, query.as_deref()).await
        }

        (Method::GET, "/api/v1/entries/similar") => {
            routes::handle_similar(Arc::clone(&state), &subject, query.as_deref()).await
        }

        (Method::GET, "/api/v1/entries/recent") => {
            routes::handle_recent(Arc::clone(&state), query.as_deref()).await
        }

        (Method::GET, "/api/v1/entries/popular") => {
            routes::handle_popular(Arc::clone(&state), query.as_deref()).await
        }

        (Method::OPTIONS, _) => preflight_response(),

        _ => not_found_response(&path),
    };

    Ok(to_boxed(response))
}

/// Rate-limit subject for a request
///
/// `X-Forwarded-For` is honoured only when the peer is a trusted proxy. The
/// chain is walked from the right and the first address that is not itself
/// a trusted proxy is the client. Anything else uses the peer IP.
fn client_subject(headers: &HeaderMap, addr: SocketAddr, trusted_proxies: &[IpAddr]) -> String {
    let peer = addr.ip();
    if !trusted_proxies.contains(&peer) {
        return peer.to_string();
    }

    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|chain| {
            chain
                .rsplit(',')
                .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
                .find(|ip| !trusted_proxies.contains(ip))
        })
        .unwrap_or(peer)
        .to_string()
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "not_found",
        "message": "No such endpoint",
        "path": path,
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
