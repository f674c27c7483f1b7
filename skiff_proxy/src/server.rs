//! The serving side of the edge proxy.
//!
//! :80 answers ACME HTTP-01 challenges, redirects to HTTPS where a
//! certificate is active, and forwards plain HTTP otherwise. :443 terminates
//! TLS with a per-SNI certificate and forwards to the route target over the
//! project network. Routing state is only ever read from the journal, so a
//! route becomes visible to these paths strictly after it has been persisted.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path as UrlPath, State};
use axum::http::{Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::acme::{AcmeWorker, CertQueue, ChallengeMap, renewal_loop};
use crate::control::{self, ProxyContext};
use crate::state::{CertStatus, Route, StateJournal};
use crate::tls::CertStore;

type ForwardClient = Client<HttpConnector, Body>;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub state_dir: PathBuf,
    pub certs_dir: PathBuf,
    pub http_port: u16,
    pub https_port: u16,
    pub acme_email: Option<String>,
    pub acme_directory: Option<String>,
    pub staging: Option<bool>,
}

#[derive(Clone)]
struct ServerState {
    ctx: Arc<ProxyContext>,
    client: ForwardClient,
}

pub async fn run(options: RunOptions) -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    std::fs::create_dir_all(&options.certs_dir)
        .with_context(|| format!("cannot create certs dir {}", options.certs_dir.display()))?;

    let journal = Arc::new(StateJournal::load(&options.state_dir)?);

    // Operator-provided ACME settings fold into persisted state once.
    if options.acme_email.is_some() || options.acme_directory.is_some() || options.staging.is_some()
    {
        journal
            .mutate(|state| {
                if let Some(email) = &options.acme_email {
                    state.lets_encrypt.email = email.clone();
                }
                if let Some(url) = &options.acme_directory {
                    state.lets_encrypt.directory_url = url.clone();
                }
                if let Some(staging) = options.staging {
                    state.lets_encrypt.staging = staging;
                }
            })
            .await?;
    }

    let certs = CertStore::new();
    let snapshot = journal.snapshot().await;
    certs.load_from_state(&snapshot);

    let queue = CertQueue::new();
    let challenges: ChallengeMap = Arc::new(std::sync::RwLock::new(Default::default()));

    let ctx = Arc::new(ProxyContext {
        journal: journal.clone(),
        certs: certs.clone(),
        queue: queue.clone(),
        challenges: challenges.clone(),
        certs_dir: options.certs_dir.clone(),
    });

    // Issuance owed from before the restart resumes from the journal.
    for hostname in snapshot.hosts_needing_certificates() {
        queue.enqueue(&hostname, &snapshot.lets_encrypt.email);
    }

    tokio::spawn(
        AcmeWorker {
            queue: queue.clone(),
            journal: journal.clone(),
            certs: certs.clone(),
            challenges: challenges.clone(),
            certs_dir: options.certs_dir.clone(),
            state_dir: options.state_dir.clone(),
        }
        .run(),
    );
    tokio::spawn(renewal_loop(queue.clone(), journal.clone()));
    {
        let ctx = ctx.clone();
        let state_dir = options.state_dir.clone();
        tokio::spawn(async move {
            if let Err(err) = control::serve(ctx, &state_dir).await {
                warn!(error = %err, "control socket listener exited");
            }
        });
    }

    let client: ForwardClient = Client::builder(TokioExecutor::new()).build_http();
    let server_state = ServerState { ctx, client };

    let app = Router::new()
        .route("/.well-known/acme-challenge/:token", get(serve_challenge))
        .fallback(handle_http)
        .with_state(server_state.clone());
    let http_addr = SocketAddr::from(([0, 0, 0, 0], options.http_port));
    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("cannot bind {http_addr}"))?;
    info!(%http_addr, "HTTP listener up");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(
            http_listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            warn!(error = %err, "HTTP listener exited");
        }
    });

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(certs);
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let https_addr = SocketAddr::from(([0, 0, 0, 0], options.https_port));
    let https_listener = TcpListener::bind(https_addr)
        .await
        .with_context(|| format!("cannot bind {https_addr}"))?;
    info!(%https_addr, "HTTPS listener up");

    loop {
        let (tcp, peer) = match https_listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let state = server_state.clone();
        tokio::spawn(async move {
            let _ = tcp.set_nodelay(true);
            let tls = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(err) => {
                    // Covers hostnames whose certificate is not active yet:
                    // the resolver offers nothing and the handshake is refused.
                    debug!(%peer, error = %err, "TLS handshake failed");
                    return;
                }
            };
            let sni = tls.get_ref().1.server_name().map(str::to_owned);
            let peer_ip = peer.ip();
            let service = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
                let state = state.clone();
                let sni = sni.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(
                        handle_https(state, peer_ip, sni, req.map(Body::new)).await,
                    )
                }
            });
            if let Err(err) = AutoBuilder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!(%peer, error = %err, "connection error");
            }
        });
    }
}

async fn serve_challenge(
    State(state): State<ServerState>,
    UrlPath(token): UrlPath<String>,
) -> Response {
    let key_auth = state.ctx.challenges.read().unwrap().get(&token).cloned();
    match key_auth {
        Some(key_auth) => key_auth.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle_http(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let Some(hostname) = request_host(&req) else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };
    let proxy_state = state.ctx.journal.snapshot().await;
    let Some((_, route)) = proxy_state.find_route(&hostname) else {
        return not_configured(&hostname);
    };
    let route = route.clone();

    let cert_active = route
        .certificate
        .as_ref()
        .is_some_and(|cert| cert.status == CertStatus::Active);
    if route.ssl_enabled && route.ssl_redirect && cert_active {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = format!("https://{hostname}{path}");
        return Response::builder()
            .status(StatusCode::PERMANENT_REDIRECT)
            .header(header::LOCATION, location)
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    forward(&state, &route, &hostname, "http", peer.ip(), req).await
}

async fn handle_https(
    state: ServerState,
    peer_ip: IpAddr,
    sni: Option<String>,
    req: Request<Body>,
) -> Response {
    let Some(hostname) = sni.or_else(|| request_host(&req)) else {
        return (StatusCode::BAD_REQUEST, "no SNI or Host header").into_response();
    };
    let proxy_state = state.ctx.journal.snapshot().await;
    let Some((_, route)) = proxy_state.find_route(&hostname) else {
        return not_configured(&hostname);
    };
    let route = route.clone();
    forward(&state, &route, &hostname, "https", peer_ip, req).await
}

async fn forward(
    state: &ServerState,
    route: &Route,
    hostname: &str,
    scheme: &str,
    peer_ip: IpAddr,
    mut req: Request<Body>,
) -> Response {
    if !route.healthy {
        return (StatusCode::SERVICE_UNAVAILABLE, "upstream marked unhealthy").into_response();
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = match format!("http://{}{path}", route.target).parse() {
        Ok(uri) => uri,
        Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
    };
    *req.uri_mut() = uri;
    // The client derives the upstream Host from the URI.
    req.headers_mut().remove(header::HOST);

    if route.forward_headers {
        let forwarded_for = match req.headers().get("x-forwarded-for") {
            Some(existing) => format!("{}, {peer_ip}", existing.to_str().unwrap_or("")),
            None => peer_ip.to_string(),
        };
        let headers = req.headers_mut();
        if let Ok(value) = forwarded_for.parse() {
            headers.insert("x-forwarded-for", value);
        }
        if let Ok(value) = scheme.parse() {
            headers.insert("x-forwarded-proto", value);
        }
        if let Ok(value) = hostname.parse() {
            headers.insert("x-forwarded-host", value);
        }
    }

    let timeout = Duration::from_secs(route.response_timeout_secs);
    match tokio::time::timeout(timeout, state.client.request(req)).await {
        Ok(Ok(response)) => response.map(Body::new),
        Ok(Err(err)) => {
            warn!(%hostname, target = %route.target, error = %err, "upstream request failed");
            (StatusCode::BAD_GATEWAY, "upstream unreachable").into_response()
        }
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, "upstream timed out").into_response(),
    }
}

fn not_configured(hostname: &str) -> Response {
    warn!("domain \"{hostname}\" not configured");
    (
        StatusCode::NOT_FOUND,
        format!("domain \"{hostname}\" not configured"),
    )
        .into_response()
}

fn request_host(req: &Request<Body>) -> Option<String> {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host())?;
    // Drop any :port suffix.
    Some(raw.split(':').next().unwrap_or(raw).to_owned())
}

/// One-shot HTTP probe used by the deploy engine's health checks, which run
/// inside this container so they cross the same network the proxy uses.
pub async fn probe(url: &str, timeout_secs: u64) -> Result<()> {
    let client: Client<HttpConnector, http_body_util::Empty<bytes::Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let uri: Uri = url.parse().context("invalid probe url")?;
    let req = Request::builder()
        .uri(uri)
        .body(http_body_util::Empty::new())?;
    let response = tokio::time::timeout(Duration::from_secs(timeout_secs), client.request(req))
        .await
        .context("probe timed out")?
        .context("probe request failed")?;
    let status = response.status();
    if status.is_success() || status.is_redirection() {
        Ok(())
    } else {
        bail!("unhealthy: upstream answered {status}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(host: Option<&str>, uri: &str) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn host_header_wins_and_port_is_stripped() {
        let req = request(Some("example.com:8080"), "/path");
        assert_eq!(request_host(&req).as_deref(), Some("example.com"));
    }

    #[test]
    fn absolute_uri_host_is_a_fallback() {
        let req = request(None, "http://fallback.example/path");
        assert_eq!(request_host(&req).as_deref(), Some("fallback.example"));
    }

    #[test]
    fn missing_host_is_none() {
        let req = request(None, "/path");
        assert_eq!(request_host(&req), None);
    }
}
