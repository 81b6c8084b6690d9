use crate::csr::CsrSigningService;
use crate::error::TokenBridgeError;
use crate::policy::credentials::decode_basic_authorization;
use crate::security::metrics::{SecurityMetrics, SecurityMetricsSnapshot};
use crate::Result;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

pub const CSR_CONTENT_TYPE: &str = "application/x-x509-ca-cert";
const MAX_CSR_BYTES: u64 = 64 * 1024;
const REALM: &str = "tokenbridge";

/// HTTP front end of the CSR signing service
pub struct CsrApi {
    service: Arc<CsrSigningService>,
    metrics: Arc<SecurityMetrics>,
    transport_is_secure: bool,
    start_time: Instant,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub metrics: SecurityMetricsSnapshot,
}

impl CsrApi {
    /// `transport_is_secure` states whether requests reach this API over TLS
    pub fn new(
        service: Arc<CsrSigningService>,
        metrics: Arc<SecurityMetrics>,
        transport_is_secure: bool,
    ) -> Self {
        Self {
            service,
            metrics,
            transport_is_secure,
            start_time: Instant::now(),
        }
    }

    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_metrics(self.metrics.clone()))
            .and(with_start_time(self.start_time))
            .and_then(handle_health);

        let csr = warp::path!("ssg" / "csr")
            .and(warp::post())
            .and(warp::header::optional::<String>("authorization"))
            .and(warp::body::content_length_limit(MAX_CSR_BYTES))
            .and(warp::body::bytes())
            .and(with_transport_security(self.transport_is_secure))
            .and(with_service(self.service.clone()))
            .and_then(handle_csr);

        health
            .or(csr)
            .with(warp::trace::request())
            .recover(handle_rejection)
    }

    /// Serve until the task is dropped; TLS is used when both paths are given
    pub async fn serve(&self, addr: SocketAddr, tls: Option<(PathBuf, PathBuf)>) -> Result<()> {
        let routes = self.routes();
        match tls {
            Some((cert_path, key_path)) => {
                info!("Starting CSR endpoint on https://{}", addr);
                warp::serve(routes)
                    .tls()
                    .cert_path(cert_path)
                    .key_path(key_path)
                    .run(addr)
                    .await;
            }
            None => {
                warn!("Starting CSR endpoint on http://{} without TLS; CSR requests will be refused", addr);
                warp::serve(routes).run(addr).await;
            }
        }
        Ok(())
    }
}

fn with_service(
    service: Arc<CsrSigningService>,
) -> impl Filter<Extract = (Arc<CsrSigningService>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

fn with_metrics(
    metrics: Arc<SecurityMetrics>,
) -> impl Filter<Extract = (Arc<SecurityMetrics>,), Error = Infallible> + Clone {
    warp::any().map(move || metrics.clone())
}

fn with_start_time(
    start_time: Instant,
) -> impl Filter<Extract = (Instant,), Error = Infallible> + Clone {
    warp::any().map(move || start_time)
}

fn with_transport_security(
    secure: bool,
) -> impl Filter<Extract = (bool,), Error = Infallible> + Clone {
    warp::any().map(move || secure)
}

async fn handle_health(
    metrics: Arc<SecurityMetrics>,
    start_time: Instant,
) -> std::result::Result<impl Reply, Rejection> {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: start_time.elapsed().as_secs(),
        metrics: metrics.snapshot(),
    };
    Ok(warp::reply::json(&response))
}

async fn handle_csr(
    authorization: Option<String>,
    body: Bytes,
    transport_is_secure: bool,
    service: Arc<CsrSigningService>,
) -> std::result::Result<warp::reply::Response, Rejection> {
    let credentials = authorization
        .as_deref()
        .and_then(|value| decode_basic_authorization(value).ok());

    match service.handle_csr_request(transport_is_secure, credentials, &body).await {
        Ok(der) => Ok(warp::reply::with_header(
            warp::reply::with_status(der, StatusCode::OK),
            "content-type",
            CSR_CONTENT_TYPE,
        )
        .into_response()),
        Err(e) => Ok(error_reply(&e)),
    }
}

fn error_reply(e: &TokenBridgeError) -> warp::reply::Response {
    let code = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if code.is_server_error() {
        error!("CSR request failed: {}", e);
    }
    // Server-side failures are not described to the client
    let message = if code == StatusCode::INTERNAL_SERVER_ERROR {
        "Internal Server Error".to_string()
    } else {
        e.to_string()
    };

    let json = warp::reply::json(&ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(message),
    });
    let reply = warp::reply::with_status(json, code);
    if code == StatusCode::UNAUTHORIZED {
        warp::reply::with_header(reply, "www-authenticate", format!("Basic realm=\"{}\"", REALM)).into_response()
    } else {
        reply.into_response()
    }
}

async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, Infallible> {
    let code;
    let message;

    if err.is_not_found() {
        code = StatusCode::NOT_FOUND;
        message = "Not Found";
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        code = StatusCode::PAYLOAD_TOO_LARGE;
        message = "CSR too large";
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        code = StatusCode::METHOD_NOT_ALLOWED;
        message = "Method Not Allowed";
    } else {
        error!("Unhandled rejection: {:?}", err);
        code = StatusCode::INTERNAL_SERVER_ERROR;
        message = "Internal Server Error";
    }

    let json = warp::reply::json(&ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(message.to_string()),
    });
    Ok(warp::reply::with_status(json, code))
}
