//! DOR Server - REST access to a digital object repository
//!
//! Serves any backend over the protocol spoken by the REST-proxy backend in
//! `dor-core`. Requests are parsed on the async side and handed to the
//! blocking thread pool, where the route handlers call into the backend.

pub mod handlers;

pub use handlers::{RestRequest, dispatch};

use std::convert::Infallible;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use dor_core::SharedRepository;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_LENGTH, HeaderValue, WWW_AUTHENTICATE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Basic-auth user and password; `None` leaves the server open
    pub credentials: Option<(String, String)>,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials: None,
            max_body_size: 100 * 1024 * 1024, // 100 MB
        }
    }
}

/// Server errors outside the repository itself
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            ServerError::Http(_) | ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ServerError::Http(_) | ServerError::InvalidRequest(_) => "BadRequest",
            ServerError::BodyTooLarge(_) => "BodyTooLarge",
            ServerError::Unauthorized => "Unauthorized",
            ServerError::Internal(_) => "Internal",
        }
    }
}

/// REST request handler over one shared repository
pub struct RestHandler {
    repo: SharedRepository,
    config: Config,
}

impl RestHandler {
    pub fn new(repo: SharedRepository) -> Self {
        Self::with_config(repo, Config::default())
    }

    pub fn with_config(repo: SharedRepository, config: Config) -> Self {
        Self { repo, config }
    }

    pub fn repository(&self) -> &SharedRepository {
        &self.repo
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some((user, pass)) = &self.config.credentials else {
            return true;
        };
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
            .and_then(|raw| String::from_utf8(raw).ok())
            .is_some_and(|pair| pair.split_once(':') == Some((user.as_str(), pass.as_str())))
    }

    /// Handle an incoming HTTP request
    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, ServerError> {
        if !self.authorized(req.headers()) {
            return Err(ServerError::Unauthorized);
        }
        let declared = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > self.config.max_body_size) {
            return Err(ServerError::BodyTooLarge(self.config.max_body_size));
        }

        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or_default().to_string();
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| ServerError::Http(e.to_string()))?
            .to_bytes();
        if body.len() > self.config.max_body_size {
            return Err(ServerError::BodyTooLarge(self.config.max_body_size));
        }

        let request = RestRequest::parse(&method, &path, &query, body).map_err(ServerError::InvalidRequest)?;
        let repo = self.repo.clone();
        tokio::task::spawn_blocking(move || dispatch(&repo, &request))
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))
    }

    /// Like [`handle`](Self::handle), with server errors rendered as JSON responses
    pub async fn respond(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        metrics::counter!("dor_server_requests", "method" => method.to_string()).increment(1);

        let response = match self.handle(req).await {
            Ok(resp) => resp,
            Err(e) => {
                error!("Request error: {} {}: {}", method, uri, e);
                let mut resp = handlers::plain_error(e.status(), e.kind(), e.to_string());
                if matches!(e, ServerError::Unauthorized) {
                    resp.headers_mut()
                        .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"dor\""));
                }
                resp
            }
        };
        info!("{} {} -> {}", method, uri, response.status());
        response
    }
}

/// Accept connections on `listener` until it fails
pub async fn serve(listener: TcpListener, handler: Arc<RestHandler>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let handler = handler.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler.respond(req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection from {}: {:?}", peer, e);
            }
        });
    }
}
