use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    AUTHORIZATION, CONTENT_TYPE,
};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use weave::{
    FederationGateway, GatewayConfig, GatewayHooks, GraphQLRequest, InMemorySchemaRegistry,
    OwnershipQueryPlanner,
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Gateway configuration file
    #[arg(short, long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Overrides the listen address of the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn full<T: Into<Bytes>>(value: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(full(body))
        .unwrap_or_else(|_| internal_server_error())
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<FederationGateway>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let auth_headers = extract_auth_headers(&req);

    let result = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let body_bytes = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!(error = %e, "failed to read request body");
                    return Ok(Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .body(full("Failed to read request body"))
                        .unwrap_or_else(|_| internal_server_error()));
                }
            };

            match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
                Ok(mut graphql_req) => {
                    graphql_req.auth_headers = auth_headers;

                    match gateway.process_request(graphql_req).await {
                        Ok(result) => json_response(
                            StatusCode::OK,
                            serde_json::to_string(&result).unwrap_or_default(),
                        ),
                        Err(e) => {
                            let error_json = serde_json::to_string(&json!({
                                "errors": [{
                                    "message": e.to_string()
                                }]
                            }))
                            .unwrap_or_default();
                            json_response(StatusCode::OK, error_json)
                        }
                    }
                }
                Err(e) => Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
                    .body(full(format!("Invalid JSON request: {}", e)))
                    .unwrap_or_else(|_| internal_server_error()),
            }
        }

        (&Method::OPTIONS, _) => Response::builder()
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS")
            .header(ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, Authorization")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(full("Not Found"))
            .unwrap_or_else(|_| internal_server_error()),
    };

    Ok(result)
}

fn internal_server_error() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

// Headers forwarded to the underlying services.
fn extract_auth_headers(req: &Request<Incoming>) -> Option<HashMap<String, String>> {
    let mut auth_headers = HashMap::new();

    for header_name in [AUTHORIZATION.as_str(), "x-api-key", "x-token"] {
        if let Some(header_value) = req.headers().get(header_name) {
            if let Ok(value_str) = header_value.to_str() {
                auth_headers.insert(header_name.to_string(), value_str.to_string());
            }
        }
    }

    if auth_headers.is_empty() {
        None
    } else {
        Some(auth_headers)
    }
}

#[derive(Clone)]
// An Executor that uses the tokio runtime.
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

fn init_tracing(default_filter: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let config = GatewayConfig::load(&args.config)?;
    init_tracing(&config.log_filter, args.json_logs);

    let gateway = Arc::new(FederationGateway::new(
        Box::new(InMemorySchemaRegistry::new()),
        Box::new(OwnershipQueryPlanner::new()),
        GatewayHooks::default(),
    ));

    let base_dir = args.config.parent().unwrap_or(Path::new("."));
    if let Err(e) = gateway.load_schemas(&config, base_dir).await {
        error!(error = %e, "failed to load schemas");
        return Err(e.into());
    }

    let addr = args.listen.unwrap_or(config.listen);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, services = config.services.len(), "gateway listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);

        let gateway_clone = Arc::clone(&gateway);

        let executor = TokioExecutor;

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = gateway_clone.clone();
                handle_request(req, gateway)
            });

            match hyper_util::server::conn::auto::Builder::new(executor)
                .serve_connection(io, service)
                .await
            {
                Ok(_) => debug!(%peer, "connection closed"),
                Err(e) => warn!(%peer, error = %e, "error processing connection"),
            }
        });
    }
}
