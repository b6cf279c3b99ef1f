use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;

lazy_static! {
    pub static ref MINT_REGISTRY: Registry =
        Registry::new_custom(Some("mint".to_string()), None).unwrap();
}

lazy_static! {
    pub static ref EPOCHS_FINALIZED: IntCounter = register_int_counter_with_registry!(
        "epochs_finalized_total",
        "Number of epoch certificates applied by this member",
        MINT_REGISTRY
    )
    .unwrap();
    pub static ref CONSENSUS_ITEMS: IntCounterVec = register_int_counter_vec_with_registry!(
        "consensus_items_total",
        "Consensus items applied, labeled by item kind",
        &["kind"],
        MINT_REGISTRY
    )
    .unwrap();
    pub static ref RPC_REQUESTS: IntCounterVec = register_int_counter_vec_with_registry!(
        "rpc_requests_total",
        "Total number of client RPC requests, labeled by method and status",
        &["method", "status"],
        MINT_REGISTRY
    )
    .unwrap();
    pub static ref RPC_REQUEST_DURATION: HistogramVec = register_histogram_vec_with_registry!(
        "rpc_request_duration_seconds",
        "Client RPC request latency, labeled by method",
        &["method"],
        MINT_REGISTRY
    )
    .unwrap();
    pub static ref PROCESS_START_TIME: IntGauge = register_int_gauge_with_registry!(
        "process_start_time_seconds",
        "Process start time in Unix timestamp",
        MINT_REGISTRY
    )
    .unwrap();
}

async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut metric_families = MINT_REGISTRY.gather();
            metric_families.extend(prometheus::gather());

            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            encoder.encode(&metric_families, &mut buffer).unwrap();

            let response = Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, encoder.format_type())
                .body(Body::from(buffer))
                .unwrap();

            Ok(response)
        }
        (&Method::GET, "/health") => {
            let health_status = json!({
                "status": "healthy",
                "timestamp": std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
                "version": env!("CARGO_PKG_VERSION"),
            });

            let response = Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(health_status.to_string()))
                .unwrap();

            Ok(response)
        }
        (&Method::GET, "/ready") => {
            let response = Response::builder()
                .status(StatusCode::OK)
                .body(Body::from("ready"))
                .unwrap();
            Ok(response)
        }
        _ => {
            let mut not_found = Response::new(Body::from("Not Found"));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

pub async fn start_server(port_number: Option<u16>) {
    const DEFAULT_PORT: u16 = 9001;

    let port = port_number.unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let server = Server::bind(&addr).serve(make_svc);

    PROCESS_START_TIME.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64,
    );

    tokio::spawn(async move {
        tracing::info!("Starting metrics server on {}", addr);

        if let Err(e) = server.await {
            tracing::error!("Metrics server error: {}", e);
        }
    });
}
