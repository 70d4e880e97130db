//! Metrics and health endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use gridagent_telemetry::{prometheus, ExpositionFormat, MetricsRegistry};
use http_body_util::Full;
use hyper::header::{HeaderValue, ACCEPT, ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Serve `/metrics` and `/health` until `shutdown` turns true.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<MetricsRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let stream = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "metrics accept failed");
                    continue;
                }
            },
        };

        let metrics = Arc::clone(&metrics);
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = route(&req, &metrics);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}

fn route<B>(req: &Request<B>, metrics: &MetricsRegistry) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET"));
        return response;
    }

    match req.uri().path() {
        "/metrics" => {
            let accept = req.headers().get(ACCEPT).and_then(|v| v.to_str().ok());
            let format = ExpositionFormat::negotiate(accept);
            let body = prometheus::render_as(metrics, format);
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
            response
        }
        "/health" => text(StatusCode::OK, "ok\n"),
        _ => text(StatusCode::NOT_FOUND, "not found\n"),
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn metrics_route() {
        let metrics = MetricsRegistry::new();
        metrics.session_opened(false);
        let response = route(&get("/metrics"), &metrics);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            HeaderValue::from_static(gridagent_telemetry::PROMETHEUS_CONTENT_TYPE)
        );
        let text = body(response).await;
        assert_eq!(prometheus::sample_value(&text, "gas_active_sessions", &[]), Some(1.0));
        assert!(!text.contains("# EOF"));
    }

    #[tokio::test]
    async fn metrics_route_speaks_openmetrics_on_request() {
        let metrics = MetricsRegistry::new();
        let req = Request::builder()
            .uri("/metrics")
            .header(ACCEPT, "application/openmetrics-text;version=1.0.0")
            .body(())
            .unwrap();
        let response = route(&req, &metrics);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            HeaderValue::from_static(gridagent_telemetry::OPENMETRICS_CONTENT_TYPE)
        );
        assert!(body(response).await.ends_with("# EOF\n"));
    }

    #[tokio::test]
    async fn health_and_unknown_routes() {
        let metrics = MetricsRegistry::new();
        let response = route(&get("/health"), &metrics);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "ok\n");

        assert_eq!(
            route(&get("/nope"), &metrics).status(),
            StatusCode::NOT_FOUND
        );

        let post = Request::builder()
            .method(Method::POST)
            .uri("/metrics")
            .body(())
            .unwrap();
        let response = route(&post, &metrics);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "GET");
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(serve_metrics(
            listener,
            Arc::new(MetricsRegistry::new()),
            shutdown,
        ));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("ok\n"));

        stop.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
