//! Admin HTTP server.
//!
//! Serves Prometheus metrics plus the health and drain control endpoints.

use crate::drain::{DrainManager, DrainServer};
use crate::metrics::MetricsCollector;
use crate::server::Server;
use crate::util::ShutdownReason;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Shared state behind every admin request.
struct AdminContext {
    server: Arc<Server>,
    root: Arc<DrainManager>,
    collector: MetricsCollector,
    metrics_path: String,
}

/// Admin HTTP server.
pub struct AdminServer {
    listener: TcpListener,
    context: Arc<AdminContext>,
}

impl AdminServer {
    /// Bind the admin server.
    pub async fn bind(
        address: SocketAddr,
        metrics_path: String,
        server: Arc<Server>,
        root: Arc<DrainManager>,
        collector: MetricsCollector,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;

        Ok(Self {
            listener,
            context: Arc::new(AdminContext {
                server,
                root,
                collector,
                metrics_path,
            }),
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the admin server until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<ShutdownReason>) {
        info!(
            address = ?self.listener.local_addr().ok(),
            path = %self.context.metrics_path,
            "admin server started"
        );

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let context = Arc::clone(&self.context);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let context = Arc::clone(&context);
                                    async move { handle_request(req, &context).await }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept admin connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("admin server shutting down");
                    break;
                }
            }
        }
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Handle an incoming admin request.
async fn handle_request<B>(
    req: Request<B>,
    context: &AdminContext,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    let method = req.method();

    debug!(path = %path, method = %method, "admin request");

    let response = match (method, path) {
        (&Method::GET, p) if p == context.metrics_path => {
            let mut buffer = String::new();
            if let Err(e) = encode(&mut buffer, context.collector.registry()) {
                error!(error = %e, "failed to encode metrics");
                return Ok(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to encode metrics\n",
                ));
            }

            let mut response = text_response(StatusCode::OK, buffer);
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        (&Method::GET, "/health" | "/healthz") => {
            if context.server.health_check_failed() {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "FAILED\n")
            } else if context.root.draining() {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "DRAINING\n")
            } else {
                text_response(StatusCode::OK, "OK\n")
            }
        }
        (&Method::POST, "/healthcheck/fail") => {
            context.server.set_health_check_failed(true);
            text_response(StatusCode::OK, "OK\n")
        }
        (&Method::POST, "/healthcheck/ok") => {
            context.server.set_health_check_failed(false);
            text_response(StatusCode::OK, "OK\n")
        }
        (&Method::POST, "/drain_listeners") => {
            info!("drain requested through admin endpoint");
            context.server.start_drain(&context.root);
            text_response(StatusCode::OK, "OK\n")
        }
        (&Method::GET, "/") => {
            let body = format!(
                "rustdrain admin server\n\nEndpoints:\n  GET  {} - Prometheus metrics\n  GET  /health - Health check\n  POST /healthcheck/fail\n  POST /healthcheck/ok\n  POST /drain_listeners\n",
                context.metrics_path
            );
            text_response(StatusCode::OK, body)
        }
        (_, "/health" | "/healthz" | "/healthcheck/fail" | "/healthcheck/ok" | "/drain_listeners") => {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n")
        }
        (_, p) if p == context.metrics_path => {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n")
        }
        _ => text_response(StatusCode::NOT_FOUND, "Not found\n"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DrainConfig, FrontendConfig, GlobalConfig};
    use crate::drain::{DrainDecision, DrainType};
    use crate::event::Dispatcher;
    use http_body_util::BodyExt;
    use std::time::Duration;

    fn context() -> AdminContext {
        let config = Config {
            global: GlobalConfig::default(),
            drain: DrainConfig {
                drain_time: Duration::from_secs(10),
                ..DrainConfig::default()
            },
            frontends: vec![FrontendConfig {
                name: "web".to_string(),
                listen: "127.0.0.1:0".parse().unwrap(),
                drain_type: None,
            }],
        };
        let server = Server::new(config);
        let root = DrainManager::new(server.clone(), DrainType::Gradual, Dispatcher::spawn("main"));

        AdminContext {
            server,
            root,
            collector: MetricsCollector::new(),
            metrics_path: "/metrics".to_string(),
        }
    }

    fn request(method: Method, path: &str) -> Request<()> {
        Request::builder().method(method).uri(path).body(()).unwrap()
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let context = context();
        context.collector.connection_opened("web");

        let response = handle_request(request(Method::GET, "/metrics"), &context)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("rustdrain_active_connections"));
    }

    #[tokio::test]
    async fn test_health_reflects_failed_check() {
        let context = context();

        let response = handle_request(request(Method::GET, "/health"), &context)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        handle_request(request(Method::POST, "/healthcheck/fail"), &context)
            .await
            .unwrap();
        assert!(context.root.drain_close());
        let response = handle_request(request(Method::GET, "/health"), &context)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        handle_request(request(Method::POST, "/healthcheck/ok"), &context)
            .await
            .unwrap();
        assert!(!context.root.drain_close());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_listeners_starts_root_drain() {
        let context = context();

        let response = handle_request(request(Method::POST, "/drain_listeners"), &context)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(context.root.draining());
        assert!(context.server.drain_started());

        let response = handle_request(request(Method::GET, "/health"), &context)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, "DRAINING\n");
    }

    #[tokio::test]
    async fn test_wrong_method_and_unknown_path() {
        let context = context();

        let response = handle_request(request(Method::GET, "/drain_listeners"), &context)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(!context.root.draining());

        let response = handle_request(request(Method::GET, "/nope"), &context)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
