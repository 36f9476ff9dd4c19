//! Frontend listener implementation.
//!
//! Accepts connections and serves HTTP/1.1 with keep-alive. Every response asks
//! the listener's drain decision whether the connection should be closed.

use crate::config::FrontendConfig;
use crate::drain::DrainDecision;
use crate::metrics::MetricsCollector;
use crate::util::ConnectionId;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

/// Frontend listener that accepts and handles connections.
pub struct FrontendListener {
    /// Frontend name, used for metrics and logs.
    name: String,
    /// TCP listener.
    listener: TcpListener,
    /// Drain decision for this listener's connections.
    drain: Arc<dyn DrainDecision>,
    /// Metrics collector.
    metrics: MetricsCollector,
}

impl FrontendListener {
    /// Bind a new frontend listener.
    pub async fn bind(
        config: &FrontendConfig,
        drain: Arc<dyn DrainDecision>,
        metrics: MetricsCollector,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;

        info!(
            name = %config.name,
            listen = %config.listen,
            local_addr = ?listener.local_addr().ok(),
            "frontend listener bound"
        );

        Ok(Self {
            name: config.name.clone(),
            listener,
            drain,
            metrics,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `stop` fires (or its sender is dropped).
    ///
    /// Open connections outlive the accept loop. Each one is shut down
    /// gracefully once `closing` turns true or its sender is dropped.
    #[instrument(skip_all, fields(frontend = %self.name))]
    pub async fn run(self, mut stop: oneshot::Receiver<()>, closing: watch::Receiver<bool>) {
        info!("frontend listener starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            self.handle_connection(stream, addr, closing.clone());
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                _ = &mut stop => {
                    info!("frontend listener stopped accepting");
                    break;
                }
            }
        }
    }

    /// Handle an incoming connection.
    fn handle_connection(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
        mut closing: watch::Receiver<bool>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let frontend_name = self.name.clone();
        let drain = Arc::clone(&self.drain);
        let metrics = self.metrics.clone();
        let connection_id = ConnectionId::next();

        metrics.connection_opened(&frontend_name);

        tokio::spawn(async move {
            let start_time = Instant::now();

            let service = {
                let frontend_name = frontend_name.clone();
                let metrics = metrics.clone();
                service_fn(move |req| {
                    let response = respond(req, drain.as_ref(), &frontend_name, &metrics);
                    async move { Ok::<_, Infallible>(response) }
                })
            };

            let conn = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = closing_requested(&mut closing) => {
                    debug!(connection = %connection_id, "closing connection after drain");
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };

            metrics.connection_closed(&frontend_name);

            let duration = start_time.elapsed();
            if let Err(e) = result {
                debug!(
                    frontend = frontend_name,
                    client = %client_addr,
                    connection = %connection_id,
                    duration_ms = duration.as_millis(),
                    error = %e,
                    "connection ended with error"
                );
            } else {
                debug!(
                    frontend = frontend_name,
                    client = %client_addr,
                    connection = %connection_id,
                    duration_ms = duration.as_millis(),
                    "connection completed"
                );
            }
        });
    }
}

/// Resolves once `closing` turns true or its sender is dropped.
async fn closing_requested(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closing| *closing).await;
}

/// Build the response for one request, closing the connection if draining.
fn respond<B>(
    _req: Request<B>,
    drain: &dyn DrainDecision,
    frontend: &str,
    metrics: &MetricsCollector,
) -> Response<Full<Bytes>> {
    let drain_close = drain.drain_close();
    metrics.request_served(frontend, drain_close);

    let mut response = Response::new(Full::new(Bytes::from_static(b"OK\n")));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    if drain_close {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackHandle, CallbackRegistry};
    use crate::drain::DrainCloseCb;
    use crate::event::Dispatcher;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Decision source that closes exactly when told to.
    #[derive(Default)]
    struct Switch {
        close: AtomicBool,
        callbacks: CallbackRegistry<std::time::Duration>,
    }

    impl DrainDecision for Switch {
        fn drain_close(&self) -> bool {
            self.close.load(Ordering::SeqCst)
        }

        fn add_on_drain_close_cb(&self, dispatcher: &Dispatcher, cb: DrainCloseCb) -> CallbackHandle {
            self.callbacks.add(dispatcher, cb)
        }
    }

    fn frontend() -> FrontendConfig {
        FrontendConfig {
            name: "test".to_string(),
            listen: "127.0.0.1:0".parse().unwrap(),
            drain_type: None,
        }
    }

    #[tokio::test]
    async fn test_frontend_listener_bind() {
        let drain: Arc<dyn DrainDecision> = Arc::new(Switch::default());
        let listener = FrontendListener::bind(&frontend(), drain, MetricsCollector::new())
            .await
            .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_respond_sets_connection_close_when_draining() {
        let switch = Switch::default();
        let metrics = MetricsCollector::new();

        let response = respond(Request::new(()), &switch, "test", &metrics);
        assert!(response.headers().get(CONNECTION).is_none());

        switch.close.store(true, Ordering::SeqCst);
        let response = respond(Request::new(()), &switch, "test", &metrics);
        assert_eq!(response.headers().get(CONNECTION).unwrap(), "close");
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let drain: Arc<dyn DrainDecision> = Arc::new(Switch::default());
        let listener = FrontendListener::bind(&frontend(), drain, MetricsCollector::new())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel();
        let (_closing_tx, closing_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(stop_rx, closing_rx));

        stop_tx.send(()).unwrap();
        task.await.unwrap();

        // The socket is released with the accept loop.
        TcpListener::bind(addr).await.unwrap();
    }
}
