//! Health and Prometheus endpoints.
//!
//! The server runs on its own actix system thread so the consumer keeps the
//! multi-threaded tokio runtime to itself.

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpResponse, HttpServer};
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::json;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tracing::{error, info};

use crate::error::{CdcError, Result};
use crate::metrics::CdcMetrics;
use crate::services::cdc::Lifecycle;

#[derive(Clone)]
pub struct HealthState {
    pub lifecycle: Lifecycle,
    pub metrics: CdcMetrics,
    pub registry: Registry,
}

async fn health(state: web::Data<HealthState>) -> HttpResponse {
    let lifecycle = state.lifecycle.current();
    let serving = lifecycle.is_serving();
    let body = json!({
        "status": if serving { "ok" } else { "unavailable" },
        "state": lifecycle,
        "consumer_healthy": state.metrics.consumer_healthy.get() == 1,
        "consecutive_errors": state.metrics.consecutive_errors.get(),
        "assigned_partitions": state.metrics.assigned_partitions.get(),
    });

    if serving {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

async fn metrics(state: web::Data<HealthState>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&state.registry.gather(), &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics));
}

pub struct HealthServer {
    handle: ServerHandle,
    thread: JoinHandle<()>,
}

impl HealthServer {
    /// Bind and start serving on `0.0.0.0:port`.
    pub fn start(port: u16, state: HealthState) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("cdc-http".into())
            .spawn(move || {
                actix_web::rt::System::new().block_on(async move {
                    let data = web::Data::new(state);
                    let server = HttpServer::new(move || {
                        App::new().app_data(data.clone()).configure(routes)
                    })
                    .workers(1)
                    .disable_signals()
                    .bind(("0.0.0.0", port));

                    let server = match server {
                        Ok(server) => server.run(),
                        Err(e) => {
                            let _ = ready_tx.send(Err(e.to_string()));
                            return;
                        }
                    };

                    let _ = ready_tx.send(Ok(server.handle()));
                    if let Err(e) = server.await {
                        error!(error = %e, "HTTP server error");
                    }
                })
            })
            .map_err(|e| CdcError::Internal(format!("failed to spawn HTTP thread: {}", e)))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| CdcError::Internal("HTTP thread exited before binding".into()))?
            .map_err(|e| CdcError::Config(format!("failed to bind HTTP port {}: {}", port, e)))?;

        info!(port, "Health and metrics endpoint listening");
        Ok(Self { handle, thread })
    }

    /// Gracefully stop the server and join its thread.
    pub async fn stop(self) {
        self.handle.stop(true).await;
        let thread = self.thread;
        let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        info!("Health and metrics endpoint stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cdc::LifecycleState;
    use actix_web::test;

    fn state() -> HealthState {
        let registry = Registry::new();
        let metrics = CdcMetrics::new(&registry).unwrap();
        HealthState {
            lifecycle: Lifecycle::new(),
            metrics,
            registry,
        }
    }

    #[actix_web::test]
    async fn test_health_follows_lifecycle() {
        let state = state();
        let lifecycle = state.lifecycle.clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 503);

        lifecycle.transition(LifecycleState::Connecting).unwrap();
        lifecycle.transition(LifecycleState::Subscribed).unwrap();

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["state"], "subscribed");

        lifecycle.transition(LifecycleState::Draining).unwrap();
        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 503);
    }

    #[actix_web::test]
    async fn test_metrics_exposes_registry() {
        let state = state();
        state.metrics.messages_processed_total.inc_by(7);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("cdc_messages_processed_total 7"));
    }
}
