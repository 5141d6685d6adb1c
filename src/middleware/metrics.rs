use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

/// Collapse parameterized archive paths so per-object keys don't blow up
/// the endpoint map.
fn normalize_endpoint(method: &str, path: &str) -> String {
    let normalized = if path.starts_with("/api/audio/download/") {
        "/api/audio/download/{key}"
    } else if path.starts_with("/api/audio/sessions/") {
        "/api/audio/sessions/{session_id}"
    } else if path.starts_with("/api/audio/") && method == "DELETE" {
        "/api/audio/{key}"
    } else {
        path
    };
    format!("{} {}", method, normalized)
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let endpoint = normalize_endpoint(req.method().as_str(), req.uri().path());

        if let Some(app_state) = req.app_data::<web::Data<AppState>>() {
            app_state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => {
                    response.status().is_client_error() || response.status().is_server_error()
                }
                Err(_) => true,
            };

            if let Ok(response) = &result {
                if let Some(app_state) = response.request().app_data::<web::Data<AppState>>() {
                    app_state.record_endpoint_request(&endpoint, duration_ms, is_error);

                    if is_error {
                        app_state.increment_error_count();
                    }
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalization() {
        assert_eq!(
            normalize_endpoint("GET", "/api/audio/download/audio-sessions/session_a_original_3.wav"),
            "GET /api/audio/download/{key}"
        );
        assert_eq!(
            normalize_endpoint("GET", "/api/audio/sessions/abc-123"),
            "GET /api/audio/sessions/{session_id}"
        );
        assert_eq!(
            normalize_endpoint("DELETE", "/api/audio/audio-sessions/x.wav"),
            "DELETE /api/audio/{key}"
        );
        assert_eq!(normalize_endpoint("POST", "/api/ws/ticket"), "POST /api/ws/ticket");
        assert_eq!(normalize_endpoint("GET", "/health"), "GET /health");
    }
}
