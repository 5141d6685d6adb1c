//! # Ticket Issuance Endpoint
//!
//! `POST /api/ws/ticket` — exchange a verified bearer token for a one-use
//! WebSocket ticket. This is the only place the identity provider's JWT is
//! accepted; the WebSocket itself only ever sees tickets.
//!
//! ## Responses:
//! - `200 {"ticket": "<64-hex>", "expires_in": 300}`
//! - `401 {"error": "Missing Authorization header" | "Invalid token" |
//!   "Token verification failed"}`
//!
//! The 401 bodies are flat (not the nested `AppError` shape) because
//! deployed clients match on them.

use crate::auth::jwt::bearer_token;
use crate::auth::ticket::{issue_ticket, ticket_prefix, TICKET_TTL_SECONDS};
use crate::state::GatewayServices;

use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use tracing::{error, info, warn};

pub async fn issue_ws_ticket(
    req: HttpRequest,
    services: web::Data<GatewayServices>,
) -> HttpResponse {
    let Some(header) = req.headers().get(AUTHORIZATION) else {
        return unauthorized("Missing Authorization header");
    };

    let token = match header.to_str().ok().and_then(bearer_token) {
        Some(token) => token,
        None => return unauthorized("Invalid token"),
    };

    let Some(verifier) = &services.token_verifier else {
        error!("ticket requested but no JWT verification key is configured");
        return HttpResponse::InternalServerError()
            .json(json!({ "error": "Ticket issuance not configured" }));
    };

    let claims = match verifier.verify(token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(error = %e, "bearer token rejected");
            return unauthorized("Token verification failed");
        }
    };

    match issue_ticket(services.ticket_store.as_ref(), &claims.sub).await {
        Ok(ticket) => {
            services.app_state.record_ticket_issued();
            info!(
                subject = %claims.sub,
                ticket_prefix = %ticket_prefix(&ticket),
                "issued WebSocket ticket"
            );
            HttpResponse::Ok().json(json!({
                "ticket": ticket,
                "expires_in": TICKET_TTL_SECONDS,
            }))
        }
        Err(e) => {
            error!(error = %e, "ticket store write failed");
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to issue ticket" }))
        }
    }
}

fn unauthorized(message: &str) -> HttpResponse {
    HttpResponse::Unauthorized().json(json!({ "error": message }))
}
