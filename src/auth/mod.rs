//! # Authentication
//!
//! Two-stage credential flow for WebSocket sessions:
//!
//! 1. **Token exchange** (`jwt`): the client's bearer JWT is verified against
//!    the identity provider's public key and traded for a one-use ticket.
//! 2. **Ticket presentation** (`ticket`): the ticket arrives as the first
//!    WebSocket message and is consumed atomically, binding the connection
//!    to the token's subject.

pub mod jwt;         // RS256 bearer token verification
pub mod ticket;      // one-use ticket issuance and consumption

pub use jwt::TokenVerifier;
pub use ticket::{MemoryTicketStore, TicketStore};
