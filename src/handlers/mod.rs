pub mod archive_admin;
pub mod ticket;

pub use ticket::issue_ws_ticket;
