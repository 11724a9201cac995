//! Smart-HTTP (and dumb-HTTP file) access to stored repositories, plus the
//! health and metrics endpoints of the storage node.

pub mod handler;
pub mod pktline;

pub use handler::{create_router, metrics_router, AppState};
