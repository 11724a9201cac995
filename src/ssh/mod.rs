//! SSH front end.
//!
//! Accepts SSH connections, routes each command line through the [`mux`]
//! (with its middleware chain) and forwards git pack sessions to the storage
//! service over RPC.  Push and fetch are both served; authentication accepts
//! any public key.

pub mod git;
pub mod middleware;
pub mod mux;
pub mod server;
pub mod session;

pub use server::run;
pub use session::SshContext;
