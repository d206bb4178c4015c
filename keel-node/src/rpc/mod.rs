// RPC Module
//
// INTENTION:
// Expose services to other processes. A service's ServerConnection is the routing
// target for requests naming it; the RpcServer accepts TCP peers and owns the
// connection table; the RpcClient calls remote functions and receives remote events.
// Framing is newline-delimited JSON, see `protocol`.

pub mod client;
pub mod connection;
pub mod protocol;
pub mod server;

pub use client::{EventCallback, RpcClient};
pub use connection::{RemoteRequest, ServerConnection, SessionId};
pub use protocol::{Incoming, Notify, Request, Response, ResponseError};
pub use server::RpcServer;
