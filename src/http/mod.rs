//! HTTP surface: admission middleware, forwarding and the server.

mod admission;
mod forward;
mod server;

pub use admission::{admit, Admission};
pub use forward::{proxy, Forwarder};
pub use server::{router, BoundServer, HttpServer};
