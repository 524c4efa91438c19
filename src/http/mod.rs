//! HTTP integration: the admission middleware and a server that uses it.

mod layer;
mod server;

pub use layer::{AdmissionLayer, AdmissionService};
pub use server::HttpServer;
