// Machinery shared by the programs that accept sonar data over HTTP: the single-writer store actor,
// the request checks that every endpoint runs before it looks at a payload, the credential and
// cluster-alias tables, and the ingestion endpoints themselves.

pub mod alias;
pub mod auth;
pub mod error;
pub mod logging;
pub mod payload;
pub mod preamble;
pub mod routes;
pub mod server;
pub mod storewriter;

pub use alias::ClusterAliases;
pub use auth::Authenticator;
pub use error::RequestError;
pub use logging::init_logging;
pub use preamble::{check_request, Accepted, Expect};
pub use routes::{ingest_routes, IngestState};
pub use server::serve;
pub use storewriter::{StoreWriter, StoreWriterConfig, WriteRequest, WriterShutdown};

/// The value a remote client sends for a boolean parameter that is set.

pub const MAGIC_BOOLEAN: &str = "xxxxxtruexxxxx";
