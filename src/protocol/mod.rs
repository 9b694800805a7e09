//! Wire Protocol
//!
//! JSON-RPC 2.0 shaped envelopes spoken by the appliance, the error-code
//! table used by the classifier, and the query-parameter builder.

pub mod codes;
pub mod message;
pub mod query;

pub use message::{Request, Response, WireError, JSONRPC_VERSION};
pub use query::QueryParams;

/// Build a dotted `kind.action` method name
pub fn method(kind: &str, action: &str) -> String {
    format!("{}.{}", kind, action)
}
