//! Resolves the "dynamic attribute access for RPC" redesign note: instead of reflectively
//! invoking `peer._get_blocks_available(...)`, a [`Node`](crate::node::Node) holds an explicit
//! `(service name, method name)` dispatch table. Each registered [`Service`] handles every method
//! call routed to its name.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Context made available to a service handling an inbound request.
pub struct RequestContext {
    /// Name of the peer the request arrived from.
    pub from: String,
}

/// A named RPC service mixed into a node (spec.md §9: "model as composition").
#[async_trait]
pub trait Service: Send + Sync {
    /// Name this service is registered under, e.g. `"blocks"`.
    fn name(&self) -> &'static str;

    /// Handles one method call, returning a JSON response payload plus any attachments.
    async fn call(
        &self,
        method: &str,
        payload: serde_json::Value,
        attachments: Vec<Bytes>,
        ctx: &RequestContext,
    ) -> Result<(serde_json::Value, Vec<Bytes>)>;
}
