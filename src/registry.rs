//! Invocation registry and client-to-server stream-argument plumbing
//! (spec §4.2, §4.7).

use std::collections::HashMap;
use std::pin::Pin;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::Stream;

use crate::error::HubConnectionError;

/// Continuation or sink registered against a pending invocation id.
enum PendingInvocation {
    Single(oneshot::Sender<Result<Value, HubConnectionError>>),
    Stream(mpsc::UnboundedSender<Result<Value, HubConnectionError>>),
}

/// Maps pending invocation ids to continuations/sinks (spec §3
/// "InvocationRegistry entry").
///
/// The id counter is shared between invocations and client-to-server
/// stream arguments (spec §4.7) — both draw from `allocate_id`.
pub struct InvocationRegistry {
    next_id: u64,
    pending: HashMap<String, PendingInvocation>,
}

impl InvocationRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            pending: HashMap::new(),
        }
    }

    /// Allocate the next id in the shared counter, stringified (spec §3
    /// "formatted on the wire starting at 0").
    pub fn allocate_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        id.to_string()
    }

    pub fn register_invoke(&mut self, id: String) -> oneshot::Receiver<Result<Value, HubConnectionError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, PendingInvocation::Single(tx));
        rx
    }

    /// Same as `register_invoke`, but hands the caller's own oneshot sender
    /// straight to the registry instead of minting a fresh pair. Lets the
    /// coordinator resolve a caller's `invoke()` future directly from
    /// `complete()`, with no bridging task in between.
    pub fn register_invoke_with(&mut self, id: String, tx: oneshot::Sender<Result<Value, HubConnectionError>>) {
        self.pending.insert(id, PendingInvocation::Single(tx));
    }

    pub fn register_stream(
        &mut self,
        id: String,
    ) -> mpsc::UnboundedReceiver<Result<Value, HubConnectionError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(id, PendingInvocation::Stream(tx));
        rx
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Feed a `StreamItem` to a registered stream sink. Returns `false` if
    /// there is no such pending stream (e.g. already canceled).
    pub fn push_stream_item(&mut self, id: &str, item: Value) -> bool {
        match self.pending.get(id) {
            Some(PendingInvocation::Stream(tx)) => {
                let _ = tx.send(Ok(item));
                true
            }
            _ => false,
        }
    }

    /// Handle a `Completion` for `id`: resolves/errors the continuation and
    /// removes the entry. Returns `false` if there was no matching entry.
    pub fn complete(&mut self, id: &str, result: Option<Value>, error: Option<String>) -> bool {
        let Some(pending) = self.pending.remove(id) else {
            return false;
        };
        match (pending, error) {
            (PendingInvocation::Single(tx), Some(err)) => {
                let _ = tx.send(Err(HubConnectionError::Other(err)));
            }
            (PendingInvocation::Single(tx), None) => {
                let _ = tx.send(Ok(result.unwrap_or(Value::Null)));
            }
            (PendingInvocation::Stream(tx), Some(err)) => {
                let _ = tx.send(Err(HubConnectionError::Other(err)));
            }
            (PendingInvocation::Stream(_), None) => {
                // Dropping the sender closes the stream cleanly.
            }
        }
        true
    }

    /// Remove an entry unconditionally (stream cancellation, send failure).
    pub fn remove(&mut self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Error every pending continuation exactly once (spec §7
    /// "On connection close, every pending invocation continuation is
    /// errored exactly once").
    pub fn close_all(&mut self, error: HubConnectionError) {
        for (_, pending) in self.pending.drain() {
            match pending {
                PendingInvocation::Single(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
                PendingInvocation::Stream(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
            }
        }
    }
}

impl Default for InvocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Stream-argument extraction (spec §4.2 "Client-to-server streams", §9 bug
// avoidance note).
// ---------------------------------------------------------------------------

/// One call argument: either an ordinary JSON value or a client-to-server
/// stream source.
pub enum InvocationArg {
    Value(Value),
    Stream(Pin<Box<dyn Stream<Item = Value> + Send>>),
}

/// A stream argument after extraction: its allocated wire id plus the
/// source stream to drain.
pub struct ExtractedStream {
    pub id: String,
    pub source: Pin<Box<dyn Stream<Item = Value> + Send>>,
}

/// Split `args` into plain wire values and extracted stream arguments.
///
/// Builds a fresh `Vec` rather than removing-while-iterating, which is the
/// fix for the source implementation's "removes stream arguments from the
/// argument list while iterating with an incrementing index" bug (spec §9):
/// that approach can skip a stream argument immediately following a removed
/// one. Accumulating into two new vectors has no such hazard.
pub fn extract_streams(
    args: Vec<InvocationArg>,
    registry: &mut InvocationRegistry,
) -> (Vec<Value>, Vec<ExtractedStream>) {
    let mut values = Vec::with_capacity(args.len());
    let mut streams = Vec::new();
    for arg in args {
        match arg {
            InvocationArg::Value(v) => values.push(v),
            InvocationArg::Stream(source) => {
                let id = registry.allocate_id();
                streams.push(ExtractedStream { id, source });
            }
        }
    }
    (values, streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn allocate_id_is_monotonic_and_stringified_from_zero() {
        let mut registry = InvocationRegistry::new();
        assert_eq!(registry.allocate_id(), "0");
        assert_eq!(registry.allocate_id(), "1");
        assert_eq!(registry.allocate_id(), "2");
    }

    #[tokio::test]
    async fn invoke_resolves_on_completion_result() {
        let mut registry = InvocationRegistry::new();
        let id = registry.allocate_id();
        let rx = registry.register_invoke(id.clone());
        assert!(registry.complete(&id, Some(json!("hello")), None));
        assert_eq!(rx.await.unwrap().unwrap(), json!("hello"));
    }

    #[tokio::test]
    async fn invoke_errors_on_completion_error() {
        let mut registry = InvocationRegistry::new();
        let id = registry.allocate_id();
        let rx = registry.register_invoke(id.clone());
        registry.complete(&id, None, Some("boom".to_owned()));
        assert!(rx.await.unwrap().is_err());
    }

    #[test]
    fn extract_streams_does_not_skip_adjacent_stream_args() {
        let mut registry = InvocationRegistry::new();
        let args = vec![
            InvocationArg::Value(json!(1)),
            InvocationArg::Stream(Box::pin(tokio_stream::empty())),
            InvocationArg::Stream(Box::pin(tokio_stream::empty())),
            InvocationArg::Value(json!(2)),
        ];
        let (values, streams) = extract_streams(args, &mut registry);
        assert_eq!(values, vec![json!(1), json!(2)]);
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].id, "0");
        assert_eq!(streams[1].id, "1");
    }

    #[tokio::test]
    async fn close_all_errors_every_pending_entry_once() {
        let mut registry = InvocationRegistry::new();
        let id_a = registry.allocate_id();
        let id_b = registry.allocate_id();
        let rx_a = registry.register_invoke(id_a);
        let rx_b = registry.register_invoke(id_b);
        registry.close_all(HubConnectionError::InvocationCanceled);
        assert!(rx_a.await.unwrap().is_err());
        assert!(rx_b.await.unwrap().is_err());
    }
}
