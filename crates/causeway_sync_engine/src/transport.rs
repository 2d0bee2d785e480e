//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use causeway_sync_protocol::{
    AckStatus, OpId, Operation, PullRequest, PullResponse, PushAck, PushRequest, PushResponse,
    WireMessage,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Round trips to the central authority.
///
/// Implementations report unreachable peers and network failures as
/// [`SyncError::Unreachable`] or [`SyncError::Transport`]; the coordinator
/// applies its own timeout on top.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Pushes a batch; returns one ack per accepted or refused operation.
    async fn push(&self, request: PushRequest) -> SyncResult<PushResponse>;

    /// Pulls operations after the request cursor.
    async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse>;
}

#[derive(Default)]
struct AuthorityLog {
    operations: Vec<Operation>,
    ids: HashSet<OpId>,
    rejections: HashMap<OpId, (String, bool)>,
}

/// In-process central authority: an append-only operation log.
///
/// Cursors are positions in the log. Pulls skip the requester's own
/// operations; pushes of known op ids are acknowledged as duplicates.
#[derive(Clone, Default)]
pub struct LoopbackServer {
    log: Arc<Mutex<AuthorityLog>>,
}

impl LoopbackServer {
    /// Creates an empty authority.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores pushed operations.
    pub fn handle_push(&self, request: PushRequest) -> PushResponse {
        let mut log = self.log.lock();
        let acks = request
            .operations
            .into_iter()
            .map(|op| {
                let op_id = op.op_id;
                if let Some((reason, retryable)) = log.rejections.get(&op_id) {
                    return PushAck {
                        op_id,
                        status: AckStatus::Rejected {
                            reason: reason.clone(),
                            retryable: *retryable,
                        },
                    };
                }
                if !log.ids.insert(op_id) {
                    return PushAck {
                        op_id,
                        status: AckStatus::Duplicate,
                    };
                }
                log.operations.push(op);
                PushAck::accepted(op_id)
            })
            .collect();
        PushResponse { acks }
    }

    /// Serves operations after the cursor, excluding the requester's own.
    pub fn handle_pull(&self, request: PullRequest) -> PullResponse {
        let log = self.log.lock();
        let start = (request.cursor as usize).min(log.operations.len());
        let limit = request.limit.max(1) as usize;

        let mut operations = Vec::new();
        let mut position = start;
        while position < log.operations.len() && operations.len() < limit {
            let op = &log.operations[position];
            if op.origin != request.replica {
                operations.push(op.clone());
            }
            position += 1;
        }

        PullResponse {
            operations,
            next_cursor: position as u64,
            has_more: position < log.operations.len(),
        }
    }

    /// Refuses future pushes of `op_id`.
    pub fn reject(&self, op_id: OpId, reason: impl Into<String>, retryable: bool) {
        self.log
            .lock()
            .rejections
            .insert(op_id, (reason.into(), retryable));
    }

    /// Lifts a refusal set by [`LoopbackServer::reject`].
    pub fn clear_rejection(&self, op_id: &OpId) {
        self.log.lock().rejections.remove(op_id);
    }

    /// All stored operations in log order.
    pub fn operations(&self) -> Vec<Operation> {
        self.log.lock().operations.clone()
    }

    /// How many times `op_id` is stored (0 or 1).
    pub fn count_of(&self, op_id: &OpId) -> usize {
        self.log
            .lock()
            .operations
            .iter()
            .filter(|op| op.op_id == *op_id)
            .count()
    }

    /// Number of stored operations.
    pub fn len(&self) -> usize {
        self.log.lock().operations.len()
    }

    /// Returns true if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.log.lock().operations.is_empty()
    }
}

#[derive(Default)]
struct Faults {
    unreachable: AtomicBool,
    fail_pushes: AtomicU32,
    fail_pulls: AtomicU32,
    lose_push_acks: AtomicU32,
    delay: Mutex<Duration>,
}

/// Transport to a [`LoopbackServer`] with injectable faults.
///
/// Requests and responses pass through the CBOR wire encoding.
pub struct LoopbackTransport {
    server: LoopbackServer,
    faults: Faults,
    push_calls: AtomicU64,
    pull_calls: AtomicU64,
}

impl LoopbackTransport {
    /// Creates a transport to `server`.
    pub fn new(server: LoopbackServer) -> Self {
        Self {
            server,
            faults: Faults::default(),
            push_calls: AtomicU64::new(0),
            pull_calls: AtomicU64::new(0),
        }
    }

    /// Returns the server.
    pub fn server(&self) -> &LoopbackServer {
        &self.server
    }

    /// Makes every call fail with [`SyncError::Unreachable`].
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fails the next `n` pushes before they reach the server.
    pub fn fail_next_pushes(&self, n: u32) {
        self.faults.fail_pushes.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` pulls.
    pub fn fail_next_pulls(&self, n: u32) {
        self.faults.fail_pulls.store(n, Ordering::SeqCst);
    }

    /// Lets the next `n` pushes reach the server but loses the response.
    pub fn lose_next_push_acks(&self, n: u32) {
        self.faults.lose_push_acks.store(n, Ordering::SeqCst);
    }

    /// Delays every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.faults.delay.lock() = delay;
    }

    /// Number of push calls made.
    pub fn push_calls(&self) -> u64 {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Number of pull calls made.
    pub fn pull_calls(&self) -> u64 {
        self.pull_calls.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> SyncResult<()> {
        let delay = *self.faults.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.faults.unreachable.load(Ordering::SeqCst) {
            return Err(SyncError::Unreachable("loopback authority offline".into()));
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn over_the_wire<M: WireMessage>(message: &M) -> SyncResult<M> {
    Ok(M::decode(&message.encode()?)?)
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn push(&self, request: PushRequest) -> SyncResult<PushResponse> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        if take_one(&self.faults.fail_pushes) {
            return Err(SyncError::transport_retryable("injected push failure"));
        }

        let response = self.server.handle_push(over_the_wire(&request)?);

        if take_one(&self.faults.lose_push_acks) {
            return Err(SyncError::transport_retryable("push response lost"));
        }
        over_the_wire(&response)
    }

    async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        if take_one(&self.faults.fail_pulls) {
            return Err(SyncError::transport_retryable("injected pull failure"));
        }

        let response = self.server.handle_pull(over_the_wire(&request)?);
        over_the_wire(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_sync_protocol::{EntityKey, OperationKind, Payload, ReplicaId, VersionVector};

    fn op(origin: &str, entity: &str) -> Operation {
        Operation::new(
            EntityKey::new("note", entity),
            OperationKind::Create,
            Payload::new(1),
            VersionVector::new(),
            ReplicaId::new(origin),
            1,
        )
    }

    fn pull(replica: &str, cursor: u64, limit: u32) -> PullRequest {
        PullRequest {
            replica: ReplicaId::new(replica),
            cursor,
            limit,
        }
    }

    #[tokio::test]
    async fn push_then_pull_from_other_replica() {
        let server = LoopbackServer::new();
        let a = LoopbackTransport::new(server.clone());
        let b = LoopbackTransport::new(server.clone());

        let ops = vec![op("A", "n1"), op("A", "n2")];
        let response = a
            .push(PushRequest::new(ReplicaId::new("A"), ops.clone()))
            .await
            .unwrap();
        assert!(response.acks.iter().all(|ack| ack.status == AckStatus::Accepted));

        let page = b.pull(pull("B", 0, 10)).await.unwrap();
        assert_eq!(page.operations, ops);
        assert_eq!(page.next_cursor, 2);
        assert!(!page.has_more);

        // The pushing replica does not get its own operations back.
        let own = a.pull(pull("A", 0, 10)).await.unwrap();
        assert!(own.operations.is_empty());
        assert_eq!(own.next_cursor, 2);
    }

    #[tokio::test]
    async fn pull_pages() {
        let server = LoopbackServer::new();
        let t = LoopbackTransport::new(server.clone());
        let ops: Vec<_> = (0..5).map(|i| op("A", &format!("n{i}"))).collect();
        t.push(PushRequest::new(ReplicaId::new("A"), ops)).await.unwrap();

        let first = t.pull(pull("B", 0, 2)).await.unwrap();
        assert_eq!(first.operations.len(), 2);
        assert!(first.has_more);
        let rest = t.pull(pull("B", first.next_cursor, 10)).await.unwrap();
        assert_eq!(rest.operations.len(), 3);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn duplicate_push_is_acknowledged_once_stored() {
        let server = LoopbackServer::new();
        let t = LoopbackTransport::new(server.clone());
        let op = op("A", "n1");

        t.push(PushRequest::new(ReplicaId::new("A"), vec![op.clone()]))
            .await
            .unwrap();
        let again = t
            .push(PushRequest::new(ReplicaId::new("A"), vec![op.clone()]))
            .await
            .unwrap();
        assert_eq!(again.acks[0].status, AckStatus::Duplicate);
        assert_eq!(server.count_of(&op.op_id), 1);
    }

    #[tokio::test]
    async fn injected_faults() {
        let server = LoopbackServer::new();
        let t = LoopbackTransport::new(server.clone());
        let op = op("A", "n1");

        t.set_unreachable(true);
        let err = t.pull(pull("A", 0, 1)).await.unwrap_err();
        assert!(matches!(err, SyncError::Unreachable(_)));
        t.set_unreachable(false);

        t.fail_next_pushes(1);
        assert!(t
            .push(PushRequest::new(ReplicaId::new("A"), vec![op.clone()]))
            .await
            .is_err());
        assert!(server.is_empty());

        t.lose_next_push_acks(1);
        assert!(t
            .push(PushRequest::new(ReplicaId::new("A"), vec![op.clone()]))
            .await
            .is_err());
        assert_eq!(server.len(), 1);

        server.reject(OpId::generate(), "unused", false);
        assert_eq!(t.push_calls(), 2);
        assert_eq!(t.pull_calls(), 1);
    }

    #[tokio::test]
    async fn rejections_are_reported_per_op() {
        let server = LoopbackServer::new();
        let t = LoopbackTransport::new(server.clone());
        let good = op("A", "n1");
        let bad = op("A", "n2");
        server.reject(bad.op_id, "schema mismatch", false);

        let response = t
            .push(PushRequest::new(ReplicaId::new("A"), vec![good, bad.clone()]))
            .await
            .unwrap();
        assert_eq!(response.acks[0].status, AckStatus::Accepted);
        assert!(matches!(
            response.acks[1].status,
            AckStatus::Rejected { retryable: false, .. }
        ));
        assert_eq!(server.count_of(&bad.op_id), 0);
    }
}
