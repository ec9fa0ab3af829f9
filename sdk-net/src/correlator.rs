//! Sequence-keyed request/response correlation.
//!
//! ```text
//!  register(seq) ──▶ pending[seq] = callback, timer spawned
//!                        │
//!       ┌────────────────┼─────────────────────────┐
//!       ▼                ▼                         ▼
//!  resolve(frame)    timer fires              flush_connection(id)
//!  remove + abort    remove                   remove every seq of id
//!  callback(Ok)      callback(RequestTimedOut) callback(ConnectionLost)
//! ```
//!
//! Every path starts with an atomic remove from the map, so whichever path
//! wins is the only one that sees the callback. A callback runs exactly
//! once, on the thread that removed it; callbacks must not block.

use {
    crate::{
        connection::ConnectionId,
        endpoint::PeerEndpoint,
        error::{Result, SdkNetError},
        frame::{Frame, SequenceId},
        stats::NetworkStats,
    },
    dashmap::{mapref::entry::Entry, DashMap},
    log::debug,
    parking_lot::Mutex,
    std::{sync::Arc, time::Duration},
    tokio::{sync::oneshot, task::AbortHandle, time::Instant},
};

/// Completion callback of a correlated request.
pub type ResponseCallback = Box<dyn FnOnce(Result<Frame>) + Send + 'static>;

struct PendingRequest {
    connection: ConnectionId,
    // Only ever taken by value after removal from the map; the lock makes
    // the entry `Sync` for the shared map.
    callback: Mutex<ResponseCallback>,
    timer: AbortHandle,
}

impl PendingRequest {
    fn complete(self, result: Result<Frame>) {
        self.timer.abort();
        (self.callback.into_inner())(result)
    }
}

/// Map of outstanding requests shared by every connection of a network.
#[derive(Clone)]
pub struct ResponseCorrelator {
    pending: Arc<DashMap<SequenceId, PendingRequest>>,
    stats: Arc<NetworkStats>,
}

impl ResponseCorrelator {
    pub fn new(stats: Arc<NetworkStats>) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            stats,
        }
    }

    /// Track a request sent over `connection`.
    ///
    /// Must be called from within a tokio runtime. Returns `false` if `seq`
    /// is already pending; `callback` has then already been completed with
    /// [`SdkNetError::DuplicateSequence`] and the existing entry is left alone.
    pub fn register(
        &self,
        seq: SequenceId,
        connection: ConnectionId,
        timeout: Duration,
        callback: ResponseCallback,
    ) -> bool {
        let callback = match self.pending.entry(seq) {
            Entry::Vacant(slot) => {
                let timer = self.spawn_timer(seq, timeout);
                slot.insert(PendingRequest {
                    connection,
                    callback: Mutex::new(callback),
                    timer,
                });
                return true;
            }
            Entry::Occupied(_) => callback,
        };
        callback(Err(SdkNetError::DuplicateSequence(seq)));
        false
    }

    /// [`register`](Self::register) with the outcome delivered over a oneshot channel.
    pub fn register_oneshot(
        &self,
        seq: SequenceId,
        connection: ConnectionId,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<Frame>> {
        let (tx, rx) = oneshot::channel();
        self.register(
            seq,
            connection,
            timeout,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx
    }

    fn spawn_timer(&self, seq: SequenceId, timeout: Duration) -> AbortHandle {
        let pending = Arc::clone(&self.pending);
        let stats = Arc::clone(&self.stats);
        let deadline = Instant::now().checked_add(timeout);
        tokio::spawn(async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
            if let Some((_, request)) = pending.remove(&seq) {
                stats.requests_timed_out.inc();
                debug!("request {seq} timed out after {}ms", timeout.as_millis());
                request.complete(Err(SdkNetError::RequestTimedOut {
                    seq,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }));
            }
        })
        .abort_handle()
    }

    /// Complete the request `frame` answers.
    ///
    /// Returns the frame back when no request is pending under its sequence
    /// id (never sent, already timed out, or already resolved), so the
    /// caller can hand it to typed dispatch instead.
    pub fn resolve(&self, frame: Frame) -> Option<Frame> {
        if frame.seq.is_zero() {
            return Some(frame);
        }
        let Some((_, request)) = self.pending.remove(&frame.seq) else {
            return Some(frame);
        };
        request.complete(Ok(frame));
        None
    }

    /// Complete a pending request with `error`. Returns whether it was pending.
    pub fn fail(&self, seq: SequenceId, error: SdkNetError) -> bool {
        let Some((_, request)) = self.pending.remove(&seq) else {
            return false;
        };
        request.complete(Err(error));
        true
    }

    /// Complete every request sent over `connection` with
    /// [`SdkNetError::ConnectionLost`]. Requests on other connections are
    /// untouched. Returns how many were flushed.
    pub fn flush_connection(
        &self,
        connection: ConnectionId,
        endpoint: &PeerEndpoint,
        reason: &str,
    ) -> usize {
        let seqs: Vec<SequenceId> = self
            .pending
            .iter()
            .filter(|entry| entry.connection == connection)
            .map(|entry| *entry.key())
            .collect();

        let mut flushed = 0usize;
        for seq in seqs {
            if let Some((_, request)) = self
                .pending
                .remove_if(&seq, |_, request| request.connection == connection)
            {
                request.complete(Err(SdkNetError::ConnectionLost {
                    endpoint: endpoint.clone(),
                    reason: reason.to_string(),
                }));
                flushed = flushed.saturating_add(1);
            }
        }
        if flushed > 0 {
            debug!("flushed {flushed} pending request(s) of {connection} to {endpoint}");
        }
        flushed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, seq: &SequenceId) -> bool {
        self.pending.contains_key(seq)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::frame::{FrameErrorCode, MessageType},
        assert_matches::assert_matches,
    };

    type Outcomes = Arc<Mutex<Vec<Result<Frame>>>>;

    fn correlator() -> ResponseCorrelator {
        ResponseCorrelator::new(Arc::new(NetworkStats::new()))
    }

    fn recording() -> (Outcomes, ResponseCallback) {
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        (outcomes, Box::new(move |r| sink.lock().push(r)))
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_exactly_once() {
        let correlator = correlator();
        let conn = ConnectionId::next();
        let request = Frame::new(MessageType::RpcRequest, &b"ping"[..]);
        let (outcomes, callback) = recording();

        assert!(correlator.register(request.seq, conn, Duration::from_millis(100), callback));
        let response = request.response_to(FrameErrorCode::Success, &b"pong"[..]);
        assert!(correlator.resolve(response.clone()).is_none());

        // A duplicate response falls through to typed dispatch.
        assert_eq!(correlator.resolve(response.clone()), Some(response));

        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_matches!(&outcomes[0], Ok(frame) if frame.payload.as_ref() == b"pong");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_deadline() {
        let correlator = correlator();
        let seq = SequenceId::generate();
        let timeout = Duration::from_millis(250);
        let started = Instant::now();
        let rx = correlator.register_oneshot(seq, ConnectionId::next(), timeout);

        tokio::time::advance(Duration::from_millis(249)).await;
        settle().await;
        assert!(correlator.is_pending(&seq));

        let outcome = rx.await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(10));
        assert_matches!(outcome, Err(SdkNetError::RequestTimedOut { timeout_ms: 250, .. }));
        assert_eq!(correlator.stats.requests_timed_out.get(), 1);

        // A late response is not correlated.
        let late = Frame {
            seq,
            ..Frame::new(MessageType::RpcRequest, &b"late"[..])
        };
        assert!(correlator.resolve(late).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_only_affects_lost_connection() {
        let correlator = correlator();
        let endpoint: PeerEndpoint = "10.0.0.1:20200".parse().unwrap();
        let lost = ConnectionId::next();
        let alive = ConnectionId::next();
        let (lost_outcomes, cb1) = recording();
        let sink = Arc::clone(&lost_outcomes);
        let cb2: ResponseCallback = Box::new(move |r| sink.lock().push(r));
        let (alive_outcomes, cb3) = recording();
        let alive_seq = SequenceId::generate();

        let timeout = Duration::from_secs(10);
        correlator.register(SequenceId::generate(), lost, timeout, cb1);
        correlator.register(SequenceId::generate(), lost, timeout, cb2);
        correlator.register(alive_seq, alive, timeout, cb3);

        assert_eq!(correlator.flush_connection(lost, &endpoint, "reset by peer"), 2);
        assert_eq!(lost_outcomes.lock().len(), 2);
        assert!(lost_outcomes
            .lock()
            .iter()
            .all(|r| matches!(r, Err(SdkNetError::ConnectionLost { reason, .. }) if reason == "reset by peer")));
        assert!(alive_outcomes.lock().is_empty());
        assert!(correlator.is_pending(&alive_seq));

        // Flushed timers were cancelled.
        tokio::time::advance(Duration::from_secs(11)).await;
        settle().await;
        assert_eq!(lost_outcomes.lock().len(), 2);
        assert_eq!(alive_outcomes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_sequence_rejected() {
        let correlator = correlator();
        let seq = SequenceId::generate();
        let conn = ConnectionId::next();
        let (first, cb1) = recording();
        let (second, cb2) = recording();

        assert!(correlator.register(seq, conn, Duration::from_secs(1), cb1));
        assert!(!correlator.register(seq, conn, Duration::from_secs(1), cb2));
        assert_matches!(
            second.lock().as_slice(),
            [Err(SdkNetError::DuplicateSequence(s))] if *s == seq
        );
        assert!(first.lock().is_empty());
        assert_eq!(correlator.pending_count(), 1);

        assert!(correlator.fail(seq, SdkNetError::Stopped));
        assert!(!correlator.fail(seq, SdkNetError::Stopped));
        assert_matches!(first.lock().as_slice(), [Err(SdkNetError::Stopped)]);
    }

    #[tokio::test]
    async fn test_unsolicited_frames_fall_through() {
        let correlator = correlator();
        let notify = Frame::unsolicited(MessageType::BlockNotify, &b"42"[..]);
        assert_eq!(correlator.resolve(notify.clone()), Some(notify));
    }
}
