//! Request / response correlation
//!
//! Every request gets an id from the connection's [`RequestIdSequence`]. The
//! [`Dispatcher`] keeps one reply channel per outstanding id and resolves it
//! when the response, a failure or the deadline arrives. Requests submitted
//! while the handshake is still running wait in a queue and go out in
//! submission order once the channel is open.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::encoding::ServiceFault;
use crate::error::{ChannelError, Result};

/// Receives the response body, or the reason there is none
pub type ResponseSender = oneshot::Sender<Result<Bytes>>;

/// Consumer of everything that can happen to an outstanding request
pub trait ResponseHandler {
    /// A complete response arrived for `request_id`
    fn handle_response(&mut self, request_id: u32, body: Bytes);

    /// The request could not be framed or written
    fn handle_send_failure(&mut self, request_id: u32, error: ChannelError);

    /// The response was aborted by the server or broke a local limit
    fn handle_receive_failure(&mut self, request_id: u32, error: ChannelError);

    /// The channel went down, nothing outstanding will complete
    fn handle_channel_inactive(&mut self, error: &ChannelError);
}

/// Request ids 1, 2, ... wrapping around without ever producing 0
#[derive(Debug, Clone)]
pub struct RequestIdSequence {
    next: u32,
}

impl Default for RequestIdSequence {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl RequestIdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        id
    }
}

#[derive(Debug)]
struct PendingRequest {
    reply: ResponseSender,
    deadline: Instant,
}

/// Request submitted before the channel opened
#[derive(Debug)]
pub struct QueuedRequest {
    pub body: Bytes,
    pub reply: ResponseSender,
    pub deadline: Instant,
}

/// Outstanding and queued requests of one connection
#[derive(Debug, Default)]
pub struct Dispatcher {
    pending: HashMap<u32, PendingRequest>,
    queue: VecDeque<QueuedRequest>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold a request until the channel is open
    pub fn enqueue(&mut self, body: Bytes, reply: ResponseSender, deadline: Instant) {
        self.queue.push_back(QueuedRequest {
            body,
            reply,
            deadline,
        });
    }

    /// Queued requests in submission order
    pub fn take_queued(&mut self) -> VecDeque<QueuedRequest> {
        std::mem::take(&mut self.queue)
    }

    /// Track a request whose chunks were written
    pub fn register(&mut self, request_id: u32, reply: ResponseSender, deadline: Instant) {
        trace!("request_id={} in flight", request_id);
        self.pending
            .insert(request_id, PendingRequest { reply, deadline });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_pending(&self, request_id: u32) -> bool {
        self.pending.contains_key(&request_id)
    }

    /// Earliest deadline of any pending or queued request
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.deadline)
            .chain(self.queue.iter().map(|q| q.deadline))
            .min()
    }

    /// Resolve every request whose deadline has passed with `Timeout`
    ///
    /// Returns the ids of the expired in-flight requests so their remaining
    /// chunks can be discarded.
    pub fn expire(&mut self, now: Instant) -> Vec<u32> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for request_id in &expired {
            if let Some(pending) = self.pending.remove(request_id) {
                debug!("request_id={} timed out", request_id);
                let _ = pending.reply.send(Err(ChannelError::Timeout(format!(
                    "no response to request {}",
                    request_id
                ))));
            }
        }

        let (expired_queued, queue): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut self.queue)
                .into_iter()
                .partition(|q| q.deadline <= now);
        self.queue = queue;
        for queued in expired_queued {
            let _ = queued.reply.send(Err(ChannelError::Timeout(
                "channel did not open before the request deadline".into(),
            )));
        }

        expired
    }

    fn resolve(&mut self, request_id: u32, result: Result<Bytes>) {
        match self.pending.remove(&request_id) {
            Some(pending) => {
                if pending.reply.send(result).is_err() {
                    trace!("caller of request_id={} went away", request_id);
                }
            }
            None => warn!(
                "dropping response for unknown request_id={} ({})",
                request_id,
                match &result {
                    Ok(body) => format!("{} bytes", body.len()),
                    Err(e) => e.to_string(),
                }
            ),
        }
    }
}

impl ResponseHandler for Dispatcher {
    fn handle_response(&mut self, request_id: u32, body: Bytes) {
        let result = match ServiceFault::from_message(&body) {
            Ok(Some(fault)) => Err(fault.into_error()),
            Ok(None) => Ok(body),
            Err(e) => Err(e),
        };
        self.resolve(request_id, result);
    }

    fn handle_send_failure(&mut self, request_id: u32, error: ChannelError) {
        self.resolve(request_id, Err(error));
    }

    fn handle_receive_failure(&mut self, request_id: u32, error: ChannelError) {
        self.resolve(request_id, Err(error));
    }

    fn handle_channel_inactive(&mut self, error: &ChannelError) {
        let count = self.pending.len() + self.queue.len();
        if count > 0 {
            debug!("failing {} outstanding requests: {}", count, error);
        }
        let closed = || ChannelError::ConnectionClosed(error.to_string());
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(closed()));
        }
        for queued in self.queue.drain(..) {
            let _ = queued.reply.send(Err(closed()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;

    use super::*;
    use crate::encoding::{NodeId, ResponseHeader};
    use crate::status::StatusCode;

    fn deadline(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[test]
    fn test_request_ids_skip_zero() {
        let mut ids = RequestIdSequence::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);

        let mut ids = RequestIdSequence { next: u32::MAX };
        assert_eq!(ids.next_id(), u32::MAX);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_responses_in_any_order() {
        let mut dispatcher = Dispatcher::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let (tx3, rx3) = oneshot::channel();
        dispatcher.register(1, tx1, deadline(60));
        dispatcher.register(2, tx2, deadline(60));
        dispatcher.register(3, tx3, deadline(60));

        dispatcher.handle_response(3, Bytes::from_static(b"three"));
        dispatcher.handle_response(1, Bytes::from_static(b"one"));
        dispatcher.handle_response(2, Bytes::from_static(b"two"));

        let one = tokio_test::block_on(rx1).unwrap();
        let two = tokio_test::block_on(rx2).unwrap();
        let three = tokio_test::block_on(rx3).unwrap();
        assert_eq!(one.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(two.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(three.unwrap(), Bytes::from_static(b"three"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_unknown_response_dropped() {
        let mut dispatcher = Dispatcher::new();
        let (tx, mut rx) = oneshot::channel();
        dispatcher.register(1, tx, deadline(60));
        dispatcher.handle_response(42, Bytes::from_static(b"stray"));
        assert!(dispatcher.is_pending(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_service_fault_resolves_error() {
        let mut dispatcher = Dispatcher::new();
        let (tx, mut rx) = oneshot::channel();
        dispatcher.register(4, tx, deadline(60));

        let mut header = ResponseHeader::new(4, 0, StatusCode::BAD_SERVICE_UNSUPPORTED);
        header.string_table = vec![Some("unsupported".into())];
        let fault = ServiceFault {
            response_header: header,
        }
        .encode();
        dispatcher.handle_response(4, fault);

        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(matches!(
            err,
            ChannelError::ServiceFault {
                status: StatusCode::BAD_SERVICE_UNSUPPORTED,
                ..
            }
        ));
    }

    #[test]
    fn test_non_fault_body_passed_through() {
        let mut dispatcher = Dispatcher::new();
        let (tx, mut rx) = oneshot::channel();
        dispatcher.register(5, tx, deadline(60));

        let mut body = BytesMut::new();
        NodeId::ns0(632).encode(&mut body);
        body.extend_from_slice(b"payload");
        let body = body.freeze();
        dispatcher.handle_response(5, body.clone());
        assert_eq!(rx.try_recv().unwrap().unwrap(), body);
    }

    #[test]
    fn test_failures_only_affect_their_request() {
        let mut dispatcher = Dispatcher::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        dispatcher.register(1, tx1, deadline(60));
        dispatcher.register(2, tx2, deadline(60));

        dispatcher.handle_receive_failure(
            1,
            ChannelError::MessageAbort {
                request_id: 1,
                status: StatusCode::BAD_RESPONSE_TOO_LARGE,
                reason: "too big".into(),
            },
        );
        assert!(matches!(
            rx1.try_recv().unwrap(),
            Err(ChannelError::MessageAbort { request_id: 1, .. })
        ));
        assert!(rx2.try_recv().is_err());
        assert!(dispatcher.is_pending(2));
    }

    #[test]
    fn test_expire_pending_and_queued() {
        let mut dispatcher = Dispatcher::new();
        let now = Instant::now();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        let (tx3, mut rx3) = oneshot::channel();
        dispatcher.register(1, tx1, now + Duration::from_secs(1));
        dispatcher.register(2, tx2, now + Duration::from_secs(10));
        dispatcher.enqueue(Bytes::from_static(b"q"), tx3, now + Duration::from_secs(2));

        assert_eq!(dispatcher.next_deadline(), Some(now + Duration::from_secs(1)));
        let expired = dispatcher.expire(now + Duration::from_secs(5));
        assert_eq!(expired, vec![1]);
        assert!(matches!(rx1.try_recv().unwrap(), Err(ChannelError::Timeout(_))));
        assert!(matches!(rx3.try_recv().unwrap(), Err(ChannelError::Timeout(_))));
        assert!(rx2.try_recv().is_err());
        assert_eq!(dispatcher.next_deadline(), Some(now + Duration::from_secs(10)));
        assert_eq!(dispatcher.queued_count(), 0);
    }

    #[test]
    fn test_channel_inactive_fails_everything() {
        let mut dispatcher = Dispatcher::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        dispatcher.register(1, tx1, deadline(60));
        dispatcher.enqueue(Bytes::from_static(b"q"), tx2, deadline(60));

        dispatcher.handle_channel_inactive(&ChannelError::Timeout("acknowledge".into()));
        assert!(matches!(
            rx1.try_recv().unwrap(),
            Err(ChannelError::ConnectionClosed(_))
        ));
        assert!(matches!(
            rx2.try_recv().unwrap(),
            Err(ChannelError::ConnectionClosed(_))
        ));
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.queued_count(), 0);
    }

    #[test]
    fn test_queue_preserves_order() {
        let mut dispatcher = Dispatcher::new();
        for body in [&b"a"[..], &b"b"[..], &b"c"[..]] {
            let (tx, _rx) = oneshot::channel();
            dispatcher.enqueue(Bytes::copy_from_slice(body), tx, deadline(60));
        }
        let bodies: Vec<Bytes> = dispatcher.take_queued().into_iter().map(|q| q.body).collect();
        assert_eq!(
            bodies,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );
    }
}
