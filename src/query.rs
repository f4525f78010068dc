//! Per-request state shared between a proxy context, the dispatcher, and
//! the upstream resolvers racing to answer it.
//!
//! Single-threaded per worker: no `Arc`/`Mutex`, just `Rc`/`Cell`/`RefCell`.
//! Status is monotonic (`WAITING` -> `{ANSWER_WRITTEN, EXPIRED}` ->
//! `ANSWER_ACCEPTED`); only the first resolver to observe `WAITING` may
//! advance it to `ANSWER_WRITTEN`, so a losing race is a plain compare-and-set
//! on a `Cell`, no lock needed.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::sync::Notify;

/// Where a finished answer (or a synthesized failure) must be written back to.
#[derive(Debug, Clone)]
pub enum ClientEndpoint {
    /// UDP: every reply goes out the shared listening socket to this peer.
    Udp(SocketAddr),
    /// TCP: replies go out the owning connection's write queue, in the order
    /// queries complete (not necessarily arrival order).
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Waiting,
    AnswerWritten,
    AnswerAccepted,
    Expired,
}

/// Per-query state. Created by a proxy context for every inbound message,
/// referenced by the dispatcher while in flight and by each resolver's
/// remap table; all references drop once the answer is delivered or the
/// query expires.
pub struct QueryContext {
    /// The inbound query, framed (2-byte length prefix + message), as
    /// received from the client. Each resolver writes its own rewritten-ID
    /// copy to the wire; this buffer is never mutated after construction,
    /// so it is safe to share between a primary dispatch and an idle probe.
    pub query_framed: Vec<u8>,
    /// The transaction ID the client used, read once at construction time,
    /// before any resolver rewrites a copy for its own wire ID space.
    pub original_id: u16,
    /// The answer buffer, framed, written at most once by the winning
    /// resolver.
    pub answer_framed: RefCell<Option<Vec<u8>>>,
    pub endpoint: ClientEndpoint,
    status: Cell<QueryStatus>,
    /// Number of upstream resolvers this query is currently outstanding on
    /// (1 for a plain dispatch, 2 when an idle probe is also sent).
    pub outstanding: Cell<u16>,
    /// Signaled exactly once, when the status transitions to
    /// `AnswerWritten` or `Expired`. A query can have multiple concurrent
    /// waiters (the dispatcher's per-dispatch bookkeeping task for the
    /// primary send, again for an idle probe, plus the owning proxy
    /// context), so completion is broadcast with `notify_waiters`, never
    /// `notify_one` (which wakes at most one of them and starves the
    /// rest).
    completion: Notify,
}

impl QueryContext {
    /// `query_framed` must be at least 4 bytes (2-byte length prefix + a
    /// 2-byte transaction ID); the proxy context only constructs this after
    /// a successful decode, so that invariant always holds here.
    pub fn new(query_framed: Vec<u8>, endpoint: ClientEndpoint) -> Rc<Self> {
        let original_id = crate::dns::read_id(&query_framed[2..])
            .expect("query_framed holds an already-decoded message");
        Rc::new(Self {
            query_framed,
            original_id,
            answer_framed: RefCell::new(None),
            endpoint,
            status: Cell::new(QueryStatus::Waiting),
            outstanding: Cell::new(0),
            completion: Notify::new(),
        })
    }

    pub fn status(&self) -> QueryStatus {
        self.status.get()
    }

    pub fn is_waiting(&self) -> bool {
        self.status.get() == QueryStatus::Waiting
    }

    /// Attempt to write the first answer for this query. Returns `true` if
    /// this call won the race (status was `Waiting`); a `false` return means
    /// the caller observed a non-`Waiting` status and must drop its result.
    pub fn try_write_answer(&self, framed: Vec<u8>) -> bool {
        if self.status.get() != QueryStatus::Waiting {
            return false;
        }
        *self.answer_framed.borrow_mut() = Some(framed);
        self.status.set(QueryStatus::AnswerWritten);
        self.completion.notify_waiters();
        true
    }

    /// Mark the query expired. Idempotent: a second call after the answer
    /// already won is a no-op. Returns `true` if this call performed the
    /// transition.
    pub fn expire(&self) -> bool {
        if self.status.get() != QueryStatus::Waiting {
            return false;
        }
        self.status.set(QueryStatus::Expired);
        self.completion.notify_waiters();
        true
    }

    /// Final transition, taken by the proxy context once it has consumed
    /// the written answer.
    pub fn accept(&self) {
        debug_assert_eq!(self.status.get(), QueryStatus::AnswerWritten);
        self.status.set(QueryStatus::AnswerAccepted);
    }

    /// Wait for `try_write_answer` or `expire` to fire. Resolves immediately
    /// if the status has already left `Waiting` by the time this is polled.
    ///
    /// `notify_waiters` wakes only listeners already registered at the time
    /// it fires, so the registration has to happen before the `is_waiting`
    /// check below, not after — otherwise a transition landing in the gap
    /// between the check and the `.await` would be missed forever. `enable`
    /// registers this call as a listener without waiting on it yet.
    pub async fn wait_for_completion(&self) {
        let notified = self.completion.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_waiting() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins_the_race() {
        let ctx = QueryContext::new(vec![0xAB, 0xCD, 0x12, 0x34], ClientEndpoint::Udp("127.0.0.1:0".parse().unwrap()));
        assert!(ctx.try_write_answer(vec![1, 2, 3]));
        assert_eq!(ctx.status(), QueryStatus::AnswerWritten);
        assert!(!ctx.try_write_answer(vec![4, 5, 6]));
        assert_eq!(ctx.answer_framed.borrow().as_deref(), Some([1, 2, 3].as_slice()));
    }

    #[test]
    fn expire_is_a_noop_after_answer_written() {
        let ctx = QueryContext::new(vec![0xAB, 0xCD, 0x12, 0x34], ClientEndpoint::Tcp);
        assert!(ctx.try_write_answer(vec![9]));
        assert!(!ctx.expire());
        assert_eq!(ctx.status(), QueryStatus::AnswerWritten);
    }

    #[test]
    fn expire_wins_when_no_answer_arrived() {
        let ctx = QueryContext::new(vec![0xAB, 0xCD, 0x12, 0x34], ClientEndpoint::Tcp);
        assert!(ctx.expire());
        assert_eq!(ctx.status(), QueryStatus::Expired);
        assert!(!ctx.try_write_answer(vec![1]));
    }

    #[tokio::test]
    async fn wait_for_completion_resolves_immediately_if_already_done() {
        let ctx = QueryContext::new(vec![0xAB, 0xCD, 0x12, 0x34], ClientEndpoint::Tcp);
        ctx.try_write_answer(vec![1]);
        ctx.wait_for_completion().await;
        assert_eq!(ctx.status(), QueryStatus::AnswerWritten);
    }
}
