//! In-flight request bookkeeping.
//!
//! One lock covers both the sequence counter and the entry map, so assigning
//! a number and registering its slot happen together, and draining on close
//! cannot interleave with a registration.

use std::collections::HashMap;
use std::mem;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use super::client::RequestError;
use super::messages::Response;

type Slot = oneshot::Sender<Result<Response, RequestError>>;
pub(crate) type Waiter = oneshot::Receiver<Result<Response, RequestError>>;

pub(crate) struct PendingTable {
    inner: Mutex<Inner>,
}

struct Inner {
    next_seq: u64,
    entries: HashMap<u64, Slot>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_seq: 1,
                entries: HashMap::new(),
            }),
        }
    }

    /// Assigns (or adopts) a sequence number and registers its slot.
    pub(crate) fn register(&self, requested: Option<u64>) -> Result<(u64, Waiter), RequestError> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let seq = match requested {
            Some(seq) => {
                if inner.entries.contains_key(&seq) {
                    return Err(RequestError::DuplicateSequence(seq));
                }
                inner.next_seq = inner.next_seq.max(seq.saturating_add(1));
                seq
            }
            None => {
                let mut seq = inner.next_seq;
                // An override may have claimed numbers ahead of the counter.
                while inner.entries.contains_key(&seq) {
                    seq += 1;
                }
                inner.next_seq = seq + 1;
                seq
            }
        };
        inner.entries.insert(seq, tx);
        Ok((seq, rx))
    }

    /// Delivers a response to its waiter. False when nothing was waiting.
    pub(crate) fn resolve(&self, response: Response) -> bool {
        let slot = self.inner.lock().entries.remove(&response.request_seq);
        match slot {
            Some(slot) => {
                // The waiter may have given up already; the entry is gone either way.
                let _ = slot.send(Ok(response));
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, seq: u64) -> bool {
        self.inner.lock().entries.remove(&seq).is_some()
    }

    /// Swaps the table for an empty one and fails everything that was in it.
    pub(crate) fn fail_all(&self) -> usize {
        let drained = mem::take(&mut self.inner.lock().entries);
        let count = drained.len();
        for (seq, slot) in drained {
            trace!(seq, "failing pending request on close");
            let _ = slot.send(Err(RequestError::ConnectionClosed));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

/// Removes its entry when dropped, whichever way the request finished.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    seq: u64,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, seq: u64) -> Self {
        Self { table, seq }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::HashSet;
    use std::sync::Arc;

    use test_timeout::timeout;

    fn response(request_seq: u64) -> Response {
        Response {
            seq: None,
            request_seq,
            command: Some("gc".into()),
            body: Value::Null,
            running: false,
            success: true,
            message: None,
        }
    }

    #[test]
    fn sequence_numbers_start_at_one() {
        let table = PendingTable::new();
        let (first, _a) = table.register(None).unwrap();
        let (second, _b) = table.register(None).unwrap();
        assert_eq!((first, second), (1, 2));
    }

    #[test]
    fn override_advances_counter() {
        let table = PendingTable::new();
        let (seq, _a) = table.register(Some(10)).unwrap();
        assert_eq!(seq, 10);
        let (next, _b) = table.register(None).unwrap();
        assert_eq!(next, 11);

        // A lower override does not pull the counter back.
        let (low, _c) = table.register(Some(3)).unwrap();
        assert_eq!(low, 3);
        let (after, _d) = table.register(None).unwrap();
        assert_eq!(after, 12);
    }

    #[test]
    fn outstanding_override_is_rejected() {
        let table = PendingTable::new();
        let (_seq, _rx) = table.register(Some(4)).unwrap();
        assert!(matches!(
            table.register(Some(4)),
            Err(RequestError::DuplicateSequence(4))
        ));
    }

    #[test]
    fn guard_removes_entry() {
        let table = PendingTable::new();
        let (seq, _rx) = table.register(None).unwrap();
        {
            let _guard = PendingGuard::new(&table, seq);
            assert_eq!(table.len(), 1);
        }
        assert_eq!(table.len(), 0);
        assert!(!table.resolve(response(seq)));
    }

    #[tokio::test]
    async fn fail_all_leaves_later_registrations_alone() {
        let table = PendingTable::new();
        let waiters: Vec<_> = (0..5).map(|_| table.register(None).unwrap()).collect();
        assert_eq!(table.fail_all(), 5);

        let (late_seq, late_rx) = table.register(None).unwrap();
        for (_, rx) in waiters {
            assert!(matches!(rx.await.unwrap(), Err(RequestError::ConnectionClosed)));
        }
        assert_eq!(table.len(), 1);
        assert!(table.resolve(response(late_seq)));
        assert_eq!(late_rx.await.unwrap().unwrap().request_seq, late_seq);
    }

    #[timeout(10)]
    fn concurrent_registration_is_unique() {
        let table = Arc::new(PendingTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    (0..200)
                        .map(|_| table.register(None).unwrap().0)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(seen.insert(seq), "duplicate seq {seq}");
            }
        }
        assert_eq!(seen.len(), 1600);
        assert_eq!(seen.iter().copied().max(), Some(1600));
    }

    #[timeout(10)]
    fn resolve_and_close_race_settles_each_request_once() {
        for _ in 0..50 {
            let table = Arc::new(PendingTable::new());
            let registered: Vec<_> = (0..32).map(|_| table.register(None).unwrap()).collect();
            let seqs: Vec<u64> = registered.iter().map(|(seq, _)| *seq).collect();

            let resolver = {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    seqs.into_iter()
                        .filter(|seq| table.resolve(response(*seq)))
                        .count()
                })
            };
            let closer = {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.fail_all())
            };
            let resolved = resolver.join().unwrap();
            let failed = closer.join().unwrap();
            assert_eq!(resolved + failed, 32);
            assert_eq!(table.len(), 0);

            let mut outcomes = 0;
            for (_, mut rx) in registered {
                assert!(rx.try_recv().is_ok());
                outcomes += 1;
            }
            assert_eq!(outcomes, 32);
        }
    }
}
