//! Event stream (C6) and the public Consumer API (§6): bridges the blocking
//! session frame loop (C5, running on `tokio::task::spawn_blocking`) to an
//! async iteration over [`Envelope`]s.
//!
//! Grounded on the source checker's `main.rs` (the `spawn_blocking` +
//! shutdown-signal bridge between the synchronous `libpq` loop and the async
//! runtime), restructured around a channel the caller drives by iteration
//! instead of a fixed `tokio::select!` main loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ack::LsnState;
use crate::config::ReplicationConfig;
use crate::envelope::Envelope;
use crate::errors::{ReplicationError, ReplicationResult};
use crate::session::{ReplicationSession, SessionEvent};

/// `LogicalReplicationReader`: the consumer-facing handle onto a single
/// replication session. Constructed with the enumerated options in §6;
/// iterated with [`Self::recv`]; acknowledged with [`Self::acknowledge`]
/// when `auto_acknowledge=false`; torn down with [`Self::stop`].
pub struct LogicalReplicationReader {
    receiver: mpsc::Receiver<SessionEvent>,
    session_handle: Option<JoinHandle<ReplicationResult<()>>>,
    lsn_state: Arc<LsnState>,
    stop_flag: Arc<AtomicBool>,
    stopped: bool,
}

impl LogicalReplicationReader {
    /// Connects, runs setup (`wal_level`, slot, publication checks,
    /// `IDENTIFY_SYSTEM`, `START_REPLICATION`), and starts the frame loop on
    /// a dedicated blocking task. Returns once the blocking task has been
    /// spawned — setup failures surface on the first [`Self::recv`] call.
    pub async fn connect(config: ReplicationConfig) -> ReplicationResult<Self> {
        let lsn_state = Arc::new(LsnState::new(config.auto_acknowledge));
        let queue_size = config.queue_size;
        let (sender, receiver) = mpsc::channel(queue_size);
        let stop_flag = Arc::new(AtomicBool::new(false));

        let task_lsn_state = lsn_state.clone();
        let task_stop_flag = stop_flag.clone();
        let session_handle = tokio::task::spawn_blocking(move || {
            let mut session = ReplicationSession::connect(config, task_lsn_state)?;
            session.prepare()?;
            session.run(sender, task_stop_flag)
        });

        Ok(Self::from_parts(
            receiver,
            session_handle,
            lsn_state,
            stop_flag,
        ))
    }

    fn from_parts(
        receiver: mpsc::Receiver<SessionEvent>,
        session_handle: JoinHandle<ReplicationResult<()>>,
        lsn_state: Arc<LsnState>,
        stop_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            receiver,
            session_handle: Some(session_handle),
            lsn_state,
            stop_flag,
            stopped: false,
        }
    }

    /// Receives the next item: `Ok(Some(envelope))` for a row change,
    /// `Ok(None)` for a keepalive tick (no row change occurred; the consumer
    /// may check cancellation and call again), or `Err` when the stream has
    /// ended — `StoppedRead` after a clean [`Self::stop`], or the session's
    /// fatal error otherwise.
    pub async fn recv(&mut self) -> ReplicationResult<Option<Envelope>> {
        if self.stopped {
            return Err(ReplicationError::StoppedRead);
        }

        match self.receiver.recv().await {
            Some(SessionEvent::Row(envelope)) => Ok(Some(envelope)),
            Some(SessionEvent::Keepalive) => Ok(None),
            None => {
                self.stopped = true;
                match self.session_handle.take() {
                    Some(handle) => match handle.await {
                        Ok(Ok(())) => Err(ReplicationError::StoppedRead),
                        Ok(Err(err)) => Err(err),
                        Err(join_err) => Err(ReplicationError::from(join_err)),
                    },
                    None => Err(ReplicationError::StoppedRead),
                }
            }
        }
    }

    /// Promotes the last-delivered LSN to `last_applied`/`last_flushed` and
    /// forces a feedback frame. Valid only when `auto_acknowledge=false`.
    pub fn acknowledge(&self) -> ReplicationResult<u64> {
        self.lsn_state.acknowledge()
    }

    /// Idempotent: signals the session to stop, drains any events already
    /// queued, and waits for the session's final `StandbyStatusUpdate` and
    /// clean shutdown. Safe to call more than once.
    pub async fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        while self.receiver.recv().await.is_some() {}
        if let Some(handle) = self.session_handle.take() {
            let _ = handle.await;
        }
        self.stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_with_channel(
        capacity: usize,
        auto_acknowledge: bool,
    ) -> (LogicalReplicationReader, mpsc::Sender<SessionEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let lsn_state = Arc::new(LsnState::new(auto_acknowledge));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let handle: JoinHandle<ReplicationResult<()>> = tokio::spawn(async { Ok(()) });
        let reader = LogicalReplicationReader::from_parts(receiver, handle, lsn_state, stop_flag);
        (reader, sender)
    }

    fn sample_envelope() -> Envelope {
        use crate::event::{ChangeEvent, ColumnSlot, Tuple, TransactionContext};
        use crate::relation::{Column, RelationSchema, ReplicaIdentity};
        use crate::value::Value;

        let relation = RelationSchema {
            relation_id: 1,
            namespace: "public".into(),
            name: "customers".into(),
            replica_identity: ReplicaIdentity::Full,
            columns: vec![Column {
                name: "_id".into(),
                type_oid: 1043,
                type_modifier: -1,
                is_key: true,
            }],
        };
        let event = ChangeEvent::Insert {
            relation_id: 1,
            after: Tuple::new(vec![ColumnSlot::Present(Value::Text("CUST001".into()))]),
            tx: TransactionContext {
                xid: 1,
                commit_lsn: 100,
                commit_timestamp_us: 0,
            },
        };
        Envelope::from_event(&event, &relation).unwrap()
    }

    #[tokio::test]
    async fn keepalive_yields_none_row_yields_some() {
        let (mut reader, sender) = reader_with_channel(4, true);
        sender.send(SessionEvent::Keepalive).await.unwrap();
        sender
            .send(SessionEvent::Row(sample_envelope()))
            .await
            .unwrap();

        assert!(reader.recv().await.unwrap().is_none());
        let envelope = reader.recv().await.unwrap().unwrap();
        assert_eq!(envelope.op, 'c');
    }

    #[tokio::test]
    async fn closed_channel_surfaces_stopped_read() {
        let (mut reader, sender) = reader_with_channel(4, true);
        drop(sender);
        match reader.recv().await {
            Err(ReplicationError::StoppedRead) => {}
            other => panic!("expected StoppedRead, got {other:?}"),
        }
        match reader.recv().await {
            Err(ReplicationError::StoppedRead) => {}
            other => panic!("expected StoppedRead on repeated read, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auto_ack_reader_rejects_acknowledge() {
        let (reader, _sender) = reader_with_channel(4, true);
        match reader.acknowledge() {
            Err(ReplicationError::NoPendingLsn) => {}
            other => panic!("expected NoPendingLsn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (mut reader, sender) = reader_with_channel(4, true);
        drop(sender);
        reader.stop().await;
        reader.stop().await;
    }
}
