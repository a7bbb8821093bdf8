//! Per-stream receive handle on the consumer side.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;

use super::monitor::StreamMonitor;
use crate::constants::KVDATA_CHAN_SIZE;
use crate::mutation::ConnectionError;
use crate::mutation::Mutation;
use crate::mutation::MutationHandler;
use crate::mutation::MutationKind;

/// Identity of a managed stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamId {
    /// Incremental maintenance of active indexes.
    Maint,
    /// Catch-up for indexes lagging the maintenance stream.
    Catchup,
    /// Initial load of newly built indexes.
    Init,
}

impl StreamId {
    /// Producer-side topic carrying this stream's mutations.
    pub fn topic_name(&self) -> &'static str {
        match self {
            StreamId::Maint => "MAINT_STREAM_TOPIC",
            StreamId::Catchup => "CATCHUP_STREAM_TOPIC",
            StreamId::Init => "INIT_STREAM_TOPIC",
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            StreamId::Maint => "MAINT_STREAM",
            StreamId::Catchup => "CATCHUP_STREAM",
            StreamId::Init => "INIT_STREAM",
        };
        write!(f, "{name}")
    }
}

/// One message from the mutation receive path.
#[derive(Debug)]
pub enum StreamMessage {
    Mutation(Mutation),
    /// The transport lost a producer connection and names the vbuckets it
    /// was carrying.
    ConnectionError(ConnectionError),
}

/// A started stream: its listening port, status and the dispatch task
/// feeding the mutation handler.
///
/// The wire receiver itself is an external collaborator; it obtains the
/// stream's sender from the manager and pushes decoded messages through
/// it. Events are dispatched in arrival order, which preserves per-vbucket
/// ordering end to end.
pub(crate) struct Stream {
    pub(crate) id: StreamId,
    pub(crate) port: u16,
    pub(crate) status: bool,
    msg_tx: mpsc::Sender<StreamMessage>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Stream {
    /// Prepare the receiver and start dispatching.
    pub(crate) fn start(
        id: StreamId,
        port: u16,
        handler: Arc<dyn MutationHandler>,
        monitor: Option<Arc<StreamMonitor>>,
    ) -> Stream {
        let (msg_tx, msg_rx) = mpsc::channel(KVDATA_CHAN_SIZE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(dispatch(id, msg_rx, shutdown_rx, handler, monitor));
        info!("stream {} listening on port {}", id, port);

        Stream {
            id,
            port,
            status: true,
            msg_tx,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Sender for the external wire receiver.
    pub(crate) fn sender(&self) -> mpsc::Sender<StreamMessage> {
        self.msg_tx.clone()
    }

    pub(crate) fn close(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.status = false;
        info!("stream {} on port {} closed", self.id, self.port);
    }
}

async fn dispatch(
    id: StreamId,
    mut msg_rx: mpsc::Receiver<StreamMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
    handler: Arc<dyn MutationHandler>,
    monitor: Option<Arc<StreamMonitor>>,
) {
    let mut offset = 0usize;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            msg = msg_rx.recv() => match msg {
                None => break,
                Some(StreamMessage::Mutation(mutation)) => {
                    if let Some(monitor) = &monitor {
                        if matches!(
                            mutation.kind,
                            MutationKind::Sync | MutationKind::Snapshot { .. }
                        ) {
                            monitor.record_heartbeat(id, &mutation);
                        }
                    }
                    handler.dispatch(id, &mutation, offset);
                    offset += 1;
                }
                Some(StreamMessage::ConnectionError(err)) => {
                    handler.handle_connection_error(id, err);
                }
            }
        }
    }
    debug!("stream {} dispatcher exited", id);
}
