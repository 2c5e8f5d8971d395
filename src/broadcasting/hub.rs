//! # Broadcast Hub
//!
//! Owns the set of connected viewers on the event context and fans every
//! published [`ViewerMessage`] out to them.
//!
//! ## Threading
//!
//! [`BroadcastHub`] itself is not shared: it lives inside the task running
//! [`BroadcastHub::run`]. Every other party (viewer sockets, the generation
//! run, the control-plane thread) talks to it through a cloneable
//! [`HubHandle`], which pushes [`HubCommand`]s onto one unbounded FIFO
//! channel. A publish is therefore delivered to the viewers connected when the
//! hub *processes* it, and publishes from one sender keep their order.
//!
//! Each viewer's outgoing queue holds at most [`VIEWER_QUEUE_DEPTH`] frames.
//! A viewer that falls that far behind is treated like a closed one and
//! dropped, so a stalled socket cannot pin every published clip in memory.
//!
//! ```text
//! [control thread] --publish--\
//! [generation run] --publish---+--> mpsc<HubCommand> --> [hub task] --> ViewerSink x N
//! [viewer sockets] --connect--/
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::messages::ViewerMessage;

pub type ViewerId = u64;

/// Frames buffered per viewer before it counts as stalled.
pub const VIEWER_QUEUE_DEPTH: usize = 32;

/// Delivery to one viewer failed; the viewer is dropped from the hub.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("viewer connection closed")]
    Closed,
    #[error("viewer stopped reading its queue")]
    Lagging,
}

/// Outgoing side of one viewer connection.
pub trait ViewerSink: Send {
    /// Hands one serialized message to the viewer without blocking.
    fn deliver(&mut self, frame: Arc<str>) -> Result<(), DeliveryError>;
}

impl ViewerSink for mpsc::Sender<Arc<str>> {
    fn deliver(&mut self, frame: Arc<str>) -> Result<(), DeliveryError> {
        self.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Lagging,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Commands marshalled onto the hub's event context.
pub enum HubCommand {
    Connect {
        id: ViewerId,
        sink: Box<dyn ViewerSink>,
    },
    Disconnect(ViewerId),
    Publish(ViewerMessage),
    ViewerCount(oneshot::Sender<usize>),
}

/// The viewer registry. Driven by [`BroadcastHub::run`].
pub struct BroadcastHub {
    viewers: BTreeMap<ViewerId, Box<dyn ViewerSink>>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
}

/// Creates a hub and the first handle to it.
pub fn channel() -> (BroadcastHub, HubHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let hub = BroadcastHub {
        viewers: BTreeMap::new(),
        commands: rx,
    };
    let handle = HubHandle {
        commands: tx,
        next_id: Arc::new(AtomicU64::new(1)),
    };
    (hub, handle)
}

impl BroadcastHub {
    /// Processes commands until every [`HubHandle`] has been dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.apply(command);
        }
        debug!("Hub command channel closed");
    }

    fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect { id, sink } => self.add_viewer(id, sink),
            HubCommand::Disconnect(id) => self.remove_viewer(id),
            HubCommand::Publish(message) => {
                self.broadcast(&message);
            }
            HubCommand::ViewerCount(reply) => {
                let _ = reply.send(self.viewers.len());
            }
        }
    }

    pub fn add_viewer(&mut self, id: ViewerId, sink: Box<dyn ViewerSink>) {
        self.viewers.insert(id, sink);
        info!(viewer = id, total = self.viewers.len(), "Viewer connected");
    }

    pub fn remove_viewer(&mut self, id: ViewerId) {
        if self.viewers.remove(&id).is_some() {
            info!(viewer = id, remaining = self.viewers.len(), "Viewer disconnected");
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Sends `message` to every connected viewer and returns how many took it.
    ///
    /// A viewer whose sink fails is removed; the others still receive the
    /// message and nothing is reported back to the publisher.
    pub fn broadcast(&mut self, message: &ViewerMessage) -> usize {
        if self.viewers.is_empty() {
            return 0;
        }

        let frame: Arc<str> = match serde_json::to_string(message) {
            Ok(text) => text.into(),
            Err(e) => {
                error!(error = %e, "Failed to serialize viewer message");
                return 0;
            }
        };

        let mut failed = Vec::new();
        for (id, sink) in self.viewers.iter_mut() {
            if let Err(e) = sink.deliver(Arc::clone(&frame)) {
                failed.push((*id, e));
            }
        }

        for (id, reason) in failed {
            self.viewers.remove(&id);
            info!(viewer = id, remaining = self.viewers.len(), %reason, "Dropped viewer");
        }

        self.viewers.len()
    }
}

/// Thread-safe entry point into the hub.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Queues a message for delivery. Callable from any thread; never blocks.
    pub fn publish(&self, message: ViewerMessage) {
        if self.commands.send(HubCommand::Publish(message)).is_err() {
            debug!("Publish after hub shutdown ignored");
        }
    }

    /// Registers a new viewer backed by a queue of [`VIEWER_QUEUE_DEPTH`] frames.
    ///
    /// The returned [`Viewer`] receives every message published after the
    /// hub processes the registration, and disconnects when dropped.
    pub fn connect(&self) -> Viewer {
        let (tx, rx) = mpsc::channel(VIEWER_QUEUE_DEPTH);
        let id = self.connect_sink(Box::new(tx));
        Viewer {
            id,
            frames: rx,
            hub: self.clone(),
        }
    }

    /// Registers an arbitrary sink and returns its id.
    pub fn connect_sink(&self, sink: Box<dyn ViewerSink>) -> ViewerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.commands.send(HubCommand::Connect { id, sink });
        id
    }

    pub fn disconnect(&self, id: ViewerId) {
        let _ = self.commands.send(HubCommand::Disconnect(id));
    }

    /// Number of connected viewers, as seen by the hub after every command
    /// queued before this call. `None` if the hub is gone.
    pub async fn viewer_count(&self) -> Option<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(HubCommand::ViewerCount(tx)).ok()?;
        rx.await.ok()
    }
}

/// A live viewer registration.
pub struct Viewer {
    id: ViewerId,
    frames: mpsc::Receiver<Arc<str>>,
    hub: HubHandle,
}

impl Viewer {
    pub fn id(&self) -> ViewerId {
        self.id
    }

    /// Next serialized message, or `None` once the hub has dropped this viewer
    /// and its queued frames are drained.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.frames.recv().await
    }

    /// Non-blocking variant of [`Viewer::recv`].
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.frames.try_recv().ok()
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.hub.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcasting::messages::StatusState;
    use std::sync::Mutex;

    struct RecordingSink(Arc<Mutex<Vec<Arc<str>>>>);

    impl ViewerSink for RecordingSink {
        fn deliver(&mut self, frame: Arc<str>) -> Result<(), DeliveryError> {
            self.0.lock().expect("lock").push(frame);
            Ok(())
        }
    }

    struct BrokenSink;

    impl ViewerSink for BrokenSink {
        fn deliver(&mut self, _frame: Arc<str>) -> Result<(), DeliveryError> {
            Err(DeliveryError::Closed)
        }
    }

    fn info(text: &str) -> ViewerMessage {
        ViewerMessage::status(StatusState::Info, text)
    }

    #[test]
    fn fan_out_survives_a_failing_viewer() {
        let (mut hub, _handle) = channel();
        let logs: Vec<_> = (0..4).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

        for (id, log) in logs.iter().enumerate() {
            hub.add_viewer(id as ViewerId, Box::new(RecordingSink(Arc::clone(log))));
        }
        hub.add_viewer(99, Box::new(BrokenSink));
        assert_eq!(hub.viewer_count(), 5);

        hub.broadcast(&info("hello"));

        assert_eq!(hub.viewer_count(), 4);
        for log in &logs {
            let frames = log.lock().expect("lock");
            assert_eq!(frames.len(), 1);
            assert!(frames[0].contains("hello"));
        }

        hub.broadcast(&info("again"));
        assert!(logs.iter().all(|log| log.lock().expect("lock").len() == 2));
    }

    #[test]
    fn broadcast_without_viewers_is_a_no_op() {
        let (mut hub, _handle) = channel();
        assert_eq!(hub.broadcast(&info("nobody")), 0);
    }

    #[tokio::test]
    async fn publishes_reach_all_connected_viewers() {
        let (hub, handle) = channel();
        tokio::spawn(hub.run());

        let mut viewers: Vec<Viewer> = (0..3).map(|_| handle.connect()).collect();
        handle.publish(info("first"));

        for viewer in &mut viewers {
            let frame = viewer.recv().await.expect("frame");
            let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
            assert_eq!(value["message"], "first");
        }
    }

    #[tokio::test]
    async fn late_joiners_only_see_future_messages() {
        let (hub, handle) = channel();
        tokio::spawn(hub.run());

        let mut early = handle.connect();
        handle.publish(info("before"));
        let mut late = handle.connect();
        handle.publish(info("after"));

        assert!(early.recv().await.expect("before").contains("before"));
        assert!(early.recv().await.expect("after").contains("after"));
        assert!(late.recv().await.expect("after").contains("after"));
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_a_viewer_disconnects_it() {
        let (hub, handle) = channel();
        tokio::spawn(hub.run());

        let keep = handle.connect();
        let gone = handle.connect();
        assert_eq!(handle.viewer_count().await, Some(2));

        drop(gone);
        assert_eq!(handle.viewer_count().await, Some(1));
        drop(keep);
        assert_eq!(handle.viewer_count().await, Some(0));
    }

    #[tokio::test]
    async fn foreign_thread_publishes_keep_their_order() {
        let (hub, handle) = channel();
        tokio::spawn(hub.run());
        let mut viewer = handle.connect();

        let publisher = handle.clone();
        std::thread::spawn(move || {
            for i in 0..VIEWER_QUEUE_DEPTH {
                publisher.publish(info(&format!("msg-{}", i)));
            }
        })
        .join()
        .expect("publisher thread");

        for i in 0..VIEWER_QUEUE_DEPTH {
            let frame = viewer.recv().await.expect("frame");
            let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
            assert_eq!(value["message"], format!("msg-{}", i));
        }
    }

    #[tokio::test]
    async fn stalled_viewer_is_dropped_once_its_queue_fills() {
        let (hub, handle) = channel();
        tokio::spawn(hub.run());

        let mut stalled = handle.connect();
        let mut reader = handle.connect();
        assert_eq!(handle.viewer_count().await, Some(2));

        for i in 0..=VIEWER_QUEUE_DEPTH {
            handle.publish(info(&format!("clip-{}", i)));
            assert!(reader.recv().await.expect("reader keeps up").contains(&format!("clip-{}", i)));
        }

        assert_eq!(handle.viewer_count().await, Some(1));
        for i in 0..VIEWER_QUEUE_DEPTH {
            assert!(stalled.recv().await.expect("buffered").contains(&format!("clip-{}", i)));
        }
        assert!(stalled.recv().await.is_none());
    }

    #[test]
    fn full_channel_reports_lagging() {
        let (mut tx, _rx) = mpsc::channel::<Arc<str>>(1);
        assert_eq!(tx.deliver("a".into()), Ok(()));
        assert_eq!(tx.deliver("b".into()), Err(DeliveryError::Lagging));
    }

    #[test]
    fn closed_channel_reports_closed() {
        let (mut tx, rx) = mpsc::channel::<Arc<str>>(1);
        drop(rx);
        assert_eq!(tx.deliver("a".into()), Err(DeliveryError::Closed));
    }
}
