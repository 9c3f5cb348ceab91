//! Threaded test endpoint
//!
//! A minimal stand-in for a real endpoint: a fixed pool of worker threads
//! fed through a crossbeam channel. Sockets connected to it route their
//! `process_socket` and `execute` calls to the pool, so async completions,
//! timeouts and error dispatches raised on foreign threads come back to the
//! protocol handler the way they would in production.
//!
//! Events for one socket are serialised by the socket's processing lock.

use crate::socket::MockSocket;
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use portico_core::{ProtocolHandler, SocketEvent, SocketId, SocketState, SocketWrapper, Task};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// Work queued for the pool.
pub(crate) enum Work {
    Event(SocketId, SocketEvent),
    Task(Task),
    Shutdown,
}

pub struct TestEndpoint {
    protocol: Arc<ProtocolHandler>,
    sockets: Arc<DashMap<SocketId, Arc<MockSocket>>>,
    sender: Option<Sender<Work>>,
    workers: Vec<JoinHandle<()>>,
}

impl TestEndpoint {
    pub fn new(protocol: Arc<ProtocolHandler>, workers: usize) -> Self {
        let (sender, receiver) = channel::unbounded::<Work>();
        let sockets = Arc::new(DashMap::new());

        let workers = (0..workers.max(1))
            .filter_map(|n| {
                let receiver = receiver.clone();
                let protocol = protocol.clone();
                let sockets = sockets.clone();
                thread::Builder::new()
                    .name(format!("portico-test-worker-{n}"))
                    .spawn(move || worker_loop(receiver, protocol, sockets))
                    .map_err(|e| warn!(error = %e, "failed to spawn test worker"))
                    .ok()
            })
            .collect();

        Self {
            protocol,
            sockets,
            sender: Some(sender),
            workers,
        }
    }

    pub fn protocol(&self) -> &Arc<ProtocolHandler> {
        &self.protocol
    }

    /// Attach `socket` to the pool and deliver its first read event.
    pub fn connect(&self, socket: MockSocket) -> Arc<MockSocket> {
        let socket = Arc::new(socket);
        if let Some(sender) = &self.sender {
            let _ = socket.endpoint.set(sender.clone());
        }
        self.sockets.insert(socket.id(), socket.clone());
        self.dispatch(socket.id(), SocketEvent::OpenRead);
        socket
    }

    /// Queue `event` for the socket.
    pub fn dispatch(&self, socket: SocketId, event: SocketEvent) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|s| s.send(Work::Event(socket, event)).is_ok())
    }

    pub fn open_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Stop accepting work and wait for the workers to drain the queue.
    pub fn shutdown(&mut self) {
        // Connected sockets keep senders alive, so stop the workers explicitly
        if let Some(sender) = self.sender.take() {
            for _ in 0..self.workers.len() {
                let _ = sender.send(Work::Shutdown);
            }
        }
        self.sockets.clear();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("test worker panicked");
            }
        }
    }
}

impl Drop for TestEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    receiver: Receiver<Work>,
    protocol: Arc<ProtocolHandler>,
    sockets: Arc<DashMap<SocketId, Arc<MockSocket>>>,
) {
    while let Ok(work) = receiver.recv() {
        match work {
            Work::Shutdown => break,
            Work::Task(task) => task(),
            Work::Event(id, event) => {
                let Some(socket) = sockets.get(&id).map(|s| s.value().clone()) else {
                    trace!(socket = %id, ?event, "event for unknown socket dropped");
                    continue;
                };
                let _processing = socket.lock_processing();
                if socket.is_closed() {
                    continue;
                }
                let wrapper: Arc<dyn SocketWrapper> = socket.clone();
                let state = protocol.process(&wrapper, event);
                debug!(socket = %id, ?event, ?state, "test endpoint processed event");
                if state == SocketState::Closed {
                    socket.close();
                    protocol.release_socket(id);
                    sockets.remove(&id);
                }
                socket.record_verdict(state);
            }
        }
    }
}
