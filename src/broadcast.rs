//! NMEA broadcast server
//!
//! Every connected client gets its own bounded queue; the emit loop only
//! ever pushes onto those queues and never touches a socket directly, so
//! a stalled client can't back-pressure the AHRS update. On overflow the
//! oldest queued sentence is dropped in favor of the newest — a GGA/RMC
//! pair from three ticks ago is worthless once a fresher one exists.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

struct ClientQueue {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
}

impl ClientQueue {
    fn new(capacity: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::with_capacity(capacity)), notify: Notify::new(), capacity }
    }

    fn push(&self, sentence: String) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(sentence);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> String {
        loop {
            if let Some(sentence) = self.queue.lock().pop_front() {
                return sentence;
            }
            self.notify.notified().await;
        }
    }
}

pub struct NmeaBroadcaster {
    clients: Mutex<HashMap<u64, Arc<ClientQueue>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl NmeaBroadcaster {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            queue_capacity,
        })
    }

    /// Enqueue a sentence for every currently connected client. Never
    /// blocks on a slow client — each queue push is O(1) and drops its
    /// own oldest entry on overflow.
    pub fn broadcast(&self, sentence: String) {
        let clients = self.clients.lock();
        for queue in clients.values() {
            queue.push(sentence.clone());
        }
    }

    pub async fn serve(self: Arc<Self>, bind: &str, port: u16) -> Result<()> {
        let listener = TcpListener::bind((bind, port))
            .await
            .with_context(|| format!("binding NMEA broadcast listener on {bind}:{port}"))?;
        tracing::info!(bind, port, "NMEA broadcast server listening");

        loop {
            let (socket, peer) = listener.accept().await?;
            let broadcaster = self.clone();
            tokio::spawn(async move {
                broadcaster.serve_client(socket, peer).await;
            });
        }
    }

    fn register(&self) -> (u64, Arc<ClientQueue>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(ClientQueue::new(self.queue_capacity));
        self.clients.lock().insert(id, queue.clone());
        (id, queue)
    }

    fn unregister(&self, id: u64) {
        self.clients.lock().remove(&id);
    }

    async fn serve_client(self: Arc<Self>, mut socket: TcpStream, peer: SocketAddr) {
        let (id, queue) = self.register();
        tracing::debug!(%peer, "NMEA client connected");
        loop {
            let sentence = queue.pop().await;
            if let Err(err) = socket.write_all(sentence.as_bytes()).await {
                tracing::debug!(%peer, %err, "NMEA client disconnected");
                break;
            }
        }
        self.unregister(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest_not_newest() {
        let queue = ClientQueue::new(2);
        queue.push("a".to_string());
        queue.push("b".to_string());
        queue.push("c".to_string());
        let remaining: Vec<_> = queue.queue.lock().iter().cloned().collect();
        assert_eq!(remaining, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn pop_waits_until_pushed() {
        let queue = Arc::new(ClientQueue::new(4));
        let waiter = queue.clone();
        let handle = tokio::spawn(async move { waiter.pop().await });
        tokio::task::yield_now().await;
        queue.push("hello".to_string());
        let got = handle.await.unwrap();
        assert_eq!(got, "hello");
    }

    #[test]
    fn broadcast_reaches_every_registered_client() {
        let broadcaster = NmeaBroadcaster::new(4);
        let (_id1, q1) = broadcaster.register();
        let (_id2, q2) = broadcaster.register();
        broadcaster.broadcast("$GPGGA,...\r\n".to_string());
        assert_eq!(q1.queue.lock().len(), 1);
        assert_eq!(q2.queue.lock().len(), 1);
    }
}
