//! The blocking reader thread and the bounded frame queue it feeds.
//!
//! Serial I/O blocks, so it lives on a dedicated OS thread; the queue is
//! the only structure shared across the thread boundary. All decoding and
//! state mutation happens on the executor side.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use enbridge::esp3::{Esp3Framer, Esp3Packet};
use log::{debug, error, info};
use tokio::sync::Notify;

use crate::transport::{SharedWriter, Transport};

pub const QUEUE_CAPACITY: usize = 1024;

const RECONNECT_DELAY_MIN: std::time::Duration = std::time::Duration::from_millis(100);
const RECONNECT_DELAY_MAX: std::time::Duration = std::time::Duration::from_secs(5);

/// Bounded FIFO between the reader thread and the dispatcher. The radio
/// cannot be backpressured, so on overflow the oldest pending frame is
/// dropped and counted.
pub struct FrameQueue {
    frames: Mutex<VecDeque<Esp3Packet>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        FrameQueue {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, packet: Esp3Packet) {
        {
            let mut frames = self.frames.lock().expect("frame queue lock poisoned");
            if frames.len() == self.capacity {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            frames.push_back(packet);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Esp3Packet> {
        self.frames
            .lock()
            .expect("frame queue lock poisoned")
            .pop_front()
    }

    pub async fn pop(&self) -> Esp3Packet {
        loop {
            if let Some(packet) = self.try_pop() {
                return packet;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.frames.lock().expect("frame queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames dropped because the dispatcher fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct ReaderHandle {
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ReaderHandle {
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Signals the thread to stop and joins it. The blocking read returns
    /// within its 1 second timeout, so this completes promptly.
    pub fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        if self.handle.join().is_err() {
            error!("reader thread panicked");
        }
    }
}

/// Spawns the OS thread that reads raw bytes, frames them and hands
/// validated packets to the executor through the queue. On a transport
/// error the thread drops the connection and reopens it with exponential
/// backoff, swapping the shared write handle so outbound frames follow.
pub fn spawn_reader(
    port_spec: String,
    mut transport: Transport,
    writer: SharedWriter,
    queue: Arc<FrameQueue>,
) -> ReaderHandle {
    let running = Arc::new(AtomicBool::new(true));
    let connected = Arc::new(AtomicBool::new(true));
    let thread_running = running.clone();
    let thread_connected = connected.clone();

    let handle = std::thread::Builder::new()
        .name("enocean-reader".to_string())
        .spawn(move || {
            let mut framer = Esp3Framer::new();
            let mut buf = [0u8; 4096];
            info!("transceiver reader running, waiting for telegrams");

            while thread_running.load(Ordering::Relaxed) {
                match transport.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        debug!("transceiver RX {n} bytes ({} buffered)", framer.buffered());
                        framer.push(&buf[..n]);
                        while let Some(packet) = framer.next_packet() {
                            queue.push(packet);
                        }
                    }
                    Err(e) => {
                        error!("transceiver read failed: {e}");
                        thread_connected.store(false, Ordering::Relaxed);
                        framer = Esp3Framer::new();
                        match reconnect(&port_spec, &thread_running, &writer) {
                            Some(reopened) => {
                                transport = reopened;
                                thread_connected.store(true, Ordering::Relaxed);
                            }
                            None => break,
                        }
                    }
                }
            }
            info!("transceiver reader stopped");
        })
        .expect("failed to spawn reader thread");

    ReaderHandle {
        running,
        connected,
        handle,
    }
}

/// Reopens the transport with exponential backoff until it succeeds or the
/// reader is asked to stop.
fn reconnect(port_spec: &str, running: &AtomicBool, writer: &SharedWriter) -> Option<Transport> {
    let mut delay = RECONNECT_DELAY_MIN;
    let mut attempts = 0u32;

    while running.load(Ordering::Relaxed) {
        std::thread::sleep(delay);
        attempts += 1;

        match Transport::open(port_spec).and_then(|transport| {
            let new_writer = transport.writer()?;
            Ok((transport, new_writer))
        }) {
            Ok((transport, new_writer)) => {
                info!("transceiver reconnected after {attempts} attempts");
                *writer.lock().expect("transport writer lock poisoned") = new_writer;
                return Some(transport);
            }
            Err(e) => {
                debug!("transceiver reconnect attempt {attempts} failed: {e}");
                delay = (delay * 2).min(RECONNECT_DELAY_MAX);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use enbridge::esp3::PacketType;

    fn packet(seq: u8) -> Esp3Packet {
        Esp3Packet::new(PacketType::RadioErp1, vec![seq; 6], vec![])
    }

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new(4);
        queue.push(packet(1));
        queue.push(packet(2));
        assert_eq!(queue.try_pop(), Some(packet(1)));
        assert_eq!(queue.try_pop(), Some(packet(2)));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts() {
        let queue = FrameQueue::new(3);
        for seq in 1..=5 {
            queue.push(packet(seq));
        }
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(packet(3)));
        assert_eq!(queue.try_pop(), Some(packet(4)));
        assert_eq!(queue.try_pop(), Some(packet(5)));
    }

    #[tokio::test]
    async fn test_async_pop_sees_pushed_frame() {
        let queue = Arc::new(FrameQueue::new(4));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        queue.push(packet(7));
        assert_eq!(popper.await.unwrap(), packet(7));
    }
}
