//! Delivery threads between a transport and a [`MessageHandler`].
//!
//! The transport's network loop only enqueues payloads; a fixed pool of
//! worker threads pulls them off a bounded queue and calls the handler. With
//! one worker, messages are handled strictly in arrival order. With several,
//! handling is concurrent and the handler must cope (the dispatcher does).

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::dispatch::MessageHandler;

/// Queue slots per worker.
const QUEUE_DEPTH_PER_WORKER: usize = 256;

/// Pool of delivery threads fed through a bounded queue.
pub struct DeliveryPool {
    sender: Sender<Vec<u8>>,
    workers: Vec<JoinHandle<()>>,
}

impl DeliveryPool {
    /// Spawns `workers` delivery threads (at least one) calling `handler`.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned.
    pub fn start<H>(handler: Arc<H>, workers: usize) -> io::Result<Self>
    where
        H: MessageHandler + ?Sized + 'static,
    {
        let workers = workers.max(1);
        let (sender, receiver) = crossbeam_channel::bounded(workers * QUEUE_DEPTH_PER_WORKER);

        let handles = (0..workers)
            .map(|i| {
                let handler = Arc::clone(&handler);
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("delivery-{i}"))
                    .spawn(move || worker_loop(&*handler, &receiver))
            })
            .collect::<io::Result<Vec<_>>>()?;

        tracing::debug!(workers, "delivery pool started");
        Ok(Self {
            sender,
            workers: handles,
        })
    }

    /// Returns a sender feeding the pool's queue.
    ///
    /// The workers exit once every sender, including the pool's own, is gone.
    pub fn sender(&self) -> DeliverySender {
        DeliverySender(self.sender.clone())
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Closes the pool's sender and waits for the workers to drain the queue.
    ///
    /// Blocks until all other [`DeliverySender`]s are dropped too.
    pub fn join(self) {
        drop(self.sender);
        for worker in self.workers {
            if worker.join().is_err() {
                tracing::error!("delivery thread panicked");
            }
        }
    }
}

/// Cloneable handle for enqueueing payloads.
#[derive(Clone)]
pub struct DeliverySender(Sender<Vec<u8>>);

impl DeliverySender {
    /// Enqueues `payload`, blocking while the queue is full.
    ///
    /// Returns false if the pool has shut down.
    pub fn deliver(&self, payload: Vec<u8>) -> bool {
        match self.0.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(payload)) => {
                tracing::debug!("delivery queue full, applying backpressure");
                self.0.send(payload).is_ok()
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

fn worker_loop<H>(handler: &H, receiver: &Receiver<Vec<u8>>)
where
    H: MessageHandler + ?Sized,
{
    // Ends once every sender is dropped and the queue is empty.
    for payload in receiver {
        handler.handle(&payload);
    }
}
