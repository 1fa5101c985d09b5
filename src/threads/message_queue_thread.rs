//! Consumer thread dispatching queued messages by id

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

use super::{ConcurrentQueue, ThreadLifecycleResult};
use crate::network::MessageHandler;
use crate::protocol::{Endpoint, ReceivedMessage};

/// Message handler registration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageHandlerError {
    #[error("A handler is already registered for message id {0}")]
    AlreadyRegistered(String),
}

pub type MessageHandlerResult<T> = Result<T, MessageHandlerError>;

/// What happens to queued items when the thread stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnStop {
    /// Drop whatever is still queued
    #[default]
    DropRemaining,
    /// Dispatch the remaining items before returning from `stop`
    ProcessRemaining,
}

type IdDecoder<Id, M> = Box<dyn Fn(&M) -> Id + Send + Sync>;
type Handler<M> = Box<dyn Fn(M) + Send + Sync>;

struct Dispatcher<Id, M> {
    decode_id: IdDecoder<Id, M>,
    handlers: RwLock<HashMap<Id, Handler<M>>>,
}

impl<Id: Eq + Hash + std::fmt::Debug, M> Dispatcher<Id, M> {
    fn dispatch(&self, message: M) {
        let id = (self.decode_id)(&message);
        match self.handlers.read().get(&id) {
            Some(handler) => handler(message),
            None => tracing::debug!("No handler for message id {:?}, dropping", id),
        }
    }
}

/// A thread that pops messages off its own queue and hands each one to the
/// handler registered for its id
pub struct MessageQueueThread<Id, M>
where
    Id: Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
    M: Send + 'static,
{
    queue: Arc<ConcurrentQueue<M>>,
    dispatcher: Arc<Dispatcher<Id, M>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    on_stop: OnStop,
}

impl<Id, M> MessageQueueThread<Id, M>
where
    Id: Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
    M: Send + 'static,
{
    /// Start the consumer thread
    pub fn new<F>(decode_id: F, on_stop: OnStop) -> ThreadLifecycleResult<Self>
    where
        F: Fn(&M) -> Id + Send + Sync + 'static,
    {
        let queue = Arc::new(ConcurrentQueue::new());
        let dispatcher = Arc::new(Dispatcher {
            decode_id: Box::new(decode_id),
            handlers: RwLock::new(HashMap::new()),
        });
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let queue = queue.clone();
            let dispatcher = dispatcher.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name("message-queue".to_string())
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        if let Some(message) = queue.pop() {
                            dispatcher.dispatch(message);
                        }
                    }
                })?
        };

        Ok(Self {
            queue,
            dispatcher,
            running,
            worker: Mutex::new(Some(worker)),
            on_stop,
        })
    }

    /// Register the handler for one message id
    pub fn register_handler<F>(&self, id: Id, handler: F) -> MessageHandlerResult<()>
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        let mut handlers = self.dispatcher.handlers.write();
        if handlers.contains_key(&id) {
            return Err(MessageHandlerError::AlreadyRegistered(format!("{:?}", id)));
        }
        handlers.insert(id, Box::new(handler));
        Ok(())
    }

    pub fn push(&self, message: M) {
        self.queue.push(message);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the thread and apply the on-stop policy to queued items
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        self.running.store(false, Ordering::Release);
        self.queue.break_pop_wait();
        if worker.join().is_err() {
            tracing::error!("Message queue thread panicked");
        }

        match self.on_stop {
            OnStop::ProcessRemaining => {
                while let Some(message) = self.queue.try_pop() {
                    self.dispatcher.dispatch(message);
                }
            }
            OnStop::DropRemaining => self.queue.clear(),
        }
    }
}

impl<Id, M> Drop for MessageQueueThread<Id, M>
where
    Id: Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
    M: Send + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

impl<Id> MessageHandler for MessageQueueThread<Id, ReceivedMessage>
where
    Id: Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
{
    fn on_message(&self, message: ReceivedMessage, _from: &Endpoint) {
        self.push(message);
    }
}
