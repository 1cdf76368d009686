//! The single worker thread that owns all GPU state.
//!
//! Tasks run strictly in submission order against the worker-owned state.
//! Once [`ExecutorHandle::quit`] has been called no further task runs: new
//! submissions are rejected on the caller's thread and anything still queued
//! is rejected as the queue is torn down.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, trace};

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;
type Rejection = Box<dyn FnOnce() + Send>;

/// A queued task. Dropping it without running calls its rejection hook.
struct Job<S> {
    task: Option<Task<S>>,
    on_rejected: Option<Rejection>,
}

impl<S> Job<S> {
    fn run(mut self, state: &mut S) {
        self.on_rejected = None;
        if let Some(task) = self.task.take() {
            task(state);
        }
    }
}

impl<S> Drop for Job<S> {
    fn drop(&mut self) {
        if self.task.take().is_some() {
            if let Some(on_rejected) = self.on_rejected.take() {
                on_rejected();
            }
        }
    }
}

enum Message<S> {
    Run(Job<S>),
    Quit,
}

/// Cloneable submission side of a [`RenderThreadExecutor`].
pub struct ExecutorHandle<S> {
    sender: Sender<Message<S>>,
    terminated: Arc<AtomicBool>,
    worker: ThreadId,
}

impl<S> Clone for ExecutorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            terminated: Arc::clone(&self.terminated),
            worker: self.worker,
        }
    }
}

impl<S: 'static> ExecutorHandle<S> {
    /// Queues `task`, or runs `on_rejected` right away on this thread if the
    /// executor has quit. A task still queued when the worker stops gets its
    /// `on_rejected` run instead.
    pub fn execute(
        &self,
        task: impl FnOnce(&mut S) + Send + 'static,
        on_rejected: impl FnOnce() + Send + 'static,
    ) {
        let job = Job {
            task: Some(Box::new(task)),
            on_rejected: Some(Box::new(on_rejected)),
        };
        if self.terminated.load(Ordering::Acquire) {
            drop(job);
            return;
        }
        // A disconnected queue hands the job back; dropping it rejects.
        if let Err(returned) = self.sender.send(Message::Run(job)) {
            drop(returned);
        }
    }

    /// Queues `task` with no rejection hook.
    pub fn post(&self, task: impl FnOnce(&mut S) + Send + 'static) {
        self.execute(task, || {});
    }

    /// Stops the message loop after the running task. Idempotent.
    pub fn quit(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            debug!("render thread quitting");
            let _ = self.sender.send(Message::Quit);
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Whether the calling thread is the worker.
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker
    }
}

/// Owner of the worker thread.
pub struct RenderThreadExecutor<S> {
    handle: ExecutorHandle<S>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: 'static> RenderThreadExecutor<S> {
    /// Starts the worker. `init` runs first on the worker thread and builds
    /// the state every task receives.
    pub fn spawn<F>(name: &str, init: F) -> io::Result<Self>
    where
        F: FnOnce(ExecutorHandle<S>) -> S + Send + 'static,
    {
        let (sender, receiver) = unbounded();
        let terminated = Arc::new(AtomicBool::new(false));
        let (id_tx, id_rx) = crossbeam_channel::bounded(1);

        let worker_sender = sender.clone();
        let worker_terminated = Arc::clone(&terminated);
        let join_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let worker = thread::current().id();
                let _ = id_tx.send(worker);
                let handle = ExecutorHandle {
                    sender: worker_sender,
                    terminated: worker_terminated,
                    worker,
                };
                run_worker(receiver, handle, init);
            })?;
        let worker = id_rx
            .recv()
            .map_err(|_| io::Error::other("render thread exited during start-up"))?;

        Ok(Self {
            handle: ExecutorHandle {
                sender,
                terminated,
                worker,
            },
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    pub fn handle(&self) -> ExecutorHandle<S> {
        self.handle.clone()
    }

    pub fn execute(
        &self,
        task: impl FnOnce(&mut S) + Send + 'static,
        on_rejected: impl FnOnce() + Send + 'static,
    ) {
        self.handle.execute(task, on_rejected);
    }

    pub fn quit(&self) {
        self.handle.quit();
    }

    pub fn is_terminated(&self) -> bool {
        self.handle.is_terminated()
    }

    /// Waits for the worker to exit. Returns immediately when called on the
    /// worker itself or when already joined.
    pub fn join(&self) {
        if self.handle.is_worker_thread() {
            return;
        }
        let join_handle = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join_handle) = join_handle {
            if join_handle.join().is_err() {
                tracing::error!("render thread panicked");
            }
        }
    }
}

impl<S> Drop for RenderThreadExecutor<S> {
    fn drop(&mut self) {
        if !self.handle.terminated.swap(true, Ordering::AcqRel) {
            let _ = self.handle.sender.send(Message::Quit);
        }
        if thread::current().id() == self.handle.worker {
            return;
        }
        let join_handle = self
            .join_handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join_handle) = join_handle {
            let _ = join_handle.join();
        }
    }
}

fn run_worker<S, F>(receiver: Receiver<Message<S>>, handle: ExecutorHandle<S>, init: F)
where
    F: FnOnce(ExecutorHandle<S>) -> S,
{
    let terminated = Arc::clone(&handle.terminated);
    let mut state = init(handle);
    trace!("render thread started");
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run(job) => job.run(&mut state),
            Message::Quit => break,
        }
        if terminated.load(Ordering::Acquire) {
            break;
        }
    }
    // Reject whatever was queued behind the quit.
    for message in receiver.try_iter() {
        drop(message);
    }
    drop(receiver);
    drop(state);
    trace!("render thread stopped");
}
