//! Round-robin pool of executor threads for body rewriting.
//!
//! Each task goes to executor `i mod n` where `i` is its submission index.
//! There is no load balancing and no retry: a task gets exactly one reply,
//! or a `TaskError` if its executor crashed or went away.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use tokio::sync::oneshot;

use crate::error::TaskError;
use crate::transform::Transformer;

/// Task input. `Shared` is copied once into a reference-counted region and
/// handed to the executor by reference; `Owned` moves the caller's buffer.
#[derive(Debug, Clone)]
pub enum Payload {
    Shared(Arc<[u8]>),
    Owned(Vec<u8>),
}

impl Payload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Shared(b) => &b[..],
            Payload::Owned(b) => b.as_slice(),
        }
    }
}

#[derive(Debug)]
pub struct RewriteTask {
    pub id: u64,
    pub payload: Payload,
}

#[derive(Debug)]
pub struct TaskReply {
    pub task_id: u64,
    pub executor: usize,
    pub output: Vec<u8>,
}

struct Job {
    task: RewriteTask,
    reply: oneshot::Sender<TaskReply>,
}

struct Executor {
    tx: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

/// `max(2, available_parallelism - 1)`.
pub fn default_pool_size() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.saturating_sub(1).max(2)
}

pub struct Scheduler {
    executors: Vec<Executor>,
    next: AtomicUsize,
    next_id: AtomicU64,
    shared_memory: bool,
}

impl Scheduler {
    pub fn start(size: usize, transformer: Arc<dyn Transformer>, shared_memory: bool) -> Self {
        let executors = (0..size)
            .map(|idx| spawn_executor(idx, transformer.clone()))
            .collect();
        crate::logging::info_kv(
            "executor pool started",
            &[
                ("size", &size.to_string()),
                ("shared_memory", if shared_memory { "true" } else { "false" }),
            ],
        );
        Self {
            executors,
            next: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            shared_memory,
        }
    }

    pub fn size(&self) -> usize {
        self.executors.len()
    }

    pub async fn submit(&self, buffer: Vec<u8>) -> Result<Vec<u8>, TaskError> {
        Ok(self.dispatch(buffer).await?.output)
    }

    /// Like [`submit`](Self::submit) but returns which executor ran the task.
    pub async fn dispatch(&self, buffer: Vec<u8>) -> Result<TaskReply, TaskError> {
        let n = self.executors.len();
        if n == 0 {
            return Err(TaskError::EmptyPool);
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % n;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = if self.shared_memory {
            Payload::Shared(Arc::from(buffer))
        } else {
            Payload::Owned(buffer)
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            task: RewriteTask { id, payload },
            reply: reply_tx,
        };
        let tx = self.executors[idx]
            .tx
            .as_ref()
            .ok_or(TaskError::ExecutorGone(idx))?;
        tx.send(job).map_err(|_| TaskError::ExecutorGone(idx))?;
        reply_rx.await.map_err(|_| TaskError::Crashed(id))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for ex in &mut self.executors {
            ex.tx.take();
        }
        for ex in &mut self.executors {
            if let Some(h) = ex.handle.take() {
                let _ = h.join();
            }
        }
    }
}

fn spawn_executor(idx: usize, transformer: Arc<dyn Transformer>) -> Executor {
    let (tx, rx) = mpsc::channel::<Job>();
    let handle = std::thread::Builder::new()
        .name(format!("ign-executor-{idx}"))
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                let Job { task, reply } = job;
                let out = catch_unwind(AssertUnwindSafe(|| {
                    transformer.transform(task.payload.as_slice())
                }));
                match out {
                    Ok(output) => {
                        // Caller may have dropped its future; nothing to do then.
                        let _ = reply.send(TaskReply {
                            task_id: task.id,
                            executor: idx,
                            output,
                        });
                    }
                    Err(_) => {
                        crate::logging::error(format!(
                            "executor {idx} task {} panicked; reply dropped",
                            task.id
                        ));
                    }
                }
            }
        });
    match handle {
        Ok(handle) => Executor {
            tx: Some(tx),
            handle: Some(handle),
        },
        Err(e) => {
            crate::logging::error(format!("spawn executor {idx}: {e}"));
            Executor {
                tx: None,
                handle: None,
            }
        }
    }
}
