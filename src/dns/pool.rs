//! bounded worker pool shared by the UDP and TCP listeners
//!
//! Requests are queued behind a fixed set of worker threads. The queue is
//! bounded; when it is full, `execute` runs the task on the calling thread,
//! so an overloaded proxy slows its accept loops down instead of silently
//! dropping queries.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{Builder, JoinHandle};

const MIN_WORKERS: usize = 4;
const MAX_WORKERS: usize = 100;
const QUEUE_CAPACITY: usize = 1000;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    shutdown: bool,
}

pub struct WorkerPool {
    state: Arc<(Mutex<PoolState>, Condvar)>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

fn lock_state(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WorkerPool {
    pub fn new() -> io::Result<WorkerPool> {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get() * 4)
            .unwrap_or(MIN_WORKERS)
            .clamp(MIN_WORKERS, MAX_WORKERS);

        WorkerPool::with_workers(workers, QUEUE_CAPACITY)
    }

    pub fn with_workers(workers: usize, queue_capacity: usize) -> io::Result<WorkerPool> {
        let state = Arc::new((
            Mutex::new(PoolState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let state = state.clone();
            let name = format!("dns-worker-{}", worker_id);

            let handle = Builder::new().name(name).spawn(move || {
                let (lock, cvar) = &*state;
                loop {
                    let job = {
                        let mut guard = lock_state(lock);
                        loop {
                            if let Some(job) = guard.queue.pop_front() {
                                break job;
                            }
                            if guard.shutdown {
                                return;
                            }
                            guard = cvar
                                .wait(guard)
                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                        }
                    };

                    job();
                }
            })?;

            handles.push(handle);
        }

        Ok(WorkerPool {
            state,
            workers: Mutex::new(handles),
            capacity: queue_capacity,
        })
    }

    /// Queue a task, or run it inline when the backlog is full.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);

        let overflow = {
            let (lock, cvar) = &*self.state;
            let mut guard = lock_state(lock);

            if guard.shutdown {
                log::debug!("Worker pool is shut down, dropping task");
                return;
            }

            if guard.queue.len() >= self.capacity {
                Some(job)
            } else {
                guard.queue.push_back(job);
                cvar.notify_one();
                None
            }
        };

        // Caller-runs backpressure: the lock is released before the task runs
        if let Some(job) = overflow {
            log::debug!("Worker queue full, running task on caller thread");
            job();
        }
    }

    /// Stop accepting work, finish the backlog and join all workers.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        {
            let (lock, cvar) = &*self.state;
            let mut guard = lock_state(lock);
            guard.shutdown = true;
            cvar.notify_all();
        }

        let handles = {
            let mut workers = self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *workers)
        };

        for handle in handles {
            let _ = handle.join();
        }
    }
}
