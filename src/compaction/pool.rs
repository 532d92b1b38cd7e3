//! Fixed-size worker pool for split-compaction shards.
//!
//! A handful of threads created up front pull jobs from a shared queue.
//! Shutdown is cooperative: workers drain the queue, then exit when the
//! bailout flag is raised. Jobs report results through whatever channel the
//! submitter baked into the closure.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default number of shard workers.
pub const DEFAULT_WORKERS: usize = 4;

struct PoolShared {
    queue: Mutex<PoolQueue>,
    job_ready: Condvar,
}

struct PoolQueue {
    jobs: VecDeque<Job>,
    bailout: bool,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(thread_count: usize) -> Self {
        let thread_count = thread_count.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                bailout: false,
            }),
            job_ready: Condvar::new(),
        });

        let threads = (0..thread_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("compact-worker-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, threads }
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Queues a job and wakes one worker. Jobs queued before shutdown run to
    /// completion.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.bailout {
            return;
        }
        queue.jobs.push_back(Box::new(job));
        drop(queue);
        self.shared.job_ready.notify_one();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.bailout {
                    return;
                }
                queue = shared.job_ready.wait(queue).unwrap();
            }
        };
        job();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.bailout = true;
        }
        self.shared.job_ready.notify_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}
