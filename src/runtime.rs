//! Worker pool of independent event loops.
//!
//! Each worker is a single-threaded tokio runtime on its own OS thread, the
//! direct analogue of one event loop per core. Connections are pinned to
//! the loop they are spawned on; the pool only hands out [`Handle`]s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

struct Worker {
    handle: Handle,
    stop: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn spawn(name: String) -> Result<Worker> {
        let (tx, rx) = std::sync::mpsc::channel();
        let stop = CancellationToken::new();
        let stop_inside = stop.clone();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                if tx.send(Ok(rt.handle().clone())).is_err() {
                    return;
                }
                // Drives every task spawned onto this loop until stop.
                rt.block_on(stop_inside.cancelled());
            })
            .map_err(|e| Error::Io(e))?;
        let handle = rx
            .recv()
            .map_err(|_| Error::Handler("worker thread died during startup".into()))?
            .map_err(Error::Io)?;
        Ok(Worker {
            handle,
            stop,
            thread: Some(thread),
        })
    }

    fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[derive(Default)]
struct State {
    pool: Vec<Worker>,
    isolated: HashMap<String, Worker>,
    running: bool,
}

/// A pool of independent single-threaded event loops.
///
/// `next_handle` assigns work round-robin across the pool;
/// `isolated_handle` returns a dedicated loop by name, distinct from the
/// pool. Dropping the pool stops every loop.
pub struct Workers {
    size: usize,
    state: Mutex<State>,
    stopped: Condvar,
    next: AtomicUsize,
}

impl Workers {
    /// A pool sized to the hardware concurrency.
    pub fn new() -> Self {
        let size = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::with_size(size)
    }

    /// A pool with exactly `size` loops.
    pub fn with_size(size: usize) -> Self {
        Workers {
            size: size.max(1),
            state: Mutex::new(State::default()),
            stopped: Condvar::new(),
            next: AtomicUsize::new(0),
        }
    }

    /// Number of loops in the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Starts the pool threads. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return Ok(());
        }
        for i in 0..self.size {
            state.pool.push(Worker::spawn(format!("worker-{i}"))?);
        }
        state.running = true;
        debug!(size = self.size, "worker pool started");
        Ok(())
    }

    pub fn running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Round-robin handle onto the pool, starting it on first use.
    pub fn next_handle(&self) -> Result<Handle> {
        self.start()?;
        let state = self.state.lock().unwrap();
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % state.pool.len();
        Ok(state.pool[idx].handle.clone())
    }

    /// Handle to a dedicated loop identified by `name`, created on first
    /// use and never part of the round-robin rotation.
    pub fn isolated_handle(&self, name: &str) -> Result<Handle> {
        let mut state = self.state.lock().unwrap();
        if let Some(worker) = state.isolated.get(name) {
            return Ok(worker.handle.clone());
        }
        let worker = Worker::spawn(format!("isolated-{name}"))?;
        let handle = worker.handle.clone();
        state.isolated.insert(name.to_string(), worker);
        Ok(handle)
    }

    /// Stops every loop and joins the pool threads.
    pub fn stop(&self) {
        let (mut pool, isolated) = {
            let mut state = self.state.lock().unwrap();
            if !state.running && state.isolated.is_empty() {
                return;
            }
            state.running = false;
            (
                std::mem::take(&mut state.pool),
                std::mem::take(&mut state.isolated),
            )
        };
        for worker in pool.iter_mut() {
            worker.shutdown();
        }
        for (_, mut worker) in isolated {
            worker.shutdown();
        }
        self.stopped.notify_all();
        debug!("worker pool stopped");
    }

    /// Blocks the calling thread until [`stop`](Workers::stop) runs.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while state.running {
            state = self.stopped.wait(state).unwrap();
        }
    }
}

impl Default for Workers {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SharedRegistry {
    workers: Option<Arc<Workers>>,
    clients: usize,
}

fn registry() -> &'static Mutex<SharedRegistry> {
    static SHARED: OnceLock<Mutex<SharedRegistry>> = OnceLock::new();
    SHARED.get_or_init(|| {
        Mutex::new(SharedRegistry {
            workers: None,
            clients: 0,
        })
    })
}

/// The process-wide shared pool, created (but not started) on first use.
/// Async clients register with it automatically; applications that need
/// isolation construct private [`Workers`] instead.
pub fn shared_workers() -> Arc<Workers> {
    let mut reg = registry().lock().unwrap();
    reg.workers
        .get_or_insert_with(|| Arc::new(Workers::new()))
        .clone()
}

/// Registers an async client: starts the shared pool when it is the first.
pub(crate) fn register_client() -> Result<Arc<Workers>> {
    let mut reg = registry().lock().unwrap();
    let workers = reg
        .workers
        .get_or_insert_with(|| Arc::new(Workers::new()))
        .clone();
    workers.start()?;
    reg.clients += 1;
    Ok(workers)
}

/// Deregisters an async client: stops the shared pool when it was the last.
pub(crate) fn deregister_client() {
    let mut reg = registry().lock().unwrap();
    if reg.clients == 0 {
        return;
    }
    reg.clients -= 1;
    if reg.clients == 0 {
        if let Some(workers) = reg.workers.take() {
            workers.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn round_robin_cycles_distinct_loops() {
        let workers = Workers::with_size(3);
        let mut ids = HashSet::new();
        for _ in 0..3 {
            let handle = workers.next_handle().unwrap();
            let (tx, rx) = std::sync::mpsc::channel();
            handle.spawn(async move {
                let _ = tx.send(std::thread::current().id());
            });
            ids.insert(rx.recv().unwrap());
        }
        assert_eq!(ids.len(), 3);
        workers.stop();
        assert!(!workers.running());
    }

    #[test]
    fn isolated_loops_are_stable_and_distinct() {
        let workers = Workers::with_size(2);
        workers.start().unwrap();
        let a1 = workers.isolated_handle("metrics").unwrap();
        let a2 = workers.isolated_handle("metrics").unwrap();
        let b = workers.isolated_handle("other").unwrap();

        let thread_of = |handle: &Handle| {
            let (tx, rx) = std::sync::mpsc::channel();
            handle.spawn(async move {
                let _ = tx.send(std::thread::current().id());
            });
            rx.recv().unwrap()
        };
        let ta1 = thread_of(&a1);
        let ta2 = thread_of(&a2);
        let tb = thread_of(&b);
        assert_eq!(ta1, ta2);
        assert_ne!(ta1, tb);
        workers.stop();
    }

    #[test]
    fn wait_returns_after_stop() {
        let workers = Arc::new(Workers::with_size(1));
        workers.start().unwrap();
        let waiter = {
            let workers = workers.clone();
            std::thread::spawn(move || workers.wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        workers.stop();
        waiter.join().unwrap();
    }
}
