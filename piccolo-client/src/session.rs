//! Connection and worker lifecycle shared by all client roles.
use std::{
    fmt::Display,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::error::ClientError;

/// Lifecycle of a client session.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Created, never connected.
    NotStarted,
    /// Connected, the worker is running.
    Running,
    /// `stop()` was requested and the worker is being joined.
    Stopping,
    /// The worker has exited and the socket is released.
    Closed,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::NotStarted => write!(f, "not started"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Invoked on the worker thread with every value a streaming client receives.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// The most recent value published by a worker.
pub struct Latest<T> {
    slot: Arc<Mutex<Option<Arc<T>>>>,
}

impl<T> Latest<T> {
    pub fn new() -> Latest<T> {
        Latest {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn get(&self) -> Option<Arc<T>> {
        lock(&self.slot).clone()
    }

    pub fn publish(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        *lock(&self.slot) = Some(value.clone());
        value
    }
}

impl<T> Default for Latest<T> {
    fn default() -> Self {
        Latest::new()
    }
}

impl<T> Clone for Latest<T> {
    fn clone(&self) -> Self {
        Latest {
            slot: self.slot.clone(),
        }
    }
}

/// Opens a connection with `timeout` applied to connecting, reading and writing.
pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, ClientError> {
    let tcp = TcpStream::connect_timeout(&addr, timeout)?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

/// One persistent connection plus the background worker serving it.
///
/// The socket is owned by the worker and closed when the worker returns, on every
/// exit path. [`Session::stop`] shuts the socket down through a clone so that a
/// worker blocked in a read returns immediately.
pub struct Session {
    name: &'static str,
    addr: SocketAddr,
    timeout: Duration,
    state: Arc<Mutex<SessionState>>,
    stop: Arc<AtomicBool>,
    socket: Option<TcpStream>,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(name: &'static str, addr: SocketAddr, timeout: Duration) -> Session {
        Session {
            name,
            addr,
            timeout,
            state: Arc::new(Mutex::new(SessionState::NotStarted)),
            stop: Arc::new(AtomicBool::new(false)),
            socket: None,
            worker: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Connects and runs `work` on a new worker thread.
    ///
    /// A closed session may be started again; a running one may not.
    pub fn start<F>(&mut self, work: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut TcpStream, &AtomicBool) -> Result<(), ClientError> + Send + 'static,
    {
        if matches!(self.state(), SessionState::Running | SessionState::Stopping) {
            return Err(ClientError::AlreadyRunning(self.name));
        }
        // Reap a worker that ended on its own.
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        let mut tcp = connect(self.addr, self.timeout)?;
        let shutdown_handle = tcp.try_clone()?;
        log::info!("[{}] Connected to {}", self.name, self.addr);

        self.stop.store(false, Ordering::Release);
        *lock(&self.state) = SessionState::Running;

        let name = self.name;
        let state = self.state.clone();
        let stop = self.stop.clone();
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                match work(&mut tcp, &*stop) {
                    Ok(()) => log::info!("[{}] Worker finished", name),
                    Err(e) if stop.load(Ordering::Acquire) => {
                        log::debug!("[{}] Worker interrupted by stop: {}", name, e)
                    }
                    Err(e) => log::error!("[{}] Error during run: {}", name, e),
                }
                drop(tcp);
                *lock(&state) = SessionState::Closed;
                log::info!("[{}] Socket closed", name);
            });
        match spawned {
            Ok(worker) => {
                self.socket = Some(shutdown_handle);
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                *lock(&self.state) = SessionState::Closed;
                Err(e.into())
            }
        }
    }

    /// Signals the worker, unblocks its socket and waits for it to exit.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Running {
                *state = SessionState::Stopping;
            }
        }
        self.stop.store(true, Ordering::Release);
        if let Some(socket) = self.socket.take() {
            // Fails with NotConnected if the worker already closed its end.
            let _ = socket.shutdown(Shutdown::Both);
        }
        if worker.join().is_err() {
            log::error!("[{}] Worker panicked", self.name);
        }
        *lock(&self.state) = SessionState::Closed;
    }

    /// Waits for a worker that ends on its own, such as a one-shot command.
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("[{}] Worker panicked", self.name);
            }
            self.socket = None;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
