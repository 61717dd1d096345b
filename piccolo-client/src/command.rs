//! Register writes through the state-set service, and the one-shot control command.
use std::{
    collections::VecDeque,
    io::{self, Write},
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use piccolo_protocol::{Opcode, RegisterValue, SetRequest, codec::write_json_frame};

use crate::{
    ClientConfig,
    error::ClientError,
    session::{Session, SessionState},
};

/// A FIFO of pending register writes, shared between callers and the worker.
#[derive(Clone, Default)]
pub struct CommandQueue {
    pending: Arc<Mutex<VecDeque<SetRequest>>>,
}

impl CommandQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<SetRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, request: SetRequest) {
        self.lock().push_back(request);
    }

    fn push_front(&self, request: SetRequest) {
        self.lock().push_front(request);
    }

    pub fn pop(&self) -> Option<SetRequest> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Counts the bytes accepted by the inner writer.
struct Counted<'a, W> {
    inner: &'a mut W,
    written: usize,
}

impl<W: Write> Write for Counted<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Sends at most one queued request per poll interval until stopped.
///
/// A write that times out before any byte left drops that request and the loop
/// continues. A write cut off mid-frame leaves the stream out of sync: the request is
/// put back at the head of the queue and the loop ends, so a restarted client sends it
/// first on a fresh connection. Any other failure ends the loop as well.
pub(crate) fn drain_commands(
    stream: &mut impl Write,
    queue: &CommandQueue,
    poll_interval: Duration,
    stop: &AtomicBool,
) -> Result<(), ClientError> {
    while !stop.load(Ordering::Acquire) {
        if let Some(request) = queue.pop() {
            let mut counted = Counted {
                inner: &mut *stream,
                written: 0,
            };
            match write_json_frame(&mut counted, &request).map_err(ClientError::from) {
                Ok(()) => log::debug!("Sent: {} = {}", request.name, request.value),
                Err(e) if e.is_timeout() && counted.written == 0 => {
                    log::warn!("Timed out sending {}, dropping it: {}", request.name, e)
                }
                Err(e) => {
                    if counted.written > 0 {
                        log::error!(
                            "Sending {} failed after {} bytes, closing the connection",
                            request.name,
                            counted.written
                        );
                        queue.push_front(request);
                    }
                    return Err(e);
                }
            }
        }
        thread::sleep(poll_interval);
    }
    Ok(())
}

/// Queues register writes and sends them to the state-set service in order.
pub struct CommandClient {
    session: Session,
    poll_interval: Duration,
    queue: CommandQueue,
}

impl CommandClient {
    pub fn new(addr: SocketAddr, config: &ClientConfig) -> CommandClient {
        CommandClient {
            session: Session::new("state-set", addr, config.timeout),
            poll_interval: config.poll_interval,
            queue: CommandQueue::default(),
        }
    }

    /// Appends a write to the queue. May be called from any thread, before or after `start()`.
    pub fn enqueue(&self, name: impl Into<String>, value: impl Into<RegisterValue>) {
        let request = SetRequest::new(name, value);
        log::trace!("Queued: {} = {}", request.name, request.value);
        self.queue.push(request);
    }

    /// Number of writes not yet sent.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn start(&mut self) -> Result<(), ClientError> {
        let queue = self.queue.clone();
        let poll_interval = self.poll_interval;
        self.session
            .start(move |tcp, stop| drain_commands(tcp, &queue, poll_interval, stop))
    }

    pub fn stop(&mut self) {
        self.session.stop();
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }
}

/// Sends the shutdown opcode to the control service once.
pub struct ControlClient {
    session: Session,
}

impl ControlClient {
    pub fn new(addr: SocketAddr, config: &ClientConfig) -> ControlClient {
        ControlClient {
            session: Session::new("control", addr, config.timeout),
        }
    }

    /// Connects and sends the shutdown opcode on the worker; the session closes itself
    /// afterwards.
    pub fn start(&mut self) -> Result<(), ClientError> {
        self.session.start(|tcp, _| {
            log::info!("Sending shutdown command");
            Opcode::Shutdown.write_to(tcp)?;
            tcp.flush()?;
            log::info!("Shutdown command sent");
            Ok(())
        })
    }

    /// Waits until the command was sent.
    pub fn wait(&mut self) {
        self.session.join();
    }

    pub fn stop(&mut self) {
        self.session.stop();
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }
}

#[cfg(test)]
mod test {
    use std::io::{self, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use piccolo_protocol::{SetRequest, codec::read_json_frame};

    use crate::command::{CommandQueue, drain_commands};

    /// Accepts writes and raises the stop flag once `limit` frames were written.
    struct Recorder<'a> {
        sent: Vec<u8>,
        frames: usize,
        limit: usize,
        stop: &'a AtomicBool,
    }

    impl Write for Recorder<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.extend_from_slice(buf);
            self.frames += 1;
            if self.frames >= self.limit {
                self.stop.store(true, Ordering::Release);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Times out on every write.
    struct Stalled;

    impl Write for Stalled {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::TimedOut.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn commands_are_sent_in_fifo_order() {
        let queue = CommandQueue::default();
        queue.push(SetRequest::new("a", 1i64));
        queue.push(SetRequest::new("b", "101"));
        queue.push(SetRequest::new("c", -3i64));

        let stop = AtomicBool::new(false);
        let mut recorder = Recorder {
            sent: Vec::new(),
            frames: 0,
            limit: 3,
            stop: &stop,
        };
        drain_commands(&mut recorder, &queue, Duration::from_millis(1), &stop).unwrap();

        let mut wire = recorder.sent.as_slice();
        let names: Vec<String> = (0..3)
            .map(|_| {
                read_json_frame::<SetRequest>(&mut wire, 1024)
                    .unwrap()
                    .unwrap()
                    .name
            })
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(wire.is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn empty_queue_sends_nothing() {
        let queue = CommandQueue::default();
        let stop = AtomicBool::new(false);
        let mut recorder = Recorder {
            sent: Vec::new(),
            frames: 0,
            limit: 1,
            stop: &stop,
        };
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                stop.store(true, Ordering::Release);
            });
            drain_commands(&mut recorder, &queue, Duration::from_millis(1), &stop).unwrap();
        });
        assert!(recorder.sent.is_empty());
    }

    #[test]
    fn timed_out_write_does_not_end_the_loop() {
        let queue = CommandQueue::default();
        queue.push(SetRequest::new("a", 1i64));
        queue.push(SetRequest::new("b", 2i64));
        let stop = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                while !queue.is_empty() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                stop.store(true, Ordering::Release);
            });
            drain_commands(&mut Stalled, &queue, Duration::from_millis(1), &stop).unwrap();
        });
    }

    #[test]
    fn write_cut_off_mid_frame_ends_the_loop() {
        /// Accepts the first few bytes, then times out.
        struct Partial {
            accepted: usize,
        }
        impl Write for Partial {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.accepted >= 10 {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                let n = buf.len().min(10 - self.accepted);
                self.accepted += n;
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let queue = CommandQueue::default();
        queue.push(SetRequest::new("a", 1i64));
        queue.push(SetRequest::new("b", 2i64));
        let stop = AtomicBool::new(false);
        let mut partial = Partial { accepted: 0 };
        let err = drain_commands(&mut partial, &queue, Duration::from_millis(1), &stop).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(partial.accepted, 10);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().name, "a");
    }

    #[test]
    fn broken_pipe_ends_the_loop() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let queue = CommandQueue::default();
        queue.push(SetRequest::new("a", 1i64));
        let stop = AtomicBool::new(false);
        assert!(drain_commands(&mut Broken, &queue, Duration::from_millis(1), &stop).is_err());
    }
}
