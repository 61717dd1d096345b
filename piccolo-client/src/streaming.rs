//! The two streaming roles: buffers pulled on request and snapshots pushed by the server.
use std::{
    io::{Read, Write},
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use piccolo_protocol::{Opcode, SampleBuffer, Snapshot, codec::read_json_frame};

use crate::{
    ClientConfig,
    error::ClientError,
    session::{Callback, Latest, Session, SessionState},
};

/// Requests buffers until stopped. A short reply ends the loop without publishing.
pub(crate) fn pull_buffers(
    stream: &mut (impl Read + Write),
    samples_per_channel: usize,
    stop: &AtomicBool,
    mut publish: impl FnMut(SampleBuffer),
) -> Result<(), ClientError> {
    while !stop.load(Ordering::Acquire) {
        Opcode::Acquire.write_to(stream)?;
        match SampleBuffer::from_reader(stream, samples_per_channel)? {
            Some(buffer) => publish(buffer),
            None => {
                log::info!("Buffer stream closed by server");
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Receives snapshots until stopped or the server closes the stream.
pub(crate) fn receive_snapshots(
    stream: &mut impl Read,
    max_payload_len: usize,
    stop: &AtomicBool,
    mut publish: impl FnMut(Snapshot),
) -> Result<(), ClientError> {
    while !stop.load(Ordering::Acquire) {
        match read_json_frame::<Snapshot>(stream, max_payload_len)? {
            Some(snapshot) => publish(snapshot),
            None => {
                log::info!("State stream closed by server");
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Pulls two-channel sample buffers from the buffer-stream service.
pub struct BufferStreamClient {
    session: Session,
    samples_per_channel: usize,
    latest: Latest<SampleBuffer>,
    callback: Option<Callback<SampleBuffer>>,
}

impl BufferStreamClient {
    pub fn new(addr: SocketAddr, config: &ClientConfig) -> BufferStreamClient {
        BufferStreamClient {
            session: Session::new("buffer-stream", addr, config.timeout),
            samples_per_channel: config.samples_per_channel,
            latest: Latest::new(),
            callback: None,
        }
    }

    /// Called with every complete buffer, before it becomes the latest one.
    pub fn on_buffer(&mut self, callback: impl Fn(&SampleBuffer) + Send + Sync + 'static) {
        self.callback = Some(std::sync::Arc::new(callback));
    }

    pub fn start(&mut self) -> Result<(), ClientError> {
        let samples_per_channel = self.samples_per_channel;
        let latest = self.latest.clone();
        let callback = self.callback.clone();
        self.session.start(move |tcp, stop| {
            pull_buffers(tcp, samples_per_channel, stop, |buffer| {
                if let Some(callback) = &callback {
                    callback(&buffer);
                }
                latest.publish(buffer);
            })
        })
    }

    pub fn stop(&mut self) {
        self.session.stop();
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn latest(&self) -> Option<std::sync::Arc<SampleBuffer>> {
        self.latest.get()
    }
}

/// Receives register snapshots pushed by the state-stream service.
pub struct StateStreamClient {
    session: Session,
    max_payload_len: usize,
    latest: Latest<Snapshot>,
    callback: Option<Callback<Snapshot>>,
}

impl StateStreamClient {
    pub fn new(addr: SocketAddr, config: &ClientConfig) -> StateStreamClient {
        StateStreamClient {
            session: Session::new("state-stream", addr, config.timeout),
            max_payload_len: config.max_payload_len,
            latest: Latest::new(),
            callback: None,
        }
    }

    /// Called with every snapshot, before it becomes the latest one.
    pub fn on_snapshot(&mut self, callback: impl Fn(&Snapshot) + Send + Sync + 'static) {
        self.callback = Some(std::sync::Arc::new(callback));
    }

    pub fn start(&mut self) -> Result<(), ClientError> {
        let max_payload_len = self.max_payload_len;
        let latest = self.latest.clone();
        let callback = self.callback.clone();
        self.session.start(move |tcp, stop| {
            receive_snapshots(tcp, max_payload_len, stop, |snapshot| {
                if let Some(callback) = &callback {
                    callback(&snapshot);
                }
                latest.publish(snapshot);
            })
        })
    }

    pub fn stop(&mut self) {
        self.session.stop();
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn latest(&self) -> Option<std::sync::Arc<Snapshot>> {
        self.latest.get()
    }
}
