use std::{
    f32::consts::TAU,
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use piccolo_protocol::SampleBuffer;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::Acquisition;

/// Deterministic two-channel waveform for running the server without an ADC.
///
/// Channel 1 carries a sine, channel 2 a cosine of the same period. The phase advances
/// with every acquisition so that consecutive buffers differ.
#[derive(Debug, Clone)]
pub struct TestPattern {
    period: usize,
    amplitude: f32,
    phase: usize,
}

impl TestPattern {
    pub fn new(period: usize, amplitude: f32) -> TestPattern {
        TestPattern {
            period: period.max(1),
            amplitude,
            phase: 0,
        }
    }
}

impl Default for TestPattern {
    fn default() -> Self {
        TestPattern::new(512, 0.5)
    }
}

impl Acquisition for TestPattern {
    fn acquire(&mut self, samples_per_channel: usize) -> io::Result<SampleBuffer> {
        let angle = |i: usize| TAU * ((i + self.phase) % self.period) as f32 / self.period as f32;
        let ch1 = (0..samples_per_channel)
            .map(|i| self.amplitude * angle(i).sin())
            .collect();
        let ch2 = (0..samples_per_channel)
            .map(|i| self.amplitude * angle(i).cos())
            .collect();
        self.phase = (self.phase + samples_per_channel / 8 + 1) % self.period;
        SampleBuffer::new(ch1, ch2).map_err(io::Error::other)
    }
}

/// Continuously refreshes the latest buffer on a dedicated thread until `shutdown` fires.
///
/// Readers of the returned channel always see the most recent buffer; the acquisition
/// is not synchronized to their requests. Failed acquisitions are logged and retried.
pub fn spawn_acquisition<A: Acquisition>(
    mut acquisition: A,
    samples_per_channel: usize,
    interval: Duration,
    shutdown: CancellationToken,
) -> io::Result<(watch::Receiver<Arc<SampleBuffer>>, JoinHandle<()>)> {
    let (sender, receiver) = watch::channel(Arc::new(SampleBuffer::zeros(samples_per_channel)));
    let handle = thread::Builder::new()
        .name("acquisition".to_string())
        .spawn(move || {
            log::info!(
                "Acquisition started ({} samples per channel)",
                samples_per_channel
            );
            let mut acquired = 0u64;
            while !shutdown.is_cancelled() {
                match acquisition.acquire(samples_per_channel) {
                    Ok(buffer) => {
                        sender.send_replace(Arc::new(buffer));
                        acquired += 1;
                    }
                    Err(e) => log::error!("Error acquiring signals: {}", e),
                }
                thread::sleep(interval);
            }
            log::info!("Acquisition stopped after {} buffers", acquired);
        })?;
    Ok((receiver, handle))
}
