use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use piccolo_protocol::{RegisterValue, SampleBuffer, Snapshot};

use crate::{
    ClientConfig,
    calibration::{Calibration, Quantity},
    command::{CommandClient, ControlClient},
    error::ClientError,
    history::{History, Row},
    session::SessionState,
    streaming::{BufferStreamClient, StateStreamClient},
};

fn lock(history: &Mutex<History>) -> MutexGuard<'_, History> {
    history.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Converts the integer registers of `snapshot` to physical units.
///
/// Returns `None` if the snapshot carries no usable event id. Bitfields are skipped;
/// registers without a known quantity, or of a channel without calibration, are kept raw.
pub fn physical_row(calibration: &Calibration, snapshot: &Snapshot, event_id_register: &str) -> Option<Row> {
    let event_id = snapshot
        .get(event_id_register)?
        .as_int()
        .and_then(|id| u64::try_from(id).ok())?;
    let values = snapshot
        .iter()
        .filter_map(|(name, value)| {
            let raw = value.as_int()? as f64;
            let value = match Quantity::of_register(name) {
                Some((quantity, channel)) => calibration
                    .to_physical(quantity, channel, raw)
                    .unwrap_or(raw),
                None => raw,
            };
            Some((name.clone(), value))
        })
        .collect();
    Some(Row { event_id, values })
}

/// One Piccolo instrument: the streaming and command clients of one device, unit
/// conversion and a history of recent events.
///
/// ```ignore
/// use piccolo_client::{ClientConfig, calibration::Calibration, instrument::Instrument};
///
/// let calibration = Calibration::from_file("calibration.json")?;
/// let mut instrument = Instrument::new("192.168.1.100".parse()?, calibration, ClientConfig::default());
/// instrument.start()?;
/// instrument.set_register("low_intensity_thresh[0]", 1234i64);
/// instrument.set_gate_limits(&["low_intensity_thresh[0]", "high_intensity_thresh[0]"], &[0.1, 0.8])?;
/// println!("{} events", instrument.history().len());
/// instrument.stop();
/// ```
pub struct Instrument {
    ip: IpAddr,
    config: ClientConfig,
    calibration: Arc<Calibration>,
    buffers: BufferStreamClient,
    states: StateStreamClient,
    commands: CommandClient,
    history: Arc<Mutex<History>>,
}

impl Instrument {
    pub fn new(ip: IpAddr, calibration: Calibration, config: ClientConfig) -> Instrument {
        let calibration = Arc::new(calibration);
        let history = Arc::new(Mutex::new(History::new(config.history_capacity)));

        let mut states = StateStreamClient::new(SocketAddr::new(ip, config.ports.state_stream), &config);
        {
            let calibration = calibration.clone();
            let history = history.clone();
            let event_id_register = config.event_id_register.clone();
            states.on_snapshot(move |snapshot| {
                if let Some(row) = physical_row(&calibration, snapshot, &event_id_register) {
                    let event_id = row.event_id;
                    if lock(&history).record(row) {
                        log::trace!("Recorded event {}", event_id);
                    }
                }
            });
        }

        Instrument {
            ip,
            buffers: BufferStreamClient::new(SocketAddr::new(ip, config.ports.buffer_stream), &config),
            commands: CommandClient::new(SocketAddr::new(ip, config.ports.state_set), &config),
            states,
            calibration,
            history,
            config,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Starts all clients. If one fails to start, the ones already started are stopped again.
    pub fn start(&mut self) -> Result<(), ClientError> {
        log::info!("Starting instrument at {}", self.ip);
        self.commands.start()?;
        if let Err(e) = self.states.start() {
            self.commands.stop();
            return Err(e);
        }
        if let Err(e) = self.buffers.start() {
            self.states.stop();
            self.commands.stop();
            return Err(e);
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        log::info!("Stopping instrument at {}", self.ip);
        self.buffers.stop();
        self.states.stop();
        self.commands.stop();
    }

    /// Whether all clients are connected and running.
    pub fn is_running(&self) -> bool {
        [
            self.buffers.state(),
            self.states.state(),
            self.commands.state(),
        ]
        .iter()
        .all(|state| *state == SessionState::Running)
    }

    /// Queues a register write.
    pub fn set_register(&self, name: impl Into<String>, value: impl Into<RegisterValue>) {
        self.commands.enqueue(name, value);
    }

    /// Sets threshold registers from limits in physical units.
    ///
    /// The quantity and channel of each limit follow from its register name. All limits
    /// are converted before anything is queued, so an invalid key queues nothing.
    pub fn set_gate_limits(&self, keys: &[impl AsRef<str>], limits: &[f64]) -> Result<(), ClientError> {
        if keys.len() != limits.len() {
            return Err(ClientError::LimitCountMismatch {
                keys: keys.len(),
                limits: limits.len(),
            });
        }
        let raw: Vec<(&str, i64)> = keys
            .iter()
            .zip(limits)
            .map(|(key, limit)| {
                let key = key.as_ref();
                let (quantity, channel) = Quantity::of_register(key)
                    .ok_or_else(|| ClientError::UnknownQuantity(key.to_string()))?;
                Ok((key, self.calibration.to_raw(quantity, channel, *limit)?))
            })
            .collect::<Result<_, ClientError>>()?;
        for (key, value) in raw {
            log::debug!("Gate limit {} = {}", key, value);
            self.set_register(key, value);
        }
        Ok(())
    }

    /// Register writes queued but not yet sent.
    pub fn pending_commands(&self) -> usize {
        self.commands.pending()
    }

    pub fn latest_buffer(&self) -> Option<Arc<SampleBuffer>> {
        self.buffers.latest()
    }

    /// The most recent raw register snapshot.
    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.states.latest()
    }

    /// Read access to the event history. Holding the returned guard blocks recording.
    pub fn history(&self) -> impl Deref<Target = History> + '_ {
        lock(&self.history)
    }

    pub fn set_history_capacity(&self, capacity: usize) {
        lock(&self.history).resize(capacity);
    }

    /// Latest value of every register in physical units, keyed by name.
    pub fn latest_physical(&self) -> Option<BTreeMap<String, f64>> {
        let snapshot = self.latest_snapshot()?;
        physical_row(&self.calibration, &snapshot, &self.config.event_id_register).map(|row| row.values)
    }

    /// Asks the server to terminate, then stops all clients.
    pub fn shutdown_server(&mut self) -> Result<(), ClientError> {
        let mut control = ControlClient::new(SocketAddr::new(self.ip, self.config.ports.control), &self.config);
        control.start()?;
        control.wait();
        self.stop();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};

    use piccolo_protocol::{RegisterValue, Snapshot};

    use crate::ClientConfig;
    use crate::calibration::{Calibration, ChannelCalibration};
    use crate::error::ClientError;
    use crate::instrument::{Instrument, physical_row};

    fn calibration() -> Calibration {
        Calibration::new([
            (0, ChannelCalibration { gain: 1.0, offset: 0.0 }),
            (1, ChannelCalibration { gain: 2.0, offset: 0.0 }),
        ])
    }

    fn instrument() -> Instrument {
        Instrument::new(IpAddr::V4(Ipv4Addr::LOCALHOST), calibration(), ClientConfig::default())
    }

    fn snapshot(event_id: i64) -> Snapshot {
        Snapshot::from([
            ("droplet_id".to_string(), RegisterValue::Int(event_id)),
            ("cur_droplet_intensity[1]".to_string(), RegisterValue::Int(4096)),
            ("cur_droplet_width[0]".to_string(), RegisterValue::Int(125_000)),
            ("gate_mode".to_string(), RegisterValue::Bits("101".into())),
            ("fifo_count".to_string(), RegisterValue::Int(3)),
        ])
    }

    #[test]
    fn rows_are_converted_per_quantity() {
        let row = physical_row(&calibration(), &snapshot(12), "droplet_id").unwrap();
        assert_eq!(row.event_id, 12);
        assert_eq!(row.values["cur_droplet_intensity[1]"], 1.0);
        assert_eq!(row.values["cur_droplet_width[0]"], 1.0);
        assert_eq!(row.values["fifo_count"], 3.0);
        assert!(!row.values.contains_key("gate_mode"));
    }

    #[test]
    fn snapshot_without_event_id_has_no_row() {
        let mut snapshot = snapshot(1);
        snapshot.remove("droplet_id");
        assert!(physical_row(&calibration(), &snapshot, "droplet_id").is_none());
        assert!(physical_row(&calibration(), &self::snapshot(-1), "droplet_id").is_none());
    }

    #[test]
    fn gate_limits_are_queued_as_raw_values() {
        let instrument = instrument();
        instrument
            .set_gate_limits(&["low_intensity_thresh[1]", "min_width_thresh[0]"], &[0.5, 0.002])
            .unwrap();
        assert_eq!(instrument.pending_commands(), 2);
    }

    #[test]
    fn invalid_gate_limits_queue_nothing() {
        let instrument = instrument();
        assert!(matches!(
            instrument.set_gate_limits(&["low_intensity_thresh[0]"], &[0.1, 0.2]),
            Err(ClientError::LimitCountMismatch { keys: 1, limits: 2 })
        ));
        assert!(matches!(
            instrument.set_gate_limits(&["low_intensity_thresh[0]", "gate_mode"], &[0.1, 0.2]),
            Err(ClientError::UnknownQuantity(name)) if name == "gate_mode"
        ));
        assert!(matches!(
            instrument.set_gate_limits(&["low_intensity_thresh[5]"], &[0.1]),
            Err(ClientError::MissingChannel(5))
        ));
        assert_eq!(instrument.pending_commands(), 0);
    }

    #[test]
    fn history_capacity_can_change() {
        let instrument = instrument();
        assert_eq!(instrument.history().capacity(), 5000);
        instrument.set_history_capacity(10);
        assert_eq!(instrument.history().capacity(), 10);
        assert!(!instrument.is_running());
    }
}
