use std::{
    fmt::Display,
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use piccolo_protocol::{
    DEFAULT_MAX_PAYLOAD_LEN, DEFAULT_SAMPLES_PER_CHANNEL, Opcode, Ports, SampleBuffer, SetRequest,
    Snapshot,
    framed::{JsonFrameCodec, OpcodeCodec},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    time::MissedTickBehavior,
};
use tokio_util::{
    codec::{Framed, FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{
    Acquisition, RegisterMemory,
    acquisition::spawn_acquisition,
    error::{RegisterError, ServerError},
    store::RegisterStore,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub ports: Ports,
    pub samples_per_channel: usize,
    pub stream_interval: Duration,
    pub acquisition_interval: Duration,
    pub max_payload_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: Ports::default(),
            samples_per_channel: DEFAULT_SAMPLES_PER_CHANNEL,
            stream_interval: Duration::from_millis(100),
            acquisition_interval: Duration::from_millis(10),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```ignore
/// use piccolo_server::server::Builder;
/// use std::time::Duration;
///
/// let server = Builder::new()
///     .samples_per_channel(16384)
///     .stream_interval(Duration::from_millis(50))
///     .build(acquisition, store)?;
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the ports of the four services.
    pub fn ports(mut self, ports: Ports) -> Self {
        self.config.ports = ports;
        self
    }

    /// Set the number of samples per channel served on the buffer stream.
    pub fn samples_per_channel(mut self, samples: usize) -> Self {
        self.config.samples_per_channel = samples;
        self
    }

    /// Set the cadence of the state stream
    pub fn stream_interval(mut self, interval: Duration) -> Self {
        self.config.stream_interval = interval;
        self
    }

    /// Set the pause between two acquisitions
    pub fn acquisition_interval(mut self, interval: Duration) -> Self {
        self.config.acquisition_interval = interval;
        self
    }

    /// Set the largest JSON payload accepted on the state-set service.
    pub fn max_payload_len(mut self, len: usize) -> Self {
        self.config.max_payload_len = len;
        self
    }

    /// Build and return the server
    pub fn build<A: Acquisition, M: RegisterMemory + 'static>(
        self,
        acquisition: A,
        store: RegisterStore<M>,
    ) -> Result<Server<A, M>, RegisterError> {
        Server::new(acquisition, store, self.config)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Service {
    Control,
    BufferStream,
    StateStream,
    StateSet,
}

impl Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Service::Control => write!(f, "control"),
            Service::BufferStream => write!(f, "buffer-stream"),
            Service::StateStream => write!(f, "state-stream"),
            Service::StateSet => write!(f, "state-set"),
        }
    }
}

/// One bound listener per service.
#[derive(Debug)]
pub struct Listeners {
    control: TcpListener,
    buffer_stream: TcpListener,
    state_stream: TcpListener,
    state_set: TcpListener,
}

impl Listeners {
    /// Binds all four services on `ip`. A port of `0` picks an ephemeral port.
    pub async fn bind(ip: IpAddr, ports: Ports) -> io::Result<Listeners> {
        Ok(Listeners {
            control: TcpListener::bind(SocketAddr::new(ip, ports.control)).await?,
            buffer_stream: TcpListener::bind(SocketAddr::new(ip, ports.buffer_stream)).await?,
            state_stream: TcpListener::bind(SocketAddr::new(ip, ports.state_stream)).await?,
            state_set: TcpListener::bind(SocketAddr::new(ip, ports.state_set)).await?,
        })
    }

    /// The ports actually bound.
    pub fn ports(&self) -> io::Result<Ports> {
        Ok(Ports {
            control: self.control.local_addr()?.port(),
            buffer_stream: self.buffer_stream.local_addr()?.port(),
            state_stream: self.state_stream.local_addr()?.port(),
            state_set: self.state_set.local_addr()?.port(),
        })
    }
}

pub struct Server<A, M> {
    acquisition: A,
    store: Arc<RegisterStore<M>>,
    config: Config,
    shutdown: CancellationToken,
}

impl<A: Acquisition, M: RegisterMemory + 'static> Server<A, M> {
    /// Writes the register defaults and prepares the server. Nothing is bound yet.
    pub fn new(
        acquisition: A,
        store: RegisterStore<M>,
        config: Config,
    ) -> Result<Server<A, M>, RegisterError> {
        store.apply_defaults()?;
        Ok(Server {
            acquisition,
            store: Arc::new(store),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<RegisterStore<M>> {
        self.store.clone()
    }

    /// Cancelling this token has the same effect as a shutdown opcode.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn listen(self, ip: IpAddr) -> Result<(), ServerError> {
        let listeners = Listeners::bind(ip, self.config.ports).await?;
        self.serve(listeners).await
    }

    /// Serves all four services until shutdown is requested.
    pub async fn serve(self, listeners: Listeners) -> Result<(), ServerError> {
        let Server {
            acquisition,
            store,
            config,
            shutdown,
        } = self;
        log::info!("Server listening for connections on {:?}", listeners.ports()?);

        let (samples, acquisition_thread) = spawn_acquisition(
            acquisition,
            config.samples_per_channel,
            config.acquisition_interval,
            shutdown.clone(),
        )?;
        let stream_interval = config.stream_interval;
        let max_payload_len = config.max_payload_len;
        let stream_store = store.clone();
        let control_shutdown = shutdown.clone();

        tokio::join!(
            accept_loop(
                Service::Control,
                listeners.control,
                shutdown.clone(),
                move |tcp| control(tcp, control_shutdown.clone()),
            ),
            accept_loop(
                Service::BufferStream,
                listeners.buffer_stream,
                shutdown.clone(),
                move |tcp| buffer_stream(tcp, samples.clone()),
            ),
            accept_loop(
                Service::StateStream,
                listeners.state_stream,
                shutdown.clone(),
                move |tcp| state_stream(tcp, stream_store.clone(), stream_interval),
            ),
            accept_loop(
                Service::StateSet,
                listeners.state_set,
                shutdown.clone(),
                move |tcp| state_set(tcp, store.clone(), max_payload_len),
            ),
        );

        if let Ok(Err(_)) = tokio::task::spawn_blocking(move || acquisition_thread.join()).await {
            log::error!("Acquisition thread panicked");
        }
        log::info!("Server shut down");
        Ok(())
    }
}

impl ServerError {
    fn is_disconnect(&self) -> bool {
        match self {
            ServerError::Protocol(err) => err.is_disconnect(),
            ServerError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Accepts connections until shutdown and runs `handler` on a new task for each of them.
async fn accept_loop<F, Fut>(
    service: Service,
    listener: TcpListener,
    shutdown: CancellationToken,
    handler: F,
) where
    F: Fn(TcpStream) -> Fut,
    Fut: Future<Output = Result<(), ServerError>> + Send + 'static,
{
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("[{}] Connection error: {}", service, e);
                    continue;
                }
            },
        };
        log::info!("[{}] New client connection from {}", service, peer);

        let connection = handler(tcp);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::debug!("[{}] Closing connection to {} on shutdown", service, peer);
                }
                result = connection => match result {
                    Ok(()) => log::info!("[{}] Client {} disconnected", service, peer),
                    Err(e) if e.is_disconnect() => {
                        log::info!("[{}] Client {} disconnected: {}", service, peer, e)
                    }
                    Err(e) => log::error!("[{}] Client {} error: {}", service, peer, e),
                },
            }
        });
    }
    log::debug!("[{}] Listener closed", service);
}

async fn control(tcp: TcpStream, shutdown: CancellationToken) -> Result<(), ServerError> {
    let mut frames = FramedRead::new(tcp, OpcodeCodec);
    while let Some(opcode) = frames.next().await {
        match opcode? {
            Opcode::Shutdown => {
                log::info!("Shutdown signal received");
                shutdown.cancel();
                break;
            }
            other => log::warn!("[{}] Unknown opcode: {}", Service::Control, other),
        }
    }
    Ok(())
}

async fn buffer_stream(
    tcp: TcpStream,
    samples: watch::Receiver<Arc<SampleBuffer>>,
) -> Result<(), ServerError> {
    let mut framed = Framed::new(tcp, OpcodeCodec);
    while let Some(opcode) = framed.next().await {
        match opcode? {
            Opcode::Acquire => {
                let buffer = samples.borrow().clone();
                log::trace!(
                    "Sending buffer of {} samples per channel",
                    buffer.samples_per_channel()
                );
                framed.send(&*buffer).await?;
            }
            other => log::warn!("[{}] Ignoring opcode: {}", Service::BufferStream, other),
        }
    }
    Ok(())
}

async fn state_stream<M: RegisterMemory>(
    tcp: TcpStream,
    store: Arc<RegisterStore<M>>,
    interval: Duration,
) -> Result<(), ServerError> {
    let mut framed = FramedWrite::new(tcp, JsonFrameCodec::<Snapshot>::default());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        // Snapshots may be torn; consumers compare event ids across frames.
        framed.send(&store.snapshot()).await?;
    }
}

async fn state_set<M: RegisterMemory>(
    tcp: TcpStream,
    store: Arc<RegisterStore<M>>,
    max_payload_len: usize,
) -> Result<(), ServerError> {
    let mut frames = FramedRead::new(tcp, JsonFrameCodec::<SetRequest>::new(max_payload_len));
    while let Some(request) = frames.next().await {
        let request = request?;
        log::debug!(
            "[{}] Set request: {} = {}",
            Service::StateSet,
            request.name,
            request.value
        );
        store.set(&request.name, &request.value)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use piccolo_protocol::framed::{JsonFrameCodec, OpcodeCodec};
    use piccolo_protocol::{Opcode, Ports, RegisterValue, SampleBuffer, SetRequest, Snapshot};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_util::codec::{FramedRead, FramedWrite};
    use tokio_util::sync::CancellationToken;

    use crate::RegisterMemory;
    use crate::acquisition::TestPattern;
    use crate::error::ServerError;
    use crate::registers::{BLOCK_LEN, CatalogConfig, RegisterCatalog};
    use crate::server::{Builder, Listeners};
    use crate::store::{HeapMemory, RegisterStore};

    const CATALOG: &str = r#"{
        "fpga_inputs": [
            { "name": "low_intensity_thresh", "addr": ["0x0010", "0x0014"], "dtype": "14'sd", "default": 0 },
            { "name": "sort_enable", "addr": "0x0018", "dtype": "1'b", "default": "0" }
        ],
        "fpga_outputs": [
            { "name": "droplet_id", "addr": "0x0020", "dtype": "32'd" }
        ]
    }"#;

    const EPHEMERAL: Ports = Ports {
        control: 0,
        buffer_stream: 0,
        state_stream: 0,
        state_set: 0,
    };

    struct Running<M = HeapMemory> {
        ports: Ports,
        store: Arc<RegisterStore<M>>,
        shutdown: CancellationToken,
        handle: JoinHandle<Result<(), ServerError>>,
    }

    /// Returns a new event id on every read of `droplet_id`, like gateware that records
    /// events faster than the state stream is sampled.
    struct BusyMemory {
        inner: HeapMemory,
        event_id: AtomicU32,
    }

    impl RegisterMemory for BusyMemory {
        fn size(&self) -> usize {
            self.inner.size()
        }

        fn read_block(&self, offset: usize) -> [u8; BLOCK_LEN] {
            if offset == 0x20 {
                return self.event_id.fetch_add(1, Ordering::SeqCst).to_le_bytes();
            }
            self.inner.read_block(offset)
        }

        fn write_block(&mut self, offset: usize, block: [u8; BLOCK_LEN]) {
            self.inner.write_block(offset, block)
        }
    }

    async fn start(samples_per_channel: usize) -> Running {
        start_with(HeapMemory::new(0x40), samples_per_channel).await
    }

    async fn start_with<M: RegisterMemory + 'static>(
        memory: M,
        samples_per_channel: usize,
    ) -> Running<M> {
        let catalog =
            RegisterCatalog::compile(&CatalogConfig::from_json_str(CATALOG).unwrap()).unwrap();
        let store = RegisterStore::new(catalog, memory).unwrap();
        let server = Builder::new()
            .samples_per_channel(samples_per_channel)
            .stream_interval(Duration::from_millis(20))
            .acquisition_interval(Duration::from_millis(1))
            .build(TestPattern::default(), store)
            .unwrap();
        let listeners = Listeners::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), EPHEMERAL)
            .await
            .unwrap();
        Running {
            ports: listeners.ports().unwrap(),
            store: server.store(),
            shutdown: server.shutdown_token(),
            handle: tokio::spawn(server.serve(listeners)),
        }
    }

    async fn connect(port: u16) -> TcpStream {
        TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap()
    }

    #[tokio::test]
    async fn write_visible_on_state_stream() {
        let server = start(16).await;
        let mut state = FramedRead::new(
            connect(server.ports.state_stream).await,
            JsonFrameCodec::<Snapshot>::default(),
        );
        let first = state.next().await.unwrap().unwrap();
        assert_eq!(first["low_intensity_thresh[0]"], RegisterValue::Int(0));
        assert_eq!(first["sort_enable"], RegisterValue::Bits("0".into()));

        let mut set = FramedWrite::new(
            connect(server.ports.state_set).await,
            JsonFrameCodec::<SetRequest>::default(),
        );
        set.send(&SetRequest::new("low_intensity_thresh[0]", 1234i64))
            .await
            .unwrap();

        let seen = timeout(Duration::from_secs(2), async {
            while let Some(snapshot) = state.next().await {
                if snapshot.unwrap()["low_intensity_thresh[0]"] == RegisterValue::Int(1234) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(seen);

        server.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn state_stream_keeps_sending_while_events_arrive() {
        let memory = BusyMemory {
            inner: HeapMemory::new(0x40),
            event_id: AtomicU32::new(0),
        };
        let server = start_with(memory, 16).await;
        let mut state = FramedRead::new(
            connect(server.ports.state_stream).await,
            JsonFrameCodec::<Snapshot>::default(),
        );

        let ids = timeout(Duration::from_secs(1), async {
            let mut ids = Vec::new();
            while ids.len() < 3 {
                let snapshot = state.next().await.unwrap().unwrap();
                ids.push(snapshot["droplet_id"].as_int().unwrap());
            }
            ids
        })
        .await
        .unwrap();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", ids);

        server.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bad_request_closes_only_its_connection() {
        let server = start(16).await;
        let mut bad = FramedWrite::new(
            connect(server.ports.state_set).await,
            JsonFrameCodec::<SetRequest>::default(),
        );
        let mut good = FramedWrite::new(
            connect(server.ports.state_set).await,
            JsonFrameCodec::<SetRequest>::default(),
        );

        bad.send(&SetRequest::new("no_such_register", 1i64)).await.unwrap();
        let mut rest = Vec::new();
        let read = timeout(Duration::from_secs(2), bad.get_mut().read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0)) || read.is_err());

        good.send(&SetRequest::new("low_intensity_thresh[1]", -7i64))
            .await
            .unwrap();
        timeout(Duration::from_secs(2), async {
            while server.store.get("low_intensity_thresh[1]").unwrap() != RegisterValue::Int(-7) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        server.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn buffer_stream_replies_raw_samples() {
        let n = 4096;
        let server = start(n).await;
        let mut tcp = connect(server.ports.buffer_stream).await;

        let mut request = FramedWrite::new(&mut tcp, OpcodeCodec);
        request.send(Opcode::Unknown(7)).await.unwrap();
        request.send(Opcode::Acquire).await.unwrap();
        drop(request);

        let mut raw = vec![0u8; SampleBuffer::byte_len(n)];
        tcp.read_exact(&mut raw).await.unwrap();
        let buffer = SampleBuffer::from_bytes(&raw, n).unwrap();
        assert_eq!(buffer.ch1().len(), 4096);
        assert_eq!(buffer.ch2().len(), 4096);

        let mut extra = [0u8; 1];
        let nothing_more = timeout(Duration::from_millis(100), tcp.read(&mut extra)).await;
        assert!(nothing_more.is_err());

        server.shutdown.cancel();
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_opcode_stops_the_server() {
        let server = start(16).await;
        let mut control = FramedWrite::new(connect(server.ports.control).await, OpcodeCodec);
        control.send(Opcode::Unknown(42)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.handle.is_finished());

        control.send(Opcode::Shutdown).await.unwrap();
        timeout(Duration::from_secs(2), server.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
