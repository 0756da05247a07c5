//! Connection management
//!
//! Handles the session lifecycle and RPC execution with an Improv device.
//!
//! A single background task owns the read side of the transport. It feeds the
//! [`Framer`], decodes packets, updates the observable device state and routes
//! results to the pending call. Public operations encode and write their
//! request, then wait on a oneshot channel that the reader resolves.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

use super::{
    decode_with, ByteSink, ByteSource, CallId, ChecksumScheme, CommandBuilder, DeviceState,
    ErrorCode, Frame, Framer, HexBytes, Packet, ProtocolError, RpcCommand, RpcCorrelator,
    RpcOutcome, RpcReceiver, SessionEvent, Transport, DEFAULT_HANDSHAKE_TIMEOUT_MS,
    READ_CHUNK_SIZE,
};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Waiting for the first state or error report
    Connecting,
    /// The device has answered at least once
    Connected,
    /// Handshake failed or the reader stopped; terminal
    Error,
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long `initialize` waits for the first state report
    pub handshake_timeout_ms: u64,
    /// Deadline applied to calls that do not pass their own
    pub rpc_timeout_ms: Option<u64>,
    /// Checksum coverage; `Payload` for older firmware
    pub checksum: ChecksumScheme,
    /// Append `\n` after every written frame
    pub line_terminator: bool,
    /// Buffered events per subscriber before it starts lagging
    pub event_capacity: usize,
    /// Name recorded on the session's log span
    pub label: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            rpc_timeout_ms: None,
            checksum: ChecksumScheme::Frame,
            line_terminator: true,
            event_capacity: 16,
            label: "improv".to_string(),
        }
    }
}

impl ConnectionConfig {
    /// `handshake_timeout_ms` as a duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// `rpc_timeout_ms` as a duration
    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.rpc_timeout_ms.map(Duration::from_millis)
    }
}

/// Answer to REQUEST_INFO
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Firmware name, e.g. "ESPHome"
    pub firmware: String,
    /// Firmware version
    pub version: String,
    /// Chip family, e.g. "ESP32"
    pub chip_family: String,
    /// Device name
    pub name: String,
}

impl DeviceInfo {
    fn from_fields(fields: &[String]) -> Result<Self, ProtocolError> {
        match fields {
            [firmware, version, chip_family, name, ..] => Ok(Self {
                firmware: firmware.clone(),
                version: version.clone(),
                chip_family: chip_family.clone(),
                name: name.clone(),
            }),
            _ => Err(ProtocolError::InvalidResponse(format!(
                "REQUEST_INFO returned {} fields, expected 4",
                fields.len()
            ))),
        }
    }
}

/// One network reported by a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEntry {
    /// SSID
    pub name: String,
    /// Signal strength in dBm
    pub rssi: i32,
    /// Whether joining needs a password
    pub secured: bool,
}

impl NetworkEntry {
    /// Parse `[name, rssi, secured]`; the network is secured only when the
    /// flag reads "YES".
    fn from_record(record: &[String]) -> Option<Self> {
        let [name, rssi, secured, ..] = record else {
            return None;
        };
        Some(Self {
            name: name.clone(),
            rssi: rssi.trim().parse().ok()?,
            secured: secured == "YES",
        })
    }
}

/// State written by the reader and read by the getters
#[derive(Debug)]
struct Shared {
    connection_state: ConnectionState,
    device_state: Option<DeviceState>,
    error: ErrorCode,
    next_url: Option<String>,
    info: Option<DeviceInfo>,
    rpc: RpcCorrelator,
    reading: bool,
}

/// Handle shared by the session and its reader task
#[derive(Clone)]
struct SessionCore {
    shared: Arc<Mutex<Shared>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionCore {
    fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            shared: Arc::new(Mutex::new(Shared {
                connection_state: ConnectionState::Connecting,
                device_state: None,
                error: ErrorCode::NoError,
                next_url: None,
                info: None,
                rpc: RpcCorrelator::new(),
                reading: false,
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Register a call, provided the reader is running
    fn begin(&self, command: RpcCommand) -> Result<(CallId, RpcReceiver), ProtocolError> {
        let mut shared = self.lock();
        if !shared.reading {
            return Err(ProtocolError::NotConnected);
        }
        shared.rpc.begin(command)
    }

    fn cancel(&self, id: CallId) {
        if self.lock().rpc.cancel(id) {
            trace!(?id, "released pending call");
        }
    }

    fn handle_frame(&self, frame: &Frame, scheme: ChecksumScheme) {
        debug!(frame = %HexBytes(frame.as_bytes()), "received frame");
        let packet = match decode_with(frame, scheme) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(%err, "dropping frame");
                return;
            }
        };

        match packet {
            Packet::CurrentState(state) => self.on_state(state),
            Packet::ErrorState(code) => self.on_error(code),
            Packet::RpcResult { command, fields } => {
                let outcome = self.lock().rpc.on_result(command, fields);
                trace!(%command, ?outcome, "routed result");
            }
            Packet::Rpc { command, .. } => {
                debug!(%command, "ignoring RPC frame from device");
            }
        }
    }

    fn on_state(&self, state: DeviceState) {
        {
            let mut shared = self.lock();
            shared.device_state = Some(state);
            if shared.connection_state == ConnectionState::Connecting {
                shared.connection_state = ConnectionState::Connected;
            }
        }
        info!(%state, "device state");
        self.emit(SessionEvent::StateChanged(state));
    }

    /// Record a reported error code and fail the pending call
    fn on_error(&self, code: ErrorCode) {
        let outcome = {
            let mut shared = self.lock();
            shared.error = code;
            if shared.connection_state == ConnectionState::Connecting {
                shared.connection_state = ConnectionState::Connected;
            }
            shared.rpc.on_error(code)
        };
        if code.is_error() {
            warn!(%code, ?outcome, "device error");
        } else {
            debug!("device error cleared");
        }
        self.emit(SessionEvent::ErrorChanged(code));
    }

    /// Deadline for call `id` passed. Fails it with a synthesized TIMEOUT
    /// unless it already completed; a timeout is not a device answer.
    fn on_timeout(&self, id: CallId) {
        let outcome = {
            let mut shared = self.lock();
            let outcome = shared.rpc.reject(id, ErrorCode::Timeout);
            if outcome != RpcOutcome::Ignored {
                shared.error = ErrorCode::Timeout;
            }
            outcome
        };
        if outcome != RpcOutcome::Ignored {
            self.emit(SessionEvent::ErrorChanged(ErrorCode::Timeout));
        }
    }

    /// Reader is gone: fail the pending call and move to the terminal state
    fn finish(&self, reason: &str) {
        let aborted = {
            let mut shared = self.lock();
            shared.reading = false;
            shared.connection_state = ConnectionState::Error;
            shared.rpc.abort(ProtocolError::Disconnected)
        };
        if aborted {
            warn!("pending call rejected on disconnect");
        }
        info!(reason, "reader stopped");
        self.emit(SessionEvent::Disconnected);
    }
}

/// Releases the pending slot once the waiting operation is over, including
/// when its caller drops the future early. A no-op if the call resolved.
struct CallGuard<'a> {
    core: &'a SessionCore,
    id: CallId,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.core.cancel(self.id);
    }
}

async fn read_loop(
    mut source: ByteSource,
    core: SessionCore,
    scheme: ChecksumScheme,
    cancel: CancellationToken,
) {
    let mut framer = Framer::with_scheme(scheme);
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

    let reason = loop {
        buf.reserve(READ_CHUNK_SIZE);
        let read = tokio::select! {
            _ = cancel.cancelled() => break "closed",
            read = source.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => break "end of stream",
            Ok(n) => trace!(bytes = n, "read"),
            Err(err) => {
                error!(%err, "read failed");
                break "read error";
            }
        }

        while let Some(frame) = framer.next_frame(&mut buf) {
            core.handle_frame(&frame, scheme);
        }
    };

    if framer.discarded_lines() > 0 {
        debug!(lines = framer.discarded_lines(), "skipped non-Improv lines");
    }
    core.finish(reason);
}

/// A session with one Improv device
pub struct Connection {
    core: SessionCore,
    sink: tokio::sync::Mutex<ByteSink>,
    source: Mutex<Option<ByteSource>>,
    reader: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    builder: CommandBuilder,
    config: ConnectionConfig,
    span: Span,
}

impl Connection {
    /// Wrap a transport. Nothing is read until [`initialize`](Self::initialize).
    pub fn new(transport: Transport, config: ConnectionConfig) -> Self {
        let (source, sink) = transport.into_parts();
        let span = info_span!("improv_session", label = %config.label);
        Self {
            core: SessionCore::new(config.event_capacity),
            sink: tokio::sync::Mutex::new(sink),
            source: Mutex::new(Some(source)),
            reader: None,
            cancel: CancellationToken::new(),
            builder: CommandBuilder::new(config.checksum),
            config,
            span,
        }
    }

    /// Settings this session was created with
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Where the session is in its lifecycle
    pub fn connection_state(&self) -> ConnectionState {
        self.core.lock().connection_state
    }

    /// Last reported provisioning state; `None` until the device reports one
    pub fn device_state(&self) -> Option<DeviceState> {
        self.core.lock().device_state
    }

    /// Last error code, reported or synthesized; `NoError` until one arrives
    pub fn error(&self) -> ErrorCode {
        self.core.lock().error
    }

    /// Info fetched by the last successful `request_info`
    pub fn info(&self) -> Option<DeviceInfo> {
        self.core.lock().info.clone()
    }

    /// URL the device offered after provisioning, if any
    pub fn next_url(&self) -> Option<String> {
        self.core.lock().next_url.clone()
    }

    /// Whether the background reader is running
    pub fn is_reading(&self) -> bool {
        self.core.lock().reading
    }

    /// Receive state, error and disconnect notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.events.subscribe()
    }

    /// Start reading, detect the device and fetch its info.
    ///
    /// Waits up to `timeout` (default from the config) for the device to
    /// answer REQUEST_CURRENT_STATE. Any failure closes the session.
    pub async fn initialize(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<DeviceInfo, ProtocolError> {
        let timeout = timeout.unwrap_or_else(|| self.config.handshake_timeout());
        let source = self.take_source().ok_or(ProtocolError::AlreadyConnected)?;
        self.spawn_reader(source);

        let span = self.span.clone();
        async {
            info!(?timeout, "detecting device");
            match tokio::time::timeout(timeout, self.request_current_state()).await {
                Ok(Ok(state)) => info!(%state, "device detected"),
                Ok(Err(err)) => {
                    self.close().await;
                    return Err(err);
                }
                Err(_) => {
                    warn!("no state report before the handshake deadline");
                    self.close().await;
                    return Err(ProtocolError::DeviceNotDetected);
                }
            }

            match self.request_info(None).await {
                Ok(info) => Ok(info),
                Err(err) => {
                    error!(%err, "failed to read device info");
                    self.close().await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn take_source(&mut self) -> Option<ByteSource> {
        self.source
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn spawn_reader(&mut self, source: ByteSource) {
        self.core.lock().reading = true;
        let core = self.core.clone();
        let reader = read_loop(source, core, self.config.checksum, self.cancel.clone());
        self.reader = Some(tokio::spawn(reader.instrument(self.span.clone())));
    }

    /// Ask for the current state.
    ///
    /// Resolves on the next state report. When that report is PROVISIONED the
    /// device also sends a result whose first field is the next URL, which is
    /// awaited and stored.
    pub async fn request_current_state(&self) -> Result<DeviceState, ProtocolError> {
        let command = RpcCommand::RequestCurrentState;
        let frame = self.builder.request_current_state()?;

        let mut events = self.subscribe();
        let (id, mut rx) = self.core.begin(command)?;
        let _call = CallGuard {
            core: &self.core,
            id,
        };
        self.write_request(command, &frame)
            .instrument(self.span.clone())
            .await?;

        loop {
            tokio::select! {
                reply = &mut rx => {
                    // Result or error before any state report
                    let records = reply.map_err(|_| ProtocolError::Disconnected)??;
                    self.store_next_url(&records);
                    return self.device_state().ok_or_else(|| {
                        ProtocolError::InvalidResponse("result before any state report".into())
                    });
                }
                event = events.recv() => {
                    match event {
                        Ok(SessionEvent::StateChanged(DeviceState::Provisioned)) => {
                            let records = rx.await.map_err(|_| ProtocolError::Disconnected)??;
                            self.store_next_url(&records);
                            return Ok(DeviceState::Provisioned);
                        }
                        Ok(SessionEvent::StateChanged(state)) => {
                            // No result follows; the guard frees the slot
                            return Ok(state);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "state listener lagged");
                        }
                        Err(RecvError::Closed) => return Err(ProtocolError::Disconnected),
                    }
                }
            }
        }
    }

    /// Firmware, version, chip family and device name
    pub async fn request_info(
        &self,
        timeout: Option<Duration>,
    ) -> Result<DeviceInfo, ProtocolError> {
        let frame = self.builder.request_info()?;
        let records = self.call(RpcCommand::RequestInfo, &frame, timeout).await?;
        let info = DeviceInfo::from_fields(first_record(&records))?;
        debug!(?info, "device info");
        self.core.lock().info = Some(info.clone());
        Ok(info)
    }

    /// Send Wi-Fi credentials. Returns the next URL if the device sent one.
    pub async fn provision(
        &self,
        ssid: &str,
        password: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, ProtocolError> {
        let frame = self.builder.send_wifi_settings(ssid, password)?;
        info!(ssid, "provisioning");
        let records = self
            .call(RpcCommand::SendWifiSettings, &frame, timeout)
            .await?;
        Ok(self.store_next_url(&records))
    }

    /// List visible networks, sorted by name ignoring case
    pub async fn scan(&self) -> Result<Vec<NetworkEntry>, ProtocolError> {
        let frame = self.builder.request_wifi_networks()?;
        let records = self
            .call(RpcCommand::RequestWifiNetworks, &frame, None)
            .await?;

        let mut networks: Vec<NetworkEntry> = records
            .iter()
            .filter_map(|record| {
                let entry = NetworkEntry::from_record(record);
                if entry.is_none() {
                    warn!(?record, "skipping malformed scan record");
                }
                entry
            })
            .collect();
        networks.sort_by_cached_key(|network| network.name.to_lowercase());
        debug!(count = networks.len(), "scan complete");
        Ok(networks)
    }

    /// Stop the reader and wait for it to exit. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.cancel.cancel();

        if let Some(reader) = self.reader.take() {
            if let Err(err) = reader.await {
                error!(%err, "reader task failed");
            }
            if let Err(err) = self.sink.lock().await.shutdown().await {
                debug!(%err, "sink shutdown failed");
            }
        } else if self.take_source().is_some() {
            // Never initialized
            self.core.lock().connection_state = ConnectionState::Error;
        }
    }

    async fn call(
        &self,
        command: RpcCommand,
        frame: &Frame,
        timeout: Option<Duration>,
    ) -> Result<Vec<Vec<String>>, ProtocolError> {
        let span = self.span.clone();
        async {
            let (id, rx) = self.core.begin(command)?;
            let _call = CallGuard {
                core: &self.core,
                id,
            };
            self.write_request(command, frame).await?;
            self.await_reply(id, command, rx, timeout.or(self.config.rpc_timeout()))
                .await
        }
        .instrument(span)
        .await
    }

    async fn await_reply(
        &self,
        id: CallId,
        command: RpcCommand,
        mut rx: RpcReceiver,
        timeout: Option<Duration>,
    ) -> Result<Vec<Vec<String>>, ProtocolError> {
        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!(%command, ?limit, "call timed out");
                    self.core.on_timeout(id);
                    rx.await
                }
            },
            None => rx.await,
        };
        reply.map_err(|_| ProtocolError::Disconnected)?
    }

    async fn write_request(&self, command: RpcCommand, frame: &Frame) -> Result<(), ProtocolError> {
        if let Err(err) = self.write_frame(frame).await {
            error!(%command, %err, "write failed");
            return Err(err);
        }
        Ok(())
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), ProtocolError> {
        debug!(frame = %HexBytes(frame.as_bytes()), "writing frame");
        let mut sink = self.sink.lock().await;
        sink.write_all(frame.as_bytes()).await?;
        if self.config.line_terminator {
            sink.write_all(b"\n").await?;
        }
        sink.flush().await?;
        Ok(())
    }

    fn store_next_url(&self, records: &[Vec<String>]) -> Option<String> {
        let url = first_record(records).first().cloned();
        if let Some(url) = &url {
            debug!(url = %url, "next URL");
            self.core.lock().next_url = Some(url.clone());
        }
        url
    }
}

fn first_record(records: &[Vec<String>]) -> &[String] {
    records.first().map(Vec::as_slice).unwrap_or_default()
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.config.label)
            .field("state", &self.connection_state())
            .field("reading", &self.is_reading())
            .finish_non_exhaustive()
    }
}
