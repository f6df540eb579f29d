//! Per-device PLC connection: connect, poll, reconnect, write.
//!
//! Each enabled device gets one [`PlcLink`] driven by its own task. The link
//! walks `Disconnected → Connecting → Connected → Polling` and falls back to
//! `Disconnected` on any I/O failure. Writes share the link's transport with
//! the poll loop, so per device there is never more than one request in
//! flight.

use crate::metrics::{device_label, LINK_CONNECTED, POLL_CYCLES, POLL_FAILURES, RECONNECTS};
use crate::shutdown::StopSignal;
use async_trait::async_trait;
use line_core::codec::{self, set_bit, EncodeError, WritePayload};
use line_core::{
    DecodedValue, DeviceDescriptor, DeviceNo, RawRegisters, ReadSpan, TagDescriptor, TagId,
    TagPipeline,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Polling,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Polling => "polling",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Polling)
    }
}

/// Holding-register transport of one connected device.
#[async_trait]
pub trait RegisterClient: Send {
    async fn read_holding_registers(&mut self, start: u16, count: u16) -> io::Result<Vec<u16>>;
    async fn write_single_register(&mut self, address: u16, word: u16) -> io::Result<()>;
    async fn write_multiple_registers(&mut self, address: u16, words: &[u16]) -> io::Result<()>;
}

/// Opens a [`RegisterClient`] for a device.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, device: &DeviceDescriptor) -> io::Result<Box<dyn RegisterClient>>;
}

/// Receives the raw blocks of every successful poll.
pub trait PollSink: Send + Sync {
    fn on_poll(&self, device_no: DeviceNo, raw: RawRegisters);

    fn on_link_state(&self, _device_no: DeviceNo, _state: LinkState) {}
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    /// Upper bound for one connect, read or write round-trip.
    pub io_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(3),
            io_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("device {0} is not connected")]
    NotConnected(DeviceNo),
    #[error("device {device_no}: {source}")]
    Io {
        device_no: DeviceNo,
        #[source]
        source: io::Error,
    },
    #[error("device {device_no}: request timed out after {timeout:?}")]
    Timeout {
        device_no: DeviceNo,
        timeout: Duration,
    },
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl LinkError {
    /// Transport failures invalidate the connection; encode failures do not.
    fn drops_connection(&self) -> bool {
        matches!(self, LinkError::Io { .. } | LinkError::Timeout { .. })
    }
}

pub struct PlcLink {
    device: DeviceDescriptor,
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    client: Mutex<Option<Box<dyn RegisterClient>>>,
    state: parking_lot::Mutex<LinkState>,
}

impl PlcLink {
    pub fn new(device: DeviceDescriptor, config: LinkConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            device,
            config,
            connector,
            client: Mutex::new(None),
            state: parking_lot::Mutex::new(LinkState::Disconnected),
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn device_no(&self) -> DeviceNo {
        self.device.device_no
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    fn set_state(&self, next: LinkState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            debug!(
                device_no = self.device_no(),
                from = previous.as_str(),
                to = next.as_str(),
                "Link state"
            );
            LINK_CONNECTED
                .with_label_values(&[device_label(self.device_no()).as_str()])
                .set(i64::from(next.is_connected()));
        }
    }

    /// Poll loop; returns once `stop` fires.
    pub async fn run(
        self: Arc<Self>,
        pipeline: Arc<TagPipeline>,
        sink: Arc<dyn PollSink>,
        mut stop: StopSignal,
    ) {
        let device_no = self.device_no();
        let label = device_label(device_no);
        info!(device_no, endpoint = %self.device.endpoint(), "PLC link started");

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut first_attempt = true;

        while !stop.is_stopped() {
            if !self.state().is_connected() {
                // Every attempt after the initial connect is a reconnect.
                if !first_attempt {
                    RECONNECTS.with_label_values(&[label.as_str()]).inc();
                }
                first_attempt = false;
                match self.connect().await {
                    Ok(()) => {
                        sink.on_link_state(device_no, self.state());
                    }
                    Err(err) => {
                        warn!(
                            device_no,
                            error = %err,
                            retry_in = ?self.config.reconnect_delay,
                            "PLC connect failed"
                        );
                        sink.on_link_state(device_no, self.state());
                        tokio::select! {
                            _ = sleep(self.config.reconnect_delay) => {}
                            _ = stop.stopped() => {}
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.stopped() => break,
            }

            let plan = pipeline.current().read_plan(device_no);
            match self.poll_once(&plan).await {
                Ok(raw) => {
                    POLL_CYCLES.with_label_values(&[label.as_str()]).inc();
                    sink.on_poll(device_no, raw);
                }
                Err(LinkError::NotConnected(_)) => {}
                Err(err) => {
                    warn!(device_no, error = %err, "PLC poll failed, dropping connection");
                    POLL_FAILURES.with_label_values(&[label.as_str()]).inc();
                    self.disconnect().await;
                    sink.on_link_state(device_no, self.state());
                }
            }
        }

        self.disconnect().await;
        info!(device_no, "PLC link stopped");
    }

    /// One connection attempt bounded by the I/O timeout.
    pub async fn connect(&self) -> Result<(), LinkError> {
        self.set_state(LinkState::Connecting);
        let attempt = self.timed(self.connector.connect(&self.device)).await;
        match attempt {
            Ok(client) => {
                *self.client.lock().await = Some(client);
                self.set_state(LinkState::Connected);
                info!(device_no = self.device_no(), "PLC link connected");
                Ok(())
            }
            Err(err) => {
                self.set_state(LinkState::Disconnected);
                Err(err)
            }
        }
    }

    pub async fn disconnect(&self) {
        let mut client = self.client.lock().await;
        if client.take().is_some() {
            info!(device_no = self.device_no(), "PLC link disconnected");
        }
        self.set_state(LinkState::Disconnected);
    }

    /// Read every span of `plan`, strictly one request at a time.
    pub async fn poll_once(&self, plan: &[ReadSpan]) -> Result<RawRegisters, LinkError> {
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or(LinkError::NotConnected(self.device_no()))?;

        let mut raw = RawRegisters::new();
        for span in plan {
            let words = self
                .timed(client.read_holding_registers(span.start, span.count))
                .await?;
            raw.insert(span.start, words);
        }
        drop(guard);

        self.set_state(LinkState::Polling);
        Ok(raw)
    }

    /// Encode `value` for `tag` and write it to the device.
    ///
    /// Bit tags are read-modify-write of their register. Transport failures
    /// drop the connection so the poll loop reconnects.
    pub async fn write(&self, tag: &TagDescriptor, value: &DecodedValue) -> Result<(), LinkError> {
        if !self.state().is_connected() {
            return Err(LinkError::NotConnected(self.device_no()));
        }
        let payload = codec::encode(tag, value)?;

        let mut guard = self.client.lock().await;
        let Some(client) = guard.as_mut() else {
            return Err(LinkError::NotConnected(self.device_no()));
        };
        let result = self.write_payload(client.as_mut(), tag.address, payload).await;
        if let Err(err) = &result {
            if err.drops_connection() {
                warn!(
                    device_no = self.device_no(),
                    tag_id = tag.id,
                    error = %err,
                    "PLC write failed, dropping connection"
                );
                *guard = None;
                self.set_state(LinkState::Disconnected);
            }
        }
        result
    }

    async fn write_payload(
        &self,
        client: &mut dyn RegisterClient,
        address: u16,
        payload: WritePayload,
    ) -> Result<(), LinkError> {
        match payload {
            WritePayload::Bit { bit, on } => {
                let current = self.timed(client.read_holding_registers(address, 1)).await?;
                let word = current.first().copied().ok_or_else(|| LinkError::Io {
                    device_no: self.device_no(),
                    source: io::Error::new(io::ErrorKind::UnexpectedEof, "empty register read"),
                })?;
                self.timed(client.write_single_register(address, set_bit(word, bit, on)))
                    .await
            }
            WritePayload::Words(words) if words.len() == 1 => {
                self.timed(client.write_single_register(address, words[0]))
                    .await
            }
            WritePayload::Words(words) => {
                self.timed(client.write_multiple_registers(address, &words))
                    .await
            }
        }
    }

    async fn timed<T>(&self, op: impl Future<Output = io::Result<T>>) -> Result<T, LinkError> {
        match timeout(self.config.io_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(LinkError::Io {
                device_no: self.device_no(),
                source,
            }),
            Err(_) => Err(LinkError::Timeout {
                device_no: self.device_no(),
                timeout: self.config.io_timeout,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("tag {0} not found in configuration")]
    UnknownTag(TagId),
    #[error("tag {0} is not writable")]
    NotWritable(TagId),
    #[error("device {device_no} of tag {tag_id} is not configured")]
    UnknownDevice { tag_id: TagId, device_no: DeviceNo },
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Owns one [`PlcLink`] per enabled device.
pub struct PlcLinkManager {
    links: BTreeMap<DeviceNo, Arc<PlcLink>>,
}

impl PlcLinkManager {
    /// Disabled devices get no link.
    pub fn new<F>(devices: &[DeviceDescriptor], config: LinkConfig, connector_for: F) -> Self
    where
        F: Fn(&DeviceDescriptor) -> Arc<dyn Connector>,
    {
        let links = devices
            .iter()
            .filter(|d| d.enabled)
            .map(|d| {
                let link = PlcLink::new(d.clone(), config.clone(), connector_for(d));
                (d.device_no, Arc::new(link))
            })
            .collect();
        Self { links }
    }

    pub fn link(&self, device_no: DeviceNo) -> Option<&Arc<PlcLink>> {
        self.links.get(&device_no)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn states(&self) -> BTreeMap<DeviceNo, LinkState> {
        self.links
            .iter()
            .map(|(no, link)| (*no, link.state()))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.links
            .values()
            .filter(|link| link.state().is_connected())
            .count()
    }

    /// One independent task per device.
    pub fn spawn_all(
        &self,
        pipeline: Arc<TagPipeline>,
        sink: Arc<dyn PollSink>,
        stop: StopSignal,
    ) -> Vec<JoinHandle<()>> {
        self.links
            .values()
            .map(|link| {
                tokio::spawn(Arc::clone(link).run(
                    Arc::clone(&pipeline),
                    Arc::clone(&sink),
                    stop.clone(),
                ))
            })
            .collect()
    }

    /// Resolve `tag_id` in the current generation and write through its device link.
    pub async fn write_tag(
        &self,
        pipeline: &TagPipeline,
        tag_id: TagId,
        value: &DecodedValue,
    ) -> Result<TagDescriptor, WriteError> {
        let tag = pipeline.tag(tag_id).ok_or(WriteError::UnknownTag(tag_id))?;
        if !tag.writable {
            return Err(WriteError::NotWritable(tag_id));
        }
        let link = self.link(tag.device_no).ok_or(WriteError::UnknownDevice {
            tag_id,
            device_no: tag.device_no,
        })?;
        link.write(&tag, value).await?;
        Ok(tag)
    }
}
