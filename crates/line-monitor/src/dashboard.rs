//! Dashboard orchestrator.
//!
//! Owns the wiring between the PLC links and everything downstream: each
//! poll result goes through the tag pipeline, the alarm engine and the OEE
//! calculation inline on the polling task, then replaces that device's
//! cached snapshot. The UI gateway reads from the same cache.

use crate::status::{RuntimeMonitor, SystemMonitor};
use async_trait::async_trait;
use line_core::{
    AlarmEngine, AlarmError, AlarmEvent, AlarmListener, AlarmNo, DecodedValue, DeviceNo,
    OeeSnapshot, OeeTagMap, RawRegisters, SnapshotCache, TagId, TagPipeline, TagSnapshot,
    TagValues, TimeBase,
};
use line_io::metrics::{
    ACTIVE_ALARMS, ALARM_EVENTS, DECODE_FAILURES, OEE_AVAILABILITY, OEE_OVERALL,
    OEE_PERFORMANCE, OEE_QUALITY, TAG_WRITES,
};
use line_io::protocol::Parameters;
use line_io::{GatewayBackend, LinkState, PlcLinkManager, PollSink, StopSignal, WriteError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Alarm events buffered per UI client before it starts skipping.
pub const ALARM_EVENT_BUFFER: usize = 256;

/// Fans alarm events out to UI connections.
pub struct BroadcastListener {
    tx: broadcast::Sender<AlarmEvent>,
}

impl BroadcastListener {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlarmEvent> {
        self.tx.subscribe()
    }
}

impl AlarmListener for BroadcastListener {
    fn name(&self) -> &'static str {
        "ui-broadcast"
    }

    fn on_alarm_event(&self, event: &AlarmEvent) -> Result<(), AlarmError> {
        ALARM_EVENTS
            .with_label_values(&[event.kind.as_str()])
            .inc();
        // Err only means no UI client is connected.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

pub struct DashboardConfig {
    pub primary_device: DeviceNo,
    pub oee: Option<OeeTagMap>,
}

pub struct Dashboard {
    pipeline: Arc<TagPipeline>,
    alarms: Arc<AlarmEngine>,
    links: Arc<PlcLinkManager>,
    cache: SnapshotCache,
    config: DashboardConfig,
    events: Arc<BroadcastListener>,
    monitor: Arc<dyn SystemMonitor>,
    sequence: AtomicU64,
    decode_failures_seen: AtomicU64,
}

impl Dashboard {
    pub fn new(
        pipeline: Arc<TagPipeline>,
        alarms: Arc<AlarmEngine>,
        links: Arc<PlcLinkManager>,
        config: DashboardConfig,
        timebase: TimeBase,
    ) -> Arc<Self> {
        let monitor = Arc::new(RuntimeMonitor::new(
            timebase,
            Arc::clone(&links),
            Arc::clone(&alarms),
            Arc::clone(&pipeline),
        ));
        Self::with_monitor(pipeline, alarms, links, config, monitor)
    }

    pub fn with_monitor(
        pipeline: Arc<TagPipeline>,
        alarms: Arc<AlarmEngine>,
        links: Arc<PlcLinkManager>,
        config: DashboardConfig,
        monitor: Arc<dyn SystemMonitor>,
    ) -> Arc<Self> {
        let events = Arc::new(BroadcastListener::new(ALARM_EVENT_BUFFER));
        alarms.add_listener(Arc::clone(&events) as Arc<dyn AlarmListener>);
        Arc::new(Self {
            pipeline,
            alarms,
            links,
            cache: SnapshotCache::new(),
            config,
            events,
            monitor,
            sequence: AtomicU64::new(0),
            decode_failures_seen: AtomicU64::new(0),
        })
    }

    /// Spawn one poll loop per enabled device.
    pub fn start(self: &Arc<Self>, stop: StopSignal) -> Vec<JoinHandle<()>> {
        info!(
            devices = self.links.len(),
            primary_device = self.config.primary_device,
            "Starting dashboard"
        );
        self.links.spawn_all(
            Arc::clone(&self.pipeline),
            Arc::clone(self) as Arc<dyn PollSink>,
            stop,
        )
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn alarms(&self) -> &Arc<AlarmEngine> {
        &self.alarms
    }

    pub fn links(&self) -> &Arc<PlcLinkManager> {
        &self.links
    }

    pub fn pipeline(&self) -> &Arc<TagPipeline> {
        &self.pipeline
    }

    /// Tag values → alarms → OEE → cache, for one device's poll.
    pub fn process(&self, device_no: DeviceNo, values: TagValues) -> Arc<TagSnapshot> {
        self.alarms.process_tag_data(&values);
        ACTIVE_ALARMS.set(self.alarms.active_count() as i64);

        if let Some(map) = self.config.oee.as_ref().filter(|m| m.device_no == device_no) {
            let oee = map.calculate(&values);
            OEE_AVAILABILITY.set(oee.availability);
            OEE_PERFORMANCE.set(oee.performance);
            OEE_QUALITY.set(oee.quality);
            OEE_OVERALL.set(oee.overall);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.cache.publish(TagSnapshot {
            device_no,
            sequence,
            values,
        })
    }

    fn sync_decode_failures(&self) {
        let total = self.pipeline.decode_failures();
        let seen = self.decode_failures_seen.swap(total, Ordering::Relaxed);
        if total > seen {
            DECODE_FAILURES.inc_by(total - seen);
        }
    }
}

impl PollSink for Dashboard {
    fn on_poll(&self, device_no: DeviceNo, raw: RawRegisters) {
        let values = self.pipeline.apply(device_no, &raw);
        self.sync_decode_failures();
        let snapshot = self.process(device_no, values);
        debug!(
            device_no,
            sequence = snapshot.sequence,
            tags = snapshot.values.len(),
            "Snapshot published"
        );
    }

    fn on_link_state(&self, device_no: DeviceNo, state: LinkState) {
        debug!(device_no, state = state.as_str(), "Device link state changed");
    }
}

#[async_trait]
impl GatewayBackend for Dashboard {
    fn snapshot(&self) -> Option<Arc<TagSnapshot>> {
        self.cache.device_or_latest(self.config.primary_device)
    }

    async fn write_tag(&self, tag_id: TagId, value: DecodedValue) -> Result<(), WriteError> {
        match self.links.write_tag(&self.pipeline, tag_id, &value).await {
            Ok(tag) => {
                TAG_WRITES.with_label_values(&["ok"]).inc();
                info!(tag_id, device_no = tag.device_no, %value, "Tag written");
                self.cache.update_entry(tag.device_no, tag_id, value);
                Ok(())
            }
            Err(err) => {
                TAG_WRITES.with_label_values(&["error"]).inc();
                Err(err)
            }
        }
    }

    fn oee(&self) -> Option<OeeSnapshot> {
        let map = self.config.oee.as_ref()?;
        let values = self
            .cache
            .device(map.device_no)
            .map(|s| s.values.clone())
            .unwrap_or_default();
        Some(map.calculate(&values))
    }

    fn system_status(&self) -> Parameters {
        self.monitor.status()
    }

    fn acknowledge_alarm(&self, alarm_no: AlarmNo, user: &str) -> bool {
        let acknowledged = self.alarms.acknowledge(alarm_no, user);
        if !acknowledged {
            debug!(alarm_no, user, "Acknowledge rejected");
        }
        acknowledged
    }

    fn subscribe_alarms(&self) -> broadcast::Receiver<AlarmEvent> {
        self.events.subscribe()
    }
}
