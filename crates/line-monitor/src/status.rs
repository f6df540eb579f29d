use line_core::{AlarmEngine, TagPipeline, TimeBase};
use line_io::metrics::total_poll_cycles;
use line_io::protocol::{status_field, Parameters};
use line_io::PlcLinkManager;
use serde_json::Value;
use std::sync::Arc;

/// Computes the status map answered to "system status" requests.
pub trait SystemMonitor: Send + Sync {
    fn status(&self) -> Parameters;
}

/// Status of this process: uptime, links, alarms and tag generation.
pub struct RuntimeMonitor {
    timebase: TimeBase,
    links: Arc<PlcLinkManager>,
    alarms: Arc<AlarmEngine>,
    pipeline: Arc<TagPipeline>,
}

impl RuntimeMonitor {
    pub fn new(
        timebase: TimeBase,
        links: Arc<PlcLinkManager>,
        alarms: Arc<AlarmEngine>,
        pipeline: Arc<TagPipeline>,
    ) -> Self {
        Self {
            timebase,
            links,
            alarms,
            pipeline,
        }
    }
}

impl SystemMonitor for RuntimeMonitor {
    fn status(&self) -> Parameters {
        use status_field::*;
        let mut params = Parameters::from([
            (UPTIME_S, Value::from(self.timebase.uptime().as_secs())),
            (DEVICES, Value::from(self.links.len())),
            (CONNECTED_DEVICES, Value::from(self.links.connected_count())),
            (ACTIVE_ALARMS, Value::from(self.alarms.active_count())),
            (
                UNACKNOWLEDGED_ALARMS,
                Value::from(self.alarms.unacknowledged_count()),
            ),
            (TAG_GENERATION, Value::from(self.pipeline.current().generation())),
            (POLL_CYCLES, Value::from(total_poll_cycles())),
        ]);
        for (device_no, state) in self.links.states() {
            params.insert(
                LINK_STATE_BASE + i64::from(device_no),
                Value::from(state.as_str()),
            );
        }
        params
    }
}
