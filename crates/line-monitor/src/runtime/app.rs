use crate::dashboard::{Dashboard, DashboardConfig};
use crate::infra::alarm_history::AlarmHistory;
use crate::infra::station::{
    demo_station, watch_tags, ConfigProvider, StaticStation, StationError, StationFile,
};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use crate::simulation::LineSimulator;
use futures::future::join_all;
use line_core::{AlarmEngine, ConfigError, DeviceNo, ProtocolKind, TagPipeline, TimeBase};
use line_io::{
    stop_channel, Connector, Gateway, GatewayBackend, GatewayConfig, LinkConfig,
    ModbusConnector, PlcLinkManager, SimConnector, SimulatedPlc, StopTrigger,
};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Simulated time advances one second per tick of this period.
const LINE_SIMULATOR_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Station(#[from] StationError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to open alarm history {path}: {source}")]
    AlarmHistory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind UI gateway on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// A running monitor: every task spawned by [`start`].
pub struct MonitorHandle {
    pub gateway_addr: SocketAddr,
    pub dashboard: Arc<Dashboard>,
    /// Simulated controllers by device number, empty when talking Modbus.
    pub simulated: BTreeMap<DeviceNo, SimulatedPlc>,
    trigger: StopTrigger,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop every task and wait for them to finish.
    pub async fn shutdown(self) {
        self.trigger.trigger();
        for result in join_all(self.tasks).await {
            if let Err(err) = result {
                warn!(error = %err, "Task ended abnormally");
            }
        }
        info!("Monitor stopped");
    }
}

pub fn run_from_args() {
    let config = RuntimeConfig::from_env();
    if config.show_help {
        RuntimeConfig::print_help();
        return;
    }
    if let Err(err) = run(config) {
        error!(error = %err, "line-monitor failed");
        eprintln!("line-monitor: {err}");
        std::process::exit(1);
    }
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    let _log_guard = init_tracing(config.json_logs);

    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("line-monitor")
        .build()
        .map_err(AppError::Runtime)?;

    runtime.block_on(async {
        let handle = start(&config).await?;
        info!(
            gateway = %handle.gateway_addr,
            devices = handle.dashboard.links().len(),
            "line-monitor running. Connect the dashboard UI to the gateway."
        );

        match config.run_seconds {
            Some(seconds) => {
                info!(seconds, "Running for limited duration");
                tokio::time::sleep(Duration::from_secs(seconds)).await;
            }
            None => {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "Cannot listen for Ctrl-C, stopping");
                }
            }
        }

        let alarms = handle.dashboard.alarms().active_count();
        handle.shutdown().await;
        info!(active_alarms = alarms, "Run complete");
        Ok(())
    })
}

/// Build and spawn the whole monitor inside the current tokio runtime.
pub async fn start(config: &RuntimeConfig) -> Result<MonitorHandle, AppError> {
    let provider: Arc<dyn ConfigProvider> = match &config.station_path {
        Some(path) => {
            info!(path = %path.display(), "Loading station file");
            Arc::new(StationFile::new(path))
        }
        None => {
            info!("No station file given, using the demo station");
            Arc::new(StaticStation(demo_station()))
        }
    };
    let station = provider.station()?;
    let timebase = TimeBase::new();

    let pipeline = Arc::new(TagPipeline::new(station.tags.clone())?);
    let alarms = Arc::new(AlarmEngine::new(station.alarms.clone())?);
    if let Some(path) = &config.alarm_history {
        let history = AlarmHistory::new(path).map_err(|source| AppError::AlarmHistory {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "Alarm history enabled");
        alarms.add_listener(Arc::new(history));
    }

    let simulated: BTreeMap<DeviceNo, SimulatedPlc> = station
        .devices
        .iter()
        .filter(|d| d.enabled && (config.simulate || d.protocol == ProtocolKind::Simulated))
        .map(|d| (d.device_no, SimulatedPlc::new()))
        .collect();
    let link_config = LinkConfig {
        poll_interval: config.poll_interval,
        reconnect_delay: config.reconnect_delay,
        io_timeout: config.io_timeout,
    };
    let links = Arc::new(PlcLinkManager::new(&station.devices, link_config, |device| {
        let connector: Arc<dyn Connector> = match simulated.get(&device.device_no) {
            Some(plc) => Arc::new(SimConnector::new(plc.clone())),
            None => Arc::new(ModbusConnector),
        };
        connector
    }));

    let dashboard = Dashboard::new(
        Arc::clone(&pipeline),
        alarms,
        links,
        DashboardConfig {
            primary_device: station.primary_device(),
            oee: station.oee.clone(),
        },
        timebase,
    );

    let gateway = Gateway::new(
        Arc::clone(&dashboard) as Arc<dyn GatewayBackend>,
        GatewayConfig {
            bind_addr: config.bind_addr.clone(),
            ..GatewayConfig::default()
        },
    );
    let listener = gateway.bind().await.map_err(|source| AppError::Bind {
        addr: config.bind_addr.clone(),
        source,
    })?;
    let gateway_addr = listener.local_addr().map_err(|source| AppError::Bind {
        addr: config.bind_addr.clone(),
        source,
    })?;

    let (trigger, stop) = stop_channel();
    let mut tasks = dashboard.start(stop.clone());
    tasks.push(tokio::spawn(gateway.serve(listener, stop.clone())));
    tasks.push(tokio::spawn(watch_tags(
        Arc::clone(&provider),
        pipeline,
        config.reload_interval,
        stop.clone(),
    )));

    // The line simulator only knows the demo station's register layout.
    if config.station_path.is_none() {
        for plc in simulated.values() {
            let sim = LineSimulator::new(plc.clone());
            tasks.push(tokio::spawn(sim.run(LINE_SIMULATOR_PERIOD, stop.clone())));
        }
    }

    Ok(MonitorHandle {
        gateway_addr,
        dashboard,
        simulated,
        trigger,
        tasks,
    })
}
