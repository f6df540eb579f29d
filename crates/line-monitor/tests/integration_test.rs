use line_core::DecodedValue;
use line_io::protocol::{oee_field, status_field};
use line_monitor::runtime::{start, MonitorHandle, RuntimeConfig};
use serde_json::Value;
use std::io::{BufRead, BufReader as StdBufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

const STATION: &str = r#"{
    "devices": [{"device_no": 1, "address": "127.0.0.1", "protocol": "simulated"}],
    "tags": [
        {"id": 1, "device_no": 1, "address": 0, "data_type": "int16"},
        {"id": 2, "device_no": 1, "address": 1, "data_type": "int16"},
        {"id": 3, "device_no": 1, "address": 2, "data_type": "int16"},
        {"id": 4, "device_no": 1, "address": 3, "data_type": "int16"},
        {"id": 5, "device_no": 1, "address": 4, "data_type": "int16"},
        {"id": 6, "device_no": 1, "address": 5, "data_type": "int16"},
        {"id": 10, "name": "Line speed", "device_no": 1, "address": 100,
         "data_type": "int16", "scale": "linear", "offset": 0.0, "span": 100.0,
         "writable": true}
    ],
    "alarms": [{"alarm_no": 1, "tag_id": 10, "bit": "1", "text": "Line moving"}],
    "oee": {"operating_time": 1, "down_time": 2, "ok_count": 3, "ng_count": 4,
            "total_count": 5, "ideal_cycle_time": 6}
}"#;

fn write_station(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("station.json");
    std::fs::write(&path, STATION).unwrap();
    path
}

async fn start_monitor(dir: &TempDir) -> MonitorHandle {
    let config = RuntimeConfig {
        station_path: Some(write_station(dir.path())),
        bind_addr: "127.0.0.1:0".to_string(),
        simulate: true,
        poll_interval: Duration::from_millis(20),
        reconnect_delay: Duration::from_millis(20),
        io_timeout: Duration::from_millis(500),
        reload_interval: Duration::from_millis(50),
        ..RuntimeConfig::default()
    };
    start(&config).await.unwrap()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn speed(handle: &MonitorHandle) -> Option<f64> {
    handle
        .dashboard
        .cache()
        .device(1)
        .and_then(|s| s.values.get(&10).and_then(DecodedValue::as_f64))
}

struct UiClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl UiClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = tokio::net::TcpStream::connect(addr)
            .await
            .unwrap()
            .into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn line(&mut self, request: &str) -> String {
        self.writer.write_all(request.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.read_line().await
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), self.reader.read_line(&mut line))
            .await
            .expect("response in time")
            .unwrap();
        line
    }

    async fn request(&mut self, request: &str) -> Value {
        serde_json::from_str(&self.line(request).await).unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn polled_values_flow_to_cache_alarms_and_ui() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_monitor(&dir).await;
    let plc = handle.simulated[&1].clone();
    plc.set_register(100, 32767);

    eventually("scaled speed", || {
        speed(&handle).is_some_and(|v| (v - 49.999).abs() < 0.01)
    })
    .await;
    assert!(handle.dashboard.alarms().is_active(1));

    let mut ui = UiClient::connect(handle.gateway_addr).await;
    let snapshot = ui.request(r#"{"RequestId":5}"#).await;
    assert_eq!(snapshot["ResponseId"], 5);
    assert_eq!(snapshot["Success"], true);
    let shown = snapshot["Parameters"]["10"].as_f64().unwrap();
    assert!((shown - 49.999).abs() < 0.01);

    assert_eq!(
        ui.line(r#"{"RequestId":6,"Parameters":{"10":true}}"#).await,
        "{\"ResponseId\":6,\"Success\":true}\n"
    );
    // 1.0 % of span on the unsigned raw range.
    assert_eq!(plc.register(100), 655);
    eventually("polled write", || {
        speed(&handle).is_some_and(|v| (v - 0.9995).abs() < 0.01)
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oee_status_and_acknowledge_over_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_monitor(&dir).await;
    let plc = handle.simulated[&1].clone();
    // operating 100 s, down 0 s, 9 ok, 1 ng, 10 total, 5 s ideal cycle.
    plc.set_registers(0, &[100, 0, 9, 1, 10, 5]);
    plc.set_register(100, 1000);

    eventually("alarm raised", || handle.dashboard.alarms().is_active(1)).await;
    let mut ui = UiClient::connect(handle.gateway_addr).await;

    let oee = ui.request(r#"{"RequestId":4}"#).await;
    let field = |code: i64| oee["Parameters"][code.to_string()].as_f64().unwrap();
    assert_eq!(oee["Success"], true);
    assert_eq!(field(oee_field::AVAILABILITY), 1.0);
    assert!((field(oee_field::PERFORMANCE) - 0.5).abs() < 1e-9);
    assert!((field(oee_field::QUALITY) - 0.9).abs() < 1e-9);
    assert!((field(oee_field::OVERALL) - 0.45).abs() < 1e-9);
    assert_eq!(field(oee_field::TOTAL_COUNT), 10.0);

    let status = ui.request(r#"{"RequestId":1}"#).await;
    let params = &status["Parameters"];
    assert_eq!(params[status_field::DEVICES.to_string()], 1);
    assert_eq!(params[status_field::CONNECTED_DEVICES.to_string()], 1);
    assert_eq!(params[status_field::ACTIVE_ALARMS.to_string()], 1);
    assert_eq!(params[status_field::UI_CLIENTS.to_string()], 1);
    let link = params[(status_field::LINK_STATE_BASE + 1).to_string()]
        .as_str()
        .unwrap()
        .to_string();
    assert!(link == "polling" || link == "connected", "link state {link}");

    let ack = ui
        .request(r#"{"RequestId":7,"Parameters":{"1":"operator"}}"#)
        .await;
    assert_eq!(ack["ResponseId"], 7);
    assert_eq!(ack["Success"], true);
    let push: Value = serde_json::from_str(&ui.read_line().await).unwrap();
    assert_eq!(push["ResponseId"], 8);
    assert_eq!(push["Parameters"]["0"], "Acknowledged");
    assert_eq!(push["Parameters"]["7"], "operator");

    let again = ui
        .request(r#"{"RequestId":7,"Parameters":{"1":"operator"}}"#)
        .await;
    assert_eq!(again["Success"], false);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_plc_reconnects_and_keeps_last_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_monitor(&dir).await;
    let plc = handle.simulated[&1].clone();
    plc.set_register(100, 32767);
    eventually("first poll", || speed(&handle).is_some()).await;

    plc.set_online(false);
    let links = handle.dashboard.links();
    eventually("disconnect", || links.connected_count() == 0).await;
    assert!(speed(&handle).is_some(), "cache survives a lost link");

    plc.set_register(100, 0);
    plc.set_online(true);
    eventually("reconnect", || speed(&handle) == Some(0.0)).await;
    handle.shutdown().await;
}

struct MonitorProcess {
    child: Child,
    addr: String,
}

impl MonitorProcess {
    fn start() -> Self {
        let bin_path = env!("CARGO_BIN_EXE_line-monitor");

        let listener = TcpListener::bind("127.0.0.1:0")
            .expect("Failed to bind ephemeral port for integration test");
        let addr = listener
            .local_addr()
            .expect("Failed to resolve bound address");
        let bind_addr = format!("127.0.0.1:{}", addr.port());
        drop(listener);

        let child = Command::new(bin_path)
            .args(["--simulate", "--bind", &bind_addr, "--run-seconds", "30"])
            .spawn()
            .expect("Failed to start line-monitor");

        // Loop until port is open (up to 5s)
        let start = Instant::now();
        while start.elapsed().as_secs() < 5 {
            if TcpStream::connect(&bind_addr).is_ok() {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        Self {
            child,
            addr: bind_addr,
        }
    }
}

impl Drop for MonitorProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

#[test]
fn demo_binary_answers_status_requests() {
    let monitor = MonitorProcess::start();
    let mut stream = TcpStream::connect(&monitor.addr).expect("Failed to connect to gateway");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reader = StdBufReader::new(stream.try_clone().unwrap());

    writeln!(stream, "{{\"RequestId\":1}}").unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let status: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(status["ResponseId"], 1);
    assert_eq!(status["Success"], true);
    assert_eq!(status["Parameters"][status_field::DEVICES.to_string()], 1);

    writeln!(stream, "{{\"RequestId\":42}}").unwrap();
    line.clear();
    reader.read_line(&mut line).unwrap();
    let unknown: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(unknown["ResponseId"], -1);
    assert_eq!(unknown["Success"], false);
}
