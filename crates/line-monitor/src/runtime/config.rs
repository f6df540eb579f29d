use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub run_seconds: Option<u64>,
    /// Station file; the built-in demo station is used when absent.
    pub station_path: Option<PathBuf>,
    pub bind_addr: String,
    pub simulate: bool,
    pub json_logs: bool,
    pub metrics_addr: Option<String>,
    pub alarm_history: Option<PathBuf>,
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub io_timeout: Duration,
    pub reload_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            run_seconds: None,
            station_path: None,
            bind_addr: "127.0.0.1:7000".to_string(),
            simulate: false,
            json_logs: false,
            metrics_addr: None,
            alarm_history: None,
            poll_interval: Duration::from_millis(1000),
            reconnect_delay: Duration::from_millis(3000),
            io_timeout: Duration::from_millis(3000),
            reload_interval: Duration::from_millis(2000),
        }
    }
}

fn millis(value: &str, fallback: Duration) -> Duration {
    value
        .parse::<u64>()
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Self {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1);
            match (args[i].as_str(), value) {
                ("--station", Some(v)) => {
                    cfg.station_path = Some(PathBuf::from(v));
                    i += 1;
                }
                ("--bind", Some(v)) => {
                    cfg.bind_addr = v.clone();
                    i += 1;
                }
                ("--run-seconds", Some(v)) => {
                    cfg.run_seconds = v.parse::<u64>().ok();
                    i += 1;
                }
                ("--metrics-addr", Some(v)) => {
                    cfg.metrics_addr = Some(v.clone());
                    i += 1;
                }
                ("--alarm-history", Some(v)) => {
                    cfg.alarm_history = Some(PathBuf::from(v));
                    i += 1;
                }
                ("--poll-ms", Some(v)) => {
                    cfg.poll_interval = millis(v, cfg.poll_interval);
                    i += 1;
                }
                ("--reconnect-ms", Some(v)) => {
                    cfg.reconnect_delay = millis(v, cfg.reconnect_delay);
                    i += 1;
                }
                ("--io-timeout-ms", Some(v)) => {
                    cfg.io_timeout = millis(v, cfg.io_timeout);
                    i += 1;
                }
                ("--reload-ms", Some(v)) => {
                    cfg.reload_interval = millis(v, cfg.reload_interval);
                    i += 1;
                }
                ("--simulate", _) => {
                    cfg.simulate = true;
                }
                ("--json-logs", _) => {
                    cfg.json_logs = true;
                }
                ("--help" | "-h", _) => {
                    cfg.show_help = true;
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        cfg
    }

    pub fn print_help() {
        println!(
            r#"line-monitor - Production line monitoring and OEE dashboard backend

USAGE:
    line-monitor [OPTIONS]

OPTIONS:
    --station <PATH>        Station file (devices, tags, alarms, OEE map) in JSON
                            [default: built-in demo station]
    --simulate              Use simulated PLCs instead of Modbus TCP
    --bind <ADDR>           UI gateway bind address [default: 127.0.0.1:7000]
    --run-seconds <SECS>    Run for a fixed duration then exit
    --json-logs             Output logs in JSON format (for log aggregation)
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --alarm-history <PATH>  Append cleared alarms to a JSONL file
    --poll-ms <MS>          Poll interval per device [default: 1000]
    --reconnect-ms <MS>     Delay between reconnect attempts [default: 3000]
    --io-timeout-ms <MS>    Timeout for one PLC request [default: 3000]
    --reload-ms <MS>        Station file change check interval [default: 2000]
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,line_io=trace)

EXAMPLES:
    # Demo line with metrics
    line-monitor --simulate --metrics-addr 0.0.0.0:9090

    # Plant floor
    line-monitor --station /etc/line-monitor/station.json --json-logs \
        --alarm-history /var/log/line-monitor/alarms.jsonl
"#
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("line-monitor")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_arguments() {
        assert_eq!(RuntimeConfig::from_args(&args(&[])), RuntimeConfig::default());
    }

    #[test]
    fn parses_every_option() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--station",
            "station.json",
            "--simulate",
            "--bind",
            "0.0.0.0:7100",
            "--run-seconds",
            "5",
            "--json-logs",
            "--metrics-addr",
            "0.0.0.0:9090",
            "--alarm-history",
            "alarms.jsonl",
            "--poll-ms",
            "250",
            "--reconnect-ms",
            "500",
            "--io-timeout-ms",
            "750",
            "--reload-ms",
            "100",
        ]));
        assert_eq!(cfg.station_path, Some(PathBuf::from("station.json")));
        assert!(cfg.simulate);
        assert_eq!(cfg.bind_addr, "0.0.0.0:7100");
        assert_eq!(cfg.run_seconds, Some(5));
        assert!(cfg.json_logs);
        assert_eq!(cfg.metrics_addr.as_deref(), Some("0.0.0.0:9090"));
        assert_eq!(cfg.alarm_history, Some(PathBuf::from("alarms.jsonl")));
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.reconnect_delay, Duration::from_millis(500));
        assert_eq!(cfg.io_timeout, Duration::from_millis(750));
        assert_eq!(cfg.reload_interval, Duration::from_millis(100));
    }

    #[test]
    fn bad_durations_keep_defaults() {
        let cfg = RuntimeConfig::from_args(&args(&["--poll-ms", "0", "--io-timeout-ms", "soon"]));
        assert_eq!(cfg.poll_interval, Duration::from_millis(1000));
        assert_eq!(cfg.io_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn help_stops_parsing() {
        let cfg = RuntimeConfig::from_args(&args(&["-h", "--simulate"]));
        assert!(cfg.show_help);
        assert!(!cfg.simulate);
    }

    #[test]
    fn trailing_flag_without_value_is_ignored() {
        let cfg = RuntimeConfig::from_args(&args(&["--bind"]));
        assert_eq!(cfg.bind_addr, "127.0.0.1:7000");
    }
}
