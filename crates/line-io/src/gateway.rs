//! UI Protocol Gateway: one task per client connection.
//!
//! Requests on a connection are answered strictly in order. Alarm events are
//! pushed between requests. A malformed line is logged and dropped; only a
//! transport failure closes the connection, and only that one.

use crate::metrics::{GATEWAY_CLIENTS, GATEWAY_REQUESTS, PROTOCOL_ERRORS};
use crate::plc_link::WriteError;
use crate::protocol::{
    alarm_event_response, oee_parameters, snapshot_parameters, status_field, LineAccumulator,
    Parameters, Request, Response, MAX_LINE_BYTES, REQ_ACK_ALARM, REQ_OEE, REQ_SNAPSHOT,
    REQ_SYSTEM_STATUS, REQ_WRITE_TAG, RESP_UNKNOWN,
};
use crate::shutdown::StopSignal;
use async_trait::async_trait;
use line_core::{AlarmEvent, AlarmNo, DecodedValue, OeeSnapshot, TagId, TagSnapshot};
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What the gateway serves; implemented by the dashboard orchestrator.
#[async_trait]
pub trait GatewayBackend: Send + Sync {
    /// Snapshot of the primary device, or the most recent of any device.
    fn snapshot(&self) -> Option<Arc<TagSnapshot>>;

    /// Write through the PLC link and patch the cached snapshot.
    async fn write_tag(&self, tag_id: TagId, value: DecodedValue) -> Result<(), WriteError>;

    /// `None` when no OEE tag map is configured.
    fn oee(&self) -> Option<OeeSnapshot>;

    fn system_status(&self) -> Parameters;

    fn acknowledge_alarm(&self, alarm_no: AlarmNo, user: &str) -> bool;

    fn subscribe_alarms(&self) -> broadcast::Receiver<AlarmEvent>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub max_line_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7000".to_string(),
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

pub struct Gateway {
    backend: Arc<dyn GatewayBackend>,
    config: GatewayConfig,
    clients: AtomicUsize,
    next_connection: AtomicU64,
}

impl Gateway {
    pub fn new(backend: Arc<dyn GatewayBackend>, config: GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            config,
            clients: AtomicUsize::new(0),
            next_connection: AtomicU64::new(1),
        })
    }

    pub async fn bind(&self) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "UI gateway listening");
        Ok(listener)
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    /// Accept loop. Returns after `stop` fires and every connection has closed.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut stop: StopSignal) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gateway = Arc::clone(&self);
                        let stop = stop.clone();
                        connections.spawn(async move {
                            gateway.serve_connection(stream, peer, stop).await
                        });
                    }
                    Err(err) => warn!(error = %err, "UI gateway accept error"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = stop.stopped() => break,
            }
        }
        drop(listener);
        while connections.join_next().await.is_some() {}
        info!("UI gateway stopped");
    }

    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr, mut stop: StopSignal) {
        let conn_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let clients = self.clients.fetch_add(1, Ordering::Relaxed) + 1;
        GATEWAY_CLIENTS.set(clients as i64);
        info!(conn_id, %peer, clients, "UI client connected");

        if let Err(err) = stream.set_nodelay(true) {
            debug!(conn_id, error = %err, "Cannot disable Nagle on UI connection");
        }
        let (mut reader, mut writer) = stream.into_split();
        let mut events = self.backend.subscribe_alarms();
        let mut events_open = true;
        let mut framer = LineAccumulator::with_limit(self.config.max_line_bytes);
        let mut buf = vec![0u8; 4096];

        let outcome: io::Result<()> = loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break Ok(()),
                        Ok(n) => n,
                        Err(err) => break Err(err),
                    };
                    let handled = self
                        .handle_bytes(conn_id, &mut framer, &buf[..n], &mut writer)
                        .await;
                    if let Err(err) = handled {
                        break Err(err);
                    }
                }
                event = events.recv(), if events_open => match event {
                    Ok(event) => {
                        if let Err(err) = send(&mut writer, &alarm_event_response(&event)).await {
                            break Err(err);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(conn_id, skipped, "UI client fell behind alarm events");
                    }
                    Err(RecvError::Closed) => events_open = false,
                },
                _ = stop.stopped() => break Ok(()),
            }
        };

        match outcome {
            Ok(()) => info!(conn_id, %peer, "UI client disconnected"),
            Err(err) => warn!(conn_id, %peer, error = %err, "UI client connection closed"),
        }
        let clients = self.clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        GATEWAY_CLIENTS.set(clients as i64);
    }

    async fn handle_bytes(
        &self,
        conn_id: u64,
        framer: &mut LineAccumulator,
        bytes: &[u8],
        writer: &mut OwnedWriteHalf,
    ) -> io::Result<()> {
        for line in framer.push(bytes) {
            let request = match line.and_then(|text| Request::parse(&text)) {
                Ok(request) => request,
                Err(err) => {
                    PROTOCOL_ERRORS.inc();
                    warn!(conn_id, error = %err, "Discarding UI request line");
                    continue;
                }
            };
            debug!(conn_id, request_id = request.request_id, "UI request");
            let response = self.dispatch(&request).await;
            send(writer, &response).await?;
        }
        Ok(())
    }

    /// Route one request to the backend.
    pub async fn dispatch(&self, request: &Request) -> Response {
        let id = request.request_id;
        let label = match id {
            REQ_SYSTEM_STATUS | REQ_OEE | REQ_SNAPSHOT | REQ_WRITE_TAG | REQ_ACK_ALARM => id,
            _ => RESP_UNKNOWN,
        };
        GATEWAY_REQUESTS
            .with_label_values(&[label.to_string().as_str()])
            .inc();

        match id {
            REQ_SYSTEM_STATUS => {
                let mut params = self.backend.system_status();
                params.insert(status_field::UI_CLIENTS, Value::from(self.client_count()));
                Response::with_parameters(id, params)
            }
            REQ_OEE => match self.backend.oee() {
                Some(oee) => Response::with_parameters(id, oee_parameters(&oee)),
                None => Response::failure(id, "OEE is not configured"),
            },
            REQ_SNAPSHOT => {
                let params = self
                    .backend
                    .snapshot()
                    .map(|s| snapshot_parameters(&s.values))
                    .unwrap_or_default();
                Response::with_parameters(id, params)
            }
            REQ_WRITE_TAG => {
                let (tag_id, value) = match request.write_target() {
                    Ok(target) => target,
                    Err(err) => return Response::failure(id, err.to_string()),
                };
                match self.backend.write_tag(tag_id, value).await {
                    Ok(()) => Response::status(id, true),
                    Err(err) => {
                        warn!(tag_id, error = %err, "Tag write failed");
                        Response::failure(id, err.to_string())
                    }
                }
            }
            REQ_ACK_ALARM => match request.ack_target() {
                Ok((alarm_no, user)) => {
                    Response::status(id, self.backend.acknowledge_alarm(alarm_no, &user))
                }
                Err(err) => Response::failure(id, err.to_string()),
            },
            other => Response::unknown(other),
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, response: &Response) -> io::Result<()> {
    let line = response
        .to_line()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(line.as_bytes()).await
}
