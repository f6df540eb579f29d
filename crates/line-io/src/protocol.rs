//! Newline-framed JSON protocol spoken with UI clients.
//!
//! Requests: `{"RequestId": <int>, "Parameters": <object|null>}`.
//! Responses: `{"ResponseId": <int>, "Parameters": <object>, "Success": <bool>,
//! "ErrorMessage": <string>}` with absent parameters and error message
//! omitted. Response parameters are keyed by integer field codes.

use line_core::{AlarmEvent, AlarmNo, DecodedValue, OeeSnapshot, TagId, TagValues};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const REQ_SYSTEM_STATUS: i64 = 1;
pub const REQ_OEE: i64 = 4;
pub const REQ_SNAPSHOT: i64 = 5;
pub const REQ_WRITE_TAG: i64 = 6;
pub const REQ_ACK_ALARM: i64 = 7;
/// Unsolicited alarm lifecycle push.
pub const RESP_ALARM_EVENT: i64 = 8;
pub const RESP_UNKNOWN: i64 = -1;

/// Longest accepted request line, terminator excluded.
pub const MAX_LINE_BYTES: usize = 1 << 20;

pub type Parameters = BTreeMap<i64, Value>;

pub mod oee_field {
    pub const AVAILABILITY: i64 = 0;
    pub const PERFORMANCE: i64 = 1;
    pub const QUALITY: i64 = 2;
    pub const OVERALL: i64 = 3;
    pub const OPERATING_TIME_S: i64 = 4;
    pub const DOWN_TIME_S: i64 = 5;
    pub const OK_COUNT: i64 = 6;
    pub const NG_COUNT: i64 = 7;
    pub const TOTAL_COUNT: i64 = 8;
}

pub mod status_field {
    pub const UPTIME_S: i64 = 0;
    pub const DEVICES: i64 = 1;
    pub const CONNECTED_DEVICES: i64 = 2;
    pub const ACTIVE_ALARMS: i64 = 3;
    pub const UNACKNOWLEDGED_ALARMS: i64 = 4;
    pub const TAG_GENERATION: i64 = 5;
    pub const UI_CLIENTS: i64 = 6;
    pub const POLL_CYCLES: i64 = 7;
    /// `LINK_STATE_BASE + device_no` carries that device's link state name.
    pub const LINK_STATE_BASE: i64 = 1000;
}

pub mod alarm_field {
    pub const KIND: i64 = 0;
    pub const ALARM_NO: i64 = 1;
    pub const TEXT: i64 = 2;
    pub const SEVERITY: i64 = 3;
    pub const RAISED_AT: i64 = 4;
    pub const CLEARED_AT: i64 = 5;
    pub const ACKNOWLEDGED_AT: i64 = 6;
    pub const ACKNOWLEDGED_BY: i64 = 7;
    pub const INSTANCE_ID: i64 = 8;
    pub const TAG_ID: i64 = 9;
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("request line is not valid UTF-8")]
    Utf8,
    #[error("request line exceeds {limit} bytes")]
    Oversized { limit: usize },
}

/// Problems with the parameters of an otherwise well-formed request.
#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("missing parameters")]
    MissingParameters,
    #[error("expected exactly one parameter, got {0}")]
    ExpectedSingleEntry(usize),
    #[error("invalid key {0:?}")]
    InvalidKey(String),
    #[error("unsupported value for key {0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    pub request_id: i64,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line)?)
    }

    fn single_entry(&self) -> Result<(&String, &Value), RequestError> {
        let params = self
            .parameters
            .as_ref()
            .ok_or(RequestError::MissingParameters)?;
        match params.len() {
            1 => params.iter().next().ok_or(RequestError::ExpectedSingleEntry(0)),
            n => Err(RequestError::ExpectedSingleEntry(n)),
        }
    }

    /// `{"<tagId>": <value>}` of a write request, value kind sniffed from JSON.
    pub fn write_target(&self) -> Result<(TagId, DecodedValue), RequestError> {
        let (key, value) = self.single_entry()?;
        let tag_id = key
            .trim()
            .parse::<TagId>()
            .map_err(|_| RequestError::InvalidKey(key.clone()))?;
        let value =
            DecodedValue::from_json(value).ok_or_else(|| RequestError::InvalidValue(key.clone()))?;
        Ok((tag_id, value))
    }

    /// `{"<alarmNo>": "<user>"}` of an acknowledge request.
    pub fn ack_target(&self) -> Result<(AlarmNo, String), RequestError> {
        let (key, value) = self.single_entry()?;
        let alarm_no = key
            .trim()
            .parse::<AlarmNo>()
            .map_err(|_| RequestError::InvalidKey(key.clone()))?;
        let user = match value {
            Value::String(user) => user.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        Ok((alarm_no, user))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    pub response_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Response {
    pub fn with_parameters(response_id: i64, parameters: Parameters) -> Self {
        Self {
            response_id,
            parameters: Some(parameters),
            success: true,
            error_message: None,
        }
    }

    /// Success or failure without payload.
    pub fn status(response_id: i64, success: bool) -> Self {
        Self {
            response_id,
            parameters: None,
            success,
            error_message: None,
        }
    }

    pub fn failure(response_id: i64, message: impl Into<String>) -> Self {
        Self {
            response_id,
            parameters: None,
            success: false,
            error_message: Some(message.into()),
        }
    }

    pub fn unknown(request_id: i64) -> Self {
        Self {
            response_id: RESP_UNKNOWN,
            parameters: Some(Parameters::new()),
            success: false,
            error_message: Some(format!("unknown request id {request_id}")),
        }
    }

    /// One wire line including the `\n` terminator.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Tag id → value.
pub fn snapshot_parameters(values: &TagValues) -> Parameters {
    values
        .iter()
        .map(|(id, value)| (i64::from(*id), value.to_json()))
        .collect()
}

pub fn oee_parameters(oee: &OeeSnapshot) -> Parameters {
    use oee_field::*;
    Parameters::from([
        (AVAILABILITY, Value::from(oee.availability)),
        (PERFORMANCE, Value::from(oee.performance)),
        (QUALITY, Value::from(oee.quality)),
        (OVERALL, Value::from(oee.overall)),
        (OPERATING_TIME_S, Value::from(oee.operating_time_s)),
        (DOWN_TIME_S, Value::from(oee.down_time_s)),
        (OK_COUNT, Value::from(oee.ok_count)),
        (NG_COUNT, Value::from(oee.ng_count)),
        (TOTAL_COUNT, Value::from(oee.total_count)),
    ])
}

pub fn alarm_event_response(event: &AlarmEvent) -> Response {
    use alarm_field::*;
    let instance = &event.instance;
    let optional = |v: Option<String>| v.map(Value::from).unwrap_or(Value::Null);
    let params = Parameters::from([
        (KIND, Value::from(event.kind.as_str())),
        (ALARM_NO, Value::from(instance.alarm_no)),
        (TEXT, Value::from(instance.text.as_str())),
        (SEVERITY, Value::from(instance.severity.as_str())),
        (RAISED_AT, Value::from(instance.raised_at.to_rfc3339())),
        (CLEARED_AT, optional(instance.cleared_at.map(|t| t.to_rfc3339()))),
        (
            ACKNOWLEDGED_AT,
            optional(instance.acknowledged_at.map(|t| t.to_rfc3339())),
        ),
        (ACKNOWLEDGED_BY, optional(instance.acknowledged_by.clone())),
        (INSTANCE_ID, Value::from(instance.id.to_string())),
        (TAG_ID, Value::from(instance.tag_id)),
    ]);
    Response::with_parameters(RESP_ALARM_EVENT, params)
}

/// Connection-local byte buffer that yields one item per `\n`.
///
/// A `\r` right before the terminator is stripped and blank lines are
/// skipped. A line that grows past the limit without a terminator is
/// reported once as [`ProtocolError::Oversized`] and discarded up to its
/// eventual newline.
#[derive(Debug)]
pub struct LineAccumulator {
    buf: Vec<u8>,
    /// Bytes of `buf` already searched for a terminator.
    scanned: usize,
    limit: usize,
    discarding: bool,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            scanned: 0,
            limit,
            discarding: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, ProtocolError>> {
        let mut out = Vec::new();
        self.buf.extend_from_slice(bytes);

        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            self.scanned = end + 1;
            let line = &self.buf[start..end];
            start = end + 1;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.len() > self.limit {
                out.push(Err(ProtocolError::Oversized { limit: self.limit }));
                continue;
            }
            match std::str::from_utf8(line) {
                Ok(text) if text.trim().is_empty() => {}
                Ok(text) => out.push(Ok(text.to_string())),
                Err(_) => out.push(Err(ProtocolError::Utf8)),
            }
        }
        self.buf.drain(..start);
        self.scanned -= start;

        if self.discarding {
            self.clear();
        } else if self.buf.len() > self.limit {
            out.push(Err(ProtocolError::Oversized { limit: self.limit }));
            self.clear();
            self.discarding = true;
        }
        out
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }
}

impl Default for LineAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(acc: &mut LineAccumulator, bytes: &[u8]) -> Vec<String> {
        acc.push(bytes).into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn byte_by_byte_yields_requests_in_order() {
        let stream = b"{\"RequestId\":5}\r\n{\"RequestId\":6,\"Parameters\":{\"10\":true}}\n";
        let mut acc = LineAccumulator::new();
        let mut seen = Vec::new();
        for b in stream.iter() {
            seen.extend(lines(&mut acc, std::slice::from_ref(b)));
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(Request::parse(&seen[0]).unwrap().request_id, 5);
        let write = Request::parse(&seen[1]).unwrap();
        assert_eq!(write.request_id, 6);
        assert_eq!(write.write_target().unwrap(), (10, DecodedValue::Bool(true)));
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut acc = LineAccumulator::new();
        assert_eq!(lines(&mut acc, b"\n\r\n  \n{\"RequestId\":1}\n"), vec!["{\"RequestId\":1}"]);
    }

    #[test]
    fn oversized_line_is_reported_once_and_discarded() {
        let mut acc = LineAccumulator::with_limit(8);
        let out = acc.push(b"0123456789");
        assert!(matches!(out.as_slice(), [Err(ProtocolError::Oversized { limit: 8 })]));
        assert!(acc.push(b"abcdef").is_empty());
        let out = acc.push(b"tail\n{\"a\":1}\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap(), "{\"a\":1}");
    }

    #[test]
    fn partial_line_is_scanned_once() {
        let mut acc = LineAccumulator::new();
        let started = std::time::Instant::now();
        for _ in 0..256 * 1024 {
            assert!(acc.push(b"x").is_empty());
        }
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(acc.scanned, acc.pending());

        let out = acc.push(b"\n{\"RequestId\":1}\n");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().len(), 256 * 1024);
        assert_eq!(out[1].as_ref().unwrap(), "{\"RequestId\":1}");
        assert_eq!((acc.pending(), acc.scanned), (0, 0));
    }

    #[test]
    fn write_success_matches_wire_format() {
        let line = Response::status(REQ_WRITE_TAG, true).to_line().unwrap();
        assert_eq!(line, "{\"ResponseId\":6,\"Success\":true}\n");
    }

    #[test]
    fn unknown_request_has_empty_parameters() {
        let value = serde_json::to_value(Response::unknown(42)).unwrap();
        assert_eq!(value["ResponseId"], -1);
        assert_eq!(value["Parameters"], serde_json::json!({}));
        assert_eq!(value["Success"], false);
    }

    #[test]
    fn null_parameters_are_accepted() {
        let req = Request::parse("{\"RequestId\":4,\"Parameters\":null}").unwrap();
        assert_eq!(req.request_id, 4);
        assert!(req.parameters.is_none());
        assert_eq!(req.write_target(), Err(RequestError::MissingParameters));
    }

    #[test]
    fn write_target_rejects_bad_shapes() {
        let req = Request::parse(r#"{"RequestId":6,"Parameters":{"x":1}}"#).unwrap();
        assert_eq!(req.write_target(), Err(RequestError::InvalidKey("x".into())));
        let req = Request::parse(r#"{"RequestId":6,"Parameters":{"1":1,"2":2}}"#).unwrap();
        assert_eq!(req.write_target(), Err(RequestError::ExpectedSingleEntry(2)));
        let req = Request::parse(r#"{"RequestId":6,"Parameters":{"1":[1]}}"#).unwrap();
        assert_eq!(req.write_target(), Err(RequestError::InvalidValue("1".into())));
    }

    #[test]
    fn ack_target_reads_user() {
        let req = Request::parse(r#"{"RequestId":7,"Parameters":{"3":"alice"}}"#).unwrap();
        assert_eq!(req.ack_target().unwrap(), (3, "alice".to_string()));
    }

    #[test]
    fn oee_parameters_use_field_codes() {
        let oee = OeeSnapshot {
            availability: 0.5,
            total_count: 10,
            ..Default::default()
        };
        let params = oee_parameters(&oee);
        assert_eq!(params[&oee_field::AVAILABILITY], 0.5);
        assert_eq!(params[&oee_field::TOTAL_COUNT], 10);
        assert_eq!(params.len(), 9);
    }
}
