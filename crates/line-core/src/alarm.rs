//! Edge-triggered alarm evaluation.
//!
//! Each configured alarm watches one tag. An alarm raises once when its
//! condition becomes true and clears once when it becomes false again;
//! acknowledging is orthogonal and never clears. Listeners are notified
//! after the active-set lock has been released.

use crate::pipeline::{ConfigError, TagValues};
use crate::tags::{AlarmCondition, AlarmDefinition, AlarmNo, Severity, TagId};
use crate::value::DecodedValue;
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// One raise-to-clear lifetime of a configured alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmInstance {
    pub id: Uuid,
    pub alarm_no: AlarmNo,
    pub tag_id: TagId,
    pub text: String,
    pub severity: Severity,
    pub raised_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
}

impl AlarmInstance {
    fn raise(def: &AlarmDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            alarm_no: def.alarm_no,
            tag_id: def.tag_id,
            text: def.text.clone(),
            severity: def.severity,
            raised_at: now,
            cleared_at: None,
            acknowledged_at: None,
            acknowledged_by: None,
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmEventKind {
    Raised,
    Cleared,
    Acknowledged,
}

impl AlarmEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmEventKind::Raised => "Raised",
            AlarmEventKind::Cleared => "Cleared",
            AlarmEventKind::Acknowledged => "Acknowledged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub kind: AlarmEventKind,
    pub instance: AlarmInstance,
}

#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("alarm listener {listener} failed: {reason}")]
    Listener {
        listener: &'static str,
        reason: String,
    },
}

/// Receives alarm lifecycle events.
pub trait AlarmListener: Send + Sync {
    fn name(&self) -> &'static str;
    fn on_alarm_event(&self, event: &AlarmEvent) -> Result<(), AlarmError>;
}

/// Condition of one alarm against the current value of its tag.
pub fn evaluate(condition: AlarmCondition, value: &DecodedValue) -> bool {
    if let DecodedValue::Bool(b) = value {
        return *b;
    }
    if let AlarmCondition::Bit(bit) = condition {
        if bit <= 15 {
            if let Some(word) = value.as_bit_word() {
                return (word >> bit) & 1 == 1;
            }
        }
    }
    value.as_f64().is_some_and(|v| v != 0.0)
}

pub struct AlarmEngine {
    by_tag: HashMap<TagId, Vec<AlarmDefinition>>,
    active: Mutex<HashMap<AlarmNo, AlarmInstance>>,
    listeners: RwLock<Vec<Arc<dyn AlarmListener>>>,
}

impl AlarmEngine {
    pub fn new(definitions: Vec<AlarmDefinition>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut by_tag: HashMap<TagId, Vec<AlarmDefinition>> = HashMap::new();
        for def in definitions {
            if !seen.insert(def.alarm_no) {
                return Err(ConfigError::DuplicateAlarm(def.alarm_no));
            }
            by_tag.entry(def.tag_id).or_default().push(def);
        }
        Ok(Self {
            by_tag,
            active: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn AlarmListener>) {
        self.listeners.write().push(listener);
    }

    /// Evaluate every alarm whose tag appears in `values`.
    ///
    /// Returns the number of raise/clear transitions.
    pub fn process_tag_data(&self, values: &TagValues) -> usize {
        let now = Utc::now();
        let mut events = Vec::new();
        {
            let mut active = self.active.lock();
            for (tag_id, value) in values {
                let Some(defs) = self.by_tag.get(tag_id) else {
                    continue;
                };
                for def in defs {
                    let condition = evaluate(def.condition, value);
                    let is_active = active.contains_key(&def.alarm_no);
                    if condition && !is_active {
                        let instance = AlarmInstance::raise(def, now);
                        active.insert(def.alarm_no, instance.clone());
                        events.push(AlarmEvent {
                            kind: AlarmEventKind::Raised,
                            instance,
                        });
                    } else if !condition && is_active {
                        if let Some(mut instance) = active.remove(&def.alarm_no) {
                            instance.cleared_at = Some(now);
                            events.push(AlarmEvent {
                                kind: AlarmEventKind::Cleared,
                                instance,
                            });
                        }
                    }
                }
            }
        }
        let transitions = events.len();
        for event in &events {
            info!(
                "alarm {} {}: {}",
                event.instance.alarm_no,
                event.kind.as_str(),
                event.instance.text
            );
            self.notify(event);
        }
        transitions
    }

    /// Acknowledge an active, not yet acknowledged alarm.
    pub fn acknowledge(&self, alarm_no: AlarmNo, user: &str) -> bool {
        let event = {
            let mut active = self.active.lock();
            match active.get_mut(&alarm_no) {
                Some(instance) if !instance.is_acknowledged() => {
                    instance.acknowledged_at = Some(Utc::now());
                    instance.acknowledged_by = Some(user.to_string());
                    AlarmEvent {
                        kind: AlarmEventKind::Acknowledged,
                        instance: instance.clone(),
                    }
                }
                _ => return false,
            }
        };
        info!("alarm {alarm_no} acknowledged by {user}");
        self.notify(&event);
        true
    }

    pub fn is_active(&self, alarm_no: AlarmNo) -> bool {
        self.active.lock().contains_key(&alarm_no)
    }

    /// Active alarms ordered by alarm number.
    pub fn active_alarms(&self) -> Vec<AlarmInstance> {
        let active = self.active.lock();
        let ordered: BTreeMap<_, _> = active.iter().collect();
        ordered.into_values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.active
            .lock()
            .values()
            .filter(|i| !i.is_acknowledged())
            .count()
    }

    fn notify(&self, event: &AlarmEvent) {
        for listener in self.listeners.read().iter() {
            if let Err(err) = listener.on_alarm_event(event) {
                warn!(
                    "alarm {} {} not delivered: {err}",
                    event.instance.alarm_no,
                    event.kind.as_str()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<AlarmEvent>>,
    }

    impl AlarmListener for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn on_alarm_event(&self, event: &AlarmEvent) -> Result<(), AlarmError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    impl AlarmListener for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn on_alarm_event(&self, _event: &AlarmEvent) -> Result<(), AlarmError> {
            Err(AlarmError::Listener {
                listener: "failing",
                reason: "sink offline".into(),
            })
        }
    }

    fn values(tag: TagId, value: DecodedValue) -> TagValues {
        [(tag, value)].into()
    }

    fn kinds(recorder: &Recorder) -> Vec<AlarmEventKind> {
        recorder.events.lock().iter().map(|e| e.kind).collect()
    }

    #[test]
    fn edge_triggered_raise_and_clear() {
        let engine = AlarmEngine::new(vec![AlarmDefinition::new(
            1,
            10,
            AlarmCondition::NonZero,
            "Motor overload",
        )])
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        engine.add_listener(recorder.clone());

        for cond in [false, true, true, false, true] {
            engine.process_tag_data(&values(10, DecodedValue::Bool(cond)));
        }

        assert_eq!(
            kinds(&recorder),
            vec![
                AlarmEventKind::Raised,
                AlarmEventKind::Cleared,
                AlarmEventKind::Raised
            ]
        );
        engine.process_tag_data(&values(10, DecodedValue::Bool(false)));
        let k = kinds(&recorder);
        assert_eq!(k.iter().filter(|k| **k == AlarmEventKind::Raised).count(), 2);
        assert_eq!(k.iter().filter(|k| **k == AlarmEventKind::Cleared).count(), 2);
    }

    #[test]
    fn cleared_instance_carries_timestamps() {
        let engine =
            AlarmEngine::new(vec![AlarmDefinition::new(1, 10, AlarmCondition::NonZero, "x")])
                .unwrap();
        let recorder = Arc::new(Recorder::default());
        engine.add_listener(recorder.clone());
        engine.process_tag_data(&values(10, DecodedValue::Int16(1)));
        engine.process_tag_data(&values(10, DecodedValue::Int16(0)));
        let events = recorder.events.lock();
        assert_eq!(events[0].instance.id, events[1].instance.id);
        assert!(events[1].instance.cleared_at.is_some());
        assert!(events[1].instance.cleared_at >= Some(events[1].instance.raised_at));
    }

    #[test]
    fn tags_missing_from_snapshot_are_not_evaluated() {
        let engine =
            AlarmEngine::new(vec![AlarmDefinition::new(1, 10, AlarmCondition::NonZero, "x")])
                .unwrap();
        engine.process_tag_data(&values(10, DecodedValue::Int16(1)));
        engine.process_tag_data(&values(99, DecodedValue::Int16(0)));
        assert!(engine.is_active(1));
    }

    #[test]
    fn condition_rules() {
        assert!(evaluate(AlarmCondition::Bit(3), &DecodedValue::Bool(true)));
        assert!(evaluate(AlarmCondition::Bit(1), &DecodedValue::Int16(0b10)));
        assert!(!evaluate(AlarmCondition::Bit(0), &DecodedValue::Int16(0b10)));
        assert!(evaluate(AlarmCondition::Bit(15), &DecodedValue::Int32(0x8000)));
        // Out-of-range bit falls back to non-zero.
        assert!(evaluate(AlarmCondition::Bit(20), &DecodedValue::Int16(1)));
        // Floats are not bit-addressable.
        assert!(evaluate(AlarmCondition::Bit(1), &DecodedValue::Float32(49.99)));
        assert!(!evaluate(AlarmCondition::Bit(1), &DecodedValue::Float32(0.0)));
        assert!(evaluate(AlarmCondition::NonZero, &DecodedValue::Str("2".into())));
        assert!(!evaluate(AlarmCondition::NonZero, &DecodedValue::Str("n/a".into())));
    }

    #[test]
    fn acknowledge_rules() {
        let engine =
            AlarmEngine::new(vec![AlarmDefinition::new(1, 10, AlarmCondition::NonZero, "x")])
                .unwrap();
        let recorder = Arc::new(Recorder::default());
        engine.add_listener(recorder.clone());

        assert!(!engine.acknowledge(1, "op"));
        engine.process_tag_data(&values(10, DecodedValue::Int16(1)));
        assert_eq!(engine.unacknowledged_count(), 1);
        assert!(engine.acknowledge(1, "op"));
        assert!(!engine.acknowledge(1, "op"));
        assert!(engine.is_active(1));
        assert_eq!(engine.unacknowledged_count(), 0);

        let active = engine.active_alarms();
        assert_eq!(active[0].acknowledged_by.as_deref(), Some("op"));
        assert_eq!(kinds(&recorder).last(), Some(&AlarmEventKind::Acknowledged));
    }

    #[test]
    fn failing_listener_does_not_stop_evaluation() {
        let engine = AlarmEngine::new(vec![
            AlarmDefinition::new(1, 10, AlarmCondition::NonZero, "a"),
            AlarmDefinition::new(2, 11, AlarmCondition::NonZero, "b"),
        ])
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        engine.add_listener(Arc::new(Failing));
        engine.add_listener(recorder.clone());

        let snapshot: TagValues = [
            (10, DecodedValue::Int16(1)),
            (11, DecodedValue::Int16(1)),
        ]
        .into();
        assert_eq!(engine.process_tag_data(&snapshot), 2);
        assert_eq!(engine.active_count(), 2);
        assert_eq!(recorder.events.lock().len(), 2);
    }

    #[test]
    fn duplicate_alarm_numbers_are_rejected() {
        let err = AlarmEngine::new(vec![
            AlarmDefinition::new(1, 10, AlarmCondition::NonZero, "a"),
            AlarmDefinition::new(1, 11, AlarmCondition::NonZero, "b"),
        ])
        .err();
        assert_eq!(err, Some(ConfigError::DuplicateAlarm(1)));
    }
}
