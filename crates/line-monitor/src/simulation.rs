//! Packaging line behind the demo station.
//!
//! Drives the registers of a [`SimulatedPlc`] the way a real line would move
//! them, so the dashboard has something to show without hardware.

use crate::infra::station::demo;
use line_core::codec::{set_bit, split_high_first};
use line_io::{SimulatedPlc, StopSignal};
use std::time::Duration;
use tracing::{debug, info};

const RUNNING_BIT: u8 = 0;
const OVERLOAD_BIT: u8 = 1;
/// One part in this many is rejected.
const REJECT_EVERY: u32 = 10;
/// Overload is raised for a few ticks out of every cycle of this length.
const OVERLOAD_PERIOD: u64 = 60;
const OVERLOAD_TICKS: u64 = 5;

pub struct LineSimulator {
    plc: SimulatedPlc,
    tick: u64,
    operating_time: u32,
    down_time: u32,
    ok_count: u32,
    ng_count: u32,
}

impl LineSimulator {
    /// Seeds the PLC with a running line at roughly half speed.
    pub fn new(plc: SimulatedPlc) -> Self {
        plc.set_registers(demo::IDEAL_CYCLE_TIME, &split_high_first(0.8f32.to_bits()));
        plc.set_register(demo::LINE_SPEED, 32767);
        plc.update_register(demo::STATUS_WORD, |w| set_bit(w, RUNNING_BIT, true));
        plc.set_registers(
            demo::PRODUCT_CODE,
            &[u16::from_le_bytes(*b"AB"), u16::from_le_bytes(*b"-1"), 0, 0],
        );
        let sim = Self {
            plc,
            tick: 0,
            operating_time: 0,
            down_time: 0,
            ok_count: 0,
            ng_count: 0,
        };
        sim.write_counters();
        sim
    }

    /// Advance the line by one second.
    pub fn step(&mut self) {
        self.tick += 1;
        let status = self.plc.register(demo::STATUS_WORD);
        let running = status & (1 << RUNNING_BIT) != 0;

        if running {
            self.operating_time += 1;
            let produced = self.ok_count + self.ng_count + 1;
            if produced % REJECT_EVERY == 0 {
                self.ng_count += 1;
            } else {
                self.ok_count += 1;
            }
        } else {
            self.down_time += 1;
        }
        self.write_counters();

        let overload = running && self.tick % OVERLOAD_PERIOD >= OVERLOAD_PERIOD - OVERLOAD_TICKS;
        self.plc
            .update_register(demo::STATUS_WORD, |w| set_bit(w, OVERLOAD_BIT, overload));

        let phase = self.tick as f32 / 30.0;
        let temperature = 45.0 + 8.0 * phase.sin() + if overload { 15.0 } else { 0.0 };
        self.plc
            .set_registers(demo::TEMPERATURE, &split_high_first(temperature.to_bits()));
    }

    fn write_counters(&self) {
        let total = self.ok_count + self.ng_count;
        for (address, value) in [
            (demo::OPERATING_TIME, self.operating_time),
            (demo::DOWN_TIME, self.down_time),
            (demo::OK_COUNT, self.ok_count),
            (demo::NG_COUNT, self.ng_count),
            (demo::TOTAL_COUNT, total),
        ] {
            self.plc.set_registers(address, &split_high_first(value));
        }
    }

    pub async fn run(mut self, period: Duration, mut stop: StopSignal) {
        info!(period_ms = period.as_millis() as u64, "Line simulator started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.step();
                    if self.tick % 60 == 0 {
                        debug!(
                            tick = self.tick,
                            ok = self.ok_count,
                            ng = self.ng_count,
                            "Line simulator progress"
                        );
                    }
                }
                _ = stop.stopped() => break,
            }
        }
        info!("Line simulator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::station::demo_station;
    use line_core::DecodedValue;

    fn int32_at(plc: &SimulatedPlc, address: u16) -> u32 {
        (u32::from(plc.register(address)) << 16) | u32::from(plc.register(address + 1))
    }

    #[test]
    fn product_code_decodes_as_text() {
        let plc = SimulatedPlc::new();
        let _sim = LineSimulator::new(plc.clone());
        let station = demo_station();
        let tag = station.tags.iter().find(|t| t.id == 20).unwrap();
        let words: Vec<u16> = (0..4).map(|i| plc.register(demo::PRODUCT_CODE + i)).collect();
        assert_eq!(
            line_core::codec::decode(tag, &words).unwrap(),
            DecodedValue::Str("AB-1".to_string())
        );
    }

    #[test]
    fn running_line_produces_parts() {
        let plc = SimulatedPlc::new();
        let mut sim = LineSimulator::new(plc.clone());
        for _ in 0..20 {
            sim.step();
        }
        assert_eq!(int32_at(&plc, demo::OPERATING_TIME), 20);
        assert_eq!(int32_at(&plc, demo::DOWN_TIME), 0);
        assert_eq!(int32_at(&plc, demo::TOTAL_COUNT), 20);
        assert_eq!(int32_at(&plc, demo::NG_COUNT), 2);
        assert_eq!(int32_at(&plc, demo::OK_COUNT), 18);
        assert_eq!(
            f32::from_bits(int32_at(&plc, demo::IDEAL_CYCLE_TIME)),
            0.8
        );
    }

    #[test]
    fn stopped_line_accumulates_down_time() {
        let plc = SimulatedPlc::new();
        let mut sim = LineSimulator::new(plc.clone());
        plc.update_register(demo::STATUS_WORD, |w| set_bit(w, RUNNING_BIT, false));
        for _ in 0..5 {
            sim.step();
        }
        assert_eq!(int32_at(&plc, demo::DOWN_TIME), 5);
        assert_eq!(int32_at(&plc, demo::TOTAL_COUNT), 0);
        assert_eq!(plc.register(demo::STATUS_WORD) & (1 << OVERLOAD_BIT), 0);
    }

    #[test]
    fn overload_pulses_once_per_period() {
        let plc = SimulatedPlc::new();
        let mut sim = LineSimulator::new(plc.clone());
        let mut overloaded = 0;
        for _ in 0..OVERLOAD_PERIOD {
            sim.step();
            if plc.register(demo::STATUS_WORD) & (1 << OVERLOAD_BIT) != 0 {
                overloaded += 1;
            }
        }
        assert_eq!(overloaded, OVERLOAD_TICKS);
    }

    #[tokio::test]
    async fn run_stops_on_signal() {
        let plc = SimulatedPlc::new();
        let (trigger, stop) = line_io::stop_channel();
        let sim = LineSimulator::new(plc.clone());
        let task = tokio::spawn(sim.run(Duration::from_millis(10), stop));
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();
        task.await.unwrap();
        assert!(int32_at(&plc, demo::OPERATING_TIME) >= 3);
    }
}
