// src/core/stats.rs

//! Per-connection traffic statistics, kept per message kind and per direction.

use crate::core::message::MessageKind;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A lock-free running total of messages and their latency.
#[derive(Debug, Default)]
pub struct TrafficCounter {
    count: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

impl TrafficCounter {
    pub fn record(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_us = self.total_us.load(Ordering::Relaxed);
        TrafficSnapshot {
            count,
            total_us,
            avg_us: total_us.checked_div(count).unwrap_or(0),
            max_us: self.max_us.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of a [`TrafficCounter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSnapshot {
    pub count: u64,
    pub total_us: u64,
    pub avg_us: u64,
    pub max_us: u64,
}

/// Transmit and receive counters for every [`MessageKind`].
#[derive(Debug, Default)]
pub struct ConnStats {
    tx: [TrafficCounter; 3],
    rx: [TrafficCounter; 3],
}

impl ConnStats {
    pub fn record_tx(&self, kind: MessageKind, latency: Duration) {
        self.tx[kind.index()].record(latency);
    }

    pub fn record_rx(&self, kind: MessageKind, latency: Duration) {
        self.rx[kind.index()].record(latency);
    }

    pub fn tx(&self, kind: MessageKind) -> TrafficSnapshot {
        self.tx[kind.index()].snapshot()
    }

    pub fn rx(&self, kind: MessageKind) -> TrafficSnapshot {
        self.rx[kind.index()].snapshot()
    }

    pub fn snapshot(&self) -> ConnStatsSnapshot {
        ConnStatsSnapshot {
            tx_request: self.tx(MessageKind::Request),
            tx_response: self.tx(MessageKind::Response),
            tx_oneway: self.tx(MessageKind::OneWay),
            rx_request: self.rx(MessageKind::Request),
            rx_response: self.rx(MessageKind::Response),
            rx_oneway: self.rx(MessageKind::OneWay),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnStatsSnapshot {
    pub tx_request: TrafficSnapshot,
    pub tx_response: TrafficSnapshot,
    pub tx_oneway: TrafficSnapshot,
    pub rx_request: TrafficSnapshot,
    pub rx_response: TrafficSnapshot,
    pub rx_oneway: TrafficSnapshot,
}
