// src/session/status.rs

//! Human-readable and serialisable session status reports.

use super::{Session, SessionKind, SessionStatus};
use crate::connection::{ConnStatus, ConnectionKind};
use crate::core::stats::ConnStatsSnapshot;
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub session_id: u64,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub endpoint: Option<String>,
    pub conn_num: usize,
    pub conn_timeout_ms: u128,
    pub max_message_len: usize,
    pub max_header_len: usize,
    pub max_iov_len: usize,
    pub reconnect_times: u32,
    pub connections: Vec<ConnectionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub id: u64,
    pub kind: ConnectionKind,
    pub status: ConnStatus,
    pub is_busy: bool,
    pub stats: ConnStatsSnapshot,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "session {} ({:?}) status={} endpoint={} conns={} reconnect_times={}",
            self.session_id,
            self.kind,
            self.status,
            self.endpoint.as_deref().unwrap_or("-"),
            self.conn_num,
            self.reconnect_times
        )?;
        writeln!(
            f,
            "  limits: timeout={}ms message={}B header={}B iov={}B",
            self.conn_timeout_ms, self.max_message_len, self.max_header_len, self.max_iov_len
        )?;
        for conn in &self.connections {
            let s = &conn.stats;
            writeln!(
                f,
                "  conn {} {} busy={} tx[req={} rsp={} oneway={}] rx[req={} rsp={} oneway={}] avg_rtt={}us",
                conn.id,
                conn.status,
                conn.is_busy,
                s.tx_request.count,
                s.tx_response.count,
                s.tx_oneway.count,
                s.rx_request.count,
                s.rx_response.count,
                s.rx_oneway.count,
                s.rx_response.avg_us
            )?;
        }
        Ok(())
    }
}

impl Session {
    /// A snapshot of the session and every pooled connection.
    pub fn status_report(&self) -> StatusReport {
        let inner = &self.inner;
        let (status, reconnect_times) = {
            let state = inner.state.lock();
            (state.status, state.reconnect_times)
        };
        let connections = self
            .connections()
            .iter()
            .map(|conn| {
                let state = conn.state();
                ConnectionReport {
                    id: conn.id(),
                    kind: conn.kind(),
                    status: state.status,
                    is_busy: state.is_busy,
                    stats: conn.stats().snapshot(),
                }
            })
            .collect::<Vec<_>>();
        StatusReport {
            session_id: inner.id,
            kind: inner.kind,
            status,
            endpoint: inner.endpoint.clone(),
            conn_num: connections.len(),
            conn_timeout_ms: inner.config.conn_timeout.as_millis(),
            max_message_len: inner.config.max_message_len,
            max_header_len: inner.config.max_header_len,
            max_iov_len: inner.config.max_iov_len,
            reconnect_times,
            connections,
        }
    }

    /// Logs the status report, at most once per configured status interval.
    /// Returns the report when it was logged.
    pub fn dump_status(&self) -> Option<StatusReport> {
        {
            let mut last = self.inner.last_dump.lock();
            let now = Instant::now();
            if let Some(at) = *last
                && now.duration_since(at) < self.inner.config.status_interval
            {
                return None;
            }
            *last = Some(now);
        }
        let report = self.status_report();
        info!("{report}");
        Some(report)
    }
}
