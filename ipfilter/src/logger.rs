
use std::{
    net::IpAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use ipfilter_common::Direction;
use serde::Serialize;

use crate::{
    packet::PacketSummary,
    rule::{Priority, Rule},
    Result,
};

/// Why a packet was logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Block,
    Auth,
    /// A `log` rule matched, no decision implied.
    Log,
    /// No rule decided, default policy applied.
    NoMatch,
}

#[derive(Debug, Clone, Serialize)]
struct PacketFormatted<'a> {
    source_ip: IpAddr,
    destination_ip: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination_port: Option<u16>,
    protocol: u8,
    direction: Direction,
    verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interface: Option<&'a str>,
    length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    facility: Option<&'a str>,
    timestamp: String,
}

impl<'a> PacketFormatted<'a> {
    fn new(
        packet: &'a PacketSummary,
        direction: Direction,
        verdict: Verdict,
        rule: Option<&'a Rule>,
    ) -> Self {
        let timestamp =
            chrono::offset::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let interface = match direction {
            Direction::In => packet.in_if(),
            Direction::Out => packet.out_if(),
        };
        let level = rule.and_then(|r| r.body().log.as_ref()).and_then(|l| l.level.as_ref());
        Self {
            source_ip: packet.src().into(),
            destination_ip: packet.dst().into(),
            source_port: packet.sport(),
            destination_port: packet.dport(),
            protocol: packet.proto(),
            direction,
            verdict,
            rule: rule.map(Rule::line),
            group: rule.and_then(Rule::group),
            interface,
            length: packet.len(),
            facility: level.and_then(|l| l.facility.as_deref()),
            timestamp,
        }
    }
}

/// Writes packet records as JSON lines to the `packet_log` tracing target.
#[derive(Debug, Default)]
pub struct PacketLogger {
    logged: AtomicU64,
    failed: AtomicU64,
}

impl PacketLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs `packet` at the priority the rule asks for, `info` otherwise.
    pub fn log(
        &self,
        packet: &PacketSummary,
        direction: Direction,
        verdict: Verdict,
        rule: Option<&Rule>,
    ) -> Result<()> {
        let record = PacketFormatted::new(packet, direction, verdict, rule);
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        let priority = rule
            .and_then(|r| r.body().log.as_ref())
            .and_then(|l| l.level.as_ref())
            .map_or(Priority::Info, |l| l.priority);
        match priority {
            Priority::Emerg | Priority::Alert | Priority::Crit | Priority::Err => {
                tracing::error!(target: "packet_log", "{line}")
            }
            Priority::Warn => tracing::warn!(target: "packet_log", "{line}"),
            Priority::Notice | Priority::Info => tracing::info!(target: "packet_log", "{line}"),
            Priority::Debug => tracing::debug!(target: "packet_log", "{line}"),
        }
        self.logged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn logged(&self) -> u64 {
        self.logged.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
