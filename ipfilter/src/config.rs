
use std::{fs, path::Path};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result, Tick};

/// Clock rate assumed when none is configured.
pub const DEFAULT_TICKS_PER_SECOND: u64 = 2;

const fn secs(s: u64) -> Tick {
    s * DEFAULT_TICKS_PER_SECOND
}

/// What happens to packets no rule decided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromPrimitive, ToPrimitive)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Pass = 0,
    Block = 1,
}

/// Runtime tunables. Timeouts are in ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub ticks_per_second: u64,
    pub default_policy: Policy,
    pub state_max: u64,
    pub tcp_idle_timeout: Tick,
    pub tcp_close_wait: Tick,
    pub tcp_last_ack: Tick,
    pub tcp_timeout: Tick,
    pub tcp_closed: Tick,
    pub tcp_half_closed: Tick,
    pub udp_timeout: Tick,
    pub udp_ack_timeout: Tick,
    pub icmp_timeout: Tick,
    pub icmp_ack_timeout: Tick,
    pub ip_timeout: Tick,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            ticks_per_second: DEFAULT_TICKS_PER_SECOND,
            default_policy: Policy::Pass,
            state_max: 4013,
            tcp_idle_timeout: secs(5 * 24 * 3600),
            tcp_close_wait: secs(240),
            tcp_last_ack: secs(240),
            tcp_timeout: secs(240),
            tcp_closed: secs(60),
            tcp_half_closed: secs(2 * 3600),
            udp_timeout: secs(120),
            udp_ack_timeout: secs(12),
            icmp_timeout: secs(60),
            icmp_ack_timeout: secs(6),
            ip_timeout: secs(60),
        }
    }
}

struct Tunable {
    name: &'static str,
    min: u64,
    max: u64,
    get: fn(&Tunables) -> u64,
    set: fn(&mut Tunables, u64),
}

macro_rules! timeout {
    ($name:literal, $field:ident) => {
        Tunable {
            name: $name,
            min: 1,
            max: u32::MAX as u64,
            get: |t| t.$field,
            set: |t, v| t.$field = v,
        }
    };
}

const TUNABLES: &[Tunable] = &[
    Tunable {
        name: "ticks_per_second",
        min: 1,
        max: 1000,
        get: |t| t.ticks_per_second,
        set: |t, v| t.ticks_per_second = v,
    },
    Tunable {
        name: "default_policy",
        min: 0,
        max: 1,
        get: |t| t.default_policy.to_u64().unwrap_or_default(),
        set: |t, v| t.default_policy = Policy::from_u64(v).unwrap_or(Policy::Pass),
    },
    Tunable {
        name: "state_max",
        min: 1,
        max: 1 << 24,
        get: |t| t.state_max,
        set: |t, v| t.state_max = v,
    },
    timeout!("tcp_idle_timeout", tcp_idle_timeout),
    timeout!("tcp_close_wait", tcp_close_wait),
    timeout!("tcp_last_ack", tcp_last_ack),
    timeout!("tcp_timeout", tcp_timeout),
    timeout!("tcp_closed", tcp_closed),
    timeout!("tcp_half_closed", tcp_half_closed),
    timeout!("udp_timeout", udp_timeout),
    timeout!("udp_ack_timeout", udp_ack_timeout),
    timeout!("icmp_timeout", icmp_timeout),
    timeout!("icmp_ack_timeout", icmp_ack_timeout),
    timeout!("ip_timeout", ip_timeout),
];

fn tunable(name: &str) -> Result<&'static Tunable> {
    TUNABLES
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| Error::UnknownTunable(name.to_string()))
}

impl Tunables {
    /// Reads tunables from JSON; missing keys keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let tunables: Tunables = serde_json::from_str(text)?;
        for t in TUNABLES {
            tunables.check(t, (t.get)(&tunables))?;
        }
        Ok(tunables)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let tunables = Self::from_json(&fs::read_to_string(path.as_ref())?)?;
        info!(path = %path.as_ref().display(), "loaded tunables");
        Ok(tunables)
    }

    fn check(&self, t: &Tunable, value: u64) -> Result<()> {
        if !(t.min..=t.max).contains(&value) {
            return Err(Error::TunableRange {
                name: t.name.to_string(),
                value,
            });
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<u64> {
        Ok((tunable(name)?.get)(self))
    }

    /// Sets one tunable by name, refusing values outside its bounds.
    pub fn set(&mut self, name: &str, value: u64) -> Result<()> {
        let t = tunable(name)?;
        self.check(t, value)?;
        (t.set)(self, value);
        Ok(())
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        TUNABLES.iter().map(|t| t.name)
    }
}
