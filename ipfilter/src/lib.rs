mod cidr;
mod classifier;
mod compiler;
mod config;
mod control;
mod encode;
mod error;
mod firewall;
mod logger;
mod packet;
mod resolve;
mod rule;
mod rule_list;
mod state;
mod timeout;
mod token;

pub use crate::firewall::{Decision, Firewall, FirewallStats, FilterStats, Outcome};
pub use ipfilter_common::{Direction, Family, PortCmp, PortOp};

pub use cidr::{Address, HostMatch};
pub use classifier::{
    Classifier, FunctionTable, RuleFunction, ScanResult, StateKeeper, MAX_GROUP_DEPTH,
};
pub use compiler::Compiler;
pub use config::{Policy, Tunables, DEFAULT_TICKS_PER_SECOND};
pub use control::{ListSelector, Request, RequestKind, Response, RuleCursor};
pub use error::{Error, FieldError};
pub use logger::{PacketLogger, Verdict};
pub use packet::{IcmpInfo, PacketSummary};
pub use resolve::{LiteralResolver, Resolver, StaticResolver};
pub use rule::{
    Action, BlockReturn, Interfaces, LogLevel, LogSpec, Priority, ProtoMatch, Rule, RuleBody,
    RuleStats, Target,
};
pub use rule_list::{Group, ListStats, RuleId, RuleListStore, RuleSet};
pub use state::{FlowKey, StateEntry, StateMatch, StateStats, StateTable, TcpState};
pub use timeout::{QueueId, QueueKind, QueueStats, TimeoutEntry, TimeoutQueues};

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse clock unit; `ticks_per_second` ticks make a second.
pub type Tick = u64;
