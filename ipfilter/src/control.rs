//! Request surface: numbered request kinds with text or JSON payloads.
//!
//! Rule requests carry rule text, optionally prefixed with `@N` to insert at
//! position `N` (1-based). Everything else carries JSON.

use ipfilter_common::{Direction, Family};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum RequestKind {
    AddRule = 1,
    RemoveRule = 2,
    Flush = 3,
    ZeroStats = 4,
    FetchStats = 5,
    NextRule = 6,
    SetTunable = 7,
    GetTunable = 8,
    FlushState = 9,
    Reload = 10,
}

/// Lists a flush applies to; unset fields select every list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListSelector {
    pub direction: Option<Direction>,
    pub family: Option<Family>,
}

/// Position in a rule list, for walking it one rule per request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleCursor {
    pub direction: Direction,
    #[serde(default)]
    pub family: Family,
    #[serde(default)]
    pub group: Option<String>,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct TunableRequest {
    name: String,
    #[serde(default)]
    value: Option<u64>,
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    AddRule { text: String, position: Option<usize> },
    RemoveRule { text: String },
    Flush(ListSelector),
    ZeroStats,
    FetchStats,
    NextRule(RuleCursor),
    SetTunable { name: String, value: u64 },
    GetTunable { name: String },
    FlushState,
    /// Replace every list with the rules in `text`.
    Reload { text: String },
}

fn rule_text(text: &str) -> Result<(String, Option<usize>)> {
    let text = text.trim();
    match text.strip_prefix('@') {
        Some(rest) => {
            let (n, rule) = rest.split_once(char::is_whitespace).ok_or(Error::InvalidRequest)?;
            let n: usize = n.parse().map_err(|_| Error::InvalidRequest)?;
            Ok((rule.trim().to_string(), Some(n.saturating_sub(1))))
        }
        None => Ok((text.to_string(), None)),
    }
}

impl Request {
    /// Decodes `size` bytes of `payload` as a request of kind `kind`.
    pub fn decode(kind: u32, payload: &[u8], size: usize) -> Result<Self> {
        let kind = RequestKind::from_u32(kind).ok_or(Error::InvalidRequest)?;
        let payload = payload.get(..size).ok_or(Error::InvalidRequest)?;
        let text = std::str::from_utf8(payload).map_err(|_| Error::InvalidRequest)?;

        Ok(match kind {
            RequestKind::AddRule => {
                let (text, position) = rule_text(text)?;
                Request::AddRule { text, position }
            }
            RequestKind::RemoveRule => Request::RemoveRule {
                text: rule_text(text)?.0,
            },
            RequestKind::Flush if text.trim().is_empty() => Request::Flush(ListSelector::default()),
            RequestKind::Flush => Request::Flush(serde_json::from_str(text)?),
            RequestKind::ZeroStats => Request::ZeroStats,
            RequestKind::FetchStats => Request::FetchStats,
            RequestKind::NextRule => Request::NextRule(serde_json::from_str(text)?),
            RequestKind::SetTunable => {
                let req: TunableRequest = serde_json::from_str(text)?;
                Request::SetTunable {
                    name: req.name,
                    value: req.value.ok_or(Error::InvalidRequest)?,
                }
            }
            RequestKind::GetTunable => {
                let req: TunableRequest = serde_json::from_str(text)?;
                Request::GetTunable { name: req.name }
            }
            RequestKind::FlushState => Request::FlushState,
            RequestKind::Reload => Request::Reload {
                text: text.to_string(),
            },
        })
    }
}

/// Result of a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Done,
    Count(usize),
    Rule(Option<String>),
    Tunable(u64),
    Stats(serde_json::Value),
    Loaded { rules: usize, errors: Vec<String> },
}

impl Response {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
