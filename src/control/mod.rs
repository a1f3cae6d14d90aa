//! Control Plane (C6): translates external transitions into lifecycle
//! operations on C1-C5, carries configuration through the pipeline, and
//! replies with success/error (§4.6, §6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::container::InfoRecord;
use crate::pv::PvMonitor;

/// `{header:{key, msg_id}, body:{...}}` (§6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandHeader {
    pub key: String,
    pub msg_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandMessage {
    pub header: CommandHeader,
    #[serde(default)]
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_info: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub header: CommandHeader,
    pub body: ResponseBody,
}

impl CommandResponse {
    fn ok(header: CommandHeader) -> Self {
        Self { header, body: ResponseBody { err_info: None } }
    }

    fn err(header: CommandHeader, message: impl Into<String>) -> Self {
        Self { header, body: ResponseBody { err_info: Some(message.into()) } }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown transition key: {0}")]
    UnknownKey(String),
    #[error("malformed pv spec '{0}': {1}")]
    BadPvSpec(String, &'static str),
    #[error("too many PVs (max 32)")]
    TooManyPvs,
    #[error("transition received while not configured: {0}")]
    NotConfigured(&'static str),
    #[error("already configured")]
    AlreadyConfigured,
}

/// A parsed `[alias=][provider/]pvName[.field][,firstDim]` spec
/// (§6, § SUPPLEMENTED FEATURES — delimiter precedence matches the original:
/// `=` (alias) before `/` (provider) before `.` (field) before `,`
/// (firstDim); unlike the original, each step narrows the remainder rather
/// than re-scanning the original string).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvSpec {
    pub alias: String,
    pub provider: String,
    pub pv_name: String,
    pub field: String,
    pub first_dim: u32,
}

pub fn parse_pv_spec(spec: &str) -> Result<PvSpec, ControlError> {
    let mut rest = spec;

    let (alias, rest_after_alias) = match rest.split_once('=') {
        Some((alias, remainder)) => (Some(alias.to_string()), remainder),
        None => (None, rest),
    };
    rest = rest_after_alias;

    let (provider, rest_after_provider) = match rest.split_once('/') {
        Some((provider, remainder)) => (provider.to_string(), remainder),
        None => ("pva".to_string(), rest),
    };
    rest = rest_after_provider;

    let (name_and_field, first_dim_str) = match rest.split_once(',') {
        Some((head, tail)) => (head, Some(tail)),
        None => (rest, None),
    };

    let (pv_name, field) = match name_and_field.split_once('.') {
        Some((name, field)) => (name.to_string(), field.to_string()),
        None => (name_and_field.to_string(), "value".to_string()),
    };

    if pv_name.is_empty() {
        return Err(ControlError::BadPvSpec(spec.to_string(), "empty PV name"));
    }

    let first_dim = match first_dim_str {
        Some(s) => s
            .parse::<u32>()
            .map_err(|_| ControlError::BadPvSpec(spec.to_string(), "firstDim is not an unsigned integer"))?,
        None => 0,
    };

    let alias = alias.unwrap_or_else(|| pv_name.clone());

    Ok(PvSpec { alias, provider, pv_name, field, first_dim })
}

/// `[configured, idle] -> [configured, running] -> ...` high-level state,
/// kept separate from each `PvMonitor`'s own Armed/Ready machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Disconnected,
    Connected,
    Configured,
}

/// Owns the set of connected PV monitors and the `terminate` flag the
/// matcher thread watches (§5: "Control thread ... synchronizes with the
/// Matcher via a terminate flag (release/acquire) and thread join").
/// Spawning/joining the matcher thread itself lives in the binary, since
/// the thread's concrete `DmaReader`/`Contributor` types are chosen there.
pub struct ControlPlane {
    state: ControlState,
    pv_specs: Vec<PvSpec>,
    pub terminate: Arc<AtomicBool>,
    info_record: Option<InfoRecord>,
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlane {
    pub fn new() -> Self {
        Self {
            state: ControlState::Disconnected,
            pv_specs: Vec::new(),
            terminate: Arc::new(AtomicBool::new(false)),
            info_record: None,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn info_record(&self) -> Option<&InfoRecord> {
        self.info_record.as_ref()
    }

    /// `connect`: parse PV specs, assigning monotonic ids starting at 0.
    pub fn connect(&mut self, specs: &[String]) -> Result<(), ControlError> {
        if specs.len() > crate::model::MAX_PVS {
            return Err(ControlError::TooManyPvs);
        }
        let mut parsed = Vec::with_capacity(specs.len());
        for spec in specs {
            parsed.push(parse_pv_spec(spec)?);
        }
        self.pv_specs = parsed;
        self.state = ControlState::Connected;
        Ok(())
    }

    /// `configure`: builds the info record from the connected PV specs.
    /// Draining queues and spawning the matcher thread are the binary's
    /// responsibility once it has concrete PV monitor/reader instances.
    pub fn configure(&mut self) -> Result<&InfoRecord, ControlError> {
        if self.state == ControlState::Disconnected {
            return Err(ControlError::NotConfigured("connect must run before configure"));
        }
        let pairs: Vec<(String, String)> =
            self.pv_specs.iter().map(|s| (s.alias.clone(), s.pv_name.clone())).collect();
        self.info_record = Some(InfoRecord::build(&pairs));
        self.state = ControlState::Configured;
        self.terminate.store(false, Ordering::Release);
        Ok(self.info_record.as_ref().unwrap())
    }

    /// `unconfigure`: raises the terminate flag; the binary joins the
    /// matcher thread and shuts down C1/PV-monitor queues in response.
    pub fn unconfigure(&mut self) {
        self.terminate.store(true, Ordering::Release);
        self.state = ControlState::Connected;
        self.info_record = None;
    }

    /// `reset`: force unconfigure + disconnect.
    pub fn reset(&mut self) {
        self.unconfigure();
        self.pv_specs.clear();
        self.state = ControlState::Disconnected;
    }

    pub fn pv_specs(&self) -> &[PvSpec] {
        &self.pv_specs
    }

    /// Dispatches one command-bus message, matching the key set in §4.6.
    pub fn handle(&mut self, msg: CommandMessage) -> CommandResponse {
        let header = msg.header.clone();
        let result = match msg.header.key.as_str() {
            "connect" => {
                let specs: Vec<String> = serde_json::from_value(msg.body.get("pvs").cloned().unwrap_or_default())
                    .unwrap_or_default();
                self.connect(&specs)
            }
            "configure" => self.configure().map(|_| ()),
            "unconfigure" => {
                self.unconfigure();
                Ok(())
            }
            "enable" | "disable" | "beginrun" | "endrun" => Ok(()),
            "disconnect" => {
                self.state = ControlState::Disconnected;
                Ok(())
            }
            "reset" => {
                self.reset();
                Ok(())
            }
            other => Err(ControlError::UnknownKey(other.to_string())),
        };
        match result {
            Ok(()) => CommandResponse::ok(header),
            Err(e) => CommandResponse::err(header, e.to_string()),
        }
    }

    /// Notifies any monitor keyed by `pv_monitors` that asks for an armed
    /// handshake that a new configuration cycle started. Exposed so the
    /// binary can re-arm monitors after `connect` without duplicating the
    /// id-assignment logic living in `pv_specs`.
    pub fn monitor_params(&self, monitors: &[Arc<PvMonitor>]) -> Vec<(u32, String)> {
        monitors.iter().map(|m| (m.id, m.pv_name.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_spec() {
        let spec = parse_pv_spec("sig=pva/XPP:GON:01.value,128").unwrap();
        assert_eq!(spec.alias, "sig");
        assert_eq!(spec.provider, "pva");
        assert_eq!(spec.pv_name, "XPP:GON:01");
        assert_eq!(spec.field, "value");
        assert_eq!(spec.first_dim, 128);
    }

    #[test]
    fn defaults_provider_field_and_alias() {
        let spec = parse_pv_spec("XPP:GON:01").unwrap();
        assert_eq!(spec.alias, "XPP:GON:01");
        assert_eq!(spec.provider, "pva");
        assert_eq!(spec.field, "value");
        assert_eq!(spec.first_dim, 0);
    }

    #[test]
    fn rejects_non_integer_first_dim() {
        let err = parse_pv_spec("pv/NAME,abc").unwrap_err();
        assert!(matches!(err, ControlError::BadPvSpec(_, _)));
    }

    #[test]
    fn configure_requires_connect_first() {
        let mut cp = ControlPlane::new();
        assert_eq!(cp.configure().unwrap_err(), ControlError::NotConfigured("connect must run before configure"));
    }

    #[test]
    fn configure_builds_info_record_in_declared_order() {
        let mut cp = ControlPlane::new();
        cp.connect(&["a=pva/PV:A".to_string(), "b=pva/PV:B".to_string()]).unwrap();
        let rec = cp.configure().unwrap();
        assert_eq!(rec.aliases, "a,b");
        assert_eq!(rec.names, "PV:A\nPV:B");
    }

    #[test]
    fn unconfigure_raises_terminate_flag() {
        let mut cp = ControlPlane::new();
        cp.connect(&["PV:A".to_string()]).unwrap();
        cp.configure().unwrap();
        cp.unconfigure();
        assert!(cp.terminate.load(Ordering::Acquire));
        assert_eq!(cp.state(), ControlState::Connected);
    }

    #[test]
    fn too_many_pvs_rejected() {
        let mut cp = ControlPlane::new();
        let specs: Vec<String> = (0..33).map(|i| format!("PV:{i}")).collect();
        assert_eq!(cp.connect(&specs).unwrap_err(), ControlError::TooManyPvs);
    }
}
