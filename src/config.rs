//! Configuration / CLI (§6). Mirrors the original's CLI-derived parameter
//! struct; validation order (laneMask bit-count, then alias suffix, then
//! kwargs allowlist) matches `original_source/psdaq/drp/PvaDetector.cc`.

use clap::Parser;
use thiserror::Error;

/// Kwargs recognized even though they aren't declared CLI flags (§6).
/// Anything else in `-k` is a fatal configuration error.
pub const KWARGS_ALLOWLIST: &[&str] = &[
    "forceEnet",
    "ep_fabric",
    "ep_domain",
    "ep_provider",
    "sim_length",
    "timebase",
    "pebbleBufSize",
    "pebbleBufCount",
    "batching",
    "directIO",
    "pva_addr",
    "firstdim",
    "match_tmo_ms",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("laneMask must have exactly one bit set, got {0:#x}")]
    BadLaneMask(u32),
    #[error("alias '{0}' must end with _<digits>")]
    BadAliasSuffix(String),
    #[error("unrecognized kwarg '{0}'")]
    UnknownKwarg(String),
    #[error("malformed kwarg entry '{0}', expected key=value")]
    MalformedKwarg(String),
    #[error("tsMatchDegree=1 (fiducial-ignored) is disabled at the CLI")]
    Degree1Disabled,
}

/// Raw CLI surface (§6). `clap` derive gives one flag per field; semantic
/// validation (lane mask, alias suffix, kwargs) happens in
/// `Parameters::from_cli` rather than in clap value parsers, so the error
/// ordering exactly matches the original.
#[derive(Debug, Parser)]
#[command(name = "pvcorr-drp", about = "PV-correlated event pipeline front-end")]
pub struct Cli {
    #[arg(short = 'p', long)]
    pub partition: String,

    #[arg(short = 'd', long)]
    pub device: String,

    #[arg(short = 'u', long)]
    pub alias: String,

    #[arg(short = 'l', long)]
    pub lane_mask: u32,

    #[arg(short = 'D', long, default_value = "pv")]
    pub det_type: String,

    #[arg(short = 'S', long, default_value = "")]
    pub ser_no: String,

    #[arg(short = 'C', long, default_value = "")]
    pub collection_host: String,

    #[arg(short = 'k', long)]
    pub kwargs: Vec<String>,

    #[arg(short = 'P', long, default_value = "")]
    pub instrument: String,

    #[arg(short = 'M', long)]
    pub prometheus_dir: Option<String>,

    #[arg(short = '0', long = "degree0")]
    pub ts_match_degree_0: bool,

    /// Rejected: degree 1 (fiducial-ignored) is implemented but disabled at
    /// the CLI, matching the original.
    #[arg(short = '1', long = "degree1")]
    pub ts_match_degree_1: bool,

    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// `[alias=][provider/]pvName[.field][,firstDim]`, max 32.
    pub pv_specs: Vec<String>,
}

/// Validated configuration, analogous to the original's `Parameters`.
#[derive(Debug, Clone)]
pub struct Parameters {
    pub partition: String,
    pub device: String,
    pub alias: String,
    pub det_name: String,
    pub det_segment: u32,
    pub lane_mask: u32,
    pub det_type: String,
    pub ser_no: String,
    pub collection_host: String,
    pub kwargs: Vec<(String, String)>,
    pub instrument: String,
    pub prometheus_dir: Option<String>,
    pub ts_match_degree: u8,
    pub verbose: bool,
    pub pv_specs: Vec<String>,
}

impl Parameters {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.ts_match_degree_1 {
            return Err(ConfigError::Degree1Disabled);
        }

        if cli.lane_mask == 0 || cli.lane_mask & (cli.lane_mask - 1) != 0 {
            return Err(ConfigError::BadLaneMask(cli.lane_mask));
        }

        let (det_name, det_segment) = split_alias(&cli.alias)?;

        let kwargs = parse_kwargs(&cli.kwargs)?;

        if cli.ts_match_degree_0 {
            // degree 0 selected via `-0`; `-1` (degree 1) has no CLI flag at
            // all, matching the original rejecting it outright.
        }

        Ok(Self {
            partition: cli.partition,
            device: cli.device,
            alias: cli.alias,
            det_name,
            det_segment,
            lane_mask: cli.lane_mask,
            det_type: cli.det_type,
            ser_no: cli.ser_no,
            collection_host: cli.collection_host,
            kwargs,
            instrument: cli.instrument,
            prometheus_dir: cli.prometheus_dir,
            ts_match_degree: if cli.ts_match_degree_0 { 0 } else { 2 },
            verbose: cli.verbose,
            pv_specs: cli.pv_specs,
        })
    }
}

fn split_alias(alias: &str) -> Result<(String, u32), ConfigError> {
    match alias.rsplit_once('_') {
        Some((name, suffix)) if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) => {
            let segment = suffix.parse::<u32>().map_err(|_| ConfigError::BadAliasSuffix(alias.to_string()))?;
            Ok((name.to_string(), segment))
        }
        _ => Err(ConfigError::BadAliasSuffix(alias.to_string())),
    }
}

fn parse_kwargs(raw: &[String]) -> Result<Vec<(String, String)>, ConfigError> {
    let mut out = Vec::new();
    for entry in raw {
        for pair in entry.split(',') {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedKwarg(pair.to_string()))?;
            if !KWARGS_ALLOWLIST.contains(&key) {
                return Err(ConfigError::UnknownKwarg(key.to_string()));
            }
            out.push((key.to_string(), value.to_string()));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            partition: "p".into(),
            device: "/dev/pgp0".into(),
            alias: "sig_1".into(),
            lane_mask: 0x2,
            det_type: "pv".into(),
            ser_no: String::new(),
            collection_host: String::new(),
            kwargs: vec![],
            instrument: String::new(),
            prometheus_dir: None,
            ts_match_degree_0: false,
            ts_match_degree_1: false,
            verbose: false,
            pv_specs: vec![],
        }
    }

    #[test]
    fn splits_alias_into_det_name_and_segment() {
        let params = Parameters::from_cli(base_cli()).unwrap();
        assert_eq!(params.det_name, "sig");
        assert_eq!(params.det_segment, 1);
    }

    #[test]
    fn rejects_multi_bit_lane_mask() {
        let mut cli = base_cli();
        cli.lane_mask = 0x3;
        assert_eq!(Parameters::from_cli(cli).unwrap_err(), ConfigError::BadLaneMask(0x3));
    }

    #[test]
    fn lane_mask_checked_before_alias_suffix() {
        let mut cli = base_cli();
        cli.lane_mask = 0x3;
        cli.alias = "noSuffix".into();
        assert_eq!(Parameters::from_cli(cli).unwrap_err(), ConfigError::BadLaneMask(0x3));
    }

    #[test]
    fn rejects_alias_without_digit_suffix() {
        let mut cli = base_cli();
        cli.alias = "noSuffix".into();
        assert_eq!(Parameters::from_cli(cli).unwrap_err(), ConfigError::BadAliasSuffix("noSuffix".into()));
    }

    #[test]
    fn accepts_allowlisted_kwarg() {
        let mut cli = base_cli();
        cli.kwargs = vec!["sim_length=10,timebase=119e6".into()];
        let params = Parameters::from_cli(cli).unwrap();
        assert_eq!(params.kwargs, vec![("sim_length".to_string(), "10".to_string()), ("timebase".to_string(), "119e6".to_string())]);
    }

    #[test]
    fn rejects_unknown_kwarg() {
        let mut cli = base_cli();
        cli.kwargs = vec!["bogus=1".into()];
        assert_eq!(Parameters::from_cli(cli).unwrap_err(), ConfigError::UnknownKwarg("bogus".to_string()));
    }

    #[test]
    fn degree1_flag_is_rejected() {
        let mut cli = base_cli();
        cli.ts_match_degree_1 = true;
        assert_eq!(Parameters::from_cli(cli).unwrap_err(), ConfigError::Degree1Disabled);
    }

    #[test]
    fn degree0_flag_sets_ts_match_degree() {
        let mut cli = base_cli();
        cli.ts_match_degree_0 = true;
        let params = Parameters::from_cli(cli).unwrap();
        assert_eq!(params.ts_match_degree, 0);
    }
}
