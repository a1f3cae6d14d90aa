//! Wiring binary: builds `Parameters` from the CLI, constructs C1-C7, and
//! drives a toy end-to-end run (sim DMA reader, synthetic PV generators,
//! a logging contributor) since the real DMA/PV/contributor/control-bus
//! collaborators are external (§1 scope). A fixed run length stands in for
//! the kind of interactive menu loop that would otherwise drive this.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::unbounded;
use pvcorr::config::{Cli, Parameters};
use pvcorr::container::MemNamesLookup;
use pvcorr::contributor::{Contributor, ContributorAdapter, NoopTrigger};
use pvcorr::control::ControlPlane;
use pvcorr::dma::{DmaReader, SimDmaSource};
use pvcorr::matcher::Matcher;
use pvcorr::metrics::PipelineMetrics;
use pvcorr::model::EventDatagram;
use pvcorr::pool::BufferPool;
use pvcorr::pv::{PvMonitor, PvParams, PvWorkQueue, RawUpdate};
use pvcorr::time::{MatchDegree, Timestamp};

const NBUFFERS: u32 = 64;
const BUFFER_SIZE: usize = 4096;
const PV_QUEUE_CAPACITY: usize = 8;

struct LoggingContributor;

impl Contributor for LoggingContributor {
    fn send_to_teb(&mut self, pebble_index: u32, datagram: &EventDatagram) {
        log::info!(
            "sendToTeb pebble={pebble_index} pulseId={} damage={:#x} payload_len={}",
            datagram.header.pulse_id,
            datagram.damage.value(),
            datagram.payload.0.len()
        );
    }
}

fn epics_now() -> Timestamp {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    Timestamp::new(now.as_secs() as u32, now.subsec_nanos())
}

fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if verbose { "debug" } else { "info" }))
        .init();

    let params = match Parameters::from_cli(cli) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let match_tmo_ms: u64 = params
        .kwargs
        .iter()
        .find(|(k, _)| k == "match_tmo_ms")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(pvcorr::matcher::DEFAULT_TIMEOUT_MS);
    let sim_length_secs: u64 = params
        .kwargs
        .iter()
        .find(|(k, _)| k == "sim_length")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(5);

    let mut control = ControlPlane::new();
    if let Err(e) = control.connect(&params.pv_specs) {
        eprintln!("connect failed: {e}");
        std::process::exit(1);
    }
    let info = match control.configure() {
        Ok(info) => info.clone(),
        Err(e) => {
            eprintln!("configure failed: {e}");
            std::process::exit(1);
        }
    };
    log::info!("configured: aliases=[{}] names=[{}]", info.aliases, info.names.replace('\n', ", "));

    let metrics = PipelineMetrics::new();

    let (notice_tx, notice_rx) = unbounded();
    let monitors: Vec<Arc<PvMonitor>> = control
        .pv_specs()
        .iter()
        .enumerate()
        .map(|(id, spec)| {
            Arc::new(PvMonitor::new(
                id as u32,
                spec.alias.clone(),
                spec.pv_name.clone(),
                PV_QUEUE_CAPACITY,
                BUFFER_SIZE,
                spec.first_dim,
                notice_tx.clone(),
            ))
        })
        .collect();
    for m in &monitors {
        m.startup();
    }

    std::thread::spawn(move || {
        for notice in notice_rx.iter() {
            log::warn!("async notice: alias={} message={}", notice.alias, notice.message);
        }
    });

    let pumps: Vec<Arc<PvWorkQueue>> = monitors
        .iter()
        .cloned()
        .map(|monitor| Arc::new(PvWorkQueue::spawn(monitor, probe_params)))
        .collect();

    // Synthetic PV update generator: the real source is the external PV
    // transport library (§1 scope); this stands in for it the same way
    // `SimDmaSource` stands in for the kernel DMA ring.
    let generators: Vec<std::thread::JoinHandle<()>> = pumps
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, pump)| {
            let terminate = control.terminate.clone();
            std::thread::Builder::new()
                .name(format!("pv-sim-{i}"))
                .spawn(move || {
                    while !terminate.load(Ordering::Acquire) {
                        pump.submit(RawUpdate { time: epics_now(), payload: vec![0u8; 8] });
                        spin_sleep::sleep(Duration::from_millis(150));
                    }
                })
                .expect("spawning PV simulator thread")
        })
        .collect();

    let pool = BufferPool::new(NBUFFERS, BUFFER_SIZE);
    let dma_source = SimDmaSource::new(Duration::from_millis(100), params.lane_mask);
    let reader = DmaReader::new(dma_source);
    let adapter = ContributorAdapter::new(LoggingContributor, None::<NoopTrigger>);
    let mut matcher = Matcher::new(
        reader,
        pool,
        monitors.clone(),
        adapter,
        MemNamesLookup::default(),
        MatchDegree::from_level(params.ts_match_degree),
        Duration::from_millis(match_tmo_ms),
        metrics.clone(),
    );

    let terminate = control.terminate.clone();
    let matcher_handle = std::thread::spawn(move || {
        while !terminate.load(Ordering::Acquire) {
            matcher.tick(epics_now());
            spin_sleep::sleep(Duration::from_millis(5));
        }
        matcher.stats()
    });

    spin_sleep::sleep(Duration::from_secs(sim_length_secs));
    control.unconfigure();

    let stats = matcher_handle.join().expect("matcher thread panicked");
    for handle in generators {
        let _ = handle.join();
    }
    drop(pumps);

    let snapshot = metrics.snapshot();
    log::info!(
        "run complete: sent={} match={} missing_data={} timed_out={} (matcher stats: sent={})",
        snapshot.n_sent,
        snapshot.n_match,
        snapshot.n_missing_data,
        snapshot.n_timed_out,
        stats.n_sent
    );
}

fn probe_params() -> Option<PvParams> {
    Some(PvParams { element_type: pvcorr::pv::PvElementType::Double, n_elements: 1, rank: 0 })
}
