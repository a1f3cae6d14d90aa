//! PV-correlated event pipeline: reads timed detector datagrams off a DMA
//! ring, correlates them against asynchronous PV updates under a
//! bounded-lateness policy, and forwards a single record per detector event
//! to a downstream contributor, damaged when correlation can't complete.

pub mod config;
pub mod container;
pub mod contributor;
pub mod control;
pub mod dma;
pub mod matcher;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod pv;
pub mod time;
