//! Channel coexistence simulation core.
//!
//! This module models WiFi DCF stations, NR-U gNBs and Frame-Based Equipment sharing one
//! half-duplex channel in virtual microsecond time. It integrates:
//! - A single-threaded discrete-event executor with interruptible timed waits
//! - The shared channel: occupancy lock, per-instant arbitration and collision rounds
//! - Backoff drawing and interruption accounting shared by the LBT families
//! - Per-family access state machines (DCF, NR-U LBT, five FBE variants)
//! - Fairness and occupancy metrics over finished runs
//!
//! ## Module Organization
//!
//! - `types`: Configurations, records, results and the error type
//! - `executor`: Virtual clock, timer queue and task scheduling
//! - `channel`: Shared medium and transmission rounds
//! - `backoff`, `timing`: Countdown and airtime arithmetic
//! - `station`, `gnb`, `fbe`: Entity tasks
//! - `runner`: Builds and drives one run
//! - `metrics`: Derived statistics
//!
//! ## Public API
//!
//! `run` executes one configuration for one seed and returns a `RunResult`; `run_batch` repeats it
//! over several seeds. Every run owns its clock, channel and random stream.

pub mod backoff;
pub mod channel;
pub mod entity;
pub mod executor;
pub mod fbe;
pub mod gnb;
pub mod metrics;
pub mod rng;
pub mod runner;
pub mod station;
pub mod timing;
pub mod types;

pub use runner::{run, run_batch};

pub use types::{EntityConfig, Family, FbeConfig, FbeVariant, NruConfig, RunResult, SimulationError, WifiConfig};
