// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Timing and memory reporting at marked points of execution.
//!
//! The executor only sees the [`Instrument`] capability. State (timers,
//! counter, output stream, suppression flags) lives in an explicit
//! [`InstrumentContext`], created once per process and torn down with
//! [`InstrumentContext::finish`]. Reporting never influences results: any
//! failure is logged and dropped.
//!
//! Environment:
//!
//! | Variable                     | Effect                              |
//! |------------------------------|-------------------------------------|
//! | `MIND_NO_INSTRUMENT`         | suppress all reports                |
//! | `MIND_NO_INSTRUMENT_TIME`    | suppress `==PERF-REPORT==` lines    |
//! | `MIND_NO_INSTRUMENT_MEMORY`  | suppress `==MEM-REPORT==` lines     |
//! | `MIND_INSTRUMENT_FILE`       | write reports to this path          |

use std::env;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use tracing::warn;

pub const ENV_NO_INSTRUMENT: &str = "MIND_NO_INSTRUMENT";
pub const ENV_NO_INSTRUMENT_TIME: &str = "MIND_NO_INSTRUMENT_TIME";
pub const ENV_NO_INSTRUMENT_MEMORY: &str = "MIND_NO_INSTRUMENT_MEMORY";
pub const ENV_INSTRUMENT_FILE: &str = "MIND_INSTRUMENT_FILE";

/// Bitfield describing one mark point.
///
/// Bits 0..=4 are flags, bits 8..=13 hold the operator name length and bits
/// 14..=23 the node name length; longer names are clamped to the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MarkTag(pub u64);

impl MarkTag {
    pub const BEFORE_OP: u64 = 1 << 0;
    pub const AFTER_OP: u64 = 1 << 1;
    pub const REPORT_TIME: u64 = 1 << 2;
    pub const REPORT_MEMORY: u64 = 1 << 3;
    pub const INIT: u64 = 1 << 4;

    const OP_LEN_SHIFT: u32 = 8;
    const OP_LEN_MASK: u64 = 0x3f;
    const NODE_LEN_SHIFT: u32 = 14;
    const NODE_LEN_MASK: u64 = 0x3ff;

    pub fn new(flags: u64, op_name: &str, node_name: &str) -> Self {
        let op_len = (op_name.len() as u64).min(Self::OP_LEN_MASK);
        let node_len = (node_name.len() as u64).min(Self::NODE_LEN_MASK);
        MarkTag(
            (flags & 0x1f) | (op_len << Self::OP_LEN_SHIFT) | (node_len << Self::NODE_LEN_SHIFT),
        )
    }

    pub fn has(&self, flag: u64) -> bool {
        self.0 & flag != 0
    }

    pub fn is_before(&self) -> bool {
        self.has(Self::BEFORE_OP)
    }

    pub fn is_after(&self) -> bool {
        self.has(Self::AFTER_OP)
    }

    pub fn reports_time(&self) -> bool {
        self.has(Self::REPORT_TIME)
    }

    pub fn reports_memory(&self) -> bool {
        self.has(Self::REPORT_MEMORY)
    }

    pub fn is_init(&self) -> bool {
        self.has(Self::INIT)
    }

    pub fn op_name_len(&self) -> usize {
        ((self.0 >> Self::OP_LEN_SHIFT) & Self::OP_LEN_MASK) as usize
    }

    pub fn node_name_len(&self) -> usize {
        ((self.0 >> Self::NODE_LEN_SHIFT) & Self::NODE_LEN_MASK) as usize
    }
}

/// Mark-point capability injected into plan execution.
pub trait Instrument {
    fn mark_point(&self, op_name: &str, node_name: &str, tag: MarkTag);
}

/// Discards every mark.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInstrument;

impl Instrument for NoInstrument {
    fn mark_point(&self, _op_name: &str, _node_name: &str, _tag: MarkTag) {}
}

#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("failed to read process status: {0}")]
    Io(#[from] io::Error),
    #[error("process status has no `{0}` entry")]
    MissingField(&'static str),
    #[error("malformed `{field}` entry: {line}")]
    Malformed { field: &'static str, line: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentConfig {
    pub enabled: bool,
    pub report_time: bool,
    pub report_memory: bool,
    /// Report file; standard output when absent.
    pub destination: Option<PathBuf>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_time: true,
            report_memory: true,
            destination: None,
        }
    }
}

impl InstrumentConfig {
    pub fn from_env() -> Self {
        let flag = |name: &str| env::var_os(name).is_some();
        Self {
            enabled: !flag(ENV_NO_INSTRUMENT),
            report_time: !flag(ENV_NO_INSTRUMENT_TIME),
            report_memory: !flag(ENV_NO_INSTRUMENT_MEMORY),
            destination: env::var(ENV_INSTRUMENT_FILE)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

struct State {
    start: Instant,
    last: Instant,
    counter: u64,
    sink: Box<dyn Write + Send>,
}

/// Process-scoped reporting state.
pub struct InstrumentContext {
    config: InstrumentConfig,
    state: Mutex<State>,
}

impl std::fmt::Debug for InstrumentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InstrumentContext {
    pub fn from_env() -> Self {
        Self::with_config(InstrumentConfig::from_env())
    }

    /// Open the configured destination. An unwritable file falls back to
    /// standard output.
    pub fn with_config(config: InstrumentConfig) -> Self {
        let sink: Box<dyn Write + Send> = match &config.destination {
            None => Box::new(io::stdout()),
            Some(path) => match File::create(path) {
                Ok(file) => Box::new(BufWriter::new(file)),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot open instrumentation file, using stdout");
                    Box::new(io::stdout())
                }
            },
        };
        Self::with_writer(config, sink)
    }

    pub fn with_writer(config: InstrumentConfig, sink: Box<dyn Write + Send>) -> Self {
        let now = Instant::now();
        Self {
            config,
            state: Mutex::new(State {
                start: now,
                last: now,
                counter: 0,
                sink,
            }),
        }
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Marks recorded so far.
    pub fn marks(&self) -> u64 {
        self.lock_or_recover().counter
    }

    /// Flush and close the destination, returning the number of marks.
    pub fn finish(self) -> u64 {
        let mut state = match self.state.into_inner() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = state.sink.flush() {
            warn!(error = %err, "failed to flush instrumentation output");
        }
        state.counter
    }

    fn lock_or_recover(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("instrumentation state poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn clip(name: &str, len: usize) -> &str {
    if len == 0 {
        return name;
    }
    name.get(..len).unwrap_or(name)
}

impl Instrument for InstrumentContext {
    fn mark_point(&self, op_name: &str, node_name: &str, tag: MarkTag) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.lock_or_recover();
        let now = Instant::now();
        if tag.is_init() {
            state.start = now;
            state.last = now;
        }
        state.counter += 1;

        let op = clip(op_name, tag.op_name_len());
        let node = clip(node_name, tag.node_name_len());
        let phase = if tag.is_before() { "before" } else { "after" };

        if tag.reports_time() && self.config.report_time {
            let delta = now.duration_since(state.last).as_secs_f64();
            let total = now.duration_since(state.start).as_secs_f64();
            state.last = now;
            let line = format!("==PERF-REPORT==, {op}, {node}, {phase}, {delta:.6}, {total:.6}");
            if let Err(err) = writeln!(state.sink, "{line}") {
                warn!(error = %err, "failed to write time report");
            }
        }

        if tag.reports_memory() && self.config.report_memory {
            match process_vmem_kb() {
                Ok(kb) => {
                    let line = format!("==MEM-REPORT==, {op}, {node}, {phase}, VMem: {kb}");
                    if let Err(err) = writeln!(state.sink, "{line}") {
                        warn!(error = %err, "failed to write memory report");
                    }
                }
                Err(err) => warn!(error = %err, "memory report skipped"),
            }
        }
    }
}

/// Virtual memory size of this process in kB.
pub fn process_vmem_kb() -> Result<u64, InstrumentError> {
    let status = fs::read_to_string("/proc/self/status")?;
    parse_vmem_kb(&status)
}

fn parse_vmem_kb(status: &str) -> Result<u64, InstrumentError> {
    const FIELD: &str = "VmSize";
    let line = status
        .lines()
        .find(|l| l.starts_with("VmSize:"))
        .ok_or(InstrumentError::MissingField(FIELD))?;
    line["VmSize:".len()..]
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| InstrumentError::Malformed {
            field: FIELD,
            line: line.to_string(),
        })
}
