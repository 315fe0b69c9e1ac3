//! Hybrid logical clock for causal ordering of operations.
//!
//! An [`Hlc`] pairs wall-clock milliseconds with a logical counter so that
//! timestamps stay close to real time while still ordering events correctly
//! when device clocks drift or jump backwards.

use crate::{error::Result, Error, NodeId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Base36 digits of the physical component. Covers all of `i64`.
pub const PHYSICAL_WIDTH: usize = 13;

/// Base36 digits of the counter component. Covers all of `u32`.
pub const COUNTER_WIDTH: usize = 7;

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A hybrid logical clock value.
///
/// Ordering rules:
/// 1. Higher physical time wins
/// 2. If physical times are equal, higher counter wins
/// 3. If both are equal, the byte-wise larger node id wins
///
/// The string form is fixed-width and sorts the same way as the value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hlc {
    /// Milliseconds since the Unix epoch
    pub physical_time: i64,
    /// Logical counter within one millisecond
    pub counter: u32,
    /// Node that produced the value
    pub node_id: NodeId,
}

impl Hlc {
    /// Create a clock value from its parts.
    pub fn new(physical_time: i64, counter: u32, node_id: impl Into<NodeId>) -> Self {
        Self {
            physical_time,
            counter,
            node_id: node_id.into(),
        }
    }

    /// The smallest possible value. Used as the "from the beginning" cursor.
    pub fn zero() -> Self {
        Self::new(0, 0, "")
    }

    /// Whether this is [`Hlc::zero`].
    pub fn is_zero(&self) -> bool {
        self.physical_time == 0 && self.counter == 0 && self.node_id.is_empty()
    }

    /// Parse the string form produced by `Display`.
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.splitn(3, '-');
        let (Some(physical), Some(counter), Some(node_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::invalid_hlc(value, "expected three '-' separated parts"));
        };

        if physical.len() != PHYSICAL_WIDTH {
            return Err(Error::invalid_hlc(value, "physical time has the wrong width"));
        }
        if counter.len() != COUNTER_WIDTH {
            return Err(Error::invalid_hlc(value, "counter has the wrong width"));
        }

        let physical_time = decode_base36(physical)
            .and_then(|v| i64::try_from(v).ok())
            .ok_or_else(|| Error::invalid_hlc(value, "physical time out of range"))?;
        let counter = decode_base36(counter)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| Error::invalid_hlc(value, "counter out of range"))?;

        Ok(Self::new(physical_time, counter, node_id))
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical_time
            .cmp(&other.physical_time)
            .then(self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.as_bytes().cmp(other.node_id.as_bytes()))
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            encode_base36(self.physical_time.max(0) as u64, PHYSICAL_WIDTH),
            encode_base36(u64::from(self.counter), COUNTER_WIDTH),
            self.node_id
        )
    }
}

impl FromStr for Hlc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Hlc::parse(s)
    }
}

impl TryFrom<String> for Hlc {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Hlc::parse(&value)
    }
}

impl From<Hlc> for String {
    fn from(value: Hlc) -> Self {
        value.to_string()
    }
}

fn encode_base36(mut value: u64, width: usize) -> String {
    let mut buf = vec![b'0'; width];
    for slot in buf.iter_mut().rev() {
        *slot = DIGITS[(value % 36) as usize];
        value /= 36;
    }
    // Every byte comes from DIGITS.
    String::from_utf8(buf).unwrap_or_default()
}

fn decode_base36(s: &str) -> Option<u64> {
    s.bytes().try_fold(0u64, |acc, b| {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'z' => b - b'a' + 10,
            _ => return None,
        };
        acc.checked_mul(36)?.checked_add(u64::from(digit))
    })
}

/// Source of wall-clock time in milliseconds.
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Current wall-clock time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// The operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A manually driven clock for tests and simulations.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualTime(Arc<AtomicI64>);

impl ManualTime {
    pub fn new(start_ms: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start_ms)))
    }

    pub fn set(&self, ms: i64) {
        self.0.store(ms, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, AtomicOrdering::SeqCst);
    }
}

impl TimeSource for ManualTime {
    fn now_ms(&self) -> i64 {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

/// The per-node clock that issues [`Hlc`] values.
///
/// Every value returned by [`tick`](Self::tick) or [`receive`](Self::receive)
/// is strictly greater than every value this clock issued or observed before.
#[derive(Debug, Clone)]
pub struct HybridClock {
    last: Hlc,
    time: Arc<dyn TimeSource>,
}

impl HybridClock {
    /// Create a clock for a node, starting from zero.
    ///
    /// # Panics
    ///
    /// Panics if `node_id` is empty.
    pub fn new(node_id: impl Into<NodeId>, time: Arc<dyn TimeSource>) -> Self {
        Self::resume(Hlc::new(0, 0, node_id), time)
    }

    /// Continue a clock from the last value it issued.
    ///
    /// # Panics
    ///
    /// Panics if the node id of `last` is empty.
    pub fn resume(last: Hlc, time: Arc<dyn TimeSource>) -> Self {
        assert!(
            !last.node_id.is_empty(),
            "hybrid clock requires a non-empty node id"
        );
        Self { last, time }
    }

    /// The node this clock issues values for.
    pub fn node_id(&self) -> &NodeId {
        &self.last.node_id
    }

    /// The last value issued or observed.
    pub fn last(&self) -> &Hlc {
        &self.last
    }

    /// Current wall-clock time according to the time source.
    pub fn wall_time(&self) -> i64 {
        self.time.now_ms()
    }

    pub fn time_source(&self) -> Arc<dyn TimeSource> {
        Arc::clone(&self.time)
    }

    /// Issue a value for a new local event.
    pub fn tick(&mut self) -> Hlc {
        let now = self.time.now_ms();
        self.tick_at(now)
    }

    /// Issue a value for a new local event at the given wall time.
    pub fn tick_at(&mut self, now: i64) -> Hlc {
        let now = now.max(0);
        let (physical_time, counter) = if now > self.last.physical_time {
            (now, 0)
        } else {
            bump(self.last.physical_time, self.last.counter.checked_add(1))
        };
        self.last.physical_time = physical_time;
        self.last.counter = counter;
        self.last.clone()
    }

    /// Observe a remote value and issue one greater than both it and the
    /// local clock.
    pub fn receive(&mut self, remote: &Hlc) -> Hlc {
        let now = self.time.now_ms();
        self.receive_at(remote, now)
    }

    /// [`receive`](Self::receive) at the given wall time.
    pub fn receive_at(&mut self, remote: &Hlc, now: i64) -> Hlc {
        let local_pt = self.last.physical_time;
        let physical_time = now.max(0).max(local_pt).max(remote.physical_time);

        let next = if physical_time == local_pt && physical_time == remote.physical_time {
            self.last.counter.max(remote.counter).checked_add(1)
        } else if physical_time == local_pt {
            self.last.counter.checked_add(1)
        } else if physical_time == remote.physical_time {
            remote.counter.checked_add(1)
        } else {
            Some(0)
        };

        let (physical_time, counter) = bump(physical_time, next);
        self.last.physical_time = physical_time;
        self.last.counter = counter;
        self.last.clone()
    }
}

// Counter exhaustion moves into the next millisecond.
fn bump(physical_time: i64, counter: Option<u32>) -> (i64, u32) {
    match counter {
        Some(counter) => (physical_time, counter),
        None => (physical_time.saturating_add(1), 0),
    }
}
