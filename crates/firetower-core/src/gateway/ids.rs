//! Snowflake-style identifier generator.
//!
//! Layout, most significant bit first:
//!
//! ```text
//! | 41 bits: ms since EPOCH_MS | 10 bits: cluster id | 12 bits: sequence |
//! ```
//!
//! Ids are strictly increasing per generator even if the wall clock steps
//! backwards or more than 4096 ids are requested within one millisecond; in
//! both cases the generator runs ahead of the clock until it catches up.

use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// 2020-01-01T00:00:00Z.
pub const EPOCH_MS: u64 = 1_577_836_800_000;

const CLUSTER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_CLUSTER: u16 = (1 << CLUSTER_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug)]
struct Clock {
    last_ms: u64,
    sequence: u64,
}

/// Generates unique, monotonically increasing ids.
#[derive(Debug)]
pub struct IdGenerator {
    cluster_id: u64,
    clock: Mutex<Clock>,
}

impl IdGenerator {
    /// `cluster_id` is masked to 10 bits.
    #[must_use]
    pub fn new(cluster_id: u16) -> Self {
        Self {
            cluster_id: u64::from(cluster_id & MAX_CLUSTER),
            clock: Mutex::new(Clock {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    #[must_use]
    pub fn cluster_id(&self) -> u16 {
        self.cluster_id as u16
    }

    /// Next id.
    pub fn next_id(&self) -> u64 {
        let now = now_ms();
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);

        if now > clock.last_ms {
            clock.last_ms = now;
            clock.sequence = 0;
        } else if clock.sequence < MAX_SEQUENCE {
            clock.sequence += 1;
        } else {
            clock.last_ms += 1;
            clock.sequence = 0;
        }

        (clock.last_ms << (CLUSTER_BITS + SEQUENCE_BITS))
            | (self.cluster_id << SEQUENCE_BITS)
            | clock.sequence
    }

    /// Next id, formatted as a decimal string.
    pub fn next_string(&self) -> String {
        self.next_id().to_string()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Split an id into `(ms since EPOCH_MS, cluster id, sequence)`.
#[must_use]
pub fn decompose(id: u64) -> (u64, u16, u16) {
    let timestamp = id >> (CLUSTER_BITS + SEQUENCE_BITS);
    let cluster = ((id >> SEQUENCE_BITS) & u64::from(MAX_CLUSTER)) as u16;
    let sequence = (id & MAX_SEQUENCE) as u16;
    (timestamp, cluster, sequence)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
        .saturating_sub(EPOCH_MS)
}
