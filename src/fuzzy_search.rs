//! Three-way partitioned binary search over time-ordered UUIDv7 keys with a
//! bounded clock-skew window (§4.7).
//!
//! The insertion invariant (`t_new + skew_ms > max_timestamp_seen_so_far`)
//! means the sequence is only "mostly" sorted: a key can trail up to
//! `skew_ms` behind the running max. A plain binary search would miss
//! matches hiding in that disorder, so once the coarse phase brackets the
//! target's timestamp window it hands off to a bounded linear scan.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::key;

/// What [`Getter::get`] returns for one index.
pub enum GetOutcome {
    Found(Uuid),
    OutOfRange,
}

/// Supplies keys by logical index. Implemented by whatever backs the search
/// (an in-memory vec in tests, `FileManager` reads in the real finder).
pub trait Getter {
    fn get(&mut self, index: u64) -> Result<GetOutcome>;
}

impl<F> Getter for F
where
    F: FnMut(u64) -> Result<GetOutcome>,
{
    fn get(&mut self, index: u64) -> Result<GetOutcome> {
        self(index)
    }
}

/// Search `[0, num_keys)` for the logical index whose key equals `target`.
///
/// `skew_ms` must be within `[0, MAX_SKEW_MS]` and `target` must be a valid
/// UUIDv7, or this fails with `InvalidInput`. An error from `getter` is
/// returned as-is (including `KeyNotFound`, which signals an index that
/// turned out not to exist and is treated as out of range by the caller of
/// this function, not as "no match was found").
pub fn search(target: &Uuid, skew_ms: u64, num_keys: u64, getter: &mut impl Getter) -> Result<u64> {
    key::validate_v7(target)?;
    if skew_ms > crate::config::MAX_SKEW_MS {
        return Err(Error::invalid_input(format!("skew_ms {skew_ms} exceeds max")));
    }
    if num_keys == 0 {
        return Err(Error::key_not_found());
    }

    let target_ts = key::timestamp_ms(target);
    let lo_window = target_ts.saturating_sub(skew_ms);
    let hi_window = target_ts.saturating_add(skew_ms);

    let mut lo: i64 = 0;
    let mut hi: i64 = num_keys as i64 - 1;

    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let mid_u = mid as u64;
        let mid_key = match getter.get(mid_u)? {
            GetOutcome::Found(k) => k,
            GetOutcome::OutOfRange => return Err(Error::key_not_found()),
        };
        let mid_ts = key::timestamp_ms(&mid_key);

        if mid_ts < lo_window {
            lo = mid + 1;
        } else if mid_ts > hi_window {
            hi = mid - 1;
        } else {
            return linear_phase(target, target_ts, mid_u, mid_key, skew_ms, getter);
        }
    }

    Err(Error::key_not_found())
}

fn linear_phase(
    target: &Uuid,
    target_ts: u64,
    mid: u64,
    mid_key: Uuid,
    skew_ms: u64,
    getter: &mut impl Getter,
) -> Result<u64> {
    if mid_key == *target {
        return Ok(mid);
    }

    let scan_lo = target_ts.saturating_sub(2 * skew_ms);
    let scan_hi = target_ts.saturating_add(2 * skew_ms);

    // Scan left from mid-1.
    let mut cursor = mid;
    while cursor > 0 {
        cursor -= 1;
        let k = match getter.get(cursor)? {
            GetOutcome::Found(k) => k,
            GetOutcome::OutOfRange => break,
        };
        let ts = key::timestamp_ms(&k);
        if ts < scan_lo || ts > scan_hi {
            break;
        }
        if k == *target {
            return Ok(cursor);
        }
    }

    // Scan right from mid+1.
    let mut cursor = mid;
    loop {
        cursor += 1;
        let k = match getter.get(cursor)? {
            GetOutcome::Found(k) => k,
            GetOutcome::OutOfRange => break,
        };
        let ts = key::timestamp_ms(&k);
        if ts < scan_lo || ts > scan_hi {
            break;
        }
        if k == *target {
            return Ok(cursor);
        }
    }

    Err(Error::key_not_found())
}
