//! Resume points and live tailing of running inputs

use crate::config::LiveWait;
use crate::error::{MiliError, Result};
use crate::registry::{FamilyId, FamilyRegistry};
use std::thread;
use std::time::Instant;
use tracing::{debug, info};

/// Relative tolerance under which two state times are the same step
pub const TIME_TOLERANCE: f64 = 1e-6;

fn same_time(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs());
    (a - b).abs() <= TIME_TOLERANCE * scale.max(f64::MIN_POSITIVE)
}

/// First input state to combine into an output holding `out_times`
///
/// `None` means the output is already up to date.
pub fn resume_index(out_times: &[f64], in_times: &[f64]) -> Option<usize> {
    let Some(&last) = out_times.last() else {
        return Some(0);
    };
    let (&first_in, &last_in) = (in_times.first()?, in_times.last()?);

    if first_in > last && !same_time(first_in, last) {
        return Some(0);
    }
    if last_in <= last || same_time(last_in, last) {
        return None;
    }
    in_times
        .iter()
        .position(|&t| t > last && !same_time(t, last))
}

/// Block until every input has state `state`
///
/// Returns `Ok(false)` when the first input produces nothing new within the
/// timeout, which ends a live run normally. The remaining inputs share one
/// timeout counted from when the first input has the state; any input still
/// missing it then is an error.
pub fn wait_for_state(
    registry: &mut FamilyRegistry,
    inputs: &[FamilyId],
    state: usize,
    live: &LiveWait,
) -> Result<bool> {
    let Some((&first, rest)) = inputs.split_first() else {
        return Ok(false);
    };
    if !poll_until(registry, first, state, Instant::now() + live.timeout(), live)? {
        info!(
            "No state {} after {}s, ending live combine",
            state, live.timeout_secs
        );
        return Ok(false);
    }
    let deadline = Instant::now() + live.timeout();
    for &id in rest {
        if !poll_until(registry, id, state, deadline, live)? {
            return Err(MiliError::LiveWaitTimeout {
                state,
                waited_secs: live.timeout_secs,
            });
        }
    }
    Ok(true)
}

fn poll_until(
    registry: &mut FamilyRegistry,
    id: FamilyId,
    state: usize,
    deadline: Instant,
    live: &LiveWait,
) -> Result<bool> {
    if registry.get(id)?.state_qty() > state {
        return Ok(true);
    }
    loop {
        let family = registry.get_mut(id)?;
        let qty = family.refresh_states()?;
        if qty > state {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        debug!(
            "Family '{}' has {} states, waiting for {}",
            family.root(),
            qty,
            state
        );
        thread::sleep(live.poll_interval());
    }
}
