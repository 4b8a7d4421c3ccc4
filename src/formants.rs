//! Formant adjustment command encoding.
//!
//! Apollo exposes ten voice-timbre parameters only through relative nudge
//! commands (`@u<index><HH><sign> `) with a single-byte magnitude; there is
//! no absolute set and no query. The engine therefore tracks the last
//! deltas it applied and sends diffs, re-baselining with a soft reset (`@J`)
//! whenever the device may have reverted its internal state.

/// Number of adjustable formant parameters.
pub const FORMANT_COUNT: usize = 10;
/// Hard limits for a single cumulative delta.
pub const FORMANT_DELTA_MIN: i32 = -255;
pub const FORMANT_DELTA_MAX: i32 = 255;

fn adjust_command(index: usize, magnitude: u32, positive: bool) -> String {
    let sign = if positive { '+' } else { '-' };
    format!("@u{index}{magnitude:02X}{sign} ")
}

/// Commands applying `deltas` on top of a freshly reset baseline.
///
/// Zero deltas emit nothing; magnitudes clamp to the ±255 hard range.
pub fn commands_from_deltas(deltas: &[i32]) -> Vec<String> {
    let mut commands = Vec::new();
    for (index, &delta) in deltas.iter().enumerate() {
        if delta == 0 {
            continue;
        }
        let clamped = delta.clamp(FORMANT_DELTA_MIN, FORMANT_DELTA_MAX);
        commands.push(adjust_command(index, clamped.unsigned_abs().min(0xFF), clamped > 0));
    }
    commands
}

/// Commands moving one parameter by `diff`, split into ≤255 steps.
///
/// The device command is a strictly relative single-byte step, so a large
/// diff becomes several same-sign commands.
pub fn adjust_commands(index: usize, diff: i32) -> Vec<String> {
    if diff == 0 {
        return Vec::new();
    }
    let positive = diff > 0;
    let mut remaining = diff.unsigned_abs();
    let mut commands = Vec::new();
    while remaining > 0 {
        let chunk = remaining.min(0xFF);
        commands.push(adjust_command(index, chunk, positive));
        remaining -= chunk;
    }
    commands
}

/// Commands moving the device from `applied` to `desired`, per index.
///
/// A missing `applied` entry is treated as zero (nothing applied yet).
pub fn diff_commands(desired: &[i32], applied: &[i32]) -> Vec<String> {
    let mut commands = Vec::new();
    for (index, &target) in desired.iter().enumerate() {
        let current = applied.get(index).copied().unwrap_or(0);
        commands.extend(adjust_commands(index, target - current));
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_deltas_emit_nothing() {
        assert!(commands_from_deltas(&[0, 0, 0]).is_empty());
        assert!(adjust_commands(3, 0).is_empty());
    }

    #[test]
    fn single_positive_delta() {
        assert_eq!(commands_from_deltas(&[1]), vec!["@u001+ ".to_string()]);
        assert_eq!(commands_from_deltas(&[0, -16]), vec!["@u110- ".to_string()]);
    }

    #[test]
    fn deltas_clamp_to_single_byte_magnitude() {
        assert_eq!(commands_from_deltas(&[400]), vec!["@u0FF+ ".to_string()]);
        assert_eq!(commands_from_deltas(&[-1000]), vec!["@u0FF- ".to_string()]);
    }

    #[test]
    fn large_adjustments_split_into_steps() {
        assert_eq!(
            adjust_commands(2, 300),
            vec!["@u2FF+ ".to_string(), "@u22D+ ".to_string()]
        );
        assert_eq!(
            adjust_commands(0, -510),
            vec!["@u0FF- ".to_string(), "@u0FF- ".to_string()]
        );
    }

    #[test]
    fn diffing_against_applied_state() {
        assert_eq!(diff_commands(&[10], &[0]), vec!["@u00A+ ".to_string()]);
        assert_eq!(diff_commands(&[10], &[10]), Vec::<String>::new());
        assert_eq!(diff_commands(&[0], &[10]), vec!["@u00A- ".to_string()]);
    }

    #[test]
    fn missing_applied_entries_count_as_zero() {
        assert_eq!(
            diff_commands(&[5, 7], &[5]),
            vec!["@u107+ ".to_string()]
        );
    }
}
