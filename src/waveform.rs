//! Waveform generation: turns declarative sweep descriptions into ordered
//! lists of target voltages tagged with a cycle id.
//!
//! Every function here is pure and deterministic. Range checks against the
//! instrument's safety limits are the executor's job, not the generator's.

use serde::{Deserialize, Serialize};

/// Largest sequence any generator produces; longer requests yield nothing.
pub const MAX_SWEEP_POINTS: usize = 1_000_000;

/// One target level of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub target_voltage: f64,
    /// 1-based repetition index; 0 for untagged single-shot points.
    pub cycle_id: u32,
    /// Seconds since the start of the sequence, for hold sequences.
    pub relative_time_s: Option<f64>,
}

impl SweepPoint {
    pub fn new(target_voltage: f64, cycle_id: u32) -> Self {
        Self {
            target_voltage,
            cycle_id,
            relative_time_s: None,
        }
    }

    pub fn untagged(target_voltage: f64) -> Self {
        Self::new(target_voltage, 0)
    }
}

/// Phase parameters of a write-read-erase-read hold sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WrerParams {
    pub write_v: f64,
    pub write_t: f64,
    pub read_v: f64,
    pub read_t: f64,
    pub erase_v: f64,
    pub erase_t: f64,
    pub sample_interval: f64,
    pub cycles: u32,
}

/// Canned one-way sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SweepPreset {
    ZeroToOne,
    ZeroToFive,
    MinusOneToOne,
}

impl SweepPreset {
    /// `(start, stop, step)` of the preset.
    pub fn parameters(self) -> (f64, f64, f64) {
        match self {
            SweepPreset::ZeroToOne => (0.0, 1.0, 0.1),
            SweepPreset::ZeroToFive => (0.0, 5.0, 0.5),
            SweepPreset::MinusOneToOne => (-1.0, 1.0, 0.1),
        }
    }

    pub fn points(self) -> Vec<SweepPoint> {
        let (start, stop, step) = self.parameters();
        linear_sweep(start, stop, step)
    }
}

/// Round to 12 decimal places, ties to even.
fn round12(value: f64) -> f64 {
    (value * 1e12).round_ties_even() / 1e12
}

/// Raw ramp from `start` towards `stop` in increments of `step`.
///
/// Stops once a value has passed `stop` by more than `|step| / 1000`.
/// Empty when `step` is zero or points away from `stop`.
pub fn linear_values(start: f64, stop: f64, step: f64) -> Vec<f64> {
    if step == 0.0 || !start.is_finite() || !stop.is_finite() || !step.is_finite() {
        return Vec::new();
    }
    if (stop - start) * step < 0.0 {
        return Vec::new();
    }
    let expected = ((stop - start) / step).floor() + 1.0;
    if !(expected <= MAX_SWEEP_POINTS as f64) {
        return Vec::new();
    }

    let tolerance = step.abs() / 1000.0;
    let mut values = Vec::new();
    let mut k = 0u64;
    loop {
        let value = start + k as f64 * step;
        let in_range = if step > 0.0 {
            value <= stop + tolerance
        } else {
            value >= stop - tolerance
        };
        if !in_range {
            break;
        }
        values.push(round12(value));
        k += 1;
    }
    values
}

/// One-way sweep, tagged as cycle 1.
pub fn linear_sweep(start: f64, stop: f64, step: f64) -> Vec<SweepPoint> {
    tag_cycle(&linear_values(start, stop, step), 1)
}

/// `0 -> +peak -> 0 -> -peak -> 0`, repeated `cycles` times.
///
/// Consecutive cycles share their boundary zero.
pub fn simple_cycle(peak: f64, step: f64, cycles: u32) -> Vec<SweepPoint> {
    let step = step.abs();
    let peak = peak.abs();
    if step == 0.0 || cycles < 1 {
        return Vec::new();
    }
    if peak == 0.0 {
        return vec![SweepPoint::new(0.0, 1)];
    }

    let segments = [
        linear_values(0.0, peak, step),
        linear_values(peak, 0.0, -step),
        linear_values(0.0, -peak, -step),
        linear_values(-peak, 0.0, step),
    ];
    match chain_shared(segments) {
        Some(single) => repeat_shared(&single, cycles),
        None => Vec::new(),
    }
}

/// Arbitrary ordered `(from, to)` segments chained into one cycle.
///
/// The step magnitude is signed towards each segment's direction. A segment
/// with `from == to` contributes a single point. If any segment produces
/// nothing the whole sequence is empty.
pub fn custom_sequence(segments: &[(f64, f64)], step: f64, cycles: u32) -> Vec<SweepPoint> {
    let step = step.abs();
    if step == 0.0 || cycles < 1 || segments.is_empty() {
        return Vec::new();
    }

    let ramps = segments.iter().map(|&(from, to)| {
        if from == to {
            vec![round12(from)]
        } else {
            let signed = if to > from { step } else { -step };
            linear_values(from, to, signed)
        }
    });
    match chain_shared(ramps) {
        Some(single) => repeat_shared(&single, cycles),
        None => Vec::new(),
    }
}

/// `max(1, round(hold / interval))` samples at `voltage`.
pub fn hold_values(voltage: f64, hold_s: f64, interval_s: f64) -> Vec<f64> {
    if hold_s <= 0.0 || interval_s <= 0.0 || !hold_s.is_finite() || !interval_s.is_finite() {
        return Vec::new();
    }
    let ratio = (hold_s / interval_s).round_ties_even();
    if !(ratio <= MAX_SWEEP_POINTS as f64) {
        return Vec::new();
    }
    let samples = (ratio as usize).max(1);
    vec![round12(voltage); samples]
}

/// Write-read-erase-read hold sequence with per-point timestamps.
///
/// Cycles repeat the whole template; hold phases are not ramps so nothing
/// is shared between cycles.
pub fn hold_sequence(params: &WrerParams) -> Vec<SweepPoint> {
    if params.cycles < 1 {
        return Vec::new();
    }
    let dt = params.sample_interval;
    let single: Vec<f64> = [
        (params.write_v, params.write_t),
        (params.read_v, params.read_t),
        (params.erase_v, params.erase_t),
        (params.read_v, params.read_t),
    ]
    .iter()
    .flat_map(|&(v, t)| hold_values(v, t, dt))
    .collect();
    if single.is_empty() || !within_limit(single.len(), params.cycles) {
        return Vec::new();
    }

    (1..=params.cycles)
        .flat_map(|cycle| single.iter().map(move |&v| (v, cycle)))
        .enumerate()
        .map(|(index, (v, cycle))| SweepPoint {
            target_voltage: v,
            cycle_id: cycle,
            relative_time_s: Some(index as f64 * dt),
        })
        .collect()
}

/// Target voltages of a point list, in order.
pub fn voltages(points: &[SweepPoint]) -> Vec<f64> {
    points.iter().map(|p| p.target_voltage).collect()
}

fn tag_cycle(values: &[f64], cycle_id: u32) -> Vec<SweepPoint> {
    values
        .iter()
        .map(|&v| SweepPoint::new(v, cycle_id))
        .collect()
}

/// Concatenate ramps, dropping each later ramp's first (shared) point.
fn chain_shared<I>(ramps: I) -> Option<Vec<f64>>
where
    I: IntoIterator<Item = Vec<f64>>,
{
    let mut single = Vec::new();
    for (idx, ramp) in ramps.into_iter().enumerate() {
        if ramp.is_empty() {
            return None;
        }
        let skip = usize::from(idx > 0);
        single.extend(ramp.into_iter().skip(skip));
    }
    Some(single)
}

/// Repeat a cycle, dropping the leading point of every repetition after
/// the first.
fn repeat_shared(single: &[f64], cycles: u32) -> Vec<SweepPoint> {
    if !within_limit(single.len(), cycles) {
        return Vec::new();
    }
    let mut points = tag_cycle(single, 1);
    for cycle in 2..=cycles {
        points.extend(single.iter().skip(1).map(|&v| SweepPoint::new(v, cycle)));
    }
    points
}

fn within_limit(per_cycle: usize, cycles: u32) -> bool {
    per_cycle
        .checked_mul(cycles as usize)
        .is_some_and(|n| n <= MAX_SWEEP_POINTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-12)
    }

    #[test]
    fn test_linear_sweep_up() {
        let values = linear_values(0.0, 1.0, 0.1);
        assert_eq!(values.len(), 11);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[3], 0.3);
        assert_eq!(values[10], 1.0);
    }

    #[test]
    fn test_linear_sweep_down_reverses_up() {
        let mut up = linear_values(0.0, 1.0, 0.1);
        let down = linear_values(1.0, 0.0, -0.1);
        up.reverse();
        assert!(approx(&up, &down));
    }

    #[test]
    fn test_linear_sweep_sign_mismatch_and_zero_step() {
        assert!(linear_values(0.0, 1.0, -0.1).is_empty());
        assert!(linear_values(1.0, 0.0, 0.1).is_empty());
        assert!(linear_values(0.0, 1.0, 0.0).is_empty());
    }

    #[test]
    fn test_linear_sweep_is_deterministic() {
        assert_eq!(linear_sweep(-2.0, 3.0, 0.25), linear_sweep(-2.0, 3.0, 0.25));
    }

    #[test]
    fn test_linear_sweep_single_point_when_start_equals_stop() {
        assert_eq!(linear_values(0.5, 0.5, 0.1), vec![0.5]);
    }

    #[test]
    fn test_simple_cycle_two_cycles() {
        let points = simple_cycle(1.0, 0.5, 2);
        let expected_first = [0.0, 0.5, 1.0, 0.5, 0.0, -0.5, -1.0, -0.5, 0.0];
        assert_eq!(points.len(), 17);
        assert!(approx(&voltages(&points[..9]), &expected_first));
        assert!(points[..9].iter().all(|p| p.cycle_id == 1));
        assert!(approx(&voltages(&points[9..]), &expected_first[1..]));
        assert!(points[9..].iter().all(|p| p.cycle_id == 2));
    }

    #[test]
    fn test_simple_cycle_zero_peak() {
        assert_eq!(simple_cycle(0.0, 0.1, 3), vec![SweepPoint::new(0.0, 1)]);
        assert!(simple_cycle(1.0, 0.0, 1).is_empty());
        assert!(simple_cycle(1.0, 0.1, 0).is_empty());
    }

    #[test]
    fn test_simple_cycle_negative_peak_uses_magnitude() {
        assert_eq!(simple_cycle(-1.0, 0.5, 1), simple_cycle(1.0, 0.5, 1));
    }

    #[test]
    fn test_custom_sequence_chains_segments() {
        let points = custom_sequence(&[(0.0, 1.0), (1.0, -1.0), (-1.0, -1.0)], 0.5, 1);
        let expected = [0.0, 0.5, 1.0, 0.5, 0.0, -0.5, -1.0];
        assert!(approx(&voltages(&points), &expected));
        assert!(points.iter().all(|p| p.cycle_id == 1));
    }

    #[test]
    fn test_custom_sequence_repeats_without_shared_point() {
        let points = custom_sequence(&[(0.0, 1.0), (1.0, 0.0)], -0.5, 2);
        assert_eq!(voltages(&points), vec![0.0, 0.5, 1.0, 0.5, 0.0, 0.5, 1.0, 0.5, 0.0]);
        assert_eq!(points[5].cycle_id, 2);
    }

    #[test]
    fn test_custom_sequence_empty_inputs() {
        assert!(custom_sequence(&[], 0.1, 1).is_empty());
        assert!(custom_sequence(&[(0.0, 1.0)], 0.0, 1).is_empty());
        assert!(custom_sequence(&[(0.0, f64::NAN)], 0.1, 1).is_empty());
    }

    #[test]
    fn test_hold_sequence_phase_lengths() {
        let params = WrerParams {
            write_v: 2.0,
            write_t: 0.2,
            read_v: 0.1,
            read_t: 0.3,
            erase_v: -2.0,
            erase_t: 0.1,
            sample_interval: 0.1,
            cycles: 1,
        };
        let points = hold_sequence(&params);
        let v = voltages(&points);
        assert_eq!(&v[..2], &[2.0, 2.0]);
        assert_eq!(v[2], 0.1);
        assert_eq!(v.len(), 2 + 3 + 1 + 3);
        assert_eq!(points[4].relative_time_s, Some(4.0 * 0.1));
    }

    #[test]
    fn test_hold_sequence_cycles_repeat_full_template() {
        let params = WrerParams {
            write_v: 1.0,
            write_t: 0.01,
            read_v: 0.0,
            read_t: 0.01,
            erase_v: -1.0,
            erase_t: 0.01,
            sample_interval: 0.1,
            cycles: 3,
        };
        let points = hold_sequence(&params);
        // each phase is shorter than the interval but still gets one sample
        assert_eq!(points.len(), 12);
        assert_eq!(points[4].target_voltage, 1.0);
        assert_eq!(points[4].cycle_id, 2);
        assert_eq!(points[11].cycle_id, 3);
        assert_eq!(points[11].relative_time_s, Some(11.0 * 0.1));
    }

    #[test]
    fn test_hold_values_rejects_non_positive_durations() {
        assert!(hold_values(1.0, 0.0, 0.1).is_empty());
        assert!(hold_values(1.0, 0.1, 0.0).is_empty());
    }

    #[test]
    fn test_oversized_requests_yield_nothing() {
        assert!(hold_values(1.0, 1e300, 1e-300).is_empty());
        let params = WrerParams {
            write_v: 1.0,
            write_t: 1e300,
            read_v: 0.1,
            read_t: 0.1,
            erase_v: -1.0,
            erase_t: 0.1,
            sample_interval: 1e-300,
            cycles: 1,
        };
        assert!(hold_sequence(&params).is_empty());
        assert!(linear_sweep(-1e300, 1e300, 1e-300).is_empty());
        assert!(simple_cycle(1.0, 0.1, u32::MAX).is_empty());
    }

    #[test]
    fn test_presets() {
        assert_eq!(SweepPreset::ZeroToOne.points().len(), 11);
        assert_eq!(SweepPreset::ZeroToFive.points().len(), 11);
        assert_eq!(SweepPreset::MinusOneToOne.points().len(), 21);
    }
}
