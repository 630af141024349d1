//! Bit timing for the add-on CAN controllers.
//!
//! The add-on controllers are clocked from their own crystal, so the prescaler
//! and segment lengths have to be derived from the configured crystal frequency
//! before the controller can join the bus. The solver searches all segment
//! lengths the controller supports, preferring an exact bitrate and then the
//! sample point closest to (but not after) the requested one.

use thiserror::Error;

use crate::can::CanInterface;

const CAN_SYNC_SEG: u32 = 1;
const CAN_CALC_MAX_ERROR: u32 = 50; // 0.50% in one-hundredth percent units

pub const NOMINAL_BITRATE: u32 = 500_000;
pub const DATA_BITRATE: u32 = 2_000_000; // SAE J2284-4
const SAMPLE_POINT_PERMILLE: u32 = 800; // SAE J2284-4 and SAE J2284-5

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimingError {
    #[error("crystal frequency must be greater than 0")]
    InvalidClock,
    #[error("bitrate error too high: {error_hundredth_percent} (1/100 percent)")]
    BitrateErrorTooHigh { error_hundredth_percent: u32 },
    #[error("unable to find a valid timing solution for {bitrate} bit/s from a {crystal_mhz} MHz crystal")]
    NoSolution { bitrate: u32, crystal_mhz: u32 },
}

/// Segment limits of one controller phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ControllerLimits {
    /// Prescaler input clock, after any fixed internal divider.
    clock_hz: u32,
    tseg1_min: u32,
    tseg1_max: u32,
    tseg2_min: u32,
    tseg2_max: u32,
    sjw_max: u32,
    brp_min: u32,
    brp_max: u32,
}

impl ControllerLimits {
    /// Classic add-on controller (MCP2515 class). The prescaler runs at half the crystal frequency.
    fn addon_classic(crystal_hz: u32) -> Self {
        Self {
            clock_hz: crystal_hz / 2,
            tseg1_min: 2,
            tseg1_max: 16,
            tseg2_min: 2,
            tseg2_max: 8,
            sjw_max: 4,
            brp_min: 1,
            brp_max: 64,
        }
    }

    /// Nominal phase of the FD add-on controller (MCP2518FD class).
    fn addon_fd_nominal(crystal_hz: u32) -> Self {
        Self {
            clock_hz: crystal_hz,
            tseg1_min: 2,
            tseg1_max: 256,
            tseg2_min: 1,
            tseg2_max: 128,
            sjw_max: 128,
            brp_min: 1,
            brp_max: 256,
        }
    }

    /// Data phase of the FD add-on controller.
    fn addon_fd_data(crystal_hz: u32) -> Self {
        Self {
            clock_hz: crystal_hz,
            tseg1_min: 1,
            tseg1_max: 32,
            tseg2_min: 1,
            tseg2_max: 16,
            sjw_max: 16,
            brp_min: 1,
            brp_max: 256,
        }
    }
}

/// Register values for one phase, plus what they actually achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SegmentTiming {
    pub brp: u32,
    pub tseg1: u32,
    pub tseg2: u32,
    pub sjw: u32,
    /// Achieved bitrate in bits per second.
    pub bitrate: u32,
    /// Achieved sample point in 1/1000 of the bit time.
    pub sample_point: u32,
}

impl SegmentTiming {
    /// Duration of one bit in time quanta.
    pub fn bit_time_tq(&self) -> u32 {
        CAN_SYNC_SEG + self.tseg1 + self.tseg2
    }
}

/// Complete timing for a controller: nominal phase and, for FD operation, the data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BusTiming {
    pub nominal: SegmentTiming,
    pub data: Option<SegmentTiming>,
}

impl BusTiming {
    /// Timing for an add-on controller clocked from `crystal_mhz`.
    pub fn for_addon(interface: CanInterface, crystal_mhz: u32, fd: bool) -> Result<Self, TimingError> {
        let crystal_hz = match crystal_mhz.checked_mul(1_000_000) {
            Some(hz) if hz > 0 => hz,
            _ => return Err(TimingError::InvalidClock),
        };

        if interface.is_fd_capable() {
            let nominal = solve(&ControllerLimits::addon_fd_nominal(crystal_hz), NOMINAL_BITRATE)
                .map_err(|e| with_crystal(e, crystal_mhz))?;
            let data = if fd {
                Some(
                    solve(&ControllerLimits::addon_fd_data(crystal_hz), DATA_BITRATE)
                        .map_err(|e| with_crystal(e, crystal_mhz))?,
                )
            } else {
                None
            };
            Ok(Self { nominal, data })
        } else {
            let nominal = solve(&ControllerLimits::addon_classic(crystal_hz), NOMINAL_BITRATE)
                .map_err(|e| with_crystal(e, crystal_mhz))?;
            Ok(Self { nominal, data: None })
        }
    }
}

fn with_crystal(err: TimingError, crystal_mhz: u32) -> TimingError {
    match err {
        TimingError::NoSolution { bitrate, .. } => TimingError::NoSolution { bitrate, crystal_mhz },
        other => other,
    }
}

#[derive(Debug, Clone, Copy)]
struct SamplePointCandidate {
    sample_point: u32,
    sample_point_error: u32,
    tseg1: u32,
    tseg2: u32,
}

fn solve(limits: &ControllerLimits, bitrate: u32) -> Result<SegmentTiming, TimingError> {
    if limits.clock_hz == 0 {
        return Err(TimingError::InvalidClock);
    }

    let mut best_bitrate_error = u32::MAX;
    let mut best_sample_point_error = u32::MAX;
    let mut best: Option<(u32, u32)> = None; // (brp, tseg)

    let max_tseg = (limits.tseg1_max + limits.tseg2_max) * 2 + 1;
    let min_tseg = (limits.tseg1_min + limits.tseg2_min) * 2;

    for tseg in (min_tseg..=max_tseg).rev() {
        let tsegall = CAN_SYNC_SEG + tseg / 2;
        let brp = (limits.clock_hz as u64 / (tsegall as u64 * bitrate as u64)) as u32 + tseg % 2;
        if brp < limits.brp_min || brp > limits.brp_max {
            continue;
        }

        let bitrate_error = bitrate.abs_diff(limits.clock_hz / (brp * tsegall));
        if bitrate_error > best_bitrate_error {
            continue;
        }
        if bitrate_error < best_bitrate_error {
            best_sample_point_error = u32::MAX;
        }

        let candidate = fit_sample_point(limits, tseg / 2);
        if candidate.sample_point_error >= best_sample_point_error {
            continue;
        }

        best_bitrate_error = bitrate_error;
        best_sample_point_error = candidate.sample_point_error;
        best = Some((brp, tseg / 2));

        if bitrate_error == 0 && candidate.sample_point_error == 0 {
            break;
        }
    }

    let (brp, tseg) = best.ok_or(TimingError::NoSolution { bitrate, crystal_mhz: 0 })?;

    if best_bitrate_error != 0 {
        let error_hundredth_percent = ((best_bitrate_error as u64 * 10_000 / bitrate as u64) as u32).max(1);
        if error_hundredth_percent > CAN_CALC_MAX_ERROR {
            return Err(TimingError::BitrateErrorTooHigh { error_hundredth_percent });
        }
    }

    let candidate = fit_sample_point(limits, tseg);
    let phase_seg1 = candidate.tseg1 - candidate.tseg1 / 2;
    let sjw = (phase_seg1.min(candidate.tseg2 / 2)).clamp(1, limits.sjw_max);
    let bit_time_tq = CAN_SYNC_SEG + candidate.tseg1 + candidate.tseg2;

    Ok(SegmentTiming {
        brp,
        tseg1: candidate.tseg1,
        tseg2: candidate.tseg2,
        sjw,
        bitrate: limits.clock_hz / (brp * bit_time_tq),
        sample_point: candidate.sample_point,
    })
}

fn fit_sample_point(limits: &ControllerLimits, tseg: u32) -> SamplePointCandidate {
    let mut best = SamplePointCandidate {
        sample_point: 0,
        sample_point_error: u32::MAX,
        tseg1: 0,
        tseg2: 0,
    };

    for i in 0..=1 {
        let bit_tq = tseg + CAN_SYNC_SEG;
        let mut tseg2 = (bit_tq - (SAMPLE_POINT_PERMILLE * bit_tq) / 1000)
            .saturating_sub(i)
            .clamp(limits.tseg2_min, limits.tseg2_max);
        let mut tseg1 = tseg.saturating_sub(tseg2);
        if tseg1 > limits.tseg1_max {
            tseg1 = limits.tseg1_max;
            tseg2 = tseg - tseg1;
        }

        let sample_point = 1000 * (bit_tq - tseg2) / bit_tq;
        let sample_point_error = SAMPLE_POINT_PERMILLE.abs_diff(sample_point);

        if sample_point <= SAMPLE_POINT_PERMILLE && sample_point_error < best.sample_point_error {
            best = SamplePointCandidate {
                sample_point,
                sample_point_error,
                tseg1,
                tseg2,
            };
        }
    }

    best
}
