//! Uptime-derived authorization codes for destructive commands
//!
//! A code is derived from how many whole windows the device has been up and
//! from its identity. No secret is persisted on either side: the backend can
//! compute the same value if it knows the device's boot time.
//!
//! **This is obscurity, not security.** Anyone who knows the identity and can
//! estimate uptime can produce a valid code, a code stays valid for a whole
//! window and can be replayed within it. It keeps a stray command from firing
//! by accident; it does not authenticate anyone. The derivation is part of
//! the wire contract with the backend and must not be changed.

use embassy_time::{Duration, Instant};
use log::debug;
use thiserror_no_std::Error;

/// Window length used by the firmware
pub const DEFAULT_WINDOW_MINUTES: u32 = 5;

/// Perturbs the window index so the sequence of codes does not look linear
/// over a short observation period.
pub const FUDGE_TABLE: [u8; 10] = [42, 69, 3, 18, 25, 12, 51, 93, 54, 76];

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpError {
    /// The first window has not elapsed since boot; no code exists yet.
    #[error("no code before {} s of uptime, {} s to go", .window.as_secs(), .remaining.as_secs())]
    NotYetAvailable { window: Duration, remaining: Duration },
}

/// Stateless code derivation for a fixed window length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtpGate {
    window: Duration,
}

impl OtpGate {
    /// A zero-minute window is treated as one minute.
    pub const fn new(window_minutes: u32) -> Self {
        let minutes = if window_minutes == 0 { 1 } else { window_minutes };
        Self {
            window: Duration::from_secs(minutes as u64 * 60),
        }
    }

    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Derive the code valid at `uptime` for `identity`.
    pub fn compute(&self, uptime: Instant, identity: &str) -> Result<u16, OtpError> {
        let window = self.window.as_micros();
        let now = uptime.as_micros();

        if now < window {
            return Err(OtpError::NotYetAvailable {
                window: self.window,
                remaining: Duration::from_micros(window - now),
            });
        }

        let index = now / window;
        let fudge = FUDGE_TABLE[(index % FUDGE_TABLE.len() as u64) as usize];
        let mut acc = index.wrapping_add(fudge as u64);
        for byte in identity.bytes() {
            acc = acc.wrapping_add(byte as u64);
        }

        Ok(acc as u16)
    }

    /// Compare a candidate against the current code.
    ///
    /// `Ok(false)` is a wrong code; `Err` means no code can be checked yet and
    /// the action must be rejected until the device has been up longer.
    pub fn check(&self, uptime: Instant, identity: &str, candidate: u16) -> Result<bool, OtpError> {
        let expected = self.compute(uptime, identity)?;
        let accepted = expected == candidate;
        if !accepted {
            debug!("otp: rejected candidate {}", candidate);
        }
        Ok(accepted)
    }
}

impl Default for OtpGate {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_MINUTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIVE_MINUTES_US: u64 = 5 * 60 * 1_000_000;

    #[test]
    fn test_golden_vector() {
        let gate = OtpGate::new(5);
        let uptime = Instant::from_micros(18_000_000_001);

        // idx 60, table[0] = 42, "zero" = 122 + 101 + 114 + 111
        assert_eq!(gate.compute(uptime, "zero"), Ok(60 + 42 + 448));
        assert_eq!(gate.compute(uptime, "zero"), Ok(550));
    }

    #[test]
    fn test_unavailable_before_first_window() {
        let gate = OtpGate::new(5);

        assert_eq!(
            gate.compute(Instant::from_micros(0), "zero"),
            Err(OtpError::NotYetAvailable {
                window: Duration::from_secs(300),
                remaining: Duration::from_secs(300),
            })
        );
        assert!(gate.compute(Instant::from_micros(FIVE_MINUTES_US - 1), "zero").is_err());
        assert!(gate.compute(Instant::from_micros(FIVE_MINUTES_US), "zero").is_ok());
    }

    #[test]
    fn test_check_distinguishes_unavailable_from_wrong() {
        let gate = OtpGate::new(5);

        assert!(matches!(
            gate.check(Instant::from_micros(1_000), "zero", 550),
            Err(OtpError::NotYetAvailable { .. })
        ));
        let uptime = Instant::from_micros(18_000_000_001);
        assert_eq!(gate.check(uptime, "zero", 551), Ok(false));
        assert_eq!(gate.check(uptime, "zero", 550), Ok(true));
    }

    #[test]
    fn test_code_constant_within_window() {
        let gate = OtpGate::new(5);
        let start = Instant::from_micros(60 * FIVE_MINUTES_US);
        let end = Instant::from_micros(61 * FIVE_MINUTES_US - 1);

        assert_eq!(gate.compute(start, "ezero"), gate.compute(end, "ezero"));
        assert_ne!(
            gate.compute(end, "ezero"),
            gate.compute(Instant::from_micros(61 * FIVE_MINUTES_US), "ezero")
        );
    }

    #[test]
    fn test_pure_function_of_inputs() {
        let gate = OtpGate::new(5);
        let uptime = Instant::from_micros(7 * FIVE_MINUTES_US + 12_345);
        assert_eq!(gate.compute(uptime, "amini"), gate.compute(uptime, "amini"));
    }

    #[test]
    fn test_identity_changes_code() {
        let gate = OtpGate::new(5);
        let uptime = Instant::from_micros(18_000_000_001);

        assert_ne!(gate.compute(uptime, "zero"), gate.compute(uptime, "zerp"));
        assert_ne!(gate.compute(uptime, "ezero"), gate.compute(uptime, "amini"));
    }

    #[test]
    fn test_truncates_to_sixteen_bits() {
        let gate = OtpGate::new(1);
        // index 70_000, table[0]
        let uptime = Instant::from_micros(70_000 * 60 * 1_000_000);
        let expected = ((70_000u64 + 42 + b'a' as u64) & 0xFFFF) as u16;
        assert_eq!(gate.compute(uptime, "a"), Ok(expected));
    }

    #[test]
    fn test_zero_window_is_one_minute() {
        let gate = OtpGate::new(0);
        assert_eq!(gate.window(), Duration::from_secs(60));

        assert!(gate.compute(Instant::from_secs(5), "zero").is_err());
        // index 2, table[2] = 3
        assert_eq!(
            gate.compute(Instant::from_secs(150), "zero"),
            Ok(2 + 3 + 448)
        );
    }

    #[test]
    fn test_window_length() {
        assert_eq!(OtpGate::new(5).window(), Duration::from_secs(300));
        assert_eq!(OtpGate::default(), OtpGate::new(DEFAULT_WINDOW_MINUTES));
    }
}
