extern crate ffmpeg_next as ffmpeg;

use std::time::Duration;

use ffmpeg::util::mathematics::rescale::{Rescale, TIME_BASE};
use ffmpeg::Rational as AvRational;

/// A timestamp or duration tied to the time base it is expressed in.
///
/// Packets and frames hand out PTS, DTS and durations as [`Time`] so the
/// time base always travels with the raw tick count. libav* frequently
/// reports unknown timestamps, so a [`Time`] may hold no value at all;
/// conversions to seconds then return `0.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Time {
    value: Option<i64>,
    time_base: AvRational,
}

impl Time {
    /// Wrap a raw tick count and the time base it is counted in.
    pub fn new(value: Option<i64>, time_base: AvRational) -> Time {
        Self { value, time_base }
    }

    /// A timestamp measured in seconds, held in `AV_TIME_BASE` units.
    pub fn from_secs_f64(secs: f64) -> Time {
        Self {
            value: Some((secs * TIME_BASE.denominator() as f64).round() as i64),
            time_base: TIME_BASE,
        }
    }

    /// Whether a value is present at all.
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// The raw tick count. Only meaningful together with
    /// [`Time::time_base`].
    pub fn value(&self) -> Option<i64> {
        self.value
    }

    /// The time base the tick count is expressed in.
    pub fn time_base(&self) -> AvRational {
        self.time_base
    }

    /// Express the same moment in another time base.
    ///
    /// Goes through `av_rescale_q`, so the conversion rounds the way the
    /// rest of libav* rounds and survives values that would overflow a
    /// naive multiply.
    pub fn rescale(&self, time_base: AvRational) -> Time {
        Time {
            value: self
                .value
                .map(|value| value.rescale(self.time_base, time_base)),
            time_base,
        }
    }

    /// The value in seconds, `0.0` when no value is present.
    pub fn as_secs_f64(&self) -> f64 {
        match self.value {
            Some(value) => {
                value as f64
                    * (self.time_base.numerator() as f64 / self.time_base.denominator() as f64)
            }
            None => 0.0,
        }
    }
}

impl From<Duration> for Time {
    #[inline]
    fn from(duration: Duration) -> Self {
        Time::from_secs_f64(duration.as_secs_f64())
    }
}

impl From<Time> for Duration {
    fn from(time: Time) -> Self {
        Duration::from_secs_f64(time.as_secs_f64().max(0.0))
    }
}

impl std::fmt::Display for Time {
    /// `ticks/den secs` for present values, `none` otherwise.
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.value {
            Some(value) => {
                let num = self.time_base.numerator() as i64 * value;
                let den = self.time_base.denominator();
                write!(f, "{num}/{den} secs")
            }
            None => write!(f, "none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_value_and_time_base() {
        let time = Time::new(Some(1500), AvRational::new(1, 1000));
        assert!(time.has_value());
        assert_eq!(time.value(), Some(1500));
        assert_eq!(time.time_base(), AvRational::new(1, 1000));
        assert_eq!(time.as_secs_f64(), 1.5);
    }

    #[test]
    fn rescale_preserves_the_moment() {
        // 0.5 s in a typical mp4 video time base, moved to milliseconds.
        let time = Time::new(Some(7680), AvRational::new(1, 15360));
        let rescaled = time.rescale(AvRational::new(1, 1000));
        assert_eq!(rescaled.value(), Some(500));
        assert_eq!(rescaled.as_secs_f64(), time.as_secs_f64());
    }

    #[test]
    fn rescale_rounds_like_libav() {
        // One tick of 1/3 s has no exact representation in 1/2 s ticks.
        let time = Time::new(Some(1), AvRational::new(1, 3));
        let rescaled = time.rescale(AvRational::new(1, 2));
        assert_eq!(rescaled.value(), Some(1));
    }

    #[test]
    fn missing_values_propagate() {
        let time = Time::new(None, AvRational::new(1, 1000));
        assert!(!time.has_value());
        assert_eq!(time.as_secs_f64(), 0.0);
        let rescaled = time.rescale(AvRational::new(1, 90000));
        assert!(!rescaled.has_value());
        assert_eq!(rescaled.to_string(), "none");
    }

    #[test]
    fn seconds_roundtrip() {
        let time = Time::from_secs_f64(2.5);
        assert_eq!(time.as_secs_f64(), 2.5);
        assert_eq!(Duration::from(time), Duration::from_millis(2500));

        let time = Time::from(Duration::from_millis(40));
        assert_eq!(time.as_secs_f64(), 0.04);
    }

    #[test]
    fn display_shows_ticks_over_denominator() {
        let time = Time::new(Some(7680), AvRational::new(1, 15360));
        assert_eq!(time.to_string(), "7680/15360 secs");
    }
}
