//! Wall-clock availability windows for device definitions

use std::str::FromStr;

use crate::Result;
use crate::TypesError;

/// Time-of-day window during which a device definition may be used.
///
/// Parsed from the definition's `Available` field: `"disabled"` removes the
/// definition from consideration entirely, an empty/absent value means the
/// device is always usable, and `"HH:mm-HH:mm"` restricts it to a wall-clock
/// range. The range may wrap past midnight (`22:00-06:00` contains 23:00 and
/// 05:00 but not 12:00). A zero-length range is treated as always available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AvailabilityWindow {
    Disabled,
    #[default]
    Always,
    /// Start (inclusive) and end (exclusive), in minutes since midnight.
    Between {
        start: u16,
        end: u16,
    },
}

impl AvailabilityWindow {
    /// Whether the window contains the given wall-clock time, expressed in
    /// minutes since local midnight.
    pub fn contains(&self, minutes: u16) -> bool {
        match *self {
            Self::Disabled => false,
            Self::Always => true,
            Self::Between { start, end } => {
                if start == end {
                    true
                } else if start < end {
                    start <= minutes && minutes < end
                } else {
                    minutes >= start || minutes < end
                }
            }
        }
    }
}

impl FromStr for AvailabilityWindow {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        let value = s.trim();
        if value.is_empty() {
            return Ok(Self::Always);
        }
        if value.eq_ignore_ascii_case("disabled") {
            return Ok(Self::Disabled);
        }
        let (start, end) = value.split_once('-').ok_or_else(|| TypesError::InvalidWindow {
            value: value.to_string(),
        })?;
        Ok(Self::Between {
            start: parse_minutes(start, value)?,
            end: parse_minutes(end, value)?,
        })
    }
}

fn parse_minutes(time: &str, window: &str) -> Result<u16> {
    let invalid = || TypesError::InvalidWindow {
        value: window.to_string(),
    };
    let (hours, minutes) = time.trim().split_once(':').ok_or_else(invalid)?;
    let hours: u16 = hours.parse().map_err(|_| invalid())?;
    let minutes: u16 = minutes.parse().map_err(|_| invalid())?;
    if hours >= 24 || minutes >= 60 {
        return Err(invalid());
    }
    Ok(hours * 60 + minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(h: u16, m: u16) -> u16 {
        h * 60 + m
    }

    #[test]
    fn empty_and_disabled_values() {
        assert_eq!("".parse::<AvailabilityWindow>().unwrap(), AvailabilityWindow::Always);
        assert_eq!(
            "Disabled".parse::<AvailabilityWindow>().unwrap(),
            AvailabilityWindow::Disabled
        );
        assert!(!AvailabilityWindow::Disabled.contains(minutes(12, 0)));
        assert!(AvailabilityWindow::Always.contains(minutes(12, 0)));
    }

    #[test]
    fn simple_range() {
        let window: AvailabilityWindow = "09:00-17:30".parse().unwrap();
        assert!(window.contains(minutes(9, 0)));
        assert!(window.contains(minutes(17, 29)));
        assert!(!window.contains(minutes(17, 30)));
        assert!(!window.contains(minutes(8, 59)));
    }

    #[test]
    fn range_wrapping_midnight() {
        let window: AvailabilityWindow = "22:00-06:00".parse().unwrap();
        assert!(window.contains(minutes(23, 0)));
        assert!(window.contains(minutes(5, 0)));
        assert!(!window.contains(minutes(12, 0)));
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        assert!("22:00".parse::<AvailabilityWindow>().is_err());
        assert!("25:00-06:00".parse::<AvailabilityWindow>().is_err());
        assert!("22:61-06:00".parse::<AvailabilityWindow>().is_err());
        assert!("sometimes".parse::<AvailabilityWindow>().is_err());
    }
}
