//! Safety window: when experiments are allowed to start.
//!
//! Consulted once per tick. Experiments only run while people are around to
//! respond, so the usual window is working hours minus weekends and holidays.

use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ChaosError;

pub trait SafetyWindow: Send + Sync {
    fn is_within_safe_window(&self, at: DateTime<Utc>) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOpen;

impl SafetyWindow for AlwaysOpen {
    fn is_within_safe_window(&self, _at: DateTime<Utc>) -> bool {
        true
    }
}

/// Open on `[start_hour, end_hour)` local time.
#[derive(Debug, Clone)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub offset: FixedOffset,
    pub skip_weekends: bool,
    pub holidays: Vec<NaiveDate>,
}

impl SafetyWindow for BusinessHours {
    fn is_within_safe_window(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.offset);
        if self.skip_weekends && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        if self.holidays.contains(&local.date_naive()) {
            return false;
        }
        (self.start_hour..self.end_hour).contains(&local.hour())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SafetyWindowConfig {
    #[default]
    AlwaysOpen,
    BusinessHours {
        start_hour: u32,
        end_hour: u32,
        #[serde(default)]
        utc_offset_hours: i32,
        #[serde(default = "default_skip_weekends")]
        skip_weekends: bool,
        #[serde(default)]
        holidays: Vec<NaiveDate>,
    },
}

fn default_skip_weekends() -> bool {
    true
}

impl SafetyWindowConfig {
    pub fn validate(&self) -> Result<(), ChaosError> {
        match self {
            SafetyWindowConfig::AlwaysOpen => Ok(()),
            SafetyWindowConfig::BusinessHours {
                start_hour,
                end_hour,
                utc_offset_hours,
                ..
            } => {
                if *end_hour > 24 || start_hour >= end_hour {
                    return Err(ChaosError::Config(format!(
                        "safety window hours {start_hour}..{end_hour} must satisfy start < end <= 24"
                    )));
                }
                if !(-14..=14).contains(utc_offset_hours) {
                    return Err(ChaosError::Config(format!(
                        "safety window utc offset {utc_offset_hours} is out of range"
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn build(&self) -> Result<Arc<dyn SafetyWindow>, ChaosError> {
        self.validate()?;
        match self {
            SafetyWindowConfig::AlwaysOpen => Ok(Arc::new(AlwaysOpen)),
            SafetyWindowConfig::BusinessHours {
                start_hour,
                end_hour,
                utc_offset_hours,
                skip_weekends,
                holidays,
            } => {
                let offset = FixedOffset::east_opt(utc_offset_hours * 3600).ok_or_else(|| {
                    ChaosError::Config(format!("invalid utc offset {utc_offset_hours}"))
                })?;
                Ok(Arc::new(BusinessHours {
                    start_hour: *start_hour,
                    end_hour: *end_hour,
                    offset,
                    skip_weekends: *skip_weekends,
                    holidays: holidays.clone(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn office() -> BusinessHours {
        BusinessHours {
            start_hour: 9,
            end_hour: 17,
            offset: FixedOffset::east_opt(0).unwrap(),
            skip_weekends: true,
            holidays: vec![NaiveDate::from_ymd_opt(2026, 12, 25).unwrap()],
        }
    }

    // 2026-10-19 is a Monday.
    #[rstest]
    #[case(at(2026, 10, 19, 9), true)]
    #[case(at(2026, 10, 19, 16), true)]
    #[case(at(2026, 10, 19, 17), false)]
    #[case(at(2026, 10, 19, 8), false)]
    #[case(at(2026, 10, 24, 12), false)]
    #[case(at(2026, 12, 25, 12), false)]
    fn business_hours_cases(#[case] when: DateTime<Utc>, #[case] open: bool) {
        assert_eq!(office().is_within_safe_window(when), open);
    }

    #[test]
    fn offset_shifts_the_window() {
        let mut window = office();
        window.offset = FixedOffset::east_opt(-5 * 3600).unwrap();
        assert!(!window.is_within_safe_window(at(2026, 10, 19, 9)));
        assert!(window.is_within_safe_window(at(2026, 10, 19, 14)));
    }

    #[test]
    fn always_open_is_open() {
        assert!(AlwaysOpen.is_within_safe_window(at(2026, 10, 24, 3)));
    }

    #[rstest]
    #[case(17, 9, 0)]
    #[case(9, 25, 0)]
    #[case(9, 17, 20)]
    fn invalid_business_hours_are_rejected(#[case] start: u32, #[case] end: u32, #[case] offset: i32) {
        let cfg = SafetyWindowConfig::BusinessHours {
            start_hour: start,
            end_hour: end,
            utc_offset_hours: offset,
            skip_weekends: true,
            holidays: vec![],
        };
        assert!(matches!(cfg.validate(), Err(ChaosError::Config(_))));
        assert!(cfg.build().is_err());
    }

    #[test]
    fn config_parses_from_yaml() {
        let cfg: SafetyWindowConfig = serde_yaml::from_str(
            "kind: business_hours\nstart_hour: 9\nend_hour: 17\nholidays: [2026-12-25]\n",
        )
        .unwrap();
        let window = cfg.build().unwrap();
        assert!(!window.is_within_safe_window(at(2026, 12, 25, 10)));
        assert!(window.is_within_safe_window(at(2026, 10, 19, 10)));
    }
}
