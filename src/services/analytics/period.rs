use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::AnalyticsError;

/// Bucket size for trend grouping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFrame {
    #[default]
    Monthly,
    Quarterly,
    Annual,
}

impl FromStr for TimeFrame {
    type Err = AnalyticsError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Ok(Self::Monthly),
            "quarterly" | "quarter" => Ok(Self::Quarterly),
            "annual" | "annually" | "yearly" | "year" => Ok(Self::Annual),
            _ => Err(AnalyticsError::UnknownTimeFrame(raw.trim().to_string())),
        }
    }
}

/// Group key for one period. Keys of the same time frame order
/// chronologically because `year` is compared first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeriodKey {
    Month { year: i32, month: u32 },
    Quarter { year: i32, quarter: u32 },
    Year { year: i32 },
}

impl PeriodKey {
    /// `month` must be in 1..=12.
    pub fn new(time_frame: TimeFrame, year: i32, month: u32) -> Self {
        match time_frame {
            TimeFrame::Monthly => Self::Month { year, month },
            TimeFrame::Quarterly => Self::Quarter {
                year,
                quarter: quarter_of(month),
            },
            TimeFrame::Annual => Self::Year { year },
        }
    }

    /// `"1/2024"`, `"Q1/2024"` or `"2024"`.
    pub fn label(&self) -> String {
        match self {
            Self::Month { year, month } => format!("{month}/{year}"),
            Self::Quarter { year, quarter } => format!("Q{quarter}/{year}"),
            Self::Year { year } => year.to_string(),
        }
    }

    /// First day of the period.
    pub fn start_date(&self) -> Option<NaiveDate> {
        match *self {
            Self::Month { year, month } => NaiveDate::from_ymd_opt(year, month, 1),
            Self::Quarter { year, quarter } => {
                NaiveDate::from_ymd_opt(year, (quarter.saturating_sub(1)) * 3 + 1, 1)
            }
            Self::Year { year } => NaiveDate::from_ymd_opt(year, 1, 1),
        }
    }
}

pub fn quarter_of(month: u32) -> u32 {
    month.saturating_sub(1) / 3 + 1
}
