use std::str::FromStr;
use thiserror::Error;

pub const MAX_CUSTOM_LIMIT: u32 = 1000;
pub const MAX_TEMPORARY_DAYS: u32 = 365;

/// Administrative limit input: `N`, `L/D` or `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitInput {
    Permanent(u32),
    Temporary { limit: u32, days: u32 },
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitInputError {
    #[error("limit input is empty")]
    Empty,
    #[error("'{0}' is not a whole number")]
    NotANumber(String),
    #[error("limit must be in range 1..={max}, got {0}", max = MAX_CUSTOM_LIMIT)]
    LimitOutOfRange(u64),
    #[error("days must be in range 1..={max}, got {0}", max = MAX_TEMPORARY_DAYS)]
    DaysOutOfRange(u64),
}

fn parse_number(raw: &str) -> Result<u64, LimitInputError> {
    let raw = raw.trim();
    raw.parse::<u64>()
        .map_err(|_| LimitInputError::NotANumber(raw.to_string()))
}

fn check_limit(value: u64) -> Result<u32, LimitInputError> {
    if (1..=MAX_CUSTOM_LIMIT as u64).contains(&value) {
        Ok(value as u32)
    } else {
        Err(LimitInputError::LimitOutOfRange(value))
    }
}

impl FromStr for LimitInput {
    type Err = LimitInputError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Err(LimitInputError::Empty);
        }

        if let Some((limit, days)) = input.split_once('/') {
            let limit = check_limit(parse_number(limit)?)?;
            let days = parse_number(days)?;
            if !(1..=MAX_TEMPORARY_DAYS as u64).contains(&days) {
                return Err(LimitInputError::DaysOutOfRange(days));
            }
            return Ok(LimitInput::Temporary {
                limit,
                days: days as u32,
            });
        }

        match parse_number(input)? {
            0 => Ok(LimitInput::Clear),
            value => Ok(LimitInput::Permanent(check_limit(value)?)),
        }
    }
}

impl std::fmt::Display for LimitInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitInput::Permanent(limit) => write!(f, "{}", limit),
            LimitInput::Temporary { limit, days } => write!(f, "{}/{}", limit, days),
            LimitInput::Clear => write!(f, "0"),
        }
    }
}
