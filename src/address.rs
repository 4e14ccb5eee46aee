//! Slot addressing for both changer embodiments
//!
//! Robot slots are written `"<puck>:<pin>"`. Tray slots are written
//! `"<Row><Column>:<Drop>[-<Crystal>]"`, e.g. `"B7:2"` or `"B7:2-0"`, where the
//! row letter maps to a zero-based index, column and drop are 1-based and the
//! crystal index is zero-based (defaulting to 0).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use crate::{ChangerError, Result};

static PIN_PATTERN: OnceLock<Regex> = OnceLock::new();
static WELL_PATTERN: OnceLock<Regex> = OnceLock::new();

fn pin_pattern() -> &'static Regex {
    PIN_PATTERN.get_or_init(|| Regex::new(r"^(\d+):(\d+)$").expect("pin address pattern"))
}

fn well_pattern() -> &'static Regex {
    WELL_PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z])(\d{1,2}):(\d)(?:-(\d+))?$").expect("well address pattern")
    })
}

/// Address of a single leaf slot in the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SlotAddress {
    /// Pin `pin` of puck `puck`, both as numbered by the robot
    Pin { puck: u32, pin: u32 },
    /// Crystal in a tray drop; `row` is zero-based, `column` and `drop` 1-based
    Crystal { row: u32, column: u32, drop: u32, crystal: u32 },
}

impl SlotAddress {
    pub fn pin(puck: u32, pin: u32) -> Self {
        SlotAddress::Pin { puck, pin }
    }

    pub fn crystal(row: u32, column: u32, drop: u32, crystal: u32) -> Self {
        SlotAddress::Crystal { row, column, drop, crystal }
    }

    /// Parse either grammar
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if pin_pattern().is_match(trimmed) {
            Self::parse_pin(trimmed)
        } else {
            Self::parse_well(trimmed)
        }
    }

    /// Parse a robot address, `"3:7"`
    pub fn parse_pin(input: &str) -> Result<Self> {
        let caps = pin_pattern()
            .captures(input.trim())
            .ok_or_else(|| ChangerError::AddressFormat(input.to_string()))?;
        let puck = parse_number(&caps[1], input)?;
        let pin = parse_number(&caps[2], input)?;
        Ok(SlotAddress::Pin { puck, pin })
    }

    /// Parse a tray address, `"B7:2"` or `"B7:2-0"`
    pub fn parse_well(input: &str) -> Result<Self> {
        let caps = well_pattern()
            .captures(input.trim())
            .ok_or_else(|| ChangerError::AddressFormat(input.to_string()))?;

        let letter = caps[1].chars().next().map(|c| c.to_ascii_uppercase());
        let row = match letter {
            Some(c) => c as u32 - 'A' as u32,
            None => return Err(ChangerError::AddressFormat(input.to_string())),
        };
        let column = parse_number(&caps[2], input)?;
        let drop = parse_number(&caps[3], input)?;
        if column == 0 || drop == 0 {
            return Err(ChangerError::AddressFormat(input.to_string()));
        }
        let crystal = match caps.get(4) {
            Some(m) => parse_number(m.as_str(), input)?,
            None => 0,
        };
        Ok(SlotAddress::Crystal { row, column, drop, crystal })
    }

    /// Drop-level location of a tray slot (`"B7:2"`); pins render unchanged
    pub fn well_location(&self) -> String {
        match self {
            SlotAddress::Pin { .. } => self.to_string(),
            SlotAddress::Crystal { row, column, drop, .. } => {
                format!("{}{}:{}", row_letter(*row), column, drop)
            }
        }
    }

    /// Container the slot belongs to: the puck, or the tray row
    pub fn container_index(&self) -> u32 {
        match self {
            SlotAddress::Pin { puck, .. } => *puck,
            SlotAddress::Crystal { row, .. } => *row,
        }
    }

    pub fn is_pin(&self) -> bool {
        matches!(self, SlotAddress::Pin { .. })
    }
}

fn parse_number(digits: &str, input: &str) -> Result<u32> {
    digits
        .parse::<u32>()
        .map_err(|_| ChangerError::AddressFormat(input.to_string()))
}

/// Row letter for a zero-based row index
pub fn row_letter(row: u32) -> char {
    char::from_u32('A' as u32 + row).unwrap_or('?')
}

impl fmt::Display for SlotAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotAddress::Pin { puck, pin } => write!(f, "{}:{}", puck, pin),
            SlotAddress::Crystal { row, column, drop, crystal } => {
                write!(f, "{}{}:{}-{}", row_letter(*row), column, drop, crystal)
            }
        }
    }
}

impl FromStr for SlotAddress {
    type Err = ChangerError;

    fn from_str(s: &str) -> Result<Self> {
        SlotAddress::parse(s)
    }
}

impl From<SlotAddress> for String {
    fn from(address: SlotAddress) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for SlotAddress {
    type Error = ChangerError;

    fn try_from(value: String) -> Result<Self> {
        SlotAddress::parse(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pin_address() {
        assert_eq!(SlotAddress::parse("3:7").unwrap(), SlotAddress::pin(3, 7));
        assert_eq!(SlotAddress::parse_pin("0:16").unwrap(), SlotAddress::pin(0, 16));
        assert!(SlotAddress::parse_pin("B7:2").is_err());
    }

    #[test]
    fn test_parse_well_address() {
        assert_eq!(
            SlotAddress::parse("B7:2").unwrap(),
            SlotAddress::crystal(1, 7, 2, 0)
        );
        assert_eq!(
            SlotAddress::parse("h12:3-1").unwrap(),
            SlotAddress::crystal(7, 12, 3, 1)
        );
    }

    #[test]
    fn test_malformed_addresses_rejected() {
        for bad in ["", "3", "3:", ":7", "3:7:1", "-1:2", "AB7:2", "B123:2", "B7:12", "B0:1", "B7:0", "B7:2-", "7B:2"] {
            assert!(
                matches!(SlotAddress::parse(bad), Err(ChangerError::AddressFormat(_))),
                "expected '{}' to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_display_parses_back() {
        let addresses = [
            SlotAddress::pin(3, 7),
            SlotAddress::pin(29, 16),
            SlotAddress::crystal(0, 1, 1, 0),
            SlotAddress::crystal(7, 12, 4, 2),
        ];
        for address in addresses {
            assert_eq!(SlotAddress::parse(&address.to_string()).unwrap(), address);
        }
    }

    #[test]
    fn test_well_location() {
        let address = SlotAddress::parse("B7:2-0").unwrap();
        assert_eq!(address.well_location(), "B7:2");
        assert_eq!(address.to_string(), "B7:2-0");
        assert_eq!(SlotAddress::pin(3, 7).well_location(), "3:7");
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&SlotAddress::pin(3, 7)).unwrap();
        assert_eq!(json, "\"3:7\"");
        let parsed: SlotAddress = serde_json::from_str("\"B7:2\"").unwrap();
        assert_eq!(parsed, SlotAddress::crystal(1, 7, 2, 0));
        assert!(serde_json::from_str::<SlotAddress>("\"nope\"").is_err());
    }
}
