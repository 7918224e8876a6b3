// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// PCI vendor/device pair backing a block device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PciId {
    pub vendor: u16,
    pub device: u16,
}

impl fmt::Display for PciId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.device)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PciListError {
    #[error("PCI list item '{0}' is not of the form vendor:device")]
    Malformed(String),
    #[error("PCI list item '{item}' has invalid hex '{value}'")]
    InvalidHex { item: String, value: String },
}

/// Comma separated `vendor:device` list, hex with optional `0x`.
///
/// Used both as an allow-list and a block-list for device filtering.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PciList(Vec<PciId>);

impl PciList {
    pub fn new(ids: Vec<PciId>) -> Self {
        Self(ids)
    }

    pub fn contains(&self, id: &PciId) -> bool {
        self.0.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> &[PciId] {
        &self.0
    }
}

pub fn parse_hex_u16(value: &str) -> Option<u16> {
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u16::from_str_radix(digits, 16).ok()
}

impl FromStr for PciList {
    type Err = PciListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ids = Vec::new();
        for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let (vendor, device) = item
                .split_once(':')
                .ok_or_else(|| PciListError::Malformed(item.to_string()))?;

            let parse = |value: &str| {
                parse_hex_u16(value).ok_or_else(|| PciListError::InvalidHex {
                    item: item.to_string(),
                    value: value.to_string(),
                })
            };

            ids.push(PciId {
                vendor: parse(vendor)?,
                device: parse(device)?,
            });
        }
        Ok(Self(ids))
    }
}
