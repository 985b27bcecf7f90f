//! Order and instrument enums shared by the client and the order manager

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DeribitError;

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = DeribitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(DeribitError::invalid_argument(format!(
                "Side must be either 'buy' or 'sell', got '{}'",
                other
            ))),
        }
    }
}

/// Instrument kind filter used by position queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    #[default]
    Future,
    Option,
    Spot,
    FutureCombo,
    OptionCombo,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Future => "future",
            Self::Option => "option",
            Self::Spot => "spot",
            Self::FutureCombo => "future_combo",
            Self::OptionCombo => "option_combo",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumentKind {
    type Err = DeribitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "future" => Ok(Self::Future),
            "option" => Ok(Self::Option),
            "spot" => Ok(Self::Spot),
            "future_combo" => Ok(Self::FutureCombo),
            "option_combo" => Ok(Self::OptionCombo),
            other => Err(DeribitError::invalid_argument(format!(
                "Unknown instrument kind '{}'",
                other
            ))),
        }
    }
}
