//! Click attribution model identifiers.
//!
//! The click model itself runs elsewhere; its stored results are keyed by one
//! of these identifiers and the combined report filters on it.

use crate::error::AttributionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClickModel {
    LastTouch,
    FirstTouch,
    #[default]
    Linear,
    TimeDecay,
    PositionBased,
}

impl ClickModel {
    pub const ALL: [ClickModel; 5] = [
        ClickModel::LastTouch,
        ClickModel::FirstTouch,
        ClickModel::Linear,
        ClickModel::TimeDecay,
        ClickModel::PositionBased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClickModel::LastTouch => "last_touch",
            ClickModel::FirstTouch => "first_touch",
            ClickModel::Linear => "linear",
            ClickModel::TimeDecay => "time_decay",
            ClickModel::PositionBased => "position_based",
        }
    }
}

impl fmt::Display for ClickModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClickModel {
    type Err = AttributionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ClickModel::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| AttributionError::UnknownModel(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_models() {
        assert_eq!("linear".parse::<ClickModel>().unwrap(), ClickModel::Linear);
        assert_eq!("last-touch".parse::<ClickModel>().unwrap(), ClickModel::LastTouch);
        assert_eq!(" Time_Decay ".parse::<ClickModel>().unwrap(), ClickModel::TimeDecay);
        for model in ClickModel::ALL {
            assert_eq!(model.as_str().parse::<ClickModel>().unwrap(), model);
        }
    }

    #[test]
    fn test_unknown_model_is_client_error() {
        let err = "shapley".parse::<ClickModel>().unwrap_err();
        assert!(err.is_client_error());
        assert!(err.to_string().contains("shapley"));
    }

    #[test]
    fn test_default_is_linear() {
        assert_eq!(ClickModel::default(), ClickModel::Linear);
    }
}
