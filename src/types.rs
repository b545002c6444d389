// =============================================================================
// Shared primitive types used across the trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Position/decision side. Symmetric: a position has a side, and an action
/// targets a side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// The action a Decision proposes for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
    Wait,
}

impl ActionKind {
    /// Decisions sort into three ordered buckets: closes first, then opens,
    /// then everything else (hold/wait). See `autotrader::order_decisions`.
    pub fn ordering_bucket(self) -> u8 {
        match self {
            ActionKind::CloseLong | ActionKind::CloseShort => 0,
            ActionKind::OpenLong | ActionKind::OpenShort => 1,
            ActionKind::Hold | ActionKind::Wait => 2,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, ActionKind::OpenLong | ActionKind::OpenShort)
    }

    pub fn is_close(self) -> bool {
        matches!(self, ActionKind::CloseLong | ActionKind::CloseShort)
    }

    pub fn side(self) -> Option<Side> {
        match self {
            ActionKind::OpenLong | ActionKind::CloseLong => Some(Side::Long),
            ActionKind::OpenShort | ActionKind::CloseShort => Some(Side::Short),
            ActionKind::Hold | ActionKind::Wait => None,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::OpenLong => "open_long",
            ActionKind::OpenShort => "open_short",
            ActionKind::CloseLong => "close_long",
            ActionKind::CloseShort => "close_short",
            ActionKind::Hold => "hold",
            ActionKind::Wait => "wait",
        };
        write!(f, "{s}")
    }
}
