// =============================================================================
// Shared types used across the Aurora verdict core
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// Horizon & cache key
// =============================================================================

/// Forecast window a verdict applies to. Shorter horizons expire sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    Short,
    Medium,
    Long,
}

impl Horizon {
    pub const ALL: [Horizon; 3] = [Horizon::Short, Horizon::Medium, Horizon::Long];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
        }
    }
}

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Horizon {
    type Err = String;

    /// Accepts the canonical names plus the day-count aliases used by the
    /// upstream compute service.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short" | "1d" => Ok(Self::Short),
            "medium" | "7d" => Ok(Self::Medium),
            "long" | "30d" => Ok(Self::Long),
            other => Err(format!("unknown horizon '{other}'")),
        }
    }
}

/// Immutable `(symbol, horizon)` cache key, rendered as `SYMBOL:horizon`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    symbol: String,
    horizon: Horizon,
}

impl CacheKey {
    pub fn new(symbol: &str, horizon: Horizon) -> Self {
        Self {
            symbol: symbol.trim().to_uppercase(),
            horizon,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn horizon(&self) -> Horizon {
        self.horizon
    }

    /// Decode a rendered key back into its parts. The horizon is the segment
    /// after the last `:` so symbols may themselves contain colons.
    pub fn parse(raw: &str) -> Option<Self> {
        let (symbol, horizon) = raw.rsplit_once(':')?;
        if symbol.is_empty() {
            return None;
        }
        let horizon = horizon.parse().ok()?;
        Some(Self::new(symbol, horizon))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.symbol, self.horizon)
    }
}

// =============================================================================
// Verdict vocabulary
// =============================================================================

/// Forecast direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
    Neutral,
}

impl Direction {
    /// True for an UP <-> DOWN reversal. Transitions through NEUTRAL are not
    /// flips.
    pub fn is_flip_of(self, other: Direction) -> bool {
        matches!(
            (self, other),
            (Self::Up, Self::Down) | (Self::Down, Self::Up)
        )
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Trading action carried by a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    StrongBuy,
    Buy,
    Hold,
    Avoid,
    Sell,
    StrongSell,
}

impl Action {
    /// Direction implied by the action (neutral for HOLD / AVOID).
    pub fn direction(self) -> Direction {
        match self {
            Self::StrongBuy | Self::Buy => Direction::Up,
            Self::Sell | Self::StrongSell => Direction::Down,
            Self::Hold | Self::Avoid => Direction::Neutral,
        }
    }

    pub fn is_strong(self) -> bool {
        matches!(self, Self::StrongBuy | Self::StrongSell)
    }

    /// HOLD and AVOID open no new risk.
    pub fn is_neutral(self) -> bool {
        matches!(self, Self::Hold | Self::Avoid)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrongBuy => write!(f, "STRONG_BUY"),
            Self::Buy => write!(f, "BUY"),
            Self::Hold => write!(f, "HOLD"),
            Self::Avoid => write!(f, "AVOID"),
            Self::Sell => write!(f, "SELL"),
            Self::StrongSell => write!(f, "STRONG_SELL"),
        }
    }
}

/// Conviction attached to the base engine's action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strength {
    Weak,
    #[default]
    Moderate,
    Strong,
}

/// Macro regime reported by the upstream regime classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MacroRegime {
    RiskOn,
    #[default]
    Neutral,
    RiskOff,
    FullRiskOff,
    Panic,
    Extreme,
}

impl MacroRegime {
    /// Regimes where strong-conviction actions are forbidden.
    pub fn is_stressed(self) -> bool {
        matches!(self, Self::Panic | Self::Extreme)
    }
}

impl std::fmt::Display for MacroRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RiskOn => write!(f, "RISK_ON"),
            Self::Neutral => write!(f, "NEUTRAL"),
            Self::RiskOff => write!(f, "RISK_OFF"),
            Self::FullRiskOff => write!(f, "FULL_RISK_OFF"),
            Self::Panic => write!(f, "PANIC"),
            Self::Extreme => write!(f, "EXTREME"),
        }
    }
}

/// Market risk level, ordered from calm to extreme.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Extreme,
}

impl RiskLevel {
    pub fn is_elevated(self) -> bool {
        self >= Self::High
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Extreme => write!(f, "EXTREME"),
        }
    }
}

// =============================================================================
// Raw verdict (upstream payload)
// =============================================================================

/// Payload produced by the upstream compute service for one `(symbol,
/// horizon)`. The core never edits it; stabilised and enforced values are
/// carried alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawVerdict {
    pub symbol: String,
    pub horizon: Horizon,
    pub direction: Direction,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    pub expected_move_pct: f64,
    /// Final action after ML adjustment.
    pub action: Action,
    /// Fraction of the maximum position, `[0, 1]`.
    pub position_size: f64,

    // --- Base rule engine -------------------------------------------------
    /// Action picked by the rule-based engine before ML adjustment.
    pub base_action: Action,
    /// Actions the base engine considered admissible.
    #[serde(default)]
    pub base_candidates: Vec<Action>,
    #[serde(default)]
    pub strength: Strength,

    // --- Market context ---------------------------------------------------
    #[serde(default)]
    pub macro_regime: MacroRegime,
    #[serde(default)]
    pub risk_level: RiskLevel,
    /// Funding crowdedness score in `[0, 1]`.
    #[serde(default)]
    pub funding_crowdedness: f64,

    // --- ML influence -----------------------------------------------------
    /// Additive confidence modifier applied by the ML layer.
    #[serde(default)]
    pub ml_modifier: f64,
    /// Action the ML layer pushed towards, if any.
    #[serde(default)]
    pub ml_action: Option<Action>,

    /// True when sub-signals disagree on direction.
    #[serde(default)]
    pub signal_conflict: bool,

    /// Upstream computation timestamp (epoch ms). Filled in by the cache
    /// when the upstream leaves it at zero.
    #[serde(default)]
    pub computed_at_ms: i64,
}
