use serde::{Deserialize, Serialize};

/// Job priority levels for queue ordering (Higher values = higher priority)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Bulk work such as analytics rollups
    Low = 1,

    /// Default
    Normal = 2,

    High = 3,

    /// User-facing work that should jump the line
    Critical = 4,
}

// Ready jobs are ordered by (rank, enqueue sequence): a lower rank is
// claimed first, and within a rank the broker's insertion order holds.

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl JobPriority {
    /// Get the numeric value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create from numeric value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Claim order rank: 0 for critical up to 3 for low
    pub fn rank(self) -> u8 {
        Self::Critical.as_u8() - self.as_u8()
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_inverts_priority() {
        assert_eq!(JobPriority::Critical.rank(), 0);
        assert_eq!(JobPriority::Low.rank(), 3);
        assert!(JobPriority::High.rank() < JobPriority::Normal.rank());
    }

    #[test]
    fn parses_names() {
        assert_eq!("HIGH".parse::<JobPriority>(), Ok(JobPriority::High));
        assert!("urgent".parse::<JobPriority>().is_err());
    }
}
