//! Tracking state machine of the frame driver.

/// State of the frame driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No pose computed yet: the first frame only seeds the local map.
    #[default]
    NotInitialized,
    /// The last pose optimization succeeded.
    Ok,
    /// Some recent optimizations failed, the predicted pose is used meanwhile.
    RecentlyLost,
    /// Too many consecutive failures: the local map is reseeded and matching
    /// uses the advanced search.
    Lost,
}

impl TrackingState {
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::NotInitialized | Self::Lost)
    }
}

impl std::fmt::Display for TrackingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "NOT_INITIALIZED"),
            Self::Ok => write!(f, "OK"),
            Self::RecentlyLost => write!(f, "RECENTLY_LOST"),
            Self::Lost => write!(f, "LOST"),
        }
    }
}
