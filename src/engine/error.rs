use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Day or resource identifier outside the configured layout.
    InvalidSlot { day: String, resource: String },
    /// Empty or over-long actor identity.
    InvalidActor(&'static str),
    /// Persistence failed. The engine never retries; callers may.
    StoreUnavailable(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidSlot { day, resource } => {
                write!(f, "invalid slot: {day}/{resource}")
            }
            EngineError::InvalidActor(why) => write!(f, "invalid actor: {why}"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotConfigured(slot) => EngineError::InvalidSlot {
                day: slot.day.to_string(),
                resource: slot.resource,
            },
            StoreError::Unavailable(msg) => EngineError::StoreUnavailable(msg),
        }
    }
}
