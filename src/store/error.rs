use crate::model::Slot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Day or resource outside the configured layout.
    NotConfigured(Slot),
    /// Persistence failed; the slot kept its previous state.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotConfigured(slot) => write!(f, "slot not configured: {slot}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}
