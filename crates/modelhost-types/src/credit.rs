use serde::{Deserialize, Serialize};
use std::fmt;

/// Subscription tier of the account; each tier caps the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Standard,
    Premium,
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionTier::Free => write!(f, "free"),
            SubscriptionTier::Standard => write!(f, "standard"),
            SubscriptionTier::Premium => write!(f, "premium"),
        }
    }
}
