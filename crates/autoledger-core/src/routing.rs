use serde::{Deserialize, Serialize};

use crate::model::ReviewPriority;
use crate::LedgerError;

pub const AUTO_POST_THRESHOLD: u8 = 85;
pub const REVIEW_MEDIUM_THRESHOLD: u8 = 60;

/// Where a scored booking goes next.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "route", content = "priority", rename_all = "snake_case")]
pub enum Route {
    AutoPost,
    Review(ReviewPriority),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingThresholds {
    pub auto_post: u8,
    pub review_medium: u8,
}

impl Default for RoutingThresholds {
    fn default() -> Self {
        Self {
            auto_post: AUTO_POST_THRESHOLD,
            review_medium: REVIEW_MEDIUM_THRESHOLD,
        }
    }
}

impl RoutingThresholds {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] unless
    /// `review_medium < auto_post <= 100`.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.auto_post > 100 || self.review_medium >= self.auto_post {
            return Err(LedgerError::Configuration(format!(
                "thresholds MUST satisfy review_medium < auto_post <= 100 (got {} / {})",
                self.review_medium, self.auto_post
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn route(&self, confidence: u8) -> Route {
        if confidence >= self.auto_post {
            Route::AutoPost
        } else if confidence >= self.review_medium {
            Route::Review(ReviewPriority::Medium)
        } else {
            Route::Review(ReviewPriority::High)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds_split_at_85_and_60() {
        let thresholds = RoutingThresholds::default();
        assert_eq!(thresholds.route(100), Route::AutoPost);
        assert_eq!(thresholds.route(85), Route::AutoPost);
        assert_eq!(thresholds.route(84), Route::Review(ReviewPriority::Medium));
        assert_eq!(thresholds.route(60), Route::Review(ReviewPriority::Medium));
        assert_eq!(thresholds.route(59), Route::Review(ReviewPriority::High));
        assert_eq!(thresholds.route(0), Route::Review(ReviewPriority::High));
    }

    #[test]
    fn tenant_override_shifts_boundaries() {
        let strict = RoutingThresholds {
            auto_post: 95,
            review_medium: 70,
        };
        assert!(strict.validate().is_ok());
        assert_eq!(strict.route(90), Route::Review(ReviewPriority::Medium));
        assert_eq!(strict.route(65), Route::Review(ReviewPriority::High));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let invalid = RoutingThresholds {
            auto_post: 50,
            review_medium: 60,
        };
        assert!(invalid.validate().is_err());
    }
}
