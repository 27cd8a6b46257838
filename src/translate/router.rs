//! Picks the upstream model for a request.
//!
//! Priority: image content forces the vision model; otherwise the first tier
//! keyword found in the requested id (case-insensitive) selects a tier; anything
//! else lands on the middle tier.

use super::canonical::CanonicalRequest;
use crate::config::ModelTiers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Small,
    Middle,
    Big,
    Vision,
}

const TIER_KEYWORDS: &[(&str, RouteTarget)] = &[
    ("haiku", RouteTarget::Small),
    ("sonnet", RouteTarget::Middle),
    ("opus", RouteTarget::Big),
];

#[derive(Debug, Clone)]
pub struct ModelRouter {
    small: String,
    middle: String,
    big: String,
    vision: String,
}

impl ModelRouter {
    pub fn new(tiers: &ModelTiers) -> Self {
        Self {
            small: tiers.small.clone(),
            middle: tiers.middle().to_string(),
            big: tiers.big.clone(),
            vision: tiers.vision.clone(),
        }
    }

    /// Tier implied by the requested model id alone.
    pub fn tier_for(requested: &str) -> RouteTarget {
        let lowered = requested.to_lowercase();
        TIER_KEYWORDS
            .iter()
            .find(|(keyword, _)| lowered.contains(keyword))
            .map_or(RouteTarget::Middle, |(_, tier)| *tier)
    }

    pub fn target(requested: &str, image_present: bool) -> RouteTarget {
        if image_present {
            RouteTarget::Vision
        } else {
            Self::tier_for(requested)
        }
    }

    pub fn model_for(&self, target: RouteTarget) -> &str {
        match target {
            RouteTarget::Small => &self.small,
            RouteTarget::Middle => &self.middle,
            RouteTarget::Big => &self.big,
            RouteTarget::Vision => &self.vision,
        }
    }

    pub fn route(&self, requested: &str, image_present: bool) -> &str {
        self.model_for(Self::target(requested, image_present))
    }

    /// Replace the request's model directive with the routed upstream model.
    pub fn apply(&self, request: &mut CanonicalRequest) {
        let target = Self::target(&request.model, request.image_present);
        let model = self.model_for(target).to_string();
        tracing::debug!(requested = %request.model, routed = %model, ?target, "Routed model");
        request.model = model;
        request.route = Some(target);
    }
}
