//! Service and plan metadata.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A catalog service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service id.
    pub id: String,
    /// Service name.
    pub name: String,
    /// Override for the scheduled backup interval (`daily`, cron, ...).
    #[serde(default)]
    pub backup_interval: Option<String>,
}

/// A catalog plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan id.
    pub id: String,
    /// Plan name.
    pub name: String,
    /// Owning service.
    pub service: Service,
    /// Features supported by the plan's agent, e.g. `backup`.
    #[serde(default)]
    pub features: Vec<String>,
}

impl Plan {
    /// Returns true if the plan's agent supports the feature.
    #[must_use]
    pub fn supports(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    /// Fails unless the plan supports the feature.
    ///
    /// # Errors
    ///
    /// Returns `FeatureNotSupported`.
    pub fn verify_feature_support(&self, feature: &str) -> Result<()> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(Error::FeatureNotSupported {
                feature: feature.to_string(),
                plan_id: self.id.clone(),
            })
        }
    }
}

/// Plan lookup by id.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    plans: HashMap<String, Plan>,
}

impl Catalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plan (builder style).
    #[must_use]
    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plans.insert(plan.id.clone(), plan);
        self
    }

    /// Looks up a plan.
    ///
    /// # Errors
    ///
    /// Returns `PlanNotFound` for unknown ids.
    pub fn get_plan(&self, plan_id: &str) -> Result<&Plan> {
        self.plans
            .get(plan_id)
            .ok_or_else(|| Error::PlanNotFound(plan_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_features() {
        let catalog = Catalog::new().with_plan(Plan {
            id: "p-1".into(),
            name: "small".into(),
            service: Service {
                id: "s-1".into(),
                name: "postgres".into(),
                backup_interval: None,
            },
            features: vec!["backup".into()],
        });
        let plan = catalog.get_plan("p-1").expect("plan");
        assert!(plan.verify_feature_support("backup").is_ok());
        assert!(plan.verify_feature_support("restore").is_err());
        assert!(matches!(catalog.get_plan("nope"), Err(Error::PlanNotFound(_))));
    }
}
