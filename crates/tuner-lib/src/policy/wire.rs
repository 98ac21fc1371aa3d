//! Payloads of the policy serving boundary
//!
//! ```json
//! {"action": "recommend",
//!  "target": {"bucket": "models", "key": "resize_exp1.model"},
//!  "config": {"action_space": [64, 128], "features": ["payload_size"], "model_name": "resize"},
//!  "request": {"payload_size": 100}}
//! ```
//!
//! Actions travel as memory sizes, not action ids. Observe requests add
//! `selected_action`, `cost` and `probability` to `request`.

use crate::error::PolicyError;
use crate::models::{ActionSpace, Context, Observation, Recommendation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServeAction {
    Observe,
    Recommend,
}

/// Location of a model blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServeConfig {
    pub action_space: Vec<u32>,
    pub features: Vec<String>,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<f64>,
}

/// Feature values plus, for observe, the logged outcome
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServeBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_action: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    #[serde(flatten)]
    pub features: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServeRequest {
    pub action: ServeAction,
    pub target: ModelRef,
    pub config: ServeConfig,
    pub request: ServeBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendResult {
    pub recommended_action: u32,
    pub action_probability: f64,
    /// Ordered to match `config.action_space`
    pub probability_list: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServeResult {
    Recommend(RecommendResult),
    /// `1` on a successful observe
    Observed(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServeResponse {
    pub result: ServeResult,
}

impl ServeResponse {
    pub fn observed() -> Self {
        Self {
            result: ServeResult::Observed(1),
        }
    }

    pub fn recommended(recommendation: &Recommendation) -> Self {
        Self {
            result: ServeResult::Recommend(RecommendResult {
                recommended_action: recommendation.size_mb,
                action_probability: recommendation.probability,
                probability_list: recommendation.distribution.clone(),
            }),
        }
    }
}

/// Error body returned by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServeError {
    pub error: String,
}

impl ServeBody {
    pub fn for_context(context: &Context) -> Self {
        Self {
            features: context.iter().map(|(k, v)| (k.to_string(), v)).collect(),
            ..Self::default()
        }
    }

    pub fn for_observation(observation: &Observation, space: &ActionSpace) -> Self {
        Self {
            selected_action: space.size_of(observation.action),
            cost: Some(observation.cost),
            probability: Some(observation.probability),
            ..Self::for_context(&observation.context)
        }
    }

    pub fn context(&self) -> Context {
        let mut context = Context::new();
        for (name, value) in &self.features {
            context.insert(name.clone(), *value);
        }
        context
    }

    /// Observation carried by an observe request
    pub fn observation(&self, space: &ActionSpace) -> Result<Observation, PolicyError> {
        let size = self
            .selected_action
            .ok_or_else(|| PolicyError::InvalidObservation("missing selected_action".to_string()))?;
        let action = space.action_for(size).ok_or_else(|| {
            PolicyError::InvalidObservation(format!(
                "selected_action {size} not in action space {:?}",
                space.sizes()
            ))
        })?;
        let cost = self
            .cost
            .ok_or_else(|| PolicyError::InvalidObservation("missing cost".to_string()))?;
        let probability = self
            .probability
            .ok_or_else(|| PolicyError::InvalidObservation("missing probability".to_string()))?;

        Ok(Observation {
            action,
            context: self.context(),
            cost,
            probability,
        })
    }
}

impl RecommendResult {
    /// Rebuild a recommendation, checking it against the local action space
    pub fn into_recommendation(self, space: &ActionSpace) -> Result<Recommendation, PolicyError> {
        let action = space.action_for(self.recommended_action).ok_or_else(|| {
            PolicyError::Config(format!(
                "agent recommended {} outside action space {:?}",
                self.recommended_action,
                space.sizes()
            ))
        })?;
        if self.probability_list.len() != space.len() {
            return Err(PolicyError::Config(format!(
                "agent returned {} probabilities for {} actions",
                self.probability_list.len(),
                space.len()
            )));
        }
        Ok(Recommendation {
            action,
            size_mb: self.recommended_action,
            probability: self.action_probability,
            distribution: self.probability_list,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_observe_request_shape() {
        let raw = json!({
            "action": "observe",
            "target": {"bucket": "models", "key": "decompress_exp.model"},
            "config": {"action_space": [64, 128], "features": ["bytes"], "model_name": "decompress"},
            "request": {"bytes": 100, "selected_action": 64, "cost": -10, "probability": 0.5}
        });
        let req: ServeRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.action, ServeAction::Observe);

        let space = ActionSpace::new(req.config.action_space.clone()).unwrap();
        let obs = req.request.observation(&space).unwrap();
        assert_eq!(obs.action, 1);
        assert_eq!(obs.cost, -10.0);
        assert_eq!(obs.context.get("bytes"), Some(100.0));
    }

    #[test]
    fn test_observe_rejects_unknown_size() {
        let body = ServeBody {
            selected_action: Some(96),
            cost: Some(1.0),
            probability: Some(0.5),
            features: BTreeMap::new(),
        };
        let space = ActionSpace::new(vec![64, 128]).unwrap();
        assert!(matches!(
            body.observation(&space),
            Err(PolicyError::InvalidObservation(_))
        ));
    }

    #[test]
    fn test_response_shapes() {
        assert_eq!(
            serde_json::to_value(ServeResponse::observed()).unwrap(),
            json!({"result": 1})
        );

        let rec = Recommendation {
            action: 2,
            size_mb: 128,
            probability: 0.95,
            distribution: vec![0.05, 0.95],
        };
        let value = serde_json::to_value(ServeResponse::recommended(&rec)).unwrap();
        assert_eq!(
            value,
            json!({"result": {
                "recommended_action": 128,
                "action_probability": 0.95,
                "probability_list": [0.05, 0.95]
            }})
        );

        let parsed: ServeResponse = serde_json::from_value(value).unwrap();
        let ServeResult::Recommend(result) = parsed.result else {
            panic!("expected recommend result");
        };
        let space = ActionSpace::new(vec![64, 128]).unwrap();
        assert_eq!(result.into_recommendation(&space).unwrap(), rec);
    }
}
