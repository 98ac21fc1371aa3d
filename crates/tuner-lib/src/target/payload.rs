//! Request payloads for load generation

use crate::error::TunerError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Mutex;

/// Produces the body of each generated request
pub trait PayloadGenerator: Send + Sync {
    fn generate(&self) -> Value;
}

/// Payload generator selection, per target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadSpec {
    /// Same JSON body for every request
    Fixed {
        #[serde(default = "empty_object")]
        body: Value,
    },
    /// `{"<field>": n}` with n uniform in `[min_bytes, max_bytes]`
    RandomSize {
        min_bytes: u64,
        max_bytes: u64,
        #[serde(default = "default_size_field")]
        field: String,
    },
}

fn empty_object() -> Value {
    json!({})
}

fn default_size_field() -> String {
    "payload_size".to_string()
}

impl Default for PayloadSpec {
    fn default() -> Self {
        PayloadSpec::Fixed {
            body: empty_object(),
        }
    }
}

impl PayloadSpec {
    pub fn validate(&self) -> Result<(), TunerError> {
        match self {
            PayloadSpec::Fixed { .. } => Ok(()),
            PayloadSpec::RandomSize {
                min_bytes,
                max_bytes,
                field,
            } => {
                if min_bytes > max_bytes {
                    return Err(TunerError::FatalConfig(format!(
                        "random_size payload has min_bytes {min_bytes} > max_bytes {max_bytes}"
                    )));
                }
                if field.is_empty() {
                    return Err(TunerError::FatalConfig(
                        "random_size payload needs a field name".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    pub fn build(&self, seed: Option<u64>) -> Result<Box<dyn PayloadGenerator>, TunerError> {
        self.validate()?;
        Ok(match self {
            PayloadSpec::Fixed { body } => Box::new(FixedPayload::new(body.clone())),
            PayloadSpec::RandomSize {
                min_bytes,
                max_bytes,
                field,
            } => Box::new(RandomSizePayload::new(*min_bytes, *max_bytes, field.clone(), seed)),
        })
    }
}

pub struct FixedPayload {
    body: Value,
}

impl FixedPayload {
    pub fn new(body: Value) -> Self {
        Self { body }
    }
}

impl PayloadGenerator for FixedPayload {
    fn generate(&self) -> Value {
        self.body.clone()
    }
}

pub struct RandomSizePayload {
    min_bytes: u64,
    max_bytes: u64,
    field: String,
    rng: Mutex<ChaCha8Rng>,
}

impl RandomSizePayload {
    pub fn new(min_bytes: u64, max_bytes: u64, field: String, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            min_bytes,
            max_bytes,
            field,
            rng: Mutex::new(rng),
        }
    }
}

impl PayloadGenerator for RandomSizePayload {
    fn generate(&self) -> Value {
        let size = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(self.min_bytes..=self.max_bytes),
            // poisoned only if a holder panicked; the range is still valid
            Err(poisoned) => poisoned
                .into_inner()
                .gen_range(self.min_bytes..=self.max_bytes),
        };
        let mut body = serde_json::Map::new();
        body.insert(self.field.clone(), json!(size));
        Value::Object(body)
    }
}
