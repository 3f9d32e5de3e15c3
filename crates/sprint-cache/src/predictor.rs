//! Access-pattern prediction.
//!
//! A first-order Markov chain over `(method, param-class)` transitions,
//! tracked per tier class. When the observed probability of the next
//! state clears the threshold, the pre-warmer speculatively fetches it.
//!
//! Only transitions whose target params are derivable from the current
//! request are actionable: parameterless methods, and height-addressed
//! methods reusing the current height.

use parking_lot::Mutex;
use serde_json::Value;
use sprint_core::TierClass;
use std::collections::HashMap;

/// Coarse shape of a request's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamClass {
    Empty,
    Height,
    Hash,
    Address,
    Filter,
    Other,
}

impl ParamClass {
    /// Classify normalized positional params.
    pub fn classify(params: &Value) -> Self {
        let first = match params {
            Value::Array(items) if items.is_empty() => return ParamClass::Empty,
            Value::Array(items) => &items[0],
            Value::Null => return ParamClass::Empty,
            Value::Object(_) => return ParamClass::Filter,
            other => other,
        };
        match first {
            Value::Number(n) if n.is_u64() => ParamClass::Height,
            Value::Object(_) => ParamClass::Filter,
            Value::String(s) => {
                let body = s.strip_prefix("0x").unwrap_or(s);
                if body.len() == 64 && body.bytes().all(|b| b.is_ascii_hexdigit()) {
                    ParamClass::Hash
                } else if body.len() == 40 && body.bytes().all(|b| b.is_ascii_hexdigit()) {
                    ParamClass::Address
                } else if body.len() <= 16 && body.bytes().all(|b| b.is_ascii_hexdigit()) {
                    ParamClass::Height
                } else {
                    ParamClass::Other
                }
            }
            _ => ParamClass::Other,
        }
    }
}

/// One Markov state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessState {
    pub method: String,
    pub params: ParamClass,
}

impl AccessState {
    pub fn new(method: &str, params: &Value) -> Self {
        Self { method: method.to_string(), params: ParamClass::classify(params) }
    }
}

/// Transition probability needed before a prediction fires.
const PREDICTION_THRESHOLD_NUM: u32 = 3;
const PREDICTION_THRESHOLD_DEN: u32 = 5; // 0.6
/// Observations of an edge required before it can predict.
const MIN_EDGE_OBSERVATIONS: u32 = 8;
/// Bound on tracked states per tier class.
const MAX_STATES_PER_CLASS: usize = 256;

#[derive(Default)]
struct ClassChain {
    last_state: Option<AccessState>,
    /// from-state -> (to-state -> count)
    transitions: HashMap<AccessState, HashMap<AccessState, u32>>,
}

/// Per-tier-class Markov predictor.
#[derive(Default)]
pub struct AccessPredictor {
    chains: Mutex<HashMap<TierClass, ClassChain>>,
}

impl AccessPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed request and return the predicted next state, if
    /// the chain is confident enough.
    pub fn observe(&self, class: TierClass, state: AccessState) -> Option<AccessState> {
        let mut chains = self.chains.lock();
        let chain = chains.entry(class).or_default();

        if let Some(prev) = chain.last_state.take() {
            if chain.transitions.len() < MAX_STATES_PER_CLASS
                || chain.transitions.contains_key(&prev)
            {
                *chain
                    .transitions
                    .entry(prev)
                    .or_default()
                    .entry(state.clone())
                    .or_insert(0) += 1;
            }
        }
        chain.last_state = Some(state.clone());

        let outgoing = chain.transitions.get(&state)?;
        let total: u32 = outgoing.values().sum();
        let (best, count) = outgoing.iter().max_by_key(|(_, c)| **c)?;
        if *count >= MIN_EDGE_OBSERVATIONS
            && *count * PREDICTION_THRESHOLD_DEN >= total * PREDICTION_THRESHOLD_NUM
        {
            Some(best.clone())
        } else {
            None
        }
    }

    /// Concrete prefetch request for a predicted state, when its params
    /// are derivable from the current request context.
    pub fn actionable_request(
        predicted: &AccessState,
        current_height: Option<u64>,
    ) -> Option<(String, Value)> {
        match predicted.params {
            ParamClass::Empty => Some((predicted.method.clone(), Value::Array(vec![]))),
            ParamClass::Height => current_height
                .map(|h| (predicted.method.clone(), Value::Array(vec![Value::from(h)]))),
            _ => None,
        }
    }
}
