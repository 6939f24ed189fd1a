//! Decoding of explorer transaction bodies.
//!
//! Explorers disagree on the exact shape of a transaction record: some nest
//! the transaction under a `transaction` key, some inline it, and field names
//! drift between snake and camel case. The decoder walks the JSON tolerantly
//! and degrades to empty values instead of erroring, so that policy
//! verification (not decoding) is the layer that rejects unusable records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One program invocation executed by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Program id, e.g. `envelop_swap.aleo`.
    pub program_id: String,
    /// Function name, e.g. `settle_swap_onchain`.
    pub function_name: String,
    /// Rendered input literals, in call order.
    pub inputs: Vec<String>,
}

/// A transaction record decoded from an explorer response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedTransaction {
    /// Program id of the first transition, if any.
    pub program_id: Option<String>,
    /// Function name of the first transition, if any.
    pub function_name: Option<String>,
    /// The address that authorized and paid for the transaction.
    pub fee_payer: Option<String>,
    /// All transitions executed by the transaction, in order.
    pub transitions: Vec<Transition>,
}

impl DecodedTransaction {
    /// Returns the first transition matching `program_id` with a function
    /// name accepted by `functions`.
    pub fn find_transition(
        &self,
        program_id: &str,
        functions: &[String],
    ) -> Option<&Transition> {
        self.transitions.iter().find(|t| {
            t.program_id == program_id && functions.iter().any(|f| f == &t.function_name)
        })
    }
}

/// Extracts the raw status string from an explorer response, if present.
pub fn extract_raw_status(raw: &Value) -> Option<String> {
    const STATUS_KEYS: [&str; 4] = ["status", "finalizedStatus", "finalized_status", "type"];

    for scope in [Some(raw), raw.get("transaction")].into_iter().flatten() {
        for key in STATUS_KEYS {
            if let Some(status) = scope.get(key).and_then(Value::as_str) {
                return Some(status.to_owned());
            }
        }
    }
    None
}

/// Decodes a transaction record from an explorer response body.
pub fn decode_transaction(raw: &Value) -> DecodedTransaction {
    let tx = raw.get("transaction").unwrap_or(raw);

    let transitions = find_transitions(tx);
    let fee_payer = find_fee_payer(raw, tx);

    DecodedTransaction {
        program_id: transitions.first().map(|t| t.program_id.clone()),
        function_name: transitions.first().map(|t| t.function_name.clone()),
        fee_payer,
        transitions,
    }
}

fn find_transitions(tx: &Value) -> Vec<Transition> {
    let transitions = tx
        .get("execution")
        .and_then(|e| e.get("transitions"))
        .or_else(|| tx.get("transitions"))
        .and_then(Value::as_array);

    transitions
        .map(|list| list.iter().filter_map(decode_transition).collect())
        .unwrap_or_default()
}

fn decode_transition(raw: &Value) -> Option<Transition> {
    let program_id = string_at(raw, &["program", "program_id", "programId"])?;
    let function_name = string_at(raw, &["function", "function_name", "functionName"])?;

    let inputs = raw
        .get("inputs")
        .and_then(Value::as_array)
        .map(|inputs| inputs.iter().filter_map(decode_input).collect())
        .unwrap_or_default();

    Some(Transition { program_id, function_name, inputs })
}

/// Inputs are either plain literal strings or objects carrying the rendered
/// literal under `value`.
fn decode_input(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => string_at(raw, &["value", "plaintext"]),
        _ => None,
    }
}

fn find_fee_payer(raw: &Value, tx: &Value) -> Option<String> {
    const PAYER_KEYS: [&str; 4] = ["owner", "signer", "fee_payer", "feePayer"];

    for scope in [raw, tx] {
        if let Some(payer) = string_at(scope, &PAYER_KEYS) {
            return Some(payer);
        }
    }

    // Some explorers only surface the payer as the address literal inside the
    // fee transition's inputs.
    tx.get("fee")
        .and_then(|fee| fee.get("transition"))
        .and_then(|t| t.get("inputs"))
        .and_then(Value::as_array)
        .and_then(|inputs| {
            inputs
                .iter()
                .filter_map(decode_input)
                .find(|input| input.starts_with("aleo1"))
        })
}

fn string_at(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| raw.get(*key).and_then(Value::as_str).map(str::to_owned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_nested_execution() {
        let raw = json!({
            "status": "finalized",
            "transaction": {
                "id": "at1aaa",
                "owner": "aleo1owner",
                "execution": {
                    "transitions": [
                        {
                            "program": "envelop_swap.aleo",
                            "function": "create_swap_request",
                            "inputs": [{"value": "1000000u64"}, "aleo1owner"]
                        },
                        {
                            "program": "envelop_swap.aleo",
                            "function": "settle_swap_onchain",
                            "inputs": []
                        }
                    ]
                }
            }
        });

        let decoded = decode_transaction(&raw);
        assert_eq!(decoded.program_id.as_deref(), Some("envelop_swap.aleo"));
        assert_eq!(decoded.function_name.as_deref(), Some("create_swap_request"));
        assert_eq!(decoded.fee_payer.as_deref(), Some("aleo1owner"));
        assert_eq!(decoded.transitions.len(), 2);
        assert_eq!(decoded.transitions[0].inputs, vec!["1000000u64", "aleo1owner"]);
        assert_eq!(extract_raw_status(&raw).as_deref(), Some("finalized"));
    }

    #[test]
    fn decodes_flat_camel_case() {
        let raw = json!({
            "finalizedStatus": "Accepted",
            "feePayer": "aleo1payer",
            "transitions": [
                {"programId": "envelop_payments.aleo", "functionName": "create_payment_intent"}
            ]
        });

        let decoded = decode_transaction(&raw);
        assert_eq!(decoded.fee_payer.as_deref(), Some("aleo1payer"));
        assert_eq!(decoded.transitions[0].program_id, "envelop_payments.aleo");
        assert!(decoded.transitions[0].inputs.is_empty());
        assert_eq!(extract_raw_status(&raw).as_deref(), Some("Accepted"));
    }

    #[test]
    fn fee_payer_from_fee_transition() {
        let raw = json!({
            "transaction": {
                "execution": {"transitions": []},
                "fee": {
                    "transition": {
                        "inputs": ["5000u64", "aleo1feepayer"]
                    }
                }
            }
        });

        assert_eq!(decode_transaction(&raw).fee_payer.as_deref(), Some("aleo1feepayer"));
    }

    #[test]
    fn empty_body_decodes_to_default() {
        let decoded = decode_transaction(&json!({}));
        assert_eq!(decoded, DecodedTransaction::default());
        assert_eq!(extract_raw_status(&json!({})), None);
    }

    #[test]
    fn find_transition_matches_program_and_function() {
        let raw = json!({
            "transitions": [
                {"program": "a.aleo", "function": "f"},
                {"program": "b.aleo", "function": "g"}
            ]
        });
        let decoded = decode_transaction(&raw);

        let hit = decoded.find_transition("b.aleo", &["g".to_owned()]);
        assert_eq!(hit.map(|t| t.function_name.as_str()), Some("g"));
        assert!(decoded.find_transition("b.aleo", &["h".to_owned()]).is_none());
    }
}
