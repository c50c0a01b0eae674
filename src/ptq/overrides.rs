//! Per-op precision overrides (`op_type_dict`, `op_name_dict`)

use serde_json::Value;

/// Linears forced to stay in fp32
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpOverrides {
    all_linear: bool,
    names: Vec<String>,
}

/// `{"weight": {"dtype": "fp32"}}` or `{"weight": {"dtype": ["fp32"]}}`
fn weight_is_fp32(entry: &Value) -> bool {
    match entry.pointer("/weight/dtype") {
        Some(Value::String(s)) => s == "fp32",
        Some(Value::Array(items)) => items.iter().any(|v| v.as_str() == Some("fp32")),
        _ => false,
    }
}

impl OpOverrides {
    pub fn from_dicts(op_type_dict: Option<&Value>, op_name_dict: Option<&Value>) -> Self {
        let all_linear = op_type_dict
            .and_then(Value::as_object)
            .map_or(false, |types| {
                types
                    .iter()
                    .any(|(op, entry)| op.eq_ignore_ascii_case("linear") && weight_is_fp32(entry))
            });
        let names = op_name_dict
            .and_then(Value::as_object)
            .map(|ops| {
                ops.iter()
                    .filter(|(_, entry)| weight_is_fp32(entry))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        Self { all_linear, names }
    }

    pub fn keeps_fp32(&self, name: &str) -> bool {
        self.all_linear || self.names.iter().any(|n| n == name)
    }

    pub fn is_empty(&self) -> bool {
        !self.all_linear && self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_name_override_keeps_one_layer() {
        let names = json!({"model.layers.0.mlp.down_proj": {"weight": {"dtype": ["fp32"]}}});
        let o = OpOverrides::from_dicts(None, Some(&names));
        assert!(o.keeps_fp32("model.layers.0.mlp.down_proj"));
        assert!(!o.keeps_fp32("model.layers.0.mlp.up_proj"));
    }

    #[test]
    fn test_type_override_keeps_every_linear() {
        let types = json!({"Linear": {"weight": {"dtype": "fp32"}}});
        let o = OpOverrides::from_dicts(Some(&types), None);
        assert!(o.keeps_fp32("anything"));
    }

    #[test]
    fn test_non_fp32_entries_are_ignored() {
        let names = json!({
            "fc": {"weight": {"dtype": "int8"}},
            "head": {"activation": {"dtype": "fp32"}}
        });
        assert!(OpOverrides::from_dicts(None, Some(&names)).is_empty());
    }
}
