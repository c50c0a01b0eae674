//! Which layers the replacement engine leaves dense

/// Generation and embedding heads, never converted
pub const DEFAULT_EXCLUDED_MODULES: [&str; 3] = ["lm_head", "output_layer", "embed_out"];

/// Decides whether a qualified layer name is excluded from replacement
pub trait Exclusion {
    fn excludes(&self, name: &str) -> bool;
}

impl<F> Exclusion for F
where
    F: Fn(&str) -> bool,
{
    fn excludes(&self, name: &str) -> bool {
        self(name)
    }
}

/// Substring match against a list of module names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionPredicate {
    names: Vec<String>,
}

impl Default for ExclusionPredicate {
    fn default() -> Self {
        Self {
            names: DEFAULT_EXCLUDED_MODULES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ExclusionPredicate {
    /// The default heads plus `extra` names
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut p = Self::default();
        for name in extra {
            let name = name.into();
            if !p.names.contains(&name) {
                p.names.push(name);
            }
        }
        p
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Exclusion for ExclusionPredicate {
    fn excludes(&self, name: &str) -> bool {
        self.names.iter().any(|n| name.contains(n.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_heads_are_excluded() {
        let p = ExclusionPredicate::default();
        assert!(p.excludes("lm_head"));
        assert!(p.excludes("transformer.output_layer"));
        assert!(p.excludes("gpt_neox.embed_out"));
        assert!(!p.excludes("layer.0.mlp"));
    }

    #[test]
    fn test_extra_names_extend_defaults() {
        let p = ExclusionPredicate::with_extra(["gate"]);
        assert!(p.excludes("model.layers.0.mlp.gate"));
        assert!(p.excludes("lm_head"));
        assert_eq!(ExclusionPredicate::with_extra(["lm_head"]).names().len(), 3);
    }

    #[test]
    fn test_closures_are_exclusions() {
        let only_first = |name: &str| !name.starts_with("layers.0");
        assert!(only_first.excludes("layers.1.fc"));
    }
}
