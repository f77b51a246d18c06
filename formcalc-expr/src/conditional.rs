//! Typed conditional logic attached to fields

use serde::{Deserialize, Serialize};

/// What a satisfied condition does to its field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalAction {
    /// Visible exactly when the condition holds
    #[default]
    Show,
    /// Hidden exactly when the condition holds
    Hide,
    /// Editable exactly when the condition holds
    Enable,
    /// Read-only exactly when the condition holds
    Disable,
    /// Mandatory exactly when the condition holds
    Require,
}

/// A boolean expression controlling a field's visibility, enablement or
/// required state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalLogic {
    pub expression: String,

    #[serde(default)]
    pub action: ConditionalAction,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lower values are applied first
    #[serde(default)]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

impl ConditionalLogic {
    pub fn new(expression: impl Into<String>, action: ConditionalAction) -> Self {
        Self {
            expression: expression.into(),
            action,
            enabled: true,
            priority: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_defaults() {
        let logic: ConditionalLogic = serde_json::from_str(r#"{"expression": "qty > 1"}"#).unwrap();
        assert_eq!(logic.action, ConditionalAction::Show);
        assert!(logic.enabled);
        assert_eq!(logic.priority, 0);

        let logic: ConditionalLogic =
            serde_json::from_str(r#"{"expression": "x", "action": "require", "enabled": false}"#)
                .unwrap();
        assert_eq!(logic.action, ConditionalAction::Require);
        assert!(!logic.enabled);
    }
}
