//! Validation for the worker model identifier.

use crate::errors::ConfigError;

/// Reject model names outside `[A-Za-z0-9._-]` before anything is spawned.
pub fn validate_model(model: &str) -> Result<(), ConfigError> {
    let valid = !model.is_empty()
        && model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(ConfigError::InvalidModel {
            model: model.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_model_names() {
        for model in ["auto", "claude-3.5-sonnet", "gpt_4o", "sonnet-4.5-thinking"] {
            assert!(validate_model(model).is_ok(), "{model} should be valid");
        }
    }

    #[test]
    fn rejects_empty_and_unsafe_characters() {
        for model in ["", "auto; rm -rf /", "a b", "../x", "model$", "m\n", "modèle"] {
            assert!(
                matches!(
                    validate_model(model),
                    Err(ConfigError::InvalidModel { .. })
                ),
                "{model:?} should be rejected"
            );
        }
    }
}
