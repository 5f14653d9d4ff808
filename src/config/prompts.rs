//! Prompt set configuration.
//!
//! The active prompt set is configuration and stays stable for the duration
//! of a crawl window; editing it effectively starts a new window.

use serde::Deserialize;

use crate::config::helpers::parse_optional_env;
use crate::error::ConfigError;

/// One prompt issued to every (domain, model) pair.
#[derive(Debug, Clone, Deserialize)]
pub struct Prompt {
    /// Stable key, recorded on every response row.
    pub id: String,
    /// Template text. `{domain}` is replaced with the hostname at dispatch.
    pub text: String,
    /// Bumped when the text changes materially.
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl Prompt {
    /// Render the template for a concrete domain.
    pub fn render(&self, host: &str) -> String {
        self.text.replace("{domain}", host)
    }
}

#[derive(Debug, Deserialize)]
struct RawPromptSet {
    #[serde(default)]
    prompts: Vec<Prompt>,
}

/// Load the prompt set from `PROMPTS_FILE` (default `prompts.toml`).
pub(crate) fn resolve_prompts() -> Result<Vec<Prompt>, ConfigError> {
    let path = parse_optional_env("PROMPTS_FILE", "prompts.toml".to_string())?;
    let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileUnreadable {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    let set: RawPromptSet = toml::from_str(&raw).map_err(|e| ConfigError::FileInvalid {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    validate_prompts(&set.prompts)?;
    Ok(set.prompts)
}

fn validate_prompts(prompts: &[Prompt]) -> Result<(), ConfigError> {
    if prompts.is_empty() {
        return Err(ConfigError::MissingRequired {
            key: "prompts".to_string(),
            hint: "The prompt file declares no prompts".to_string(),
        });
    }
    let mut seen = std::collections::HashSet::new();
    for p in prompts {
        if p.text.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: format!("prompts.{}", p.id),
                message: "prompt text is empty".to_string(),
            });
        }
        if !seen.insert(p.id.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "prompts".to_string(),
                message: format!("duplicate prompt id '{}'", p.id),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_file_shape() {
        let raw = r#"
            [[prompts]]
            id = "brand_recall"
            text = "What do you know about {domain}?"

            [[prompts]]
            id = "services"
            version = 3
            text = "List the services offered by {domain}."
        "#;
        let set: RawPromptSet = toml::from_str(raw).expect("parse");
        assert_eq!(set.prompts.len(), 2);
        assert_eq!(set.prompts[0].version, 1);
        assert_eq!(set.prompts[1].version, 3);
        validate_prompts(&set.prompts).expect("valid");
    }

    #[test]
    fn test_render_substitutes_domain() {
        let p = Prompt {
            id: "brand_recall".to_string(),
            text: "What do you know about {domain}?".to_string(),
            version: 1,
        };
        assert_eq!(
            p.render("example.com"),
            "What do you know about example.com?"
        );
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let p = Prompt {
            id: "p".to_string(),
            text: "t".to_string(),
            version: 1,
        };
        let err = validate_prompts(&[p.clone(), p]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_empty_set_rejected() {
        assert!(matches!(
            validate_prompts(&[]).unwrap_err(),
            ConfigError::MissingRequired { .. }
        ));
    }
}
