//! Starter prompts offered before the first message of a session.

use serde::{Deserialize, Serialize};

/// A suggested first message: short title plus the text that is sent when chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarterPrompt {
    pub title: String,
    pub text: String,
}

impl StarterPrompt {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
        }
    }
}

/// Built-in prompts used when the config does not list any.
pub fn default_prompts() -> Vec<StarterPrompt> {
    vec![
        StarterPrompt::new(
            "Cases related to SPGK",
            "Find me cases that are related to SPGK Pte Ltd",
        ),
        StarterPrompt::new("Decode acronyms", "What does LLM stand for?"),
        StarterPrompt::new(
            "Start your research",
            "How have world literacy rates change?",
        ),
        StarterPrompt::new(
            "Past custody case",
            "Has there been any past case related to custody?",
        ),
    ]
}

/// Configured prompts, or the built-in set when none are configured.
pub fn resolve_prompts(configured: &[StarterPrompt]) -> Vec<StarterPrompt> {
    if configured.is_empty() {
        default_prompts()
    } else {
        configured.to_vec()
    }
}

/// Look up a prompt by 1-based position, as shown in a numbered list.
pub fn select<'a>(prompts: &'a [StarterPrompt], choice: &str) -> Option<&'a StarterPrompt> {
    let n: usize = choice.trim().parse().ok()?;
    n.checked_sub(1).and_then(|i| prompts.get(i))
}
