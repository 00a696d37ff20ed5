//! Session system prompt

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Who the user said they are when starting a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Student,
    Professional,
    #[default]
    General,
}

impl UserRole {
    /// Lenient parse: anything unrecognized is `General`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "student" => Self::Student,
            "professional" => Self::Professional,
            _ => Self::General,
        }
    }

    fn profile(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Self::Student => (
                "Use friendly, encouraging language with step-by-step explanations",
                "Focus on practical, budget-friendly solutions and educational content",
                "Break down complex concepts into digestible parts",
            ),
            Self::Professional => (
                "Use concise, data-driven language with strategic frameworks",
                "Emphasize ROI, tax efficiency, and long-term wealth building",
                "Provide actionable insights with quantifiable outcomes",
            ),
            Self::General => (
                "Use balanced, supportive language that's accessible yet informative",
                "Cover fundamental financial principles with practical applications",
                "Match the level of detail to what the user already knows",
            ),
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Student => write!(f, "student"),
            Self::Professional => write!(f, "professional"),
            Self::General => write!(f, "general"),
        }
    }
}

/// Build the system message that opens every session
pub fn build_system_prompt(name: &str, role: UserRole) -> String {
    let (tone, focus, style) = role.profile();
    let mut prompt = String::new();

    prompt.push_str("You are Taxora, a conversational personal and business finance assistant. ");
    prompt.push_str(&format!(
        "You're speaking with {}, who has identified as a {}.\n\n",
        name.trim(),
        role
    ));
    prompt.push_str(&format!("Communication style: {}. {}.\n", tone, style));
    prompt.push_str(&format!("Expertise focus: {}. ", focus));
    prompt.push_str(
        "Give personalized guidance on savings, tax planning, investing and budgeting.\n",
    );
    prompt.push_str("Ask a follow-up question when clarification would lead to better advice. ");
    prompt.push_str("Always end with practical, actionable recommendations.");

    debug!("Built system prompt for {} ({} chars)", role, prompt.len());

    prompt
}
