use serde::{Deserialize, Serialize};

/// Every question has exactly this many answer options.
pub const OPTION_COUNT: usize = 4;

/// Allowed range for a question's time limit, in seconds.
pub const MIN_TIME_LIMIT_SECS: u64 = 10;
pub const MAX_TIME_LIMIT_SECS: u64 = 180;

/// A single multiple-choice question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub text: String,
    pub options: Vec<String>,
    pub correct_index: usize,
    #[serde(rename = "timeLimit")]
    pub time_limit_secs: u64,
}

impl Question {
    /// Validate a single question against the protocol constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            return Err("Question text must not be empty".to_string());
        }
        if self.options.len() != OPTION_COUNT {
            return Err(format!(
                "Question must have exactly {OPTION_COUNT} options, got {}",
                self.options.len()
            ));
        }
        if self.options.iter().any(|o| o.trim().is_empty()) {
            return Err("Answer options must not be empty".to_string());
        }
        if self.correct_index >= OPTION_COUNT {
            return Err(format!(
                "Correct option index {} out of range 0..{OPTION_COUNT}",
                self.correct_index
            ));
        }
        if !(MIN_TIME_LIMIT_SECS..=MAX_TIME_LIMIT_SECS).contains(&self.time_limit_secs) {
            return Err(format!(
                "Time limit must be between {MIN_TIME_LIMIT_SECS} and {MAX_TIME_LIMIT_SECS} seconds"
            ));
        }
        Ok(())
    }
}

/// Validate a full question set as submitted by the moderator editor.
pub fn validate_questions(questions: &[Question]) -> Result<(), String> {
    if questions.is_empty() {
        return Err("At least one question is required".to_string());
    }
    for (i, q) in questions.iter().enumerate() {
        q.validate().map_err(|e| format!("Question {}: {e}", i + 1))?;
    }
    Ok(())
}
