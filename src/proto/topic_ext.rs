use super::instance::IndexState;
use super::instance::Instance;
use super::topic::ErrorResponse;
use super::topic::TimestampResponse;
use super::topic::TopicResponse;
use crate::Error;

impl Instance {
    /// Bucket the instance indexes, from its definition.
    pub fn bucket(&self) -> &str {
        self.definition
            .as_ref()
            .map(|d| d.bucket.as_str())
            .unwrap_or("")
    }

    pub fn index_state(&self) -> IndexState {
        IndexState::try_from(self.state).unwrap_or(IndexState::Unspecified)
    }
}

impl ErrorResponse {
    pub fn ok() -> Self {
        ErrorResponse { error: String::new() }
    }

    pub fn failure(err: &Error) -> Self {
        ErrorResponse {
            error: err.to_string(),
        }
    }

    /// Convert a wire response back into a result for the caller.
    pub fn into_result(self) -> Result<(), String> {
        if self.error.is_empty() {
            Ok(())
        } else {
            Err(self.error)
        }
    }
}

impl TopicResponse {
    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

impl TimestampResponse {
    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}
