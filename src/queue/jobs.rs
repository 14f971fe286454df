//! Job payloads
//!
//! Every queue carries its own payload variant. Payloads are validated before
//! they reach a backend, so workers can rely on the required fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AppError, AppResult};

/// The fixed set of queues jobs can live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    ConversationProcessing,
    Analysis,
    Reasoning,
    SummaryGeneration,
    AnalysisModule,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::ConversationProcessing,
        QueueName::Analysis,
        QueueName::Reasoning,
        QueueName::SummaryGeneration,
        QueueName::AnalysisModule,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::ConversationProcessing => "conversation-processing",
            QueueName::Analysis => "analysis",
            QueueName::Reasoning => "reasoning",
            QueueName::SummaryGeneration => "summary-generation",
            QueueName::AnalysisModule => "analysis-module",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Background analysis modules fanned out for every conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnalysisModule {
    RoughOverview,
    ExtractHealthMetrics,
    CheckInformationCompleteness,
    HypothesisGeneration,
}

impl AnalysisModule {
    pub const ALL: [AnalysisModule; 4] = [
        AnalysisModule::RoughOverview,
        AnalysisModule::ExtractHealthMetrics,
        AnalysisModule::CheckInformationCompleteness,
        AnalysisModule::HypothesisGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisModule::RoughOverview => "roughOverview",
            AnalysisModule::ExtractHealthMetrics => "extractHealthMetrics",
            AnalysisModule::CheckInformationCompleteness => "checkInformationCompleteness",
            AnalysisModule::HypothesisGeneration => "hypothesisGeneration",
        }
    }
}

impl std::fmt::Display for AnalysisModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnalysisModule {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnalysisModule::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AppError::Config(format!("Unknown analysis module: {}", s)))
    }
}

/// Input data for a job, keyed by the queue it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobPayload {
    #[serde(rename_all = "camelCase")]
    ConversationProcessing {
        conversation_id: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Analysis {
        conversation_id: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Reasoning {
        conversation_id: String,
        context: String,
    },
    #[serde(rename_all = "camelCase")]
    SummaryGeneration {
        session_id: String,
        conversation: String,
    },
    #[serde(rename_all = "camelCase")]
    AnalysisModule {
        module: AnalysisModule,
        conversation: String,
        session_id: String,
        timestamp: DateTime<Utc>,
    },
}

fn require(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        Err(AppError::Validation(format!("{} must not be empty", field)))
    } else {
        Ok(())
    }
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::ConversationProcessing { .. } => QueueName::ConversationProcessing,
            JobPayload::Analysis { .. } => QueueName::Analysis,
            JobPayload::Reasoning { .. } => QueueName::Reasoning,
            JobPayload::SummaryGeneration { .. } => QueueName::SummaryGeneration,
            JobPayload::AnalysisModule { .. } => QueueName::AnalysisModule,
        }
    }

    /// Job name, used as the id prefix and in logs
    pub fn name(&self) -> &'static str {
        match self {
            JobPayload::ConversationProcessing { .. } => "conversation",
            JobPayload::Analysis { .. } => "analysis",
            JobPayload::Reasoning { .. } => "reasoning",
            JobPayload::SummaryGeneration { .. } => "generateSummary",
            JobPayload::AnalysisModule { module, .. } => module.as_str(),
        }
    }

    /// Topic that completion events for this job are published on
    pub fn conversation_id(&self) -> &str {
        match self {
            JobPayload::ConversationProcessing { conversation_id, .. }
            | JobPayload::Analysis { conversation_id, .. }
            | JobPayload::Reasoning { conversation_id, .. } => conversation_id,
            JobPayload::SummaryGeneration { session_id, .. }
            | JobPayload::AnalysisModule { session_id, .. } => session_id,
        }
    }

    pub fn module(&self) -> Option<AnalysisModule> {
        match self {
            JobPayload::AnalysisModule { module, .. } => Some(*module),
            _ => None,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        match self {
            JobPayload::ConversationProcessing { conversation_id, message } => {
                require("conversationId", conversation_id)?;
                require("message", message)
            }
            JobPayload::Analysis { conversation_id, content } => {
                require("conversationId", conversation_id)?;
                require("content", content)
            }
            JobPayload::Reasoning { conversation_id, context } => {
                require("conversationId", conversation_id)?;
                require("context", context)
            }
            JobPayload::SummaryGeneration { session_id, conversation } => {
                require("sessionId", session_id)?;
                require("conversation", conversation)
            }
            JobPayload::AnalysisModule { conversation, session_id, .. } => {
                require("sessionId", session_id)?;
                require("conversation", conversation)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_payload(conversation: &str, session_id: &str) -> JobPayload {
        JobPayload::AnalysisModule {
            module: AnalysisModule::RoughOverview,
            conversation: conversation.to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_payload_queue_mapping() {
        let payload = JobPayload::Reasoning {
            conversation_id: "c1".into(),
            context: "ctx".into(),
        };
        assert_eq!(payload.queue(), QueueName::Reasoning);
        assert_eq!(payload.conversation_id(), "c1");
        assert_eq!(payload.module(), None);

        let payload = module_payload("USER: hi", "s1");
        assert_eq!(payload.queue(), QueueName::AnalysisModule);
        assert_eq!(payload.name(), "roughOverview");
        assert_eq!(payload.conversation_id(), "s1");
    }

    #[test]
    fn test_payload_validation() {
        assert!(module_payload("USER: hi", "s1").validate().is_ok());
        assert!(matches!(
            module_payload("USER: hi", "  ").validate(),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            module_payload("", "s1").validate(),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_payload_wire_format() {
        let json = serde_json::json!({
            "type": "conversation-processing",
            "conversationId": "abc",
            "message": "Hello!"
        });
        let payload: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(
            payload,
            JobPayload::ConversationProcessing {
                conversation_id: "abc".into(),
                message: "Hello!".into(),
            }
        );

        let value = serde_json::to_value(module_payload("USER: hi", "s1")).unwrap();
        assert_eq!(value["type"], "analysis-module");
        assert_eq!(value["module"], "roughOverview");
        assert_eq!(value["sessionId"], "s1");
    }

    #[test]
    fn test_module_from_str() {
        assert_eq!(
            "extracthealthmetrics".parse::<AnalysisModule>().unwrap(),
            AnalysisModule::ExtractHealthMetrics
        );
        assert!("summary".parse::<AnalysisModule>().is_err());
    }
}
