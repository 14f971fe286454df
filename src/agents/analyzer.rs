use async_trait::async_trait;
use tracing::{debug, info};

use super::extraction::{CompletenessReport, ExtractedInfo, HealthMetrics};
use super::prompts;
use crate::config::LLMConfig;
use crate::llm::provider::{LLMProviderConfig, LLM};
use crate::queue::{AnalysisModule, JobPayload};
use crate::types::{AppError, AppResult, LLMMessage, LLMRequest};

/// Turns a job payload into its result text.
///
/// Workers treat an `Err` and an empty string the same way: the attempt failed.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, payload: &JobPayload) -> AppResult<String>;
}

pub struct LlmAnalyzer {
    llm: LLM,
    default_model: String,
    reasoning_model: String,
}

impl LlmAnalyzer {
    pub fn from_config(config: &LLMConfig) -> Self {
        let llm = LLM::new(LLMProviderConfig {
            provider: config.provider,
            api_key: config.api_key.clone(),
        });
        Self::new(llm, config)
    }

    pub fn new(llm: LLM, config: &LLMConfig) -> Self {
        Self {
            llm,
            default_model: config.default_model.clone(),
            reasoning_model: config.reasoning_model.clone(),
        }
    }

    fn request(&self, model: &str, system: &str, user: String, json: bool) -> LLMRequest {
        LLMRequest {
            model: model.to_string(),
            messages: vec![LLMMessage::system(system), LLMMessage::user(user)],
            max_tokens: Some(2000),
            temperature: if json { Some(0.0) } else { Some(0.7) },
            json_response: json,
        }
    }

    fn request_for(&self, payload: &JobPayload) -> LLMRequest {
        let default = self.default_model.as_str();
        match payload {
            JobPayload::ConversationProcessing { message, .. } => {
                self.request(default, prompts::MESSAGE_SYSTEM, message.clone(), false)
            }
            JobPayload::Analysis { content, .. } => {
                self.request(default, prompts::CONTENT_SYSTEM, content.clone(), false)
            }
            JobPayload::Reasoning { context, .. } => self.request(
                &self.reasoning_model,
                prompts::REASONING_SYSTEM,
                context.clone(),
                false,
            ),
            JobPayload::SummaryGeneration { conversation, .. } => self.request(
                default,
                prompts::SUMMARY_SYSTEM,
                prompts::transcript_prompt(conversation),
                false,
            ),
            JobPayload::AnalysisModule {
                module,
                conversation,
                ..
            } => match module {
                AnalysisModule::RoughOverview => self.request(
                    default,
                    prompts::OVERVIEW_SYSTEM,
                    prompts::transcript_prompt(conversation),
                    false,
                ),
                AnalysisModule::ExtractHealthMetrics => self.request(
                    default,
                    prompts::METRICS_SYSTEM,
                    prompts::metrics_prompt(conversation),
                    true,
                ),
                AnalysisModule::CheckInformationCompleteness => self.request(
                    default,
                    prompts::COMPLETENESS_SYSTEM,
                    prompts::completeness_prompt(conversation),
                    true,
                ),
                AnalysisModule::HypothesisGeneration => self.request(
                    &self.reasoning_model,
                    prompts::HYPOTHESIS_SYSTEM,
                    prompts::transcript_prompt(conversation),
                    false,
                ),
            },
        }
    }
}

fn malformed(module: AnalysisModule, e: serde_json::Error) -> AppError {
    AppError::Analysis(format!("{} returned malformed JSON: {}", module, e))
}

/// Validate and normalize a JSON reply for the extraction modules.
fn post_process(module: Option<AnalysisModule>, content: String) -> AppResult<String> {
    match module {
        Some(m @ AnalysisModule::ExtractHealthMetrics) => {
            let metrics: HealthMetrics =
                serde_json::from_str(&content).map_err(|e| malformed(m, e))?;
            debug!(recorded = ?metrics.recorded(), "Extracted health metrics");
            Ok(serde_json::to_string(&metrics)?)
        }
        Some(m @ AnalysisModule::CheckInformationCompleteness) => {
            let info: ExtractedInfo =
                serde_json::from_str(&content).map_err(|e| malformed(m, e))?;
            let report = CompletenessReport::from_extracted(&info);
            debug!(
                enough = report.has_enough_information,
                missing = report.missing_critical_info.len(),
                "Checked information completeness"
            );
            Ok(serde_json::to_string(&report)?)
        }
        _ => Ok(content),
    }
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze(&self, payload: &JobPayload) -> AppResult<String> {
        let request = self.request_for(payload);
        info!(job = payload.name(), model = %request.model, "Running analysis");

        let response = self.llm.create_chat_completion(&request).await?;
        let content = response.content.trim().to_string();
        if content.is_empty() {
            return Err(AppError::Analysis(format!(
                "{} produced an empty response",
                payload.name()
            )));
        }
        post_process(payload.module(), content)
    }
}
