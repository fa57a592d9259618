//! The three authoring steps. Each wraps one call to the authoring service
//! and parses the reply into that step's structured result.

use serde::de::DeserializeOwned;

use crate::anthropic::{AnthropicError, MessageSender, MessagesRequest};
use crate::config::{AuthoringConfig, StageModel};
use crate::draft::{ComposedDraft, FinalArticle, RevisedDraft, SourceItem};
use crate::error::StepError;

pub(crate) const COMPOSE_SYSTEM: &str = "You are a financial journalist writing for a personal-finance \
website. Turn the news item you are given into an original, accurate first draft aimed at \
everyday readers. Do not invent figures that are not in the source.";

pub(crate) const REVISE_SYSTEM: &str = "You are the site's editor. Tighten the draft you are given: fix \
factual hedging, remove hype, improve structure with `##` section headings, and keep the \
reader's practical takeaway front and centre.";

pub(crate) const FINALIZE_SYSTEM: &str = "You prepare edited drafts for publication. Produce the final \
article with a URL slug (lowercase words joined by hyphens), a meta description of 50 to 160 \
characters, and a short list of topical tags.";

/// Extract the JSON object from a model reply, tolerating code fences and
/// stray prose around it.
pub fn parse_structured<T: DeserializeOwned>(text: &str) -> Result<T, AnthropicError> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    let candidate = match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if end > start => &unfenced[start..=end],
        _ => unfenced,
    };
    serde_json::from_str(candidate).map_err(|e| AnthropicError::MalformedResponse(e.to_string()))
}

fn require(field: &str, value: &str) -> Result<(), AnthropicError> {
    if value.trim().is_empty() {
        return Err(AnthropicError::MalformedResponse(format!(
            "response field `{field}` is empty"
        )));
    }
    Ok(())
}

pub struct StageHandlers<S> {
    sender: S,
    config: AuthoringConfig,
}

impl<S: MessageSender> StageHandlers<S> {
    pub fn new(sender: S, config: AuthoringConfig) -> Self {
        Self { sender, config }
    }

    async fn author<T: DeserializeOwned>(
        &self,
        stage: &StageModel,
        system: &str,
        prompt: String,
    ) -> Result<T, StepError> {
        let req = MessagesRequest::single_turn(&stage.model, stage.max_tokens, system, prompt);
        let response = self.sender.send_message(&req).await?;
        let text = response.text();
        match parse_structured(&text) {
            Ok(value) => Ok(value),
            Err(AnthropicError::MalformedResponse(reason)) if response.truncated() => {
                Err(AnthropicError::MalformedResponse(format!(
                    "output cut off at max_tokens: {reason}"
                ))
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stage 1: news item to first draft.
    pub async fn compose(&self, source: &SourceItem) -> Result<ComposedDraft, StepError> {
        let prompt = format!(
            "Respond with ONLY valid JSON, no other text.\n\
             Format: {{\"title\": \"<headline>\", \"body\": \"<markdown article>\"}}\n\
             \n\
             Category: {}\n\
             Headline: {}\n\
             Source: {}\n\
             \n\
             {}",
            source.category, source.title, source.source_link, source.raw_content
        );
        let drafted: ComposedDraft = self
            .author(&self.config.compose, COMPOSE_SYSTEM, prompt)
            .await?;
        require("title", &drafted.title)?;
        require("body", &drafted.body)?;
        Ok(drafted)
    }

    /// Stage 2: editorial revision of the stage-1 draft.
    pub async fn revise(&self, draft: &str) -> Result<RevisedDraft, StepError> {
        let prompt = format!(
            "Respond with ONLY valid JSON, no other text.\n\
             Format: {{\"title\": \"<headline>\", \"body\": \"<markdown article>\", \
             \"changes\": [\"<one line per notable edit>\"]}}\n\
             \n\
             Draft:\n{draft}"
        );
        let revised: RevisedDraft = self
            .author(&self.config.revise, REVISE_SYSTEM, prompt)
            .await?;
        require("title", &revised.title)?;
        require("body", &revised.body)?;
        Ok(revised)
    }

    /// Stage 3: publishable article from the revised draft.
    pub async fn finalize(&self, revision: &str) -> Result<FinalArticle, StepError> {
        let prompt = format!(
            "Respond with ONLY valid JSON, no other text.\n\
             Format: {{\"title\": \"<headline>\", \"slug\": \"<url-slug>\", \
             \"meta_description\": \"<50-160 chars>\", \"body\": \"<markdown article>\", \
             \"tags\": [\"<tag>\"]}}\n\
             \n\
             Revised draft:\n{revision}"
        );
        let article: FinalArticle = self
            .author(&self.config.finalize, FINALIZE_SYSTEM, prompt)
            .await?;
        require("body", &article.body)?;
        Ok(article)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::anthropic::{ContentBlock, MessagesResponse, Usage};
    use crate::draft::sample_source;
    use crate::error::ErrorCode;

    /// Scripted authoring service: pops one reply per call and records every
    /// request. Panics when it runs out of replies.
    pub(crate) struct ScriptedSender {
        replies: Mutex<VecDeque<Result<String, AnthropicError>>>,
        pub(crate) calls: Mutex<Vec<MessagesRequest>>,
        pub(crate) delay: Option<std::time::Duration>,
    }

    impl ScriptedSender {
        pub(crate) fn new(replies: Vec<Result<String, AnthropicError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        pub(crate) fn with_delay(mut self, delay: std::time::Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        /// System prompts of the calls made so far, in order.
        pub(crate) fn systems(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.system.clone().unwrap_or_default())
                .collect()
        }
    }

    pub(crate) fn reply(text: &str) -> MessagesResponse {
        MessagesResponse {
            id: "mock".into(),
            content: vec![ContentBlock {
                content_type: "text".into(),
                text: text.to_string(),
            }],
            model: "mock".into(),
            stop_reason: Some("end_turn".into()),
            usage: Usage {
                input_tokens: 0,
                output_tokens: 0,
            },
        }
    }

    impl MessageSender for ScriptedSender {
        async fn send_message(
            &self,
            req: &MessagesRequest,
        ) -> Result<MessagesResponse, AnthropicError> {
            self.calls.lock().unwrap().push(req.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(Ok(text)) => Ok(reply(&text)),
                Some(Err(e)) => Err(e),
                None => panic!("scripted sender ran out of replies"),
            }
        }
    }

    pub(crate) fn composed_json() -> String {
        r#"{"title":"Rates stay put","body":"The central bank held rates."}"#.to_string()
    }

    pub(crate) fn revised_json() -> String {
        r###"{"title":"Rates stay put","body":"## What happened\nRates held.","changes":["added heading"]}"###
            .to_string()
    }

    pub(crate) fn final_json() -> String {
        let body = format!("## What happened\n{}", "word ".repeat(320));
        serde_json::json!({
            "title": "Rates stay put for now",
            "slug": "rates-stay-put-for-now",
            "meta_description": "The central bank kept its policy rate unchanged. Here is what that means for savers.",
            "body": body,
            "tags": ["rates", "savings"]
        })
        .to_string()
    }

    fn handlers(replies: Vec<Result<String, AnthropicError>>) -> StageHandlers<ScriptedSender> {
        StageHandlers::new(ScriptedSender::new(replies), AuthoringConfig::default())
    }

    #[test]
    fn parse_structured_handles_fences_and_prose() {
        let fenced = "```json\n{\"title\":\"a\",\"body\":\"b\"}\n```";
        let parsed: ComposedDraft = parse_structured(fenced).unwrap();
        assert_eq!(parsed.title, "a");

        let chatty = "Sure! Here it is: {\"title\":\"a\",\"body\":\"b\"} Hope that helps.";
        let parsed: ComposedDraft = parse_structured(chatty).unwrap();
        assert_eq!(parsed.body, "b");

        let err = parse_structured::<ComposedDraft>("no json here").unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedResponse);
    }

    #[tokio::test]
    async fn compose_uses_configured_model() {
        let h = handlers(vec![Ok(composed_json())]);
        let drafted = h.compose(&sample_source()).await.unwrap();
        assert_eq!(drafted.title, "Rates stay put");
        let calls = h.sender.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model, AuthoringConfig::default().compose.model);
        assert_eq!(calls[0].system.as_deref(), Some(COMPOSE_SYSTEM));
        assert!(calls[0].messages[0].content.contains("Central bank holds rates"));
    }

    #[tokio::test]
    async fn empty_body_is_malformed() {
        let h = handlers(vec![Ok(r#"{"title":"t","body":"  "}"#.into())]);
        let err = h.compose(&sample_source()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedResponse);
    }

    #[tokio::test]
    async fn service_error_passes_through() {
        let h = handlers(vec![Err(AnthropicError::RateLimited {
            retry_after_ms: 2000,
        })]);
        let err = h.revise("draft").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimited);
    }

    #[tokio::test]
    async fn finalize_parses_article() {
        let h = handlers(vec![Ok(final_json())]);
        let article = h.finalize("revised").await.unwrap();
        assert_eq!(article.slug, "rates-stay-put-for-now");
        assert_eq!(article.tags, vec!["rates", "savings"]);
    }
}
