//! Testing utilities including mock implementations.
//!
//! These are useful for testing applications that use the pipeline
//! library without making real LLM or network calls.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};

use crate::error::LlmError;
use crate::traits::llm::{ChatModel, ChatRequest, ChatResponse};

/// A scripted chat model for testing.
///
/// Replies are matched by substring of the user prompt; a matched script
/// can be a single reply (repeated on every call) or a sequence that is
/// consumed call by call, with the last entry repeating. Injected
/// failures are consumed before any reply. Prompts unmatched by any
/// script get `NOT_FOUND`.
#[derive(Clone, Default)]
pub struct MockChatModel {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    scripts: Vec<(String, VecDeque<String>)>,
    failures: VecDeque<LlmError>,
    prompts: Vec<String>,
}

impl MockChatModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script one reply for prompts containing `matcher`.
    pub fn with_reply(self, matcher: impl Into<String>, reply: impl Into<String>) -> Self {
        self.with_reply_sequence(matcher, vec![reply.into()])
    }

    /// Script a sequence of replies for prompts containing `matcher`.
    pub fn with_reply_sequence(self, matcher: impl Into<String>, replies: Vec<String>) -> Self {
        let matcher = matcher.into();
        {
            let mut state = self.inner.lock().unwrap();
            match state.scripts.iter_mut().find(|(m, _)| *m == matcher) {
                Some((_, queue)) => queue.extend(replies),
                None => state.scripts.push((matcher, replies.into())),
            }
        }
        self
    }

    /// Inject `count` failures, consumed before any scripted reply.
    pub fn failing_times(self, count: usize, make: impl Fn() -> LlmError) -> Self {
        {
            let mut state = self.inner.lock().unwrap();
            for _ in 0..count {
                state.failures.push_back(make());
            }
        }
        self
    }

    /// Every user prompt this mock has seen, in call order.
    pub fn seen_prompts(&self) -> Vec<String> {
        self.inner.lock().unwrap().prompts.clone()
    }

    pub fn call_count(&self) -> usize {
        self.inner.lock().unwrap().prompts.len()
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut state = self.inner.lock().unwrap();
        state.prompts.push(request.user.clone());

        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let content = state
            .scripts
            .iter_mut()
            .find(|(matcher, _)| request.user.contains(matcher.as_str()))
            .map(|(_, queue)| {
                if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap_or_default()
                }
            })
            .unwrap_or_else(|| "NOT_FOUND".to_string());

        Ok(ChatResponse {
            prompt_tokens: ((request.system.len() + request.user.len()) / 4) as u32,
            completion_tokens: (content.len() / 4).max(1) as u32,
            content,
        })
    }

    fn model_id(&self) -> &str {
        "mock-model"
    }
}

/// Build a minimal PDF with one line of text per page.
///
/// Enough for exercising text extraction end to end without fixture
/// files on disk.
pub fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![50.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode fixture content"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).expect("serialise fixture PDF");
    buf
}

/// A small catalogue covering the common test cases: one emissions
/// indicator with a unit vocabulary and one percentage indicator.
pub const TEST_CATALOGUE_TOML: &str = r#"
fiscal_year_mapping = "calendar"

[[groups]]
group_name = "Emissions"

[[groups.indicators]]
name = "Scope 1 Emissions"
unit = "tCO2e"
keywords = ["Scope 1", "direct emissions"]
unit_pattern = "tCO2e|tonnes?\\s+CO2e?|metric tons? CO2e?"
unit_vocabulary = ["tCO2e", "ktCO2e"]

[groups.indicators.aliases]
"metric tons CO2e" = "tCO2e"
"tonnes CO2e" = "tCO2e"

[[groups]]
group_name = "Social"

[[groups.indicators]]
name = "Women in Workforce"
unit = "%"
keywords = ["women", "workforce"]
unit_pattern = "%|percent"
unit_vocabulary = ["%"]

[groups.indicators.aliases]
"percent" = "%"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::Catalogue;
    use crate::text;

    #[tokio::test]
    async fn scripted_replies_match_by_substring() {
        let llm = MockChatModel::new().with_reply("Scope 1", "scripted");
        let hit = llm
            .chat(&ChatRequest::new("sys", "Indicator: Scope 1 Emissions"))
            .await
            .unwrap();
        assert_eq!(hit.content, "scripted");

        let miss = llm.chat(&ChatRequest::new("sys", "other")).await.unwrap();
        assert_eq!(miss.content, "NOT_FOUND");
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn failures_are_consumed_before_replies() {
        let llm = MockChatModel::new()
            .failing_times(1, || LlmError::RateLimited)
            .with_reply("x", "ok");
        assert!(llm.chat(&ChatRequest::new("s", "x")).await.is_err());
        assert_eq!(llm.chat(&ChatRequest::new("s", "x")).await.unwrap().content, "ok");
    }

    #[test]
    fn fixture_pdf_round_trips_through_extraction() {
        let bytes = pdf_with_pages(&["Scope 1 Emissions: 32,400 tCO2e in 2023.", "Appendix."]);
        let doc = text::extract(&bytes).unwrap();
        assert_eq!(doc.pages.len(), 2);
        assert!(doc.pages[0].text.contains("32,400"));
    }

    #[test]
    fn fixture_catalogue_parses() {
        let catalogue = Catalogue::from_toml(TEST_CATALOGUE_TOML).unwrap();
        assert_eq!(catalogue.indicators().count(), 2);
    }
}
