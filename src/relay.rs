use std::sync::Arc;

use uuid::Uuid;

use crate::error::RelayError;
use crate::models::{ChatModel, ChatRequest};
use crate::parser::parse_reply;
use crate::retry::RetryPolicy;
use crate::session::Turn;
use crate::settings::{resolve_credential, ModelParams, RelaySettings};
use crate::storage::ConversationStore;

pub const SYSTEM_INSTRUCTION: &str = "You are Waves, a helpful HTML code generator. Important rules:
1. ALWAYS wrap your code in ```html tags
2. For images, always use placeholder picsum images.
3. When modifying existing code, preserve the structure and only change what's needed
4. After the code block, explain what you changed or created
5. Make sure all HTML elements are properly closed and structured
6. ALWAYS make the html code as short as possible, with the same functionality as the original code, if it gets too long, remake the whole code.
7. ALWAYS make the website look MODERN, no matter what the user asks for.";

#[derive(Debug, Clone, Default)]
pub struct ChatInput {
    pub session_id: Option<String>,
    pub prompt: String,
    pub prior_code: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub code_fragment: String,
    pub explanation_text: String,
    pub session_id: String,
}

/// Runs one prompt through the model and keeps the session history in step.
#[derive(Clone)]
pub struct Relay {
    store: Arc<dyn ConversationStore>,
    model: Arc<dyn ChatModel>,
    params: ModelParams,
    retry: RetryPolicy,
    default_credential: Option<String>,
}

impl Relay {
    pub fn new(store: Arc<dyn ConversationStore>, model: Arc<dyn ChatModel>, settings: &RelaySettings) -> Self {
        Self {
            store,
            model,
            params: settings.model_params,
            retry: settings.retry,
            default_credential: settings.api_key.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> { &self.store }

    pub async fn handle_chat_request(&self, input: ChatInput) -> Result<ChatReply, RelayError> {
        // whitespace only matters for the emptiness check; the prompt travels as typed
        let prompt = input.prompt;
        if prompt.trim().is_empty() {
            return Err(RelayError::Validation("Prompt is required".into()));
        }
        let api_key = resolve_credential(input.credential, self.default_credential.as_deref())
            .ok_or(RelayError::MissingCredential)?;
        let session_id = input
            .session_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let history = self.store.get_history(&session_id).await;
        tracing::debug!(session = %session_id, history_len = history.len(), "handling chat request");

        let request = ChatRequest {
            messages: build_messages(history, &prompt, input.prior_code.as_deref()),
            params: self.params,
        };
        let raw = self
            .retry
            .run(|| self.model.complete(&request, &api_key))
            .await
            .map_err(|e| {
                tracing::warn!(session = %session_id, attempts = e.attempts, "upstream call failed: {}", e.error);
                RelayError::from(e)
            })?;

        self.store
            .append_turns(&session_id, vec![Turn::user(prompt.as_str()), Turn::assistant(raw.clone())])
            .await;

        let parsed = parse_reply(&raw, &prompt);
        Ok(ChatReply {
            code_fragment: parsed.code_fragment,
            explanation_text: parsed.explanation_text,
            session_id,
        })
    }
}

/// With earlier code present the model is asked for an edit instead of a fresh page.
pub fn compose_user_turn(prompt: &str, prior_code: Option<&str>) -> String {
    match prior_code.filter(|c| !c.trim().is_empty()) {
        Some(code) => format!("Previous code:\n{code}\n\nUser request: {prompt}"),
        None => prompt.to_string(),
    }
}

pub fn build_messages(history: Vec<Turn>, prompt: &str, prior_code: Option<&str>) -> Vec<Turn> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Turn::system(SYSTEM_INSTRUCTION));
    messages.extend(history);
    messages.push(Turn::user(compose_user_turn(prompt, prior_code)));
    messages
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::UpstreamError;
    use crate::session::Role;
    use crate::storage::InMemoryConversationStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted replies and records what it was sent.
    #[derive(Default)]
    pub(crate) struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, UpstreamError>>>,
        pub calls: Mutex<Vec<(ChatRequest, String)>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(replies: Vec<Result<String, UpstreamError>>) -> Self {
            Self { replies: Mutex::new(replies.into()), calls: Mutex::default() }
        }

        pub(crate) fn call_count(&self) -> usize { self.calls.lock().unwrap().len() }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, req: &ChatRequest, api_key: &str) -> Result<String, UpstreamError> {
            self.calls.lock().unwrap().push((req.clone(), api_key.to_string()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("```html\n<p>default</p>\n```\nDefault reply.".into()))
        }
    }

    fn settings_with_key(key: Option<&str>) -> RelaySettings {
        RelaySettings { api_key: key.map(str::to_string), ..Default::default() }
    }

    fn make_relay(model: Arc<ScriptedModel>, key: Option<&str>) -> Relay {
        Relay::new(Arc::new(InMemoryConversationStore::default()), model, &settings_with_key(key))
    }

    fn input(session: &str, prompt: &str) -> ChatInput {
        ChatInput { session_id: Some(session.into()), prompt: prompt.into(), ..Default::default() }
    }

    #[tokio::test]
    async fn red_heading_round_trip_updates_history() {
        let raw = "```html\n<h1 style=\"color:red\">Hi</h1>\n```\nAdded a red heading as requested.";
        let model = Arc::new(ScriptedModel::new(vec![Ok(raw.into())]));
        let relay = make_relay(model.clone(), Some("cfg-key"));

        let reply = relay.handle_chat_request(input("s1", "make a red heading that says Hi")).await.unwrap();
        assert_eq!(reply.code_fragment, r#"<h1 style="color:red">Hi</h1>"#);
        assert_eq!(reply.explanation_text, "Added a red heading as requested.");
        assert_eq!(reply.session_id, "s1");

        let history = relay.store().get_history("s1").await;
        assert_eq!(history, vec![Turn::user("make a red heading that says Hi"), Turn::assistant(raw)]);

        let calls = model.calls.lock().unwrap();
        let (req, key) = &calls[0];
        assert_eq!(key, "cfg-key");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.params, ModelParams::default());
    }

    #[tokio::test]
    async fn successive_requests_replay_history_in_order() {
        let model = Arc::new(ScriptedModel::default());
        let relay = make_relay(model.clone(), Some("k"));
        for k in 0..3 {
            relay.handle_chat_request(input("s", &format!("prompt {k}"))).await.unwrap();
        }
        let history = relay.store().get_history("s").await;
        assert_eq!(history.len(), 6);
        assert_eq!(history[4], Turn::user("prompt 2"));

        let calls = model.calls.lock().unwrap();
        let third = &calls[2].0.messages;
        assert_eq!(third.len(), 1 + 4 + 1);
        assert_eq!(third[1], Turn::user("prompt 0"));
        assert_eq!(third[5], Turn::user("prompt 2"));
    }

    #[tokio::test]
    async fn prior_code_becomes_edit_request_but_bare_prompt_is_stored() {
        let model = Arc::new(ScriptedModel::default());
        let relay = make_relay(model.clone(), Some("k"));
        let mut req = input("s", "make it blue");
        req.prior_code = Some("<p>hi</p>".into());
        relay.handle_chat_request(req).await.unwrap();

        let sent = model.calls.lock().unwrap()[0].0.messages.last().cloned().unwrap();
        assert_eq!(sent.content, "Previous code:\n<p>hi</p>\n\nUser request: make it blue");
        assert_eq!(relay.store().get_history("s").await[0], Turn::user("make it blue"));
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_without_upstream_call() {
        let model = Arc::new(ScriptedModel::default());
        let relay = make_relay(model.clone(), Some("k"));
        let err = relay.handle_chat_request(input("s", "   ")).await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_credential_is_rejected_without_upstream_call() {
        let model = Arc::new(ScriptedModel::default());
        let relay = make_relay(model.clone(), None);
        let err = relay.handle_chat_request(input("s", "hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::MissingCredential));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn request_credential_overrides_default() {
        let model = Arc::new(ScriptedModel::default());
        let relay = make_relay(model.clone(), Some("cfg"));
        let mut req = input("s", "hi");
        req.credential = Some("caller".into());
        relay.handle_chat_request(req).await.unwrap();
        assert_eq!(model.calls.lock().unwrap()[0].1, "caller");
    }

    #[tokio::test]
    async fn missing_session_id_gets_generated() {
        let relay = make_relay(Arc::new(ScriptedModel::default()), Some("k"));
        let reply = relay
            .handle_chat_request(ChatInput { prompt: "hi".into(), ..Default::default() })
            .await
            .unwrap();
        assert!(Uuid::parse_str(&reply.session_id).is_ok());
        assert_eq!(relay.store().get_history(&reply.session_id).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_three_times() {
        let timeouts = (0..4).map(|_| Err(UpstreamError::Transient { reason: "request timed out".into() })).collect();
        let model = Arc::new(ScriptedModel::new(timeouts));
        let relay = make_relay(model.clone(), Some("k"));
        let started = tokio::time::Instant::now();

        let err = relay.handle_chat_request(input("s", "hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamTransient { attempts: 4, .. }));
        assert_eq!(model.call_count(), 4);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(relay.store().get_history("s").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success_recovers() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(UpstreamError::Transient { reason: "status 524".into() }),
            Ok("```css\np{}\n```\nStyled.".into()),
        ]));
        let relay = make_relay(model.clone(), Some("k"));
        let reply = relay.handle_chat_request(input("s", "style it")).await.unwrap();
        assert_eq!(reply.code_fragment, "p{}");
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn auth_and_rate_limit_are_not_retried() {
        let model = Arc::new(ScriptedModel::new(vec![Err(UpstreamError::Auth { body: "denied".into() })]));
        let relay = make_relay(model.clone(), Some("k"));
        let err = relay.handle_chat_request(input("s", "hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamAuth { .. }));
        assert_eq!(model.call_count(), 1);

        let model = Arc::new(ScriptedModel::new(vec![Err(UpstreamError::RateLimited { body: String::new() })]));
        let relay = make_relay(model.clone(), Some("k"));
        let err = relay.handle_chat_request(input("s", "hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamRateLimit { .. }));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn malformed_reply_still_yields_explanation() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("no code here".into())]));
        let relay = make_relay(model, Some("k"));
        let reply = relay.handle_chat_request(input("s", "make a footer")).await.unwrap();
        assert!(reply.code_fragment.is_empty());
        assert!(reply.explanation_text.contains("\"make a footer\""));
    }

    #[tokio::test]
    async fn prompt_is_forwarded_and_stored_as_typed() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("nothing fenced".into())]));
        let relay = make_relay(model.clone(), Some("k"));
        let prompt = "  make a footer\n";
        let reply = relay.handle_chat_request(input("s", prompt)).await.unwrap();

        assert_eq!(reply.explanation_text, crate::parser::fallback_explanation(prompt));
        assert_eq!(relay.store().get_history("s").await[0], Turn::user(prompt));
        assert_eq!(model.calls.lock().unwrap()[0].0.messages[1], Turn::user(prompt));
    }
}
