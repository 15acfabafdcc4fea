use futures::StreamExt;
use tokio::sync::mpsc;

use super::conversation::Conversation;
use super::llm::{LlmEvent, LlmStream};
use super::message::{ConversationMessage, ToolCall};
use super::tools::ToolRegistry;
use crate::Result;
use crate::config::ToolLoopConfig;

const UNKNOWN_CALL_ID: &str = "unknown";

/// Summary of one assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolLoopOutcome {
    /// Completion requests made during the turn.
    pub rounds: usize,
    pub tool_calls: usize,
    /// The model was still calling tools when the round cap was reached.
    pub capped: bool,
    /// The output receiver went away before the turn finished.
    pub interrupted: bool,
}

/// Forward one delta to the listener and record it. `false` once the listener is gone.
async fn forward(
    conversation: &mut Conversation,
    output: &mpsc::Sender<String>,
    delta: String,
) -> bool {
    if delta.is_empty() {
        return true;
    }
    let recorded = delta.clone();
    if output.send(delta).await.is_err() {
        tracing::info!("Listener gone, interrupting turn");
        conversation.mark_interrupted();
        return false;
    }
    conversation.extend_reply(&recorded);
    true
}

pub(crate) async fn run_turn(
    conversation: &mut Conversation,
    llm: &dyn LlmStream,
    registry: &ToolRegistry,
    config: ToolLoopConfig,
    output: &mpsc::Sender<String>,
) -> Result<ToolLoopOutcome> {
    let mut outcome = ToolLoopOutcome::default();

    if !conversation.tools_enabled() {
        outcome.rounds = 1;
        let mut stream = llm.chat_completion(conversation.preprocessed_messages());
        while let Some(delta) = stream.next().await {
            if !forward(conversation, output, delta?).await {
                outcome.interrupted = true;
                break;
            }
        }
        return Ok(outcome);
    }

    let max_rounds = config.max_rounds.max(1);
    let definitions = registry.definitions();
    loop {
        if outcome.rounds == max_rounds {
            tracing::warn!(
                reason = "round_cap",
                rounds = outcome.rounds,
                tool_calls = outcome.tool_calls,
                "Tool round cap reached, ending turn"
            );
            outcome.capped = true;
            break;
        }
        outcome.rounds += 1;

        let batch = {
            let mut stream = llm
                .chat_completion_with_tools(conversation.preprocessed_messages(), definitions.clone());
            let mut batch = None;
            while let Some(event) = stream.next().await {
                match event? {
                    LlmEvent::Content(delta) => {
                        if !forward(conversation, output, delta).await {
                            outcome.interrupted = true;
                            return Ok(outcome);
                        }
                    }
                    LlmEvent::ToolCalls(calls) => {
                        batch = Some(calls);
                        break;
                    }
                }
            }
            batch
        };

        let Some(calls) = batch.filter(|calls| !calls.is_empty()) else {
            break;
        };
        outcome.tool_calls += calls.len();
        execute_round(conversation, registry, calls).await;
    }

    tracing::debug!(?outcome, "Turn complete");
    Ok(outcome)
}

async fn execute_round(conversation: &mut Conversation, registry: &ToolRegistry, calls: Vec<ToolCall>) {
    let calls: Vec<ToolCall> = calls
        .into_iter()
        .map(|mut call| {
            if call.id.is_empty() {
                call.id = UNKNOWN_CALL_ID.to_string();
            }
            call
        })
        .collect();

    conversation.push(ConversationMessage::tool_request(calls.clone()));
    for call in &calls {
        tracing::info!(tool = %call.name, id = %call.id, "Tool call");
        let result = registry.execute_call(call).await;
        conversation.push(ConversationMessage::tool_result(call.id.clone(), result));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::stream::{self, BoxStream};
    use serde_json::json;

    use super::*;
    use crate::chat::message::Role;
    use crate::chat::tools::ToolDefinition;
    use crate::Error;

    /// Plays back one scripted response per request and records what it was sent.
    struct ScriptedLlm {
        rounds: Mutex<Vec<Vec<LlmEvent>>>,
        seen: Mutex<Vec<Vec<ConversationMessage>>>,
        repeat_last: bool,
    }

    impl ScriptedLlm {
        fn new(rounds: Vec<Vec<LlmEvent>>) -> Self {
            Self {
                rounds: Mutex::new(rounds.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
                repeat_last: false,
            }
        }

        fn next_round(&self, messages: Vec<ConversationMessage>) -> Vec<LlmEvent> {
            self.seen.lock().unwrap().push(messages);
            let mut rounds = self.rounds.lock().unwrap();
            if self.repeat_last && rounds.len() == 1 {
                return rounds[0].clone();
            }
            rounds.pop().unwrap_or_default()
        }
    }

    impl LlmStream for ScriptedLlm {
        fn chat_completion(&self, messages: Vec<ConversationMessage>) -> BoxStream<'_, Result<String>> {
            let deltas = self
                .next_round(messages)
                .into_iter()
                .filter_map(|e| match e {
                    LlmEvent::Content(text) => Some(Ok(text)),
                    LlmEvent::ToolCalls(_) => None,
                })
                .collect::<Vec<_>>();
            stream::iter(deltas).boxed()
        }

        fn chat_completion_with_tools(
            &self,
            messages: Vec<ConversationMessage>,
            _tools: Vec<ToolDefinition>,
        ) -> BoxStream<'_, Result<LlmEvent>> {
            stream::iter(self.next_round(messages).into_iter().map(Ok)).boxed()
        }
    }

    fn call(id: &str, expression: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "calculate".to_string(),
            arguments: json!({ "expression": expression }),
        }
    }

    fn conversation(tools: bool) -> Conversation {
        let mut c = Conversation::new();
        c.add_delta("What is two plus two?", Role::User, None);
        if tools {
            c.enable_tools();
        }
        c
    }

    fn collect(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(delta) = rx.try_recv() {
            out.push(delta);
        }
        out
    }

    #[tokio::test]
    async fn plain_completion_streams_and_records() {
        let llm = ScriptedLlm::new(vec![vec![
            LlmEvent::Content("Four".into()),
            LlmEvent::Content(String::new()),
            LlmEvent::Content(".".into()),
        ]]);
        let mut c = conversation(false);
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = c
            .respond(&llm, &ToolRegistry::with_builtins(), ToolLoopConfig::default(), &tx)
            .await
            .unwrap();
        assert_eq!(outcome.rounds, 1);
        assert_eq!(collect(&mut rx), vec!["Four", "."]);
        assert_eq!(c.last_message(Role::Assistant), Some("Four."));
    }

    #[tokio::test]
    async fn tool_results_are_keyed_to_their_calls() {
        let llm = ScriptedLlm::new(vec![
            vec![
                LlmEvent::Content("Let me check.".into()),
                LlmEvent::ToolCalls(vec![call("a", "2+2"), call("", "3*3")]),
                LlmEvent::Content("never forwarded".into()),
            ],
            vec![LlmEvent::Content("It is 4.".into())],
        ]);
        let mut c = conversation(true);
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = c
            .respond(&llm, &ToolRegistry::with_builtins(), ToolLoopConfig::default(), &tx)
            .await
            .unwrap();

        assert_eq!(outcome, ToolLoopOutcome { rounds: 2, tool_calls: 2, capped: false, interrupted: false });
        assert_eq!(collect(&mut rx), vec!["Let me check.", "It is 4."]);

        let history = c.messages();
        let request = history.iter().find(|m| m.tool_calls.is_some()).unwrap();
        assert_eq!(request.role, Role::Assistant);
        assert_eq!(request.content, "");
        let ids: Vec<&str> = request.tool_calls.as_ref().unwrap().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "unknown"]);

        let results: Vec<&ConversationMessage> = history.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].tool_call_id.as_deref(), Some("a"));
        assert_eq!(results[0].content, "2+2 = 4");
        assert_eq!(results[1].tool_call_id.as_deref(), Some("unknown"));
        assert_eq!(results[1].content, "3*3 = 9");

        let second_request = &llm.seen.lock().unwrap()[1];
        assert!(second_request.iter().any(|m| m.tool_call_id.as_deref() == Some("a")));
        assert_eq!(c.last_message(Role::Assistant), Some("It is 4."));
    }

    #[tokio::test]
    async fn endless_tool_calls_stop_at_round_cap() {
        let mut llm = ScriptedLlm::new(vec![vec![LlmEvent::ToolCalls(vec![call("loop", "1+1")])]]);
        llm.repeat_last = true;
        let mut c = conversation(true);
        let (tx, _rx) = mpsc::channel(16);
        let outcome = c
            .respond(&llm, &ToolRegistry::with_builtins(), ToolLoopConfig { max_rounds: 3 }, &tx)
            .await
            .unwrap();

        assert!(outcome.capped);
        assert_eq!(outcome.rounds, 3);
        assert_eq!(outcome.tool_calls, 3);
        assert_eq!(llm.seen.lock().unwrap().len(), 3);

        let history = c.messages();
        for (i, message) in history.iter().enumerate().filter(|(_, m)| m.role == Role::Tool) {
            let request = &history[i - 1];
            let ids: Vec<&str> = request.tool_calls.as_ref().unwrap().iter().map(|c| c.id.as_str()).collect();
            assert!(ids.contains(&message.tool_call_id.as_deref().unwrap()));
        }
    }

    #[tokio::test]
    async fn unknown_tool_error_reaches_model() {
        let llm = ScriptedLlm::new(vec![
            vec![LlmEvent::ToolCalls(vec![ToolCall {
                id: "x".into(),
                name: "weather".into(),
                arguments: json!({}),
            }])],
            vec![LlmEvent::Content("Sorry.".into())],
        ]);
        let mut c = conversation(true);
        let (tx, _rx) = mpsc::channel(16);
        c.respond(&llm, &ToolRegistry::with_builtins(), ToolLoopConfig::default(), &tx)
            .await
            .unwrap();
        assert_eq!(c.last_message(Role::Tool), Some("Error: tool 'weather' not found"));
    }

    #[tokio::test]
    async fn dropped_listener_interrupts_turn() {
        let llm = ScriptedLlm::new(vec![vec![
            LlmEvent::Content("Once upon".into()),
            LlmEvent::Content("a time".into()),
        ]]);
        let mut c = conversation(false);
        c.add_delta("Once upon", Role::Assistant, None);
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let outcome = c
            .respond(&llm, &ToolRegistry::new(), ToolLoopConfig::default(), &tx)
            .await
            .unwrap();
        assert!(outcome.interrupted);
        assert_eq!(c.last_message(Role::Assistant), Some("Once upon—"));
    }

    #[tokio::test]
    async fn backend_errors_propagate() {
        struct Failing;
        impl LlmStream for Failing {
            fn chat_completion(&self, _: Vec<ConversationMessage>) -> BoxStream<'_, Result<String>> {
                stream::iter(vec![Err(Error::Llm("down".into()))]).boxed()
            }
            fn chat_completion_with_tools(
                &self,
                _: Vec<ConversationMessage>,
                _: Vec<ToolDefinition>,
            ) -> BoxStream<'_, Result<LlmEvent>> {
                stream::iter(vec![Err(Error::Llm("down".into()))]).boxed()
            }
        }
        let mut c = conversation(true);
        let (tx, _rx) = mpsc::channel(16);
        let err = c
            .respond(&Failing, &ToolRegistry::new(), ToolLoopConfig::default(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
    }
}
