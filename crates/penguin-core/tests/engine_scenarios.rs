// End-to-end engine scenarios driven through the replay provider

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use penguin_core::{
    CompletionReason, ContextWindowConfig, CoreConfig, Message, MessageCategory, MessageContent,
    MessageRole, ModelBinding, PenguinCore, ProviderChunk, ProviderError, ReplayAdapter,
    ReplayScript, StreamEvent, TaskState, Tool, ToolContext, ToolOutcome, ToolSpec,
};

/// Fixed-output stand-in for the external code execution tool
struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    async fn invoke(&self, _payload: &str, _ctx: &ToolContext) -> ToolOutcome {
        ToolOutcome::text("['a.txt', 'b.txt']")
    }
}

fn replay_binding(provider: &str) -> ModelBinding {
    let mut binding = ModelBinding::replay();
    binding.provider = provider.to_string();
    binding
}

async fn build_core(scripts: Vec<ReplayScript>) -> Arc<PenguinCore> {
    PenguinCore::builder(ModelBinding::replay())
        .provider("replay", Arc::new(ReplayAdapter::new(scripts)))
        .tool(
            ToolSpec::new("code_execution", "run code"),
            Arc::new(ListDirTool),
        )
        .build()
        .unwrap()
}

// S1: one user input, one assistant response, no tools
#[tokio::test]
async fn simple_qa_single_iteration() {
    let core = build_core(vec![ReplayScript::text("The answer is 4.")]).await;

    let result = core.process("default", "What is 2+2?").await.unwrap();

    assert_eq!(result.text, "The answer is 4.");
    assert_eq!(result.iterations, 1);
    assert_eq!(result.completion_reason, CompletionReason::Normal);
    assert!(result.tool_results.is_empty());

    let record = core.registry().get("default").unwrap();
    let conversation = record.conversation.read().await;
    let messages = &conversation.session().messages;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);
}

// S2: a tool call in iteration one, finish_response in iteration two
#[tokio::test]
async fn tool_call_then_finish_response() {
    let core = build_core(vec![
        ReplayScript::text("<execute>\nimport os\nprint(os.listdir('/tmp'))\n</execute>"),
        ReplayScript::text("The files are a.txt and b.txt.\n<finish_response></finish_response>"),
    ])
    .await;

    let result = core.process("default", "List files in /tmp").await.unwrap();

    assert_eq!(result.iterations, 2);
    assert_eq!(result.completion_reason, CompletionReason::Normal);
    assert_eq!(result.tool_results.len(), 1);
    assert!(result.tool_results[0].ok);
    assert_eq!(result.tool_results[0].output, "['a.txt', 'b.txt']");
    assert!(result.text.contains("a.txt and b.txt"));

    // The tool result landed in tool memory
    let record = core.registry().get("default").unwrap();
    let conversation = record.conversation.read().await;
    assert!(conversation
        .session()
        .messages
        .iter()
        .any(|m| m.category == MessageCategory::ToolMemory));
}

// S3: three consecutive trivial responses end a task implicitly
#[tokio::test]
async fn trivial_response_loop_terminates() {
    let core = build_core(vec![
        ReplayScript::text("OK"),
        ReplayScript::text("I"),
        ReplayScript::text("Hmm"),
        // Never reached
        ReplayScript::text("this would be iteration four"),
    ])
    .await;

    core.run_task("default", "do something", None).await.unwrap();
    let task = core
        .executor()
        .wait_for("default", Some(Duration::from_secs(10)))
        .await
        .unwrap();

    assert_eq!(task.state, TaskState::Completed);

    // Exactly three provider calls were consumed
    let record = core.registry().get("default").unwrap();
    let conversation = record.conversation.read().await;
    let assistant_turns = conversation
        .session()
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .count();
    assert_eq!(assistant_turns, 3);
}

// S3 complement: a substantive response resets the trivial counter
#[tokio::test]
async fn substantive_response_resets_trivial_count() {
    let core = build_core(vec![
        ReplayScript::text("OK"),
        ReplayScript::text("Here is a longer, substantive update on the work."),
        ReplayScript::text("OK"),
        ReplayScript::text("I"),
        ReplayScript::text("Hmm"),
    ])
    .await;

    core.run_task("default", "work", None).await.unwrap();
    core.executor()
        .wait_for("default", Some(Duration::from_secs(10)))
        .await
        .unwrap();

    let record = core.registry().get("default").unwrap();
    let conversation = record.conversation.read().await;
    let assistant_turns = conversation
        .session()
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .count();
    // 1 trivial + 1 substantive (reset) + 3 trivial = 5 provider turns
    assert_eq!(assistant_turns, 5);
}

// S4: a flood of conversation messages is trimmed, system prompt kept
#[tokio::test]
async fn context_trim_preserves_system_prompt() {
    let core = build_core(vec![ReplayScript::text("Acknowledged, context intact.")]).await;

    let record = core.registry().get("default").unwrap();
    {
        let mut conversation = record.conversation.write().await;
        // Shrink the window: 1000 total, 100 reserved
        *conversation = penguin_core::Conversation::new(
            "default",
            ContextWindowConfig {
                max_tokens: 1000,
                reserved_tokens: Some(100),
                fractions: Default::default(),
            },
        );
        conversation.set_system_prompt("p".repeat(400)); // 100 tokens
        for i in 0..50 {
            conversation.add(
                MessageRole::User,
                MessageContent::Text(format!("{:0>160}", i)), // 40 tokens
                MessageCategory::Conversation,
                None,
            );
        }
    }

    let result = core.process("default", "still there?").await.unwrap();
    assert_eq!(result.completion_reason, CompletionReason::Normal);

    let conversation = record.conversation.read().await;
    assert!(conversation.token_total() <= 900);
    assert!(conversation
        .session()
        .messages
        .iter()
        .any(|m| m.category == MessageCategory::SystemPrompt));
    // Ordering within the remaining log is intact
    let seqs: Vec<u64> = conversation
        .session()
        .messages
        .iter()
        .map(|m| m.seq)
        .collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
}

// S5: snapshot, mutate, branch, and verify the original is untouched
#[tokio::test]
async fn snapshot_branch_divergence() {
    let core = build_core(vec![
        ReplayScript::text("first response"),
        ReplayScript::text("second response"),
    ])
    .await;

    core.process("default", "first input").await.unwrap();
    let s1 = core.save_checkpoint("default", Some("after-first")).await.unwrap();
    let s1_payload = core.snapshots().restore(&s1).unwrap().unwrap();

    // Mutate the original conversation
    core.process("default", "second input").await.unwrap();

    // Branch from s1 and diverge
    let s2 = core.branch_from("default", &s1).await.unwrap();
    let record = core.registry().get("default").unwrap();
    record
        .conversation
        .write()
        .await
        .add_message(Message::user("divergent message"));

    assert_ne!(s1, s2);
    // restore(s1) is byte-identical to what was stored
    assert_eq!(core.snapshots().restore(&s1).unwrap().unwrap(), s1_payload);

    // The branched conversation picked up s1's two messages plus the
    // divergent one
    let conversation = record.conversation.read().await;
    assert_eq!(conversation.session().messages.len(), 3);
    assert_eq!(
        conversation.session().messages.last().unwrap().text(),
        Some("divergent message")
    );
}

// S6: three tasks under a cap of two; a failure does not sink the rest
#[tokio::test]
async fn concurrent_tasks_capped_with_failure() {
    let finish = "Done. [FINISH_STATUS:done]\n<finish_task>[FINISH_STATUS:done]</finish_task>";
    let mut config = CoreConfig::default();
    config.max_concurrent_tasks = 2;

    let core = PenguinCore::builder(replay_binding("replay-a"))
        .config(config)
        .provider("replay-a", Arc::new(ReplayAdapter::new(vec![
            ReplayScript::text(finish),
        ])))
        .provider("replay-b", Arc::new(ReplayAdapter::new(vec![
            ReplayScript::ConnectError(ProviderError::auth("key rejected")),
        ])))
        .provider("replay-c", Arc::new(ReplayAdapter::new(vec![
            ReplayScript::text(finish),
        ])))
        .build()
        .unwrap();

    core.create_agent("b", Some(replay_binding("replay-b")), None, None)
        .await
        .unwrap();
    core.create_agent("c", Some(replay_binding("replay-c")), None, None)
        .await
        .unwrap();

    core.run_task("default", "task a", None).await.unwrap();
    core.run_task("b", "task b", None).await.unwrap();
    core.run_task("c", "task c", None).await.unwrap();

    // Sample the cap while tasks drain
    for _ in 0..50 {
        assert!(core.executor().running_count().await <= 2);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let results = core
        .executor()
        .wait_for_all(None, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results["default"].state, TaskState::Completed);
    assert_eq!(results["b"].state, TaskState::Failed);
    assert!(results["b"].error.as_deref().unwrap().contains("key rejected"));
    assert_eq!(results["c"].state, TaskState::Completed);
}

// Streaming surface: events arrive in order with a single finalize
#[tokio::test]
async fn stream_chat_event_ordering() {
    let core = build_core(vec![ReplayScript::Chunks(vec![
        ProviderChunk::TextDelta("Hello ".into()),
        ProviderChunk::TextDelta("world.".into()),
        ProviderChunk::End,
    ])])
    .await;

    let mut rx = core.stream_chat("default", "hi").unwrap();
    let mut names = Vec::new();
    let mut text = String::new();
    while let Some(event) = rx.recv().await {
        names.push(event.name());
        if let StreamEvent::TextDelta { delta, .. } = &event {
            text.push_str(delta);
        }
        if let StreamEvent::Finalized {
            text: full,
            completion_reason,
            ..
        } = &event
        {
            assert_eq!(full, "Hello world.");
            assert_eq!(*completion_reason, CompletionReason::Normal);
        }
    }

    assert_eq!(names.first().copied(), Some("stream.started"));
    assert_eq!(names.last().copied(), Some("stream.finalized"));
    assert_eq!(
        names.iter().filter(|n| **n == "stream.finalized").count(),
        1
    );
    assert_eq!(text, "Hello world.");
}

// finish_task narration without the tag does not end the task
#[tokio::test]
async fn finish_keywords_in_narration_do_not_terminate() {
    let core = build_core(vec![
        ReplayScript::text("The task is done and complete, moving on to verify everything."),
        ReplayScript::text("Verified. <finish_task>[FINISH_STATUS:done]</finish_task>"),
    ])
    .await;

    core.run_task("default", "verify work", None).await.unwrap();
    let task = core
        .executor()
        .wait_for("default", Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(task.state, TaskState::Completed);

    let record = core.registry().get("default").unwrap();
    let conversation = record.conversation.read().await;
    let assistant_turns = conversation
        .session()
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .count();
    // Two provider turns: narration alone did not stop the loop
    assert_eq!(assistant_turns, 2);
}

// Cancellation is honored between iterations
#[tokio::test]
async fn cancellation_preserves_partial_state() {
    let core = build_core(vec![ReplayScript::text("working...")]).await;

    core.run_task("default", "long job", None).await.unwrap();
    // Let it start, then cancel
    tokio::time::sleep(Duration::from_millis(20)).await;
    core.executor().cancel("default").await.unwrap();

    let task = core
        .executor()
        .wait_for("default", Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(matches!(
        task.state,
        TaskState::Cancelled | TaskState::Completed
    ));

    // Whatever ran before the cancel is still in the conversation
    let record = core.registry().get("default").unwrap();
    let conversation = record.conversation.read().await;
    assert!(!conversation.session().messages.is_empty());
}
