//! Token-budget properties of message assembly.

use beadwork::conversation::{
    assemble_task_messages, enforce_token_budget, estimate_tokens, token_budget,
    ConversationContext,
};
use beadwork::provider::{ChatMessage, Role};
use beadwork::state::Persona;
use chrono::Duration;

#[test]
fn long_history_truncates_from_the_front_keeping_system() {
    // A long back-and-forth that overflows the 80% budget of a
    // 100k-limit model: the head survives, a notice takes index 1, and
    // the tail is the most recent run of messages.
    let mut messages = vec![ChatMessage::system("persona head")];
    for i in 0..60 {
        let body = format!("{i:04}{}", "m".repeat(7_996)); // ~2,000 tokens each
        if i % 2 == 0 {
            messages.push(ChatMessage::user(body));
        } else {
            messages.push(ChatMessage::assistant(body));
        }
    }
    let budget = token_budget("unknown-model");
    assert_eq!(budget, 80_000);
    let total: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
    assert!(total > budget);

    let result = enforce_token_budget(messages, budget);

    assert_eq!(result[0].role, Role::System);
    assert_eq!(result[0].content, "persona head");
    assert_eq!(result[1].role, Role::System);
    assert!(result[1].content.starts_with("[Note: "));
    assert!(result[1].content.ends_with("truncated to stay within token limit]"));

    // Dropped range starts at index 1: the first surviving body message is
    // not message 0000.
    assert_ne!(&result[2].content[..4], "0000");
    // The newest message always survives.
    assert_eq!(&result.last().unwrap().content[..4], "0059");

    // Budget property over the retained originals.
    let retained: usize = result
        .iter()
        .skip(2)
        .map(|m| estimate_tokens(&m.content))
        .sum::<usize>()
        + estimate_tokens(&result[0].content);
    assert!(retained <= budget);
}

#[test]
fn assembly_is_append_only_and_system_headed() {
    let mut ctx = ConversationContext::new("bd-1", "proj-1", Duration::hours(24));
    let persona = Persona {
        name: "ada".into(),
        mission: "triage".into(),
        ..Persona::default()
    };

    let first = assemble_task_messages(&mut ctx, "ada", &persona, "gpt-4-turbo", "round one", None);
    assert_eq!(first[0].role, Role::System);

    let snapshot: Vec<String> = ctx.messages.iter().map(|m| m.content.clone()).collect();

    assemble_task_messages(&mut ctx, "ada", &persona, "gpt-4-turbo", "round two", None);

    // Earlier messages are a strict prefix of the later state.
    assert!(ctx.messages.len() > snapshot.len());
    for (old, new) in snapshot.iter().zip(ctx.messages.iter()) {
        assert_eq!(old, &new.content);
    }
    assert_eq!(ctx.messages[0].role, Role::System);
}
