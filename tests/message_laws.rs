//! Property tests for tagging, name normalization and tool-call rewriting.

use std::borrow::Cow;

use proptest::prelude::*;
use serde_json::json;
use tower_supervisor::tagging::{decode, encode};
use tower_supervisor::{handoff_tool_name, normalize_agent_name, normalize_tool_calls, Message, ToolCall};

proptest! {
    #[test]
    fn decode_inverts_encode(name in "[a-z][a-z0-9_]{0,15}", content in "[^<>]{0,64}") {
        let message = Message::ai(content).with_name(name).with_id("m1");
        let encoded = encode(&message);
        prop_assert!(matches!(encoded, Cow::Owned(_)));
        let decoded = decode(&encoded).into_owned();
        prop_assert_eq!(decoded, message);
    }

    #[test]
    fn non_ai_messages_are_untouched(content in "[^<>]{0,64}", name in "[a-z]{1,8}") {
        let human = Message::human(content.clone()).with_name(name);
        prop_assert!(matches!(encode(&human), Cow::Borrowed(m) if std::ptr::eq(m, &human)));
        prop_assert!(matches!(decode(&human), Cow::Borrowed(m) if std::ptr::eq(m, &human)));

        let anonymous = Message::ai(content);
        prop_assert!(matches!(encode(&anonymous), Cow::Borrowed(m) if std::ptr::eq(m, &anonymous)));
        prop_assert!(matches!(decode(&anonymous), Cow::Borrowed(m) if std::ptr::eq(m, &anonymous)));
    }

    #[test]
    fn normalization_is_idempotent(name in "[a-zA-Z0-9 \t&_àáâäèéêëìíîïòóôöùúûüçñÀÉÈÜÖÇČŠŽ-]{0,24}") {
        let once = normalize_agent_name(&name);
        prop_assert_eq!(normalize_agent_name(&once), once.clone());
        prop_assert!(!once.chars().any(char::is_whitespace));
    }

    #[test]
    fn rewritten_calls_match_registered_tools(name in "[a-zA-Zàéèüöç ]{1,20}") {
        prop_assume!(!normalize_agent_name(&name).is_empty());
        let echoed = Message::ai_with_tool_calls(
            "",
            vec![ToolCall::new(format!("transfer_to_{name}"), json!({})).with_id("c1")],
        );
        let fixed = normalize_tool_calls(&echoed);
        prop_assert_eq!(&fixed.tool_calls[0].name, &handoff_tool_name(&name));
        prop_assert_eq!(fixed.id.as_ref(), echoed.id.as_ref());
    }
}

#[test]
fn normalizer_examples() {
    assert_eq!(normalize_agent_name("café"), "cafe");
    assert_eq!(normalize_agent_name("crème brûlée"), "creme_brulee");
    assert_eq!(normalize_agent_name("Čeština"), "cestina");
    assert_eq!(normalize_agent_name(" multiple   spaces "), "multiple_spaces");
    assert_eq!(normalize_agent_name("münich-guide"), "munich-guide");
    assert_eq!(normalize_agent_name("test&fun"), "test&fun");
}
