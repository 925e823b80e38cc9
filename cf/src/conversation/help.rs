//! Built-in help topics for HELP and HELP-INLINE

/// `(topic, text)` pairs, looked up case-insensitively
const TOPICS: &[(&str, &str)] = &[
    (
        "directives",
        "ConversationFile directives are upper-case keywords at the start of a line. \
PROMPT sends text to the agent, RUN executes a command, CHECKPOINT saves progress, \
COMPACT asks the agent to summarise its context, and ELIDE merges the steps on either \
side of it into a single turn.",
    ),
    (
        "workflow",
        "This conversation runs as a workflow of ordered steps. Each cycle is one pass over \
all steps. Work incrementally, keep changes small, and report what you changed at the \
end of each turn.",
    ),
    (
        "elide",
        "Several steps were merged into this single message. Sections marked with command \
output show what ran just before this message was sent; respond to the whole message at once.",
    ),
    (
        "stop-file",
        "If you determine that the automation should stop (for example because the work is \
done or a human must review something), create the stop file described in the instructions \
with a JSON body containing a \"reason\" field.",
    ),
    (
        "verify",
        "VERIFY steps check references, links and traceability. When a verification fails \
its report is included in the conversation; fix the reported problems before moving on.",
    ),
    (
        "context",
        "Files listed as context are included at the start of the conversation. Paths are \
shown before each file. Treat them as the current state of the repository.",
    ),
];

/// Look up a help topic
pub fn topic(name: &str) -> Option<&'static str> {
    let wanted = name.trim().to_lowercase();
    TOPICS.iter().find(|(t, _)| *t == wanted).map(|(_, text)| *text)
}

/// All topic names
pub fn topics() -> impl Iterator<Item = &'static str> {
    TOPICS.iter().map(|(t, _)| *t)
}

/// Render several topics as one block, skipping unknown names
pub fn render(names: &[String]) -> String {
    names
        .iter()
        .filter_map(|n| topic(n).map(|text| format!("## Help: {}\n\n{}", n.to_lowercase(), text)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_lookup_case_insensitive() {
        assert!(topic("ELIDE").is_some());
        assert!(topic("workflow").is_some());
        assert!(topic("nope").is_none());
    }

    #[test]
    fn test_render_skips_unknown() {
        let out = render(&["elide".to_string(), "nope".to_string()]);
        assert!(out.contains("## Help: elide"));
        assert!(!out.contains("nope"));
    }

    #[test]
    fn test_topics_listed() {
        assert!(topics().any(|t| t == "directives"));
    }
}
