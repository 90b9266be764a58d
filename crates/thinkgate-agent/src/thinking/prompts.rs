use super::types::{ThinkingRequest, ThinkingRound};
use crate::backends::{CompletionRequest, RequestPurpose};
use crate::config::ThinkingConfig;
use regex::Regex;
use std::sync::OnceLock;
use thinkgate_core::Message;

const GENERATE_SYSTEM: &str = "You are a careful assistant. Think the problem through and \
give a complete, correct answer. When you are shown a critique of an earlier answer, \
address every point it raises.";

const CRITIQUE_SYSTEM: &str = "You are a strict reviewer. Judge how well the answer \
addresses the question: correctness first, then completeness and clarity. \
Reply in exactly this format:\nSCORE: <number between 0 and 1>\nCRITIQUE: <what to fix>";

/// Builds the generation call for one round.
///
/// Later rounds carry the previous answer and its critique so the model can
/// revise rather than start over.
pub fn generation_request(
    request: &ThinkingRequest,
    previous: Option<&ThinkingRound>,
    config: &ThinkingConfig,
    compress: bool,
    temperature: f32,
) -> CompletionRequest {
    let mut messages: Vec<Message> = if compress {
        let skip = request.context.len().saturating_sub(config.max_context_messages);
        request.context[skip..]
            .iter()
            .map(|m| Message::new(m.role, collapse_whitespace(&m.content)))
            .collect()
    } else {
        request.context.clone()
    };

    let prompt = if compress {
        collapse_whitespace(&request.prompt)
    } else {
        request.prompt.clone()
    };
    messages.push(Message::user(prompt));

    if let Some(prev) = previous {
        let (answer, critique) = if compress {
            (
                truncate_chars(&collapse_whitespace(&prev.response), config.max_carry_chars),
                truncate_chars(&collapse_whitespace(&prev.critique), config.max_carry_chars),
            )
        } else {
            (prev.response.clone(), prev.critique.clone())
        };
        messages.push(Message::assistant(answer));
        messages.push(Message::user(format!(
            "A reviewer scored that answer {:.2} out of 1 and wrote:\n{critique}\n\n\
             Write an improved answer to the original question. Reply with the answer only.",
            prev.quality
        )));
    }

    CompletionRequest::new(messages)
        .with_system(GENERATE_SYSTEM)
        .with_temperature(temperature)
        .with_purpose(RequestPurpose::Generate)
}

/// Builds the critique call for a candidate answer. Critiques run cold and
/// short.
pub fn critique_request(prompt: &str, answer: &str, config: &ThinkingConfig) -> CompletionRequest {
    CompletionRequest::new(vec![Message::user(format!(
        "Question:\n{prompt}\n\nAnswer:\n{answer}"
    ))])
    .with_system(CRITIQUE_SYSTEM)
    .with_temperature(0.0)
    .with_max_tokens(config.critique_max_tokens)
    .with_purpose(RequestPurpose::Critique)
}

fn spaces_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[ \t\r\f\v]+").unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

fn blank_lines_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\n[ \t]*(\n[ \t]*)+").unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

/// Collapses runs of horizontal whitespace to one space and runs of blank
/// lines to a single blank line. Line structure is kept.
pub fn collapse_whitespace(text: &str) -> String {
    let text = spaces_re().replace_all(text.trim(), " ");
    blank_lines_re().replace_all(&text, "\n\n").into_owned()
}

/// Keeps at most `max` characters, on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thinkgate_core::Role;

    fn previous() -> ThinkingRound {
        ThinkingRound {
            index: 1,
            branch: 0,
            response: "It is   five.".into(),
            critique: "Wrong   arithmetic.".into(),
            quality: 0.2,
            provider: "mock".into(),
            elapsed_ms: 3,
        }
    }

    #[test]
    fn first_round_is_context_plus_prompt() {
        let req = ThinkingRequest::new("What is 2+2?")
            .with_context(vec![Message::system("be exact"), Message::user("hello")]);
        let out = generation_request(&req, None, &ThinkingConfig::default(), false, 0.7);
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[2].content, "What is 2+2?");
        assert_eq!(out.purpose, RequestPurpose::Generate);
        assert_eq!(out.temperature, Some(0.7));
    }

    #[test]
    fn later_rounds_carry_answer_and_critique() {
        let req = ThinkingRequest::new("What is 2+2?");
        let out = generation_request(&req, Some(&previous()), &ThinkingConfig::default(), false, 0.7);
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[1].role, Role::Assistant);
        assert_eq!(out.messages[1].content, "It is   five.");
        assert!(out.messages[2].content.contains("Wrong   arithmetic."));
        assert!(out.messages[2].content.contains("0.20"));
    }

    #[test]
    fn compression_trims_context_and_carry() {
        let config = ThinkingConfig {
            max_context_messages: 2,
            max_carry_chars: 5,
            ..ThinkingConfig::default()
        };
        let context = (0..5).map(|i| Message::user(format!("msg   {i}"))).collect();
        let req = ThinkingRequest::new("What   is\t2+2?").with_context(context);
        let out = generation_request(&req, Some(&previous()), &config, true, 0.7);

        let contents: Vec<&str> = out.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents[0], "msg 3");
        assert_eq!(contents[1], "msg 4");
        assert_eq!(contents[2], "What is 2+2?");
        assert_eq!(contents[3], "It is…");
        assert!(contents[4].contains("Wrong…"));
    }

    #[test]
    fn critique_is_the_cheap_path() {
        let out = critique_request("q", "a", &ThinkingConfig::default());
        assert_eq!(out.purpose, RequestPurpose::Critique);
        assert_eq!(out.temperature, Some(0.0));
        assert_eq!(out.max_tokens, Some(512));
    }

    #[test]
    fn whitespace_helpers() {
        assert_eq!(collapse_whitespace("  a  b\n\n\n\nc  "), "a b\n\nc");
        assert_eq!(collapse_whitespace("line one\nline two"), "line one\nline two");
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo…");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
