//! Extracts the quality score and critique text from a reviewer reply.

use regex::Regex;
use std::sync::OnceLock;

/// A parsed reviewer reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    /// Clamped to `[0, 1]`; 0 when no score could be found.
    pub score: f64,
    /// Reviewer feedback handed to the next round.
    pub critique: String,
    /// Whether a score was actually found.
    pub parsed: bool,
}

fn score_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:quality\s+)?score\W*[:=]?\s*(\d+(?:\.\d+)?)\s*(%|/\s*100|/\s*10)?")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

fn critique_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)critique\W*[:=]\s*(.*)")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

/// Parses replies shaped like
///
/// ```text
/// SCORE: 0.85
/// CRITIQUE: The arithmetic is right but the explanation is thin.
/// ```
///
/// Also understands `8/10`, `85%` and a JSON object with `score` and
/// `critique` fields. A bare number above 1 is read on a ten-point scale
/// up to 10 and as a percentage beyond that.
pub fn parse_assessment(reply: &str) -> Assessment {
    if let Some(assessment) = parse_json(reply) {
        return assessment;
    }

    let score = score_re().captures(reply).and_then(|caps| {
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let scaled = match caps.get(2).map(|m| m.as_str().replace(' ', "")) {
            Some(ref unit) if unit == "%" || unit == "/100" => value / 100.0,
            Some(ref unit) if unit == "/10" => value / 10.0,
            _ => rescale(value),
        };
        Some(scaled)
    });

    let critique = critique_re()
        .captures(reply)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| {
            reply
                .lines()
                .filter(|line| !score_re().is_match(line))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        });

    Assessment {
        score: score.map(clamp).unwrap_or(0.0),
        critique,
        parsed: score.is_some(),
    }
}

fn parse_json(reply: &str) -> Option<Assessment> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    let value: serde_json::Value = serde_json::from_str(reply.get(start..=end)?).ok()?;
    let score = value.get("score")?.as_f64()?;
    Some(Assessment {
        score: clamp(rescale(score)),
        critique: value
            .get("critique")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string(),
        parsed: true,
    })
}

/// Bare numbers: up to 1 as-is, up to 10 as tenths, above that percent.
fn rescale(value: f64) -> f64 {
    if value <= 1.0 {
        value
    } else if value <= 10.0 {
        value / 10.0
    } else {
        value / 100.0
    }
}

fn clamp(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_format() {
        let a = parse_assessment("SCORE: 0.85\nCRITIQUE: Correct, but terse.");
        assert_eq!(a.score, 0.85);
        assert_eq!(a.critique, "Correct, but terse.");
        assert!(a.parsed);
    }

    #[test]
    fn alternative_scales() {
        assert_eq!(parse_assessment("Score: 8/10").score, 0.8);
        assert_eq!(parse_assessment("score = 85%").score, 0.85);
        assert_eq!(parse_assessment("**Quality score:** 70").score, 0.7);
        assert_eq!(parse_assessment("SCORE: 1").score, 1.0);
        assert_eq!(parse_assessment("Score: 7").score, 0.7);
        assert_eq!(parse_assessment("SCORE: 10").score, 1.0);
        assert_eq!(parse_assessment("SCORE: 8.5").score, 0.85);
        assert_eq!(parse_assessment("Solid answer. Score: 0.9").score, 0.9);
    }

    #[test]
    fn json_reply() {
        let a = parse_assessment(r#"Here you go: {"score": 0.4, "critique": "missing units"}"#);
        assert_eq!(a.score, 0.4);
        assert_eq!(a.critique, "missing units");
        assert_eq!(parse_assessment(r#"{"score": 6}"#).score, 0.6);
        assert_eq!(parse_assessment(r#"{"score": 72}"#).score, 0.72);
    }

    #[test]
    fn missing_score_is_zero_and_keeps_text() {
        let a = parse_assessment("This answer looks fine to me.");
        assert_eq!(a.score, 0.0);
        assert!(!a.parsed);
        assert_eq!(a.critique, "This answer looks fine to me.");
    }

    #[test]
    fn out_of_range_is_clamped() {
        assert_eq!(parse_assessment("SCORE: 250%").score, 1.0);
    }
}
