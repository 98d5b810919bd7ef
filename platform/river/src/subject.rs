//! Subject and subscription-pattern rules
//!
//! Subjects are `.`-separated tokens. Patterns may use NATS-style wildcards:
//! - `*` matches exactly one token
//! - `>` matches one or more tokens and must be the last token

const SINGLE_WILDCARD: &str = "*";
const TAIL_WILDCARD: &str = ">";

fn check_token(token: &str) -> Result<(), String> {
    if token.is_empty() {
        return Err("empty token".to_string());
    }
    if let Some(c) = token
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '*' | '>'))
    {
        return Err(format!("illegal character {c:?} in token '{token}'"));
    }
    Ok(())
}

/// Validate a concrete subject (no wildcards)
pub fn validate_subject(subject: &str) -> Result<(), String> {
    if subject.is_empty() {
        return Err("subject cannot be empty".to_string());
    }
    for token in subject.split('.') {
        check_token(token).map_err(|e| format!("invalid subject '{subject}': {e}"))?;
    }
    Ok(())
}

/// Validate a subscription pattern
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("pattern cannot be empty".to_string());
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        match *token {
            SINGLE_WILDCARD => {}
            TAIL_WILDCARD if i == last => {}
            TAIL_WILDCARD => {
                return Err(format!(
                    "invalid pattern '{pattern}': '>' must be the last token"
                ))
            }
            _ => check_token(token).map_err(|e| format!("invalid pattern '{pattern}': {e}"))?,
        }
    }
    Ok(())
}

/// Check if a subject matches a subscription pattern
///
/// # Examples
/// - `crm.events.>` matches `crm.events.contact.created`
/// - `crm.*.created` matches `crm.contact.created`
/// - `crm.events.*` does NOT match `crm.events.contact.created` (too many tokens)
pub fn matches_pattern(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    let mut s_idx = 0;
    let mut p_idx = 0;

    while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
        let pattern_token = pattern_tokens[p_idx];

        if pattern_token == TAIL_WILDCARD {
            return true;
        } else if pattern_token == SINGLE_WILDCARD || subject_tokens[s_idx] == pattern_token {
            s_idx += 1;
            p_idx += 1;
        } else {
            return false;
        }
    }

    s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
}

/// Check whether two patterns can match at least one common subject
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let a_tokens: Vec<&str> = a.split('.').collect();
    let b_tokens: Vec<&str> = b.split('.').collect();

    let mut i = 0;
    while i < a_tokens.len() && i < b_tokens.len() {
        let (x, y) = (a_tokens[i], b_tokens[i]);
        if x == TAIL_WILDCARD || y == TAIL_WILDCARD {
            return true;
        }
        if x != SINGLE_WILDCARD && y != SINGLE_WILDCARD && x != y {
            return false;
        }
        i += 1;
    }

    a_tokens.len() == b_tokens.len()
}
