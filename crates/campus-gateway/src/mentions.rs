//! @mention resolution against the members of a container.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use campus_types::UserId;
use campus_types::models::UserSummary;

/// `@"Full Name"`, or `@word` optionally followed by up to two more words
/// joined by a space or hyphen. The leading group keeps e-mail addresses out.
static MENTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^\w@])@(?:"([^"\n]{1,100})"|(\w+(?:[ \-]\w+){0,2}))"#).expect("Invalid mention regex")
});

/// One `@` token and the names it could stand for, longest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionToken {
    pub candidates: Vec<String>,
}

pub fn extract_tokens(content: &str) -> Vec<MentionToken> {
    MENTION_REGEX
        .captures_iter(content)
        .filter_map(|cap| {
            if let Some(quoted) = cap.get(1) {
                let name = quoted.as_str().trim();
                return (!name.is_empty()).then(|| MentionToken { candidates: vec![name.to_string()] });
            }
            cap.get(2).map(|m| MentionToken { candidates: prefixes(m.as_str()) })
        })
        .collect()
}

/// "bob the builder" -> ["bob the builder", "bob the", "bob"]
fn prefixes(text: &str) -> Vec<String> {
    let mut ends: Vec<usize> = text.match_indices([' ', '-']).map(|(i, _)| i).collect();
    ends.push(text.len());
    ends.iter().rev().map(|&end| text[..end].to_string()).collect()
}

/// Resolve mentions in `content` to member ids, in order of first mention.
///
/// Each candidate is matched case-insensitively as a substring of a member's
/// name or handle, longest candidate first. The first candidate with any
/// match decides: one match resolves, several are ambiguous unless exactly
/// one of them is an exact name or handle match. The author is never
/// returned.
pub fn resolve_mentions(content: &str, members: &[UserSummary], author: UserId) -> Vec<UserId> {
    let folded: Vec<(UserId, String, String)> = members
        .iter()
        .filter(|m| m.id != author)
        .map(|m| (m.id, m.name.to_lowercase(), m.handle.to_lowercase()))
        .collect();

    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    for token in extract_tokens(content) {
        if let Some(id) = resolve_token(&token, &folded) {
            if seen.insert(id) {
                resolved.push(id);
            }
        }
    }
    resolved
}

fn resolve_token(token: &MentionToken, members: &[(UserId, String, String)]) -> Option<UserId> {
    for candidate in &token.candidates {
        let needle = candidate.to_lowercase();
        let matches: Vec<&(UserId, String, String)> = members
            .iter()
            .filter(|(_, name, handle)| name.contains(&needle) || handle.contains(&needle))
            .collect();

        match matches.len() {
            0 => continue,
            1 => return Some(matches[0].0),
            _ => {
                let exact: Vec<UserId> = matches
                    .iter()
                    .filter(|(_, name, handle)| *name == needle || *handle == needle)
                    .map(|(id, _, _)| *id)
                    .collect();
                return (exact.len() == 1).then(|| exact[0]);
            }
        }
    }
    None
}
