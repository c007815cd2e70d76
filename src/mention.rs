//! Mention detection and stripping
//!
//! Decides whether a message is directed at the assistant and removes the
//! assistant's own mention forms before the text is used as model input.
//!
//! A token mentions the assistant when, lower-cased and with surrounding
//! punctuation trimmed, it equals the local name or starts with the local
//! name immediately followed by sentence punctuation (`henry,hi`).

use crate::event::RoomType;
use crate::identity::Identity;

/// Characters trimmed from both ends of a token before comparison
const TRIM_CHARS: &[char] = &[
    ',', '.', '!', '?', ':', ';', '"', '\'', '(', ')', '[', ']', '{', '}',
];

/// Characters that may directly follow the local name inside a token
const BOUNDARY_CHARS: &[char] = &[',', '.', '!', '?', ':', ';'];

/// Whether `content` addresses the assistant
///
/// Every message in a direct room is addressed. In a group room the message
/// must contain the qualified identity (case-sensitive), the local name as a
/// whole word (case-insensitive), or the `name:` addressing idiom.
#[must_use]
pub fn is_addressed(content: &str, room_type: RoomType, identity: &Identity) -> bool {
    if room_type == RoomType::Direct {
        return true;
    }

    if content.contains(identity.as_str()) {
        return true;
    }

    let local = identity.local_name().to_lowercase();
    if local.is_empty() {
        return false;
    }

    let lower = content.to_lowercase();
    if !lower.contains(&local) {
        return false;
    }

    if lower.split_whitespace().any(|word| is_name_token(word, &local)) {
        return true;
    }

    lower.contains(&format!("{local}:"))
}

/// Remove the assistant's mention forms from `content`
///
/// The qualified identity is removed first, then every whitespace-separated
/// token naming the assistant is dropped together with the whitespace before
/// it. The result is trimmed; it may be empty.
#[must_use]
pub fn strip_mentions(content: &str, identity: &Identity) -> String {
    let without_full = if identity.as_str().is_empty() {
        content.to_string()
    } else {
        content.replace(identity.as_str(), "")
    };

    let local = identity.local_name().to_lowercase();
    if local.is_empty() {
        return without_full.trim().to_string();
    }

    let mut out = String::with_capacity(without_full.len());
    let mut pending_space = "";

    for (is_space, run) in runs(&without_full) {
        if is_space {
            pending_space = run;
        } else if is_name_token(&run.to_lowercase(), &local) {
            pending_space = "";
        } else {
            out.push_str(pending_space);
            out.push_str(run);
            pending_space = "";
        }
    }

    out.trim().to_string()
}

/// Whether a lower-cased token names `local`
fn is_name_token(token: &str, local: &str) -> bool {
    let cleaned = token.trim_matches(TRIM_CHARS);
    if cleaned == local {
        return true;
    }

    cleaned
        .strip_prefix(local)
        .and_then(|rest| rest.chars().next())
        .is_some_and(|next| BOUNDARY_CHARS.contains(&next))
}

/// Split text into alternating runs of whitespace and non-whitespace
fn runs(text: &str) -> Vec<(bool, &str)> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut current: Option<bool> = None;

    for (i, c) in text.char_indices() {
        let is_space = c.is_whitespace();
        match current {
            Some(prev) if prev == is_space => {}
            Some(prev) => {
                out.push((prev, &text[start..i]));
                start = i;
                current = Some(is_space);
            }
            None => current = Some(is_space),
        }
    }

    if let Some(prev) = current {
        out.push((prev, &text[start..]));
    }

    out
}
