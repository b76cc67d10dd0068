//! Agent-name normalization
//!
//! Agent display names are arbitrary Unicode. Handoff tools embed a
//! canonical ASCII-leaning token of that name, `transfer_to_<token>`, and
//! the same function is used when a model echoes a tool name back, so the
//! two sides always agree.

use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Canonicalize an agent name into a tool-identifier token.
///
/// Accents are stripped via canonical decomposition, the result is
/// lowercased, surrounding whitespace is trimmed and every internal run of
/// whitespace becomes a single `_`. Everything else (hyphens, ampersands,
/// digits, underscores) is kept as is.
///
/// ```
/// use tower_supervisor::normalize_agent_name;
///
/// assert_eq!(normalize_agent_name("crème brûlée"), "creme_brulee");
/// assert_eq!(normalize_agent_name("münich-guide"), "munich-guide");
/// ```
pub fn normalize_agent_name(name: &str) -> String {
    let stripped: String = name.nfd().filter(|c| !is_combining_mark(*c)).collect();
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}
