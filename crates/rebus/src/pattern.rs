//! Pattern registration and resource ID routing.
//!
//! Patterns are dot-separated token sequences with three wildcard forms:
//! `*` matches exactly one token, `$name` matches exactly one token and
//! captures it as a path parameter, and a trailing `>` matches one or more
//! tokens. When several patterns match the same resource ID, the one with the
//! most literal tokens wins; among equal literal counts a single-token
//! wildcard beats `>`, and remaining ties fall to the pattern whose literal
//! tokens come earliest.

use crate::error::RegistrationError;
use crate::handler::HandlerSet;
use std::collections::HashMap;
use std::sync::Arc;

/// One token of a parsed pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    Literal(String),
    /// `*` or `$name`; the name is captured into path parameters.
    Wildcard(Option<String>),
    /// Trailing `>`.
    Full,
}

impl Token {
    fn rank(&self) -> u8 {
        match self {
            Token::Literal(_) => 0,
            Token::Wildcard(_) => 1,
            Token::Full => 2,
        }
    }
}

/// Parse and validate a pattern into tokens.
pub(crate) fn parse_pattern(pattern: &str) -> Result<Vec<Token>, RegistrationError> {
    let invalid = |reason: &str| RegistrationError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    if pattern.is_empty() {
        return Err(invalid("pattern is empty"));
    }

    let raw: Vec<&str> = pattern.split('.').collect();
    let mut tokens = Vec::with_capacity(raw.len());
    let mut names: Vec<&str> = Vec::new();

    for (i, tok) in raw.iter().enumerate() {
        let token = match *tok {
            ">" => {
                if i != raw.len() - 1 {
                    return Err(invalid("'>' must be the final token"));
                }
                Token::Full
            }
            "*" => Token::Wildcard(None),
            t if t.starts_with('$') => {
                let name = &t[1..];
                if !crate::subject::is_valid_token(name) {
                    return Err(invalid("invalid parameter name"));
                }
                if names.contains(&name) {
                    return Err(invalid("duplicate parameter name"));
                }
                names.push(name);
                Token::Wildcard(Some(name.to_string()))
            }
            t => {
                if !crate::subject::is_valid_token(t) {
                    return Err(invalid("invalid token"));
                }
                Token::Literal(t.to_string())
            }
        };
        tokens.push(token);
    }

    Ok(tokens)
}

/// A resolved route: the owning handler set and extracted path parameters.
pub(crate) struct Match {
    pub handlers: Arc<HandlerSet>,
    pub params: HashMap<String, String>,
}

#[derive(Default)]
struct Node {
    literals: HashMap<String, Node>,
    wild: Option<Box<Node>>,
    handlers: Option<Arc<HandlerSet>>,
    full_handlers: Option<Arc<HandlerSet>>,
}

/// Routing table from patterns to handler sets.
///
/// Mutable only during the setup phase; serving takes shared references.
#[derive(Default)]
pub(crate) struct PatternMap {
    root: Node,
    #[allow(dead_code)] // Read by test helpers only
    len: usize,
}

impl PatternMap {
    /// Register a handler set under its pattern. Patterns that are equivalent
    /// to an already registered one (same token kinds at every position) are
    /// rejected.
    pub fn add(&mut self, set: Arc<HandlerSet>) -> Result<(), RegistrationError> {
        let mut node = &mut self.root;
        let mut full = false;

        for token in set.tokens() {
            match token {
                Token::Literal(t) => {
                    node = node.literals.entry(t.clone()).or_default();
                }
                Token::Wildcard(_) => {
                    node = node.wild.get_or_insert_with(Default::default);
                }
                Token::Full => {
                    full = true;
                }
            }
        }

        let slot = if full {
            &mut node.full_handlers
        } else {
            &mut node.handlers
        };
        if slot.is_some() {
            return Err(RegistrationError::DuplicatePattern(
                set.pattern().to_string(),
            ));
        }
        *slot = Some(set);
        self.len += 1;
        Ok(())
    }

    /// Resolve a resource name (no query) to its best-matching handler set.
    pub fn get(&self, name: &str) -> Option<Match> {
        let tokens: Vec<&str> = name.split('.').collect();
        if tokens.iter().any(|t| t.is_empty()) {
            return None;
        }

        let mut candidates: Vec<&Arc<HandlerSet>> = Vec::new();
        collect(&self.root, &tokens, 0, &mut candidates);

        let best = candidates.into_iter().reduce(|best, c| {
            if beats(c.tokens(), best.tokens()) {
                c
            } else {
                best
            }
        })?;

        let mut params = HashMap::new();
        for (i, token) in best.tokens().iter().enumerate() {
            if let Token::Wildcard(Some(name)) = token {
                params.insert(name.clone(), tokens[i].to_string());
            }
        }

        Some(Match {
            handlers: Arc::clone(best),
            params,
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }
}

fn collect<'a>(
    node: &'a Node,
    tokens: &[&str],
    i: usize,
    out: &mut Vec<&'a Arc<HandlerSet>>,
) {
    if i == tokens.len() {
        if let Some(set) = &node.handlers {
            out.push(set);
        }
        return;
    }
    if let Some(next) = node.literals.get(tokens[i]) {
        collect(next, tokens, i + 1, out);
    }
    if let Some(next) = &node.wild {
        collect(next, tokens, i + 1, out);
    }
    // A trailing '>' consumes the remaining one-or-more tokens.
    if let Some(set) = &node.full_handlers {
        out.push(set);
    }
}

/// Whether pattern `a` wins over pattern `b` for a resource both match.
fn beats(a: &[Token], b: &[Token]) -> bool {
    let lit = |ts: &[Token]| ts.iter().filter(|t| matches!(t, Token::Literal(_))).count();
    let (la, lb) = (lit(a), lit(b));
    if la != lb {
        return la > lb;
    }
    for (ta, tb) in a.iter().zip(b.iter()) {
        if ta.rank() != tb.rank() {
            return ta.rank() < tb.rank();
        }
    }
    // Equal kind sequences cannot both be registered; a longer pattern at
    // this point carries a '>' suffix on the other side and loses.
    a.len() > b.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;

    fn set(pattern: &str) -> Arc<HandlerSet> {
        HandlerSet::build(Handler::new(), pattern).unwrap()
    }

    fn map(patterns: &[&str]) -> PatternMap {
        let mut m = PatternMap::default();
        for p in patterns {
            m.add(set(p)).unwrap();
        }
        m
    }

    #[test]
    fn test_parse_pattern_tokens() {
        let tokens = parse_pattern("test.$id.*.>").unwrap();
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[0], Token::Literal("test".to_string()));
        assert_eq!(tokens[1], Token::Wildcard(Some("id".to_string())));
        assert_eq!(tokens[2], Token::Wildcard(None));
        assert_eq!(tokens[3], Token::Full);
    }

    #[test]
    fn test_parse_pattern_rejects_invalid() {
        assert!(parse_pattern("").is_err());
        assert!(parse_pattern("test..model").is_err());
        assert!(parse_pattern("test.>.model").is_err());
        assert!(parse_pattern("test.$").is_err());
        assert!(parse_pattern("test.$id.$id").is_err());
        assert!(parse_pattern("test.fo?o").is_err());
    }

    #[test]
    fn test_match_literal() {
        let m = map(&["test.model"]);
        assert!(m.get("test.model").is_some());
        assert!(m.get("test.other").is_none());
        assert!(m.get("test.model.foo").is_none());
        assert!(m.get("test").is_none());
    }

    #[test]
    fn test_match_wildcard_params() {
        let m = map(&["test.book.$id"]);
        let matched = m.get("test.book.42").unwrap();
        assert_eq!(matched.params.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_match_full_wildcard() {
        let m = map(&["test.store.>"]);
        assert!(m.get("test.store.a").is_some());
        assert!(m.get("test.store.a.b.c").is_some());
        // '>' requires at least one token.
        assert!(m.get("test.store").is_none());
    }

    #[test]
    fn test_most_literals_wins() {
        let m = map(&["test.*.b.c", "test.a.*.*"]);
        let matched = m.get("test.a.b.c").unwrap();
        assert_eq!(matched.handlers.pattern(), "test.*.b.c");
    }

    #[test]
    fn test_wildcard_beats_full() {
        let m = map(&["test.model.*", "test.model.>"]);
        let matched = m.get("test.model.foo").unwrap();
        assert_eq!(matched.handlers.pattern(), "test.model.*");
        // Deeper resources only match '>'.
        let matched = m.get("test.model.foo.bar").unwrap();
        assert_eq!(matched.handlers.pattern(), "test.model.>");
    }

    #[test]
    fn test_earliest_literal_breaks_tie() {
        let m = map(&["test.*.b", "test.a.*"]);
        let matched = m.get("test.a.b").unwrap();
        assert_eq!(matched.handlers.pattern(), "test.a.*");
    }

    #[test]
    fn test_duplicate_pattern_rejected() {
        let mut m = map(&["test.model.$id"]);
        // '$id' and '*' are equivalent for routing purposes.
        let err = m.add(set("test.model.*")).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicatePattern(_)));
        let err = m.add(set("test.model.$foo")).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicatePattern(_)));
    }

    #[test]
    fn test_distinct_subtrees_share_wildcard_node() {
        let m = map(&["test.$a.x", "test.$b.y"]);
        assert_eq!(m.len(), 2);
        let matched = m.get("test.1.x").unwrap();
        assert_eq!(matched.params.get("a").map(String::as_str), Some("1"));
        let matched = m.get("test.2.y").unwrap();
        assert_eq!(matched.params.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_invalid_name_no_match() {
        let m = map(&["test.>"]);
        assert!(m.get("test..foo").is_none());
    }
}
