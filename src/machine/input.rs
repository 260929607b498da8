//! Program input as a queue of whitespace-delimited tokens.
//!
//! The token list is `Arc`-shared with a per-state cursor, so consuming a
//! token in one machine state never disturbs the states history still
//! holds, and feeding more input mid-run is an append.

use std::sync::Arc;

use crate::machine::errors::Trap;
use crate::memory::Scalar;
use crate::program::TypeDesc;

#[derive(Debug, Clone, Default)]
pub struct InputStream {
    tokens: Arc<Vec<String>>,
    pos: usize,
}

impl InputStream {
    /// Tokenize `text`: trimmed, split on runs of whitespace; empty text
    /// yields no tokens.
    pub fn from_text(text: &str) -> Self {
        let tokens: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        InputStream {
            tokens: Arc::new(tokens),
            pos: 0,
        }
    }

    /// Consume the next token, advancing this stream's cursor only.
    pub fn take(&mut self) -> Option<String> {
        let token = self.tokens.get(self.pos)?.clone();
        self.pos += 1;
        Some(token)
    }

    /// Append more tokens from `text` (interactive input arriving mid-run).
    pub fn push_text(&mut self, text: &str) {
        let tokens = Arc::make_mut(&mut self.tokens);
        tokens.extend(text.split_whitespace().map(str::to_string));
    }

    pub fn remaining(&self) -> usize {
        self.tokens.len() - self.pos
    }
}

/// Parse one input token as a value for a cell of type `ty`.
pub fn parse_token(ty: &TypeDesc, token: &str) -> Result<Scalar, Trap> {
    match ty {
        TypeDesc::Int => token
            .parse::<i32>()
            .map(Scalar::Int)
            .map_err(|_| Trap::MalformedInput {
                token: token.to_string(),
            }),
        TypeDesc::Char => {
            let byte = token.bytes().next().ok_or_else(|| Trap::MalformedInput {
                token: token.to_string(),
            })?;
            Ok(Scalar::Char(byte as i8))
        }
        _ => Err(Trap::MalformedInput {
            token: token.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_on_whitespace_runs() {
        let mut input = InputStream::from_text("  12\t 34\n\n56 ");
        assert_eq!(input.remaining(), 3);
        assert_eq!(input.take().as_deref(), Some("12"));
        assert_eq!(input.take().as_deref(), Some("34"));
        assert_eq!(input.take().as_deref(), Some("56"));
        assert_eq!(input.take(), None);
    }

    #[test]
    fn empty_text_yields_no_tokens() {
        let mut input = InputStream::from_text("   \n ");
        assert_eq!(input.remaining(), 0);
        assert_eq!(input.take(), None);
    }

    #[test]
    fn cursors_are_per_clone() {
        let mut input = InputStream::from_text("1 2");
        let snapshot = input.clone();
        assert_eq!(input.take().as_deref(), Some("1"));
        assert_eq!(input.remaining(), 1);
        assert_eq!(snapshot.remaining(), 2);
    }

    #[test]
    fn pushed_text_extends_the_queue() {
        let mut input = InputStream::from_text("1");
        assert_eq!(input.take().as_deref(), Some("1"));
        assert_eq!(input.take(), None);
        input.push_text("7 8");
        assert_eq!(input.take().as_deref(), Some("7"));
    }

    #[test]
    fn token_parsing_by_type() {
        assert_eq!(parse_token(&TypeDesc::Int, "-42"), Ok(Scalar::Int(-42)));
        assert_eq!(parse_token(&TypeDesc::Char, "x"), Ok(Scalar::Char(b'x' as i8)));
        assert!(matches!(
            parse_token(&TypeDesc::Int, "4x2"),
            Err(Trap::MalformedInput { .. })
        ));
    }
}
