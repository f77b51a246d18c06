use crate::error::{ExprError, Result, Span};
use logos::Logos;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Tokens of the formula language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum Token {
    // Literals
    #[token("true")]
    #[token("TRUE")]
    #[token("True")]
    True,
    #[token("false")]
    #[token("FALSE")]
    #[token("False")]
    False,
    #[token("null")]
    #[token("NULL")]
    #[token("Null")]
    Null,

    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| Decimal::from_str(lex.slice()).ok())]
    Number(Decimal),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    #[regex(r"'([^'\\]|\\.)*'", |lex| unescape(lex.slice()))]
    Str(String),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Identifier(String),

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,

    // Delimiters
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,

    // Punctuation
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("$")]
    Dollar,

    // End of input
    Eof,
}

impl Token {
    /// Short human description used in parser messages
    pub fn describe(&self) -> String {
        match self {
            Token::True => "'true'".to_string(),
            Token::False => "'false'".to_string(),
            Token::Null => "'null'".to_string(),
            Token::Number(n) => format!("number {}", n),
            Token::Str(s) => format!("string '{}'", s),
            Token::Identifier(name) => format!("identifier '{}'", name),
            Token::Plus => "'+'".to_string(),
            Token::Minus => "'-'".to_string(),
            Token::Star => "'*'".to_string(),
            Token::Slash => "'/'".to_string(),
            Token::Percent => "'%'".to_string(),
            Token::EqEq => "'=='".to_string(),
            Token::NotEq => "'!='".to_string(),
            Token::Lt => "'<'".to_string(),
            Token::Le => "'<='".to_string(),
            Token::Gt => "'>'".to_string(),
            Token::Ge => "'>='".to_string(),
            Token::AndAnd => "'&&'".to_string(),
            Token::OrOr => "'||'".to_string(),
            Token::Bang => "'!'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Dot => "'.'".to_string(),
            Token::Dollar => "'$'".to_string(),
            Token::Eof => "end of expression".to_string(),
        }
    }
}

fn unescape(quoted: &str) -> String {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// A token with its source span
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

impl SpannedToken {
    pub fn new(token: Token, span: Span) -> Self {
        Self { token, span }
    }
}

/// Tokenize a whole expression, appending a trailing `Eof`
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>> {
    let mut lex = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(token_result) = lex.next() {
        let span = Span::from(lex.span());
        match token_result {
            Ok(token) => tokens.push(SpannedToken::new(token, span)),
            Err(_) => {
                let text = &source[span.start..span.end];
                let message = if text.starts_with('"') || text.starts_with('\'') {
                    "Unterminated string literal".to_string()
                } else {
                    format!("Invalid token: {}", text)
                };
                return Err(ExprError::LexerError { span, message });
            }
        }
    }

    tokens.push(SpannedToken::new(
        Token::Eof,
        Span::new(source.len(), source.len()),
    ));
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(
            kinds("qty * 9.99"),
            vec![
                Token::Identifier("qty".to_string()),
                Token::Star,
                Token::Number(Decimal::new(999, 2)),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_two_char_operators() {
        assert_eq!(
            kinds("a <= b && !c"),
            vec![
                Token::Identifier("a".to_string()),
                Token::Le,
                Token::Identifier("b".to_string()),
                Token::AndAnd,
                Token::Bang,
                Token::Identifier("c".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        let tokens = kinds(r#""say \"hi\"" 'it\'s'"#);
        assert_eq!(tokens[0], Token::Str("say \"hi\"".to_string()));
        assert_eq!(tokens[1], Token::Str("it's".to_string()));
    }

    #[test]
    fn test_keywords_are_case_tolerant() {
        assert_eq!(kinds("TRUE false Null")[..3], [Token::True, Token::False, Token::Null]);
        assert!(matches!(&kinds("trueish")[0], Token::Identifier(s) if s == "trueish"));
    }

    #[test]
    fn test_invalid_character() {
        let err = tokenize("a # b").unwrap_err();
        assert!(matches!(err, ExprError::LexerError { span, .. } if span == Span::new(2, 3)));
    }

    #[test]
    fn test_spans() {
        let tokens = tokenize("price  + 1").unwrap();
        assert_eq!(tokens[0].span, Span::new(0, 5));
        assert_eq!(tokens[1].span, Span::new(7, 8));
        assert_eq!(tokens[3].span, Span::new(10, 10));
    }
}
