//! Pratt parser from tokens to the restricted syntax tree

use crate::ast::{BinOp, Expr, UnOp};
use crate::error::{ExprError, Result, Span};
use crate::lexer::{tokenize, SpannedToken, Token};
use formcalc_types::Value;

/// Structural limits enforced while parsing
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    /// Maximum nesting of sub-expressions
    pub max_depth: usize,
    /// Maximum number of syntax tree nodes
    pub max_nodes: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_nodes: 1000,
        }
    }
}

/// Parser over a token slice
pub struct Parser<'a> {
    tokens: &'a [SpannedToken],
    current: usize,
    depth: usize,
    nodes: usize,
    limits: ParseLimits,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [SpannedToken], limits: ParseLimits) -> Self {
        Self {
            tokens,
            current: 0,
            depth: 0,
            nodes: 0,
            limits,
        }
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.current)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.current)
            .or_else(|| self.tokens.last())
            .map(|t| t.span)
            .unwrap_or_default()
    }

    fn advance(&mut self) -> Option<&'a SpannedToken> {
        let token = self.tokens.get(self.current);
        if token.is_some() {
            self.current += 1;
        }
        token
    }

    fn check(&self, expected: &Token) -> bool {
        self.peek() == expected
    }

    fn expect(&mut self, expected: Token, context: &str) -> Result<Span> {
        if self.check(&expected) {
            let span = self.peek_span();
            self.current += 1;
            Ok(span)
        } else {
            Err(self.unexpected(&format!("Expected {} {}", expected.describe(), context)))
        }
    }

    fn unexpected(&self, message: &str) -> ExprError {
        ExprError::ParserError {
            span: self.peek_span(),
            message: format!("{}, found {}", message, self.peek().describe()),
        }
    }

    fn node(&mut self, expr: Expr) -> Result<Expr> {
        self.nodes += 1;
        if self.nodes > self.limits.max_nodes {
            return Err(ExprError::LimitExceeded {
                span: expr.span(),
                message: format!(
                    "Expression has more than {} nodes",
                    self.limits.max_nodes
                ),
            });
        }
        Ok(expr)
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > self.limits.max_depth {
            return Err(ExprError::LimitExceeded {
                span: self.peek_span(),
                message: format!(
                    "Expression nesting exceeds the maximum depth of {}",
                    self.limits.max_depth
                ),
            });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Parse a complete expression, requiring all input to be consumed
    pub fn parse(&mut self) -> Result<Expr> {
        if self.check(&Token::Eof) {
            return Err(ExprError::ParserError {
                span: self.peek_span(),
                message: "Expression is empty".to_string(),
            });
        }
        let expr = self.parse_expr(0)?;
        if !self.check(&Token::Eof) {
            return Err(self.unexpected("Expected an operator or end of expression"));
        }
        Ok(expr)
    }

    fn parse_expr(&mut self, min_prec: u8) -> Result<Expr> {
        self.enter()?;
        let mut lhs = self.parse_unary()?;

        while let Some(op) = binop(self.peek()) {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.parse_expr(prec + 1)?;
            let span = lhs.span().merge(rhs.span());
            lhs = self.node(Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            })?;
        }

        self.leave();
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Token::Minus => UnOp::Neg,
            Token::Bang => UnOp::Not,
            _ => return self.parse_postfix(),
        };
        let start = self.peek_span();
        self.advance();

        self.enter()?;
        let operand = self.parse_unary()?;
        self.leave();

        let span = start.merge(operand.span());
        self.node(Expr::Unary {
            op,
            operand: Box::new(operand),
            span,
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let field_span = self.peek_span();
                    let field = match self.peek() {
                        Token::Identifier(name) => name.clone(),
                        _ => return Err(self.unexpected("Expected a member name after '.'")),
                    };
                    self.advance();
                    let span = expr.span().merge(field_span);
                    expr = self.node(Expr::Member {
                        object: Box::new(expr),
                        field,
                        span,
                    })?;
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr(0)?;
                    let close = self.expect(Token::RBracket, "to close the index")?;
                    let span = expr.span().merge(close);
                    expr = self.node(Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        span,
                    })?;
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let span = self.peek_span();
        let literal = match self.peek() {
            Token::Number(n) => Some(Value::Number(*n)),
            Token::Str(s) => Some(Value::String(s.clone())),
            Token::True => Some(Value::Bool(true)),
            Token::False => Some(Value::Bool(false)),
            Token::Null => Some(Value::Null),
            _ => None,
        };
        if let Some(value) = literal {
            self.advance();
            return self.node(Expr::Literal { value, span });
        }

        match self.peek().clone() {
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr(0)?;
                self.expect(Token::RParen, "to close the group")?;
                Ok(inner)
            }
            Token::Dollar => {
                self.advance();
                match self.peek().clone() {
                    Token::Identifier(name) => {
                        let end = self.peek_span();
                        self.advance();
                        self.node(Expr::Variable {
                            name,
                            span: span.merge(end),
                        })
                    }
                    _ => Err(self.unexpected("Expected a variable name after '$'")),
                }
            }
            Token::Identifier(name) => {
                self.advance();
                if self.check(&Token::LParen) {
                    self.parse_call(name, span)
                } else {
                    self.node(Expr::Variable { name, span })
                }
            }
            Token::Eof => Err(self.unexpected("Expected an expression")),
            _ => Err(self.unexpected("Expected a value, variable or function call")),
        }
    }

    fn parse_call(&mut self, name: String, start: Span) -> Result<Expr> {
        self.expect(Token::LParen, "after function name")?;
        let mut args = Vec::new();

        if !self.check(&Token::RParen) {
            loop {
                args.push(self.parse_expr(0)?);
                if self.check(&Token::Comma) {
                    self.advance();
                    continue;
                }
                break;
            }
        }

        let close = self.expect(Token::RParen, "to close the argument list")?;
        self.node(Expr::Call {
            function: name.to_ascii_uppercase(),
            args,
            span: start.merge(close),
        })
    }
}

fn binop(token: &Token) -> Option<BinOp> {
    Some(match token {
        Token::Plus => BinOp::Add,
        Token::Minus => BinOp::Sub,
        Token::Star => BinOp::Mul,
        Token::Slash => BinOp::Div,
        Token::Percent => BinOp::Mod,
        Token::EqEq => BinOp::Eq,
        Token::NotEq => BinOp::Ne,
        Token::Lt => BinOp::Lt,
        Token::Le => BinOp::Le,
        Token::Gt => BinOp::Gt,
        Token::Ge => BinOp::Ge,
        Token::AndAnd => BinOp::And,
        Token::OrOr => BinOp::Or,
        _ => return None,
    })
}

/// Tokenize and parse a formula
pub fn parse(source: &str, limits: ParseLimits) -> Result<Expr> {
    let tokens = tokenize(source)?;
    Parser::new(&tokens, limits).parse()
}
