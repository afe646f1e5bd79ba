use std::sync::Arc;

use strata_core::ScriptError;

use crate::ast::*;
use crate::lexer::{Lexer, Token, TokenKind};

/// Deepest syntax tree the parser will build. Evaluation recurses once per
/// level, so this also bounds interpreter stack use for a single expression.
pub const MAX_NESTING: usize = 128;

pub fn parse_program(source: &str, origin: &str) -> Result<Program, ScriptError> {
    let tokens = Lexer::new(source).tokenize()?;
    let origin: Arc<str> = Arc::from(origin);
    let mut parser = Parser {
        tokens,
        pos: 0,
        origin: origin.clone(),
        depth: 0,
    };
    let mut body = Vec::new();
    while !parser.at(&TokenKind::Eof) {
        body.push(parser.statement()?);
    }
    Ok(Program { origin, body })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    origin: Arc<str>,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always ends with Eof, so the last index is valid
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl AsRef<str>) -> ScriptError {
        let token = self.peek();
        ScriptError::syntax(format!(
            "{} at {}:{} (found {})",
            message.as_ref(),
            self.origin,
            token.line,
            describe(&token.kind)
        ))
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, ScriptError> {
        if self.at(&kind) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn deepen(&mut self) -> Result<(), ScriptError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ScriptError>,
    ) -> Result<T, ScriptError> {
        self.deepen()?;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn ident(&mut self, what: &str) -> Result<String, ScriptError> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(format!("expected {what}"))),
        }
    }

    fn doc_string(&mut self) -> Option<String> {
        if let TokenKind::Str(doc) = &self.peek().kind {
            let doc = doc.clone();
            self.advance();
            Some(doc)
        } else {
            None
        }
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.peek().line;
        let kind = match &self.peek().kind {
            TokenKind::Let => {
                self.advance();
                let name = self.ident("variable name after 'let'")?;
                self.expect(TokenKind::Assign, "'=' after variable name")?;
                let value = self.expression()?;
                StmtKind::Let { name, value }
            }
            TokenKind::Fn => StmtKind::Fn(Arc::new(self.function()?)),
            TokenKind::Class => StmtKind::Class(self.class()?),
            TokenKind::Return => {
                self.advance();
                let value = if self.peek().line == line && starts_expression(&self.peek().kind) {
                    Some(self.expression()?)
                } else {
                    None
                };
                StmtKind::Return(value)
            }
            TokenKind::Raise => {
                self.advance();
                StmtKind::Raise(self.expression()?)
            }
            TokenKind::If => return self.if_statement(),
            TokenKind::For => {
                self.advance();
                let var = self.ident("loop variable after 'for'")?;
                self.expect(TokenKind::In, "'in' after loop variable")?;
                let iter = self.expression()?;
                let body = self.block()?;
                StmtKind::For { var, iter, body }
            }
            _ => {
                let expr = self.expression()?;
                if self.eat(&TokenKind::Assign) {
                    let target = assign_target(expr).ok_or_else(|| {
                        ScriptError::syntax(format!(
                            "invalid assignment target at {}:{}",
                            self.origin, line
                        ))
                    })?;
                    let value = self.expression()?;
                    StmtKind::Assign { target, value }
                } else {
                    StmtKind::Expr(expr)
                }
            }
        };
        self.eat(&TokenKind::Semicolon);
        Ok(Stmt { kind, line })
    }

    fn if_statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.peek().line;
        self.expect(TokenKind::If, "'if'")?;
        let cond = self.expression()?;
        let then = self.block()?;
        let otherwise = if self.eat(&TokenKind::Else) {
            if self.at(&TokenKind::If) {
                vec![self.nested(Self::if_statement)?]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then,
                otherwise,
            },
            line,
        })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.nested(Self::block_body)
    }

    fn block_body(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut body = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unclosed block"));
            }
            body.push(self.statement()?);
        }
        self.advance();
        Ok(body)
    }

    fn function(&mut self) -> Result<FunctionDef, ScriptError> {
        let line = self.expect(TokenKind::Fn, "'fn'")?.line;
        let name = self.ident("function name")?;
        self.expect(TokenKind::LParen, "'(' after function name")?;
        let mut params: Vec<Param> = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let param = self.ident("parameter name")?;
            if params.iter().any(|p| p.name == param) {
                return Err(self.error(format!("duplicate parameter '{param}'")));
            }
            let default = if self.eat(&TokenKind::Assign) {
                Some(self.expression()?)
            } else if params.iter().any(|p| p.default.is_some()) {
                return Err(self.error(format!(
                    "parameter '{param}' without default follows a defaulted parameter"
                )));
            } else {
                None
            };
            params.push(Param {
                name: param,
                default,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')' after parameters")?;
        let doc = self.doc_string();
        let body = self.block()?;
        Ok(FunctionDef {
            name,
            params,
            doc,
            body,
            origin: self.origin.clone(),
            line,
        })
    }

    fn class(&mut self) -> Result<ClassDecl, ScriptError> {
        self.expect(TokenKind::Class, "'class'")?;
        let name = self.ident("class name")?;
        let parent = if self.eat(&TokenKind::Colon) {
            Some(self.ident("parent class name after ':'")?)
        } else {
            None
        };
        self.expect(TokenKind::LBrace, "'{' after class name")?;
        let doc = self.doc_string();
        let mut methods: Vec<Arc<FunctionDef>> = Vec::new();
        loop {
            match &self.peek().kind {
                TokenKind::RBrace => {
                    self.advance();
                    break;
                }
                TokenKind::Semicolon => {
                    self.advance();
                }
                TokenKind::Fn => {
                    let method = self.function()?;
                    if methods.iter().any(|m| m.name == method.name) {
                        return Err(ScriptError::syntax(format!(
                            "method '{}' defined twice in class {} at {}:{}",
                            method.name, name, self.origin, method.line
                        )));
                    }
                    methods.push(Arc::new(method));
                }
                _ => return Err(self.error("expected 'fn' or '}' in class body")),
            }
        }
        Ok(ClassDecl {
            name,
            parent,
            doc,
            methods,
        })
    }

    fn expression(&mut self) -> Result<Expr, ScriptError> {
        self.nested(Self::or)
    }

    fn or(&mut self) -> Result<Expr, ScriptError> {
        let base = self.depth;
        let mut left = self.and()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.and()?;
            self.deepen()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ScriptError> {
        let base = self.depth;
        let mut left = self.equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.equality()?;
            self.deepen()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ScriptError> {
        let base = self.depth;
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                _ => {
                    self.depth = base;
                    return Ok(left);
                }
            };
            self.advance();
            let right = self.comparison()?;
            self.deepen()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let base = self.depth;
        let mut left = self.additive()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => {
                    self.depth = base;
                    return Ok(left);
                }
            };
            self.advance();
            let right = self.additive()?;
            self.deepen()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn additive(&mut self) -> Result<Expr, ScriptError> {
        let base = self.depth;
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => {
                    self.depth = base;
                    return Ok(left);
                }
            };
            self.advance();
            let right = self.multiplicative()?;
            self.deepen()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ScriptError> {
        let base = self.depth;
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => {
                    self.depth = base;
                    return Ok(left);
                }
            };
            self.advance();
            let right = self.unary()?;
            self.deepen()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        if self.eat(&TokenKind::Minus) {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.nested(Self::unary)?)));
        }
        if self.eat(&TokenKind::Bang) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.nested(Self::unary)?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ScriptError> {
        let base = self.depth;
        let mut expr = self.primary()?;
        loop {
            if self.eat(&TokenKind::LParen) {
                self.deepen()?;
                let (args, kwargs) = self.arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat(&TokenKind::Dot) {
                self.deepen()?;
                let name = self.ident("attribute name after '.'")?;
                expr = Expr::Attr {
                    object: Box::new(expr),
                    name,
                };
            } else if self.eat(&TokenKind::LBracket) {
                self.deepen()?;
                let index = self.expression()?;
                self.expect(TokenKind::RBracket, "']' after index")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                self.depth = base;
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ScriptError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let keyword = match (&self.peek().kind, self.peek_kind_at(1)) {
                (TokenKind::Ident(name), TokenKind::Assign) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                self.advance();
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(format!("keyword argument '{name}' repeated")));
                }
                kwargs.push((name, self.expression()?));
            } else if kwargs.is_empty() {
                args.push(self.expression()?);
            } else {
                return Err(self.error("positional argument follows keyword argument"));
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')' after arguments")?;
        Ok((args, kwargs))
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        let token = self.peek().clone();
        let expr = match token.kind {
            TokenKind::Number(n) => Expr::Literal(Literal::Number(n)),
            TokenKind::Str(s) => Expr::Literal(Literal::Str(Arc::from(s))),
            TokenKind::True => Expr::Literal(Literal::Bool(true)),
            TokenKind::False => Expr::Literal(Literal::Bool(false)),
            TokenKind::Null => Expr::Literal(Literal::Null),
            TokenKind::Ident(name) => Expr::Ident(name),
            TokenKind::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                return Ok(inner);
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.at(&TokenKind::RBracket) {
                    items.push(self.expression()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket, "']' after list items")?;
                return Ok(Expr::List(items));
            }
            _ => return Err(self.error("expected expression")),
        };
        self.advance();
        Ok(expr)
    }
}

fn assign_target(expr: Expr) -> Option<AssignTarget> {
    match expr {
        Expr::Ident(name) => Some(AssignTarget::Name(name)),
        Expr::Attr { object, name } => Some(AssignTarget::Attr {
            object: *object,
            name,
        }),
        _ => None,
    }
}

fn starts_expression(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Ident(_)
            | TokenKind::Number(_)
            | TokenKind::Str(_)
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Null
            | TokenKind::LParen
            | TokenKind::LBracket
            | TokenKind::Minus
            | TokenKind::Bang
    )
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(name) => format!("identifier '{name}'"),
        TokenKind::Number(n) => format!("number {n}"),
        TokenKind::Str(_) => "string".to_string(),
        TokenKind::Eof => "end of input".to_string(),
        other => format!("{other:?}"),
    }
}
