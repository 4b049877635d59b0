use neba_lexer::{Span, Token, TokenKind};
use crate::ast::*;
use crate::error::{ParseError, ParseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    Lowest = 0,
    Equals = 1,
    LessGreater = 2,
    Sum = 3,
    Product = 4,
    Prefix = 5,
    Call = 6,
    Index = 7,
}

fn infix_prec(tok: &TokenKind) -> Option<Prec> {
    match tok {
        TokenKind::EqualEqual | TokenKind::BangEqual => Some(Prec::Equals),
        TokenKind::Less | TokenKind::Greater => Some(Prec::LessGreater),
        TokenKind::Plus | TokenKind::Minus => Some(Prec::Sum),
        TokenKind::Star | TokenKind::Slash => Some(Prec::Product),
        TokenKind::LParen => Some(Prec::Call),
        TokenKind::LBracket => Some(Prec::Index),
        _ => None,
    }
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    pub errors: Vec<ParseError>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0, errors: Vec::new() }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }
    fn peek_kind(&self) -> &TokenKind { &self.peek().kind }
    fn advance(&mut self) -> &Token {
        let tok = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 { self.pos += 1; }
        tok
    }
    fn current_span(&self) -> Span { self.peek().span.clone() }
    fn match_tok(&mut self, kind: &TokenKind) -> bool {
        if std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind) {
            self.advance();
            true
        } else {
            false
        }
    }
    fn expect(&mut self, kind: &TokenKind, label: &str) -> ParseResult<Token> {
        if std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind) {
            Ok(self.advance().clone())
        } else if matches!(self.peek_kind(), TokenKind::Eof) {
            Err(ParseError::UnexpectedEof { expected: label.to_string(), span: self.current_span() })
        } else {
            Err(ParseError::UnexpectedToken {
                expected: label.to_string(),
                found: self.peek_kind().clone(),
                span: self.current_span(),
            })
        }
    }
    fn expect_semicolon(&mut self) {
        self.match_tok(&TokenKind::Semicolon);
    }
    fn error_expr(&mut self, err: ParseError) -> Expr {
        let span = self.current_span();
        self.errors.push(err);
        while !matches!(self.peek_kind(), TokenKind::Semicolon | TokenKind::Eof | TokenKind::RBrace) {
            self.advance();
        }
        Node::new(ExprKind::Null, span)
    }

    pub fn parse(&mut self) -> Program {
        let mut stmts = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::Eof) {
            stmts.push(self.parse_stmt());
        }
        Program { stmts }
    }

    fn parse_stmt(&mut self) -> Stmt {
        match self.peek_kind() {
            TokenKind::Let => self.parse_let(),
            TokenKind::Return => self.parse_return(),
            TokenKind::While => self.parse_while(),
            TokenKind::Fn => self.parse_fn_definition(),
            _ => self.parse_expr_stmt(),
        }
    }

    fn parse_let(&mut self) -> Stmt {
        let span = self.current_span();
        self.advance();
        let name = match self.peek_kind().clone() {
            TokenKind::Identifier(s) => { self.advance(); s }
            _ => {
                let err = ParseError::UnexpectedToken {
                    expected: "identifier".to_string(), found: self.peek_kind().clone(), span: self.current_span(),
                };
                let value = self.error_expr(err);
                self.expect_semicolon();
                return Node::new(StmtKind::Let { name: "?".to_string(), value }, span);
            }
        };
        if let Err(e) = self.expect(&TokenKind::Equal, "'='") {
            let value = self.error_expr(e);
            self.expect_semicolon();
            return Node::new(StmtKind::Let { name, value }, span);
        }
        let mut value = self.parse_expr(Prec::Lowest);
        if let ExprKind::FunctionLiteral { name: self_name, .. } = &mut value.inner {
            *self_name = Some(name.clone());
        }
        self.expect_semicolon();
        Node::new(StmtKind::Let { name, value }, span)
    }

    fn parse_return(&mut self) -> Stmt {
        let span = self.current_span();
        self.advance();
        let value = if matches!(self.peek_kind(), TokenKind::Semicolon) {
            Node::new(ExprKind::Null, span.clone())
        } else {
            self.parse_expr(Prec::Lowest)
        };
        self.expect_semicolon();
        Node::new(StmtKind::Return(value), span)
    }

    fn parse_while(&mut self) -> Stmt {
        let span = self.current_span();
        self.advance();
        if let Err(e) = self.expect(&TokenKind::LParen, "'('") { self.errors.push(e); }
        let condition = self.parse_expr(Prec::Lowest);
        if let Err(e) = self.expect(&TokenKind::RParen, "')'") { self.errors.push(e); }
        let body = self.parse_block();
        Node::new(StmtKind::While { condition, body }, span)
    }

    fn parse_fn_definition(&mut self) -> Stmt {
        let span = self.current_span();
        self.advance();
        let name = match self.peek_kind().clone() {
            TokenKind::Identifier(s) => { self.advance(); s }
            _ => {
                self.errors.push(ParseError::UnexpectedToken {
                    expected: "function name".to_string(), found: self.peek_kind().clone(), span: self.current_span(),
                });
                "?".to_string()
            }
        };
        if let Err(e) = self.expect(&TokenKind::LParen, "'('") { self.errors.push(e); }
        let params = self.parse_params();
        if let Err(e) = self.expect(&TokenKind::RParen, "')'") { self.errors.push(e); }
        let body = self.parse_block();
        Node::new(StmtKind::FunctionDefinition { name, params, body }, span)
    }

    fn parse_params(&mut self) -> Vec<String> {
        let mut params = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RParen | TokenKind::Eof) {
            match self.peek_kind().clone() {
                TokenKind::Identifier(s) => { self.advance(); params.push(s); }
                _ => break,
            }
            if !self.match_tok(&TokenKind::Comma) { break; }
        }
        params
    }

    fn parse_block(&mut self) -> BlockStatement {
        if let Err(e) = self.expect(&TokenKind::LBrace, "'{'") {
            self.errors.push(e);
            return BlockStatement { stmts: Vec::new() };
        }
        let mut stmts = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace | TokenKind::Eof) {
            stmts.push(self.parse_stmt());
        }
        self.match_tok(&TokenKind::RBrace);
        BlockStatement { stmts }
    }

    fn parse_expr_stmt(&mut self) -> Stmt {
        let span = self.current_span();
        let expr = self.parse_expr(Prec::Lowest);
        let op = match self.peek_kind() {
            TokenKind::Equal => Some(AssignOp::Assign),
            TokenKind::PlusEqual => Some(AssignOp::AddAssign),
            TokenKind::MinusEqual => Some(AssignOp::SubAssign),
            TokenKind::StarEqual => Some(AssignOp::MulAssign),
            TokenKind::SlashEqual => Some(AssignOp::DivAssign),
            _ => None,
        };
        if let Some(op) = op {
            let name = match &expr.inner {
                ExprKind::Ident(name) => name.clone(),
                _ => {
                    self.errors.push(ParseError::InvalidAssignTarget { span: expr.span.clone() });
                    self.advance();
                    self.parse_expr(Prec::Lowest);
                    self.expect_semicolon();
                    return Node::new(StmtKind::Expr(expr), span);
                }
            };
            self.advance();
            let value = self.parse_expr(Prec::Lowest);
            self.expect_semicolon();
            let assign = Node::new(ExprKind::Assign { name, op, value: Box::new(value) }, span.clone());
            return Node::new(StmtKind::Expr(assign), span);
        }
        self.expect_semicolon();
        Node::new(StmtKind::Expr(expr), span)
    }

    fn parse_expr(&mut self, min_prec: Prec) -> Expr {
        let mut left = self.parse_prefix();
        loop {
            if matches!(self.peek_kind(), TokenKind::Semicolon | TokenKind::Eof) { break; }
            let prec = match infix_prec(self.peek_kind()) {
                Some(p) => p,
                None => break,
            };
            if prec <= min_prec { break; }
            left = self.parse_infix(left, prec);
        }
        left
    }

    fn parse_prefix(&mut self) -> Expr {
        let span = self.current_span();
        match self.peek_kind().clone() {
            TokenKind::IntLiteral(n) => { self.advance(); Node::new(ExprKind::Int(n), span) }
            TokenKind::StringLiteral(s) => { self.advance(); Node::new(ExprKind::Str(s), span) }
            TokenKind::BoolLiteral(b) => { self.advance(); Node::new(ExprKind::Bool(b), span) }
            TokenKind::NullLiteral => { self.advance(); Node::new(ExprKind::Null, span) }
            TokenKind::Identifier(s) => { self.advance(); Node::new(ExprKind::Ident(s), span) }
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_expr(Prec::Prefix);
                Node::new(ExprKind::Unary { op: UnaryOp::Neg, operand: Box::new(operand) }, span)
            }
            TokenKind::Bang => {
                self.advance();
                let operand = self.parse_expr(Prec::Prefix);
                Node::new(ExprKind::Unary { op: UnaryOp::Not, operand: Box::new(operand) }, span)
            }
            TokenKind::LParen => {
                self.advance();
                let e = self.parse_expr(Prec::Lowest);
                self.match_tok(&TokenKind::RParen);
                e
            }
            TokenKind::LBracket => self.parse_array_literal(),
            TokenKind::LBrace => self.parse_hash_literal(),
            TokenKind::If => self.parse_if_expr(),
            TokenKind::Fn => self.parse_fn_literal(),
            other => self.error_expr(ParseError::UnexpectedToken {
                expected: "expression".to_string(), found: other, span,
            }),
        }
    }

    fn parse_infix(&mut self, left: Expr, prec: Prec) -> Expr {
        let span = left.span.clone();
        match self.peek_kind().clone() {
            TokenKind::LParen => {
                self.advance();
                let args = self.parse_call_args();
                self.match_tok(&TokenKind::RParen);
                Node::new(ExprKind::Call { callee: Box::new(left), args }, span)
            }
            TokenKind::LBracket => {
                self.advance();
                let index = self.parse_expr(Prec::Lowest);
                self.match_tok(&TokenKind::RBracket);
                Node::new(ExprKind::Index { left: Box::new(left), index: Box::new(index) }, span)
            }
            kind => {
                let op = self.token_to_binop(&kind);
                self.advance();
                let right = self.parse_expr(prec);
                Node::new(ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) }, span)
            }
        }
    }

    fn token_to_binop(&self, kind: &TokenKind) -> BinOp {
        match kind {
            TokenKind::Plus => BinOp::Add,
            TokenKind::Minus => BinOp::Sub,
            TokenKind::Star => BinOp::Mul,
            TokenKind::Slash => BinOp::Div,
            TokenKind::Less => BinOp::Lt,
            TokenKind::Greater => BinOp::Gt,
            TokenKind::EqualEqual => BinOp::Eq,
            TokenKind::BangEqual => BinOp::Ne,
            _ => BinOp::Add,
        }
    }

    fn parse_call_args(&mut self) -> Vec<Expr> {
        let mut args = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RParen | TokenKind::Eof) {
            args.push(self.parse_expr(Prec::Lowest));
            if !self.match_tok(&TokenKind::Comma) { break; }
        }
        args
    }

    fn parse_array_literal(&mut self) -> Expr {
        let span = self.current_span();
        self.advance();
        let mut items = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBracket | TokenKind::Eof) {
            items.push(self.parse_expr(Prec::Lowest));
            if !self.match_tok(&TokenKind::Comma) { break; }
        }
        self.match_tok(&TokenKind::RBracket);
        Node::new(ExprKind::Array(items), span)
    }

    fn parse_hash_literal(&mut self) -> Expr {
        let span = self.current_span();
        self.advance();
        let mut pairs = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace | TokenKind::Eof) {
            let key = self.parse_expr(Prec::Lowest);
            if let Err(e) = self.expect(&TokenKind::Colon, "':'") { self.errors.push(e); }
            let value = self.parse_expr(Prec::Lowest);
            pairs.push((key, value));
            if !self.match_tok(&TokenKind::Comma) { break; }
        }
        self.match_tok(&TokenKind::RBrace);
        Node::new(ExprKind::Hash(pairs), span)
    }

    fn parse_if_expr(&mut self) -> Expr {
        let span = self.current_span();
        self.advance();
        if let Err(e) = self.expect(&TokenKind::LParen, "'('") { self.errors.push(e); }
        let condition = self.parse_expr(Prec::Lowest);
        if let Err(e) = self.expect(&TokenKind::RParen, "')'") { self.errors.push(e); }
        let consequence = self.parse_block();
        let alternative = if self.match_tok(&TokenKind::Else) {
            Some(self.parse_block())
        } else {
            None
        };
        Node::new(
            ExprKind::If { condition: Box::new(condition), consequence, alternative },
            span,
        )
    }

    fn parse_fn_literal(&mut self) -> Expr {
        let span = self.current_span();
        self.advance();
        if let Err(e) = self.expect(&TokenKind::LParen, "'('") { self.errors.push(e); }
        let params = self.parse_params();
        if let Err(e) = self.expect(&TokenKind::RParen, "')'") { self.errors.push(e); }
        let body = self.parse_block();
        Node::new(ExprKind::FunctionLiteral { name: None, params, body }, span)
    }
}
