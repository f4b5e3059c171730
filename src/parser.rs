//! Parser for Lua 5.1
//!
//! Recursive descent over the token stream with precedence climbing for
//! expressions, producing the AST defined in [`crate::ast`]. Nesting depth
//! is bounded so pathological input fails with a syntax error instead of
//! exhausting the native stack.

use crate::ast::{
    Block, BinaryOp, Expression, FunctionBody, FunctionName, Node, Statement, TableItem, UnaryOp,
};
use crate::error::{parse_error, Result};
use crate::lexer::{Token, TokenWithLocation};

/// Maximum syntactic nesting depth, in the spirit of the reference
/// interpreter's C-call limit.
const MAX_DEPTH: usize = 200;

/// Unary operators bind tighter than every binary operator except `^`
const UNARY_PRIORITY: u8 = 8;

/// Left/right binding powers of a binary operator. `..` and `^` are
/// right-associative: their right power is lower than their left.
fn binary_priority(op: BinaryOp) -> (u8, u8) {
    match op {
        BinaryOp::Or => (1, 1),
        BinaryOp::And => (2, 2),
        BinaryOp::Lt
        | BinaryOp::Gt
        | BinaryOp::Le
        | BinaryOp::Ge
        | BinaryOp::Ne
        | BinaryOp::Eq => (3, 3),
        BinaryOp::Concat => (5, 4),
        BinaryOp::Add | BinaryOp::Sub => (6, 6),
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => (7, 7),
        BinaryOp::Pow => (10, 9),
    }
}

fn binary_op_of(token: &Token) -> Option<BinaryOp> {
    match token {
        Token::Plus => Some(BinaryOp::Add),
        Token::Minus => Some(BinaryOp::Sub),
        Token::Star => Some(BinaryOp::Mul),
        Token::Slash => Some(BinaryOp::Div),
        Token::Percent => Some(BinaryOp::Mod),
        Token::Caret => Some(BinaryOp::Pow),
        Token::Concat => Some(BinaryOp::Concat),
        Token::Eq => Some(BinaryOp::Eq),
        Token::NotEq => Some(BinaryOp::Ne),
        Token::Less => Some(BinaryOp::Lt),
        Token::LessEq => Some(BinaryOp::Le),
        Token::Greater => Some(BinaryOp::Gt),
        Token::GreaterEq => Some(BinaryOp::Ge),
        Token::And => Some(BinaryOp::And),
        Token::Or => Some(BinaryOp::Or),
        _ => None,
    }
}

/// The Lua parser
pub struct Parser {
    tokens: Vec<TokenWithLocation>,
    pos: usize,
    depth: usize,
}

impl Parser {
    /// Create a parser over a token stream, as produced by
    /// [`crate::lexer::tokenize`]
    pub fn new(mut tokens: Vec<TokenWithLocation>) -> Self {
        if !matches!(tokens.last().map(|t| &t.token), Some(Token::Eof)) {
            let line = tokens.last().map_or(1, |t| t.line);
            tokens.push(TokenWithLocation {
                token: Token::Eof,
                line,
                column: 1,
            });
        }
        Parser {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    /// Parse one chunk: a block running to end of file
    pub fn parse_chunk(&mut self) -> Result<Block> {
        let block = self.block()?;
        if !matches!(self.current(), Token::Eof) {
            return self.unexpected("'<eof>'");
        }
        Ok(block)
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn column(&self) -> u32 {
        self.tokens[self.pos].column
    }

    fn advance(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn check(&self, token: &Token) -> bool {
        self.current() == token
    }

    /// Consume the current token if it matches
    fn accept(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.accept(token) {
            Ok(())
        } else {
            self.unexpected(&format!("'{}'", token))
        }
    }

    /// Expect a closing token, mentioning where the construct opened
    fn expect_match(&mut self, token: &Token, what: &str, open_line: u32) -> Result<()> {
        if self.accept(token) {
            return Ok(());
        }
        if open_line == self.line() {
            self.unexpected(&format!("'{}'", token))
        } else {
            Err(parse_error(
                format!(
                    "'{}' expected (to close '{}' at line {}) near '{}'",
                    token,
                    what,
                    open_line,
                    self.current()
                ),
                self.line(),
                self.column(),
            ))
        }
    }

    fn expect_name(&mut self) -> Result<String> {
        match self.current() {
            Token::Name(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => self.unexpected("<name>"),
        }
    }

    fn unexpected<T>(&self, expected: &str) -> Result<T> {
        Err(parse_error(
            format!("{} expected near '{}'", expected, self.current()),
            self.line(),
            self.column(),
        ))
    }

    fn enter_level(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(parse_error(
                "chunk has too many syntax levels",
                self.line(),
                self.column(),
            ));
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.depth -= 1;
    }

    /// Tokens that terminate a block
    fn block_follow(&self) -> bool {
        matches!(
            self.current(),
            Token::End | Token::Else | Token::ElseIf | Token::Until | Token::Eof
        )
    }

    fn block(&mut self) -> Result<Block> {
        self.enter_level()?;
        let mut statements = Vec::new();
        while !self.block_follow() {
            if self.accept(&Token::Semicolon) {
                continue;
            }
            let line = self.line();
            let is_last = matches!(self.current(), Token::Return | Token::Break);
            let stmt = self.statement()?;
            statements.push(Node::new(stmt, line));
            if is_last {
                self.accept(&Token::Semicolon);
                if !self.block_follow() {
                    return self.unexpected("'end'");
                }
                break;
            }
        }
        self.leave_level();
        Ok(statements)
    }

    fn statement(&mut self) -> Result<Statement> {
        match self.current() {
            Token::If => self.if_statement(),
            Token::While => self.while_statement(),
            Token::Do => {
                let line = self.line();
                self.advance();
                let body = self.block()?;
                self.expect_match(&Token::End, "do", line)?;
                Ok(Statement::Do(body))
            }
            Token::For => self.for_statement(),
            Token::Repeat => self.repeat_statement(),
            Token::Function => self.function_statement(),
            Token::Local => self.local_statement(),
            Token::Return => self.return_statement(),
            Token::Break => {
                self.advance();
                Ok(Statement::Break)
            }
            _ => self.expression_statement(),
        }
    }

    fn if_statement(&mut self) -> Result<Statement> {
        let line = self.line();
        self.advance();
        let mut arms = Vec::new();
        let cond = self.expression()?;
        self.expect(&Token::Then)?;
        arms.push((cond, self.block()?));
        while self.check(&Token::ElseIf) {
            self.advance();
            let cond = self.expression()?;
            self.expect(&Token::Then)?;
            arms.push((cond, self.block()?));
        }
        let else_body = if self.accept(&Token::Else) {
            Some(self.block()?)
        } else {
            None
        };
        self.expect_match(&Token::End, "if", line)?;
        Ok(Statement::If { arms, else_body })
    }

    fn while_statement(&mut self) -> Result<Statement> {
        let line = self.line();
        self.advance();
        let cond = self.expression()?;
        self.expect(&Token::Do)?;
        let body = self.block()?;
        self.expect_match(&Token::End, "while", line)?;
        Ok(Statement::While { cond, body })
    }

    fn repeat_statement(&mut self) -> Result<Statement> {
        let line = self.line();
        self.advance();
        let body = self.block()?;
        self.expect_match(&Token::Until, "repeat", line)?;
        let cond = self.expression()?;
        Ok(Statement::Repeat { body, cond })
    }

    fn for_statement(&mut self) -> Result<Statement> {
        let line = self.line();
        self.advance();
        let first = self.expect_name()?;

        if self.accept(&Token::Assign) {
            let start = self.expression()?;
            self.expect(&Token::Comma)?;
            let limit = self.expression()?;
            let step = if self.accept(&Token::Comma) {
                Some(self.expression()?)
            } else {
                None
            };
            self.expect(&Token::Do)?;
            let body = self.block()?;
            self.expect_match(&Token::End, "for", line)?;
            return Ok(Statement::NumericFor {
                name: first,
                start,
                limit,
                step,
                body,
            });
        }

        let mut names = vec![first];
        while self.accept(&Token::Comma) {
            names.push(self.expect_name()?);
        }
        if !self.accept(&Token::In) {
            return self.unexpected("'=' or 'in'");
        }
        let exprs = self.expression_list()?;
        self.expect(&Token::Do)?;
        let body = self.block()?;
        self.expect_match(&Token::End, "for", line)?;
        Ok(Statement::GenericFor { names, exprs, body })
    }

    fn function_statement(&mut self) -> Result<Statement> {
        let line = self.line();
        self.advance();
        let base = self.expect_name()?;
        let mut fields = Vec::new();
        while self.accept(&Token::Dot) {
            fields.push(self.expect_name()?);
        }
        let method = if self.accept(&Token::Colon) {
            Some(self.expect_name()?)
        } else {
            None
        };
        let is_method = method.is_some();
        let body = self.function_body(is_method, line)?;
        Ok(Statement::FunctionDecl {
            name: FunctionName {
                base,
                fields,
                method,
            },
            body,
        })
    }

    fn local_statement(&mut self) -> Result<Statement> {
        self.advance();
        if self.accept(&Token::Function) {
            let line = self.line();
            let name = self.expect_name()?;
            let body = self.function_body(false, line)?;
            return Ok(Statement::LocalFunction { name, body });
        }

        let mut names = vec![self.expect_name()?];
        while self.accept(&Token::Comma) {
            names.push(self.expect_name()?);
        }
        let exprs = if self.accept(&Token::Assign) {
            self.expression_list()?
        } else {
            Vec::new()
        };
        Ok(Statement::LocalAssign { names, exprs })
    }

    fn return_statement(&mut self) -> Result<Statement> {
        self.advance();
        let exprs = if self.block_follow() || self.check(&Token::Semicolon) {
            Vec::new()
        } else {
            self.expression_list()?
        };
        Ok(Statement::Return { exprs })
    }

    /// A statement starting with an expression: either a call or an
    /// assignment. Resolved by scanning the prefix expression and looking
    /// at what follows it.
    fn expression_statement(&mut self) -> Result<Statement> {
        let line = self.line();
        let first = self.suffixed_expression()?;

        if !self.check(&Token::Assign) && !self.check(&Token::Comma) {
            if first.value.is_multi_valued() {
                return Ok(Statement::Call(first));
            }
            return Err(parse_error(
                "syntax error: expression is not a statement",
                line,
                self.column(),
            ));
        }

        let mut targets = vec![first];
        while self.accept(&Token::Comma) {
            targets.push(self.suffixed_expression()?);
        }
        for target in &targets {
            if !matches!(
                target.value,
                Expression::Name(_) | Expression::Index { .. } | Expression::Field { .. }
            ) {
                return Err(parse_error(
                    "cannot assign to this expression",
                    target.line,
                    self.column(),
                ));
            }
        }
        self.expect(&Token::Assign)?;
        let exprs = self.expression_list()?;
        Ok(Statement::Assign { targets, exprs })
    }

    fn expression_list(&mut self) -> Result<Vec<Node<Expression>>> {
        let mut exprs = vec![self.expression()?];
        while self.accept(&Token::Comma) {
            exprs.push(self.expression()?);
        }
        Ok(exprs)
    }

    pub(crate) fn expression(&mut self) -> Result<Node<Expression>> {
        self.sub_expression(0)
    }

    /// Precedence climbing: consume operators binding tighter than `limit`
    fn sub_expression(&mut self, limit: u8) -> Result<Node<Expression>> {
        self.enter_level()?;
        let mut lhs = match self.current() {
            Token::Not => self.unary_expression(UnaryOp::Not)?,
            Token::Minus => self.unary_expression(UnaryOp::Neg)?,
            Token::Hash => self.unary_expression(UnaryOp::Len)?,
            _ => self.simple_expression()?,
        };

        while let Some(op) = binary_op_of(self.current()) {
            let (left, right) = binary_priority(op);
            if left <= limit {
                break;
            }
            let line = self.line();
            self.advance();
            let rhs = self.sub_expression(right)?;
            lhs = Node::new(
                Expression::BinaryOp {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            );
        }
        self.leave_level();
        Ok(lhs)
    }

    fn unary_expression(&mut self, op: UnaryOp) -> Result<Node<Expression>> {
        let line = self.line();
        self.advance();
        let operand = self.sub_expression(UNARY_PRIORITY)?;
        Ok(Node::new(
            Expression::UnaryOp {
                op,
                operand: Box::new(operand),
            },
            line,
        ))
    }

    fn simple_expression(&mut self) -> Result<Node<Expression>> {
        let line = self.line();
        let expr = match self.current().clone() {
            Token::Nil => {
                self.advance();
                Expression::Nil
            }
            Token::True => {
                self.advance();
                Expression::Boolean(true)
            }
            Token::False => {
                self.advance();
                Expression::Boolean(false)
            }
            Token::Number(n) => {
                self.advance();
                Expression::Number(n)
            }
            Token::String(s) => {
                self.advance();
                Expression::String(s)
            }
            Token::Ellipsis => {
                self.advance();
                Expression::Vararg
            }
            Token::Function => {
                self.advance();
                Expression::Function(self.function_body(false, line)?)
            }
            Token::LeftBrace => Expression::Table(self.table_constructor()?),
            _ => return self.suffixed_expression(),
        };
        Ok(Node::new(expr, line))
    }

    /// `Name` or a parenthesized expression
    fn primary_expression(&mut self) -> Result<Node<Expression>> {
        let line = self.line();
        match self.current().clone() {
            Token::Name(name) => {
                self.advance();
                Ok(Node::new(Expression::Name(name), line))
            }
            Token::LeftParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect_match(&Token::RightParen, "(", line)?;
                Ok(Node::new(Expression::Paren(Box::new(inner)), line))
            }
            _ => Err(parse_error(
                format!("unexpected symbol near '{}'", self.current()),
                line,
                self.column(),
            )),
        }
    }

    /// A primary expression followed by any chain of `.name`, `[expr]`,
    /// `:name(args)`, and call suffixes
    fn suffixed_expression(&mut self) -> Result<Node<Expression>> {
        let mut expr = self.primary_expression()?;
        loop {
            let line = self.line();
            match self.current() {
                Token::Dot => {
                    self.advance();
                    let name = self.expect_name()?;
                    expr = Node::new(
                        Expression::Field {
                            object: Box::new(expr),
                            name,
                        },
                        line,
                    );
                }
                Token::LeftBracket => {
                    self.advance();
                    let key = self.expression()?;
                    self.expect(&Token::RightBracket)?;
                    expr = Node::new(
                        Expression::Index {
                            object: Box::new(expr),
                            key: Box::new(key),
                        },
                        line,
                    );
                }
                Token::Colon => {
                    self.advance();
                    let method = self.expect_name()?;
                    let args = self.call_arguments()?;
                    expr = Node::new(
                        Expression::MethodCall {
                            object: Box::new(expr),
                            method,
                            args,
                        },
                        line,
                    );
                }
                Token::LeftParen | Token::String(_) | Token::LeftBrace => {
                    let args = self.call_arguments()?;
                    expr = Node::new(
                        Expression::Call {
                            func: Box::new(expr),
                            args,
                        },
                        line,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    /// `(explist)`, a single string literal, or a single table constructor
    fn call_arguments(&mut self) -> Result<Vec<Node<Expression>>> {
        let line = self.line();
        match self.current().clone() {
            Token::LeftParen => {
                self.advance();
                let args = if self.check(&Token::RightParen) {
                    Vec::new()
                } else {
                    self.expression_list()?
                };
                self.expect_match(&Token::RightParen, "(", line)?;
                Ok(args)
            }
            Token::String(s) => {
                self.advance();
                Ok(vec![Node::new(Expression::String(s), line)])
            }
            Token::LeftBrace => {
                let table = self.table_constructor()?;
                Ok(vec![Node::new(Expression::Table(table), line)])
            }
            _ => self.unexpected("function arguments"),
        }
    }

    fn table_constructor(&mut self) -> Result<Vec<TableItem>> {
        let line = self.line();
        self.expect(&Token::LeftBrace)?;
        let mut items = Vec::new();
        while !self.check(&Token::RightBrace) {
            match self.current() {
                Token::LeftBracket => {
                    self.advance();
                    let key = self.expression()?;
                    self.expect(&Token::RightBracket)?;
                    self.expect(&Token::Assign)?;
                    let value = self.expression()?;
                    items.push(TableItem::Computed { key, value });
                }
                Token::Name(name)
                    if matches!(
                        self.tokens.get(self.pos + 1).map(|t| &t.token),
                        Some(Token::Assign)
                    ) =>
                {
                    let name = name.clone();
                    self.advance();
                    self.advance();
                    let value = self.expression()?;
                    items.push(TableItem::Named { name, value });
                }
                _ => {
                    items.push(TableItem::Item(self.expression()?));
                }
            }
            if !self.accept(&Token::Comma) && !self.accept(&Token::Semicolon) {
                break;
            }
        }
        self.expect_match(&Token::RightBrace, "{", line)?;
        Ok(items)
    }

    /// `( parlist ) block end`; a method body gets an implicit leading
    /// `self` parameter
    fn function_body(&mut self, is_method: bool, line: u32) -> Result<FunctionBody> {
        self.enter_level()?;
        self.expect(&Token::LeftParen)?;
        let mut params = Vec::new();
        if is_method {
            params.push("self".to_string());
        }
        let mut is_vararg = false;
        if !self.check(&Token::RightParen) {
            loop {
                if self.accept(&Token::Ellipsis) {
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_name()?);
                if !self.accept(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RightParen)?;
        let body = self.block()?;
        let end_line = self.line();
        self.expect_match(&Token::End, "function", line)?;
        self.leave_level();
        Ok(FunctionBody {
            params,
            is_vararg,
            body,
            end_line,
        })
    }
}

/// Parse an EOF-terminated token stream into the AST of one chunk
pub fn parse(tokens: Vec<TokenWithLocation>) -> Result<Block> {
    Parser::new(tokens).parse_chunk()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_source(source: &str) -> Result<Block> {
        parse(tokenize(source.as_bytes())?)
    }

    fn single_expression(source: &str) -> Expression {
        let block = parse_source(&format!("return {}", source)).unwrap();
        match &block[0].value {
            Statement::Return { exprs } => exprs[0].value.clone(),
            other => panic!("expected return, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        // 2 + 3 * 4 parses as 2 + (3 * 4)
        match single_expression("2 + 3 * 4") {
            Expression::BinaryOp { op, rhs, .. } => {
                assert_eq!(op, BinaryOp::Add);
                assert!(matches!(
                    rhs.value,
                    Expression::BinaryOp {
                        op: BinaryOp::Mul,
                        ..
                    }
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_right_associativity() {
        // 2 ^ 3 ^ 4 parses as 2 ^ (3 ^ 4)
        match single_expression("2 ^ 3 ^ 4") {
            Expression::BinaryOp { op, lhs, rhs } => {
                assert_eq!(op, BinaryOp::Pow);
                assert!(matches!(lhs.value, Expression::Number(_)));
                assert!(matches!(
                    rhs.value,
                    Expression::BinaryOp {
                        op: BinaryOp::Pow,
                        ..
                    }
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
        // a .. b .. c parses as a .. (b .. c)
        match single_expression("1 .. 2 .. 3") {
            Expression::BinaryOp { op, rhs, .. } => {
                assert_eq!(op, BinaryOp::Concat);
                assert!(matches!(
                    rhs.value,
                    Expression::BinaryOp {
                        op: BinaryOp::Concat,
                        ..
                    }
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unary_binds_below_pow() {
        // -x ^ 2 parses as -(x ^ 2)
        match single_expression("-x ^ 2") {
            Expression::UnaryOp { op, operand } => {
                assert_eq!(op, UnaryOp::Neg);
                assert!(matches!(
                    operand.value,
                    Expression::BinaryOp {
                        op: BinaryOp::Pow,
                        ..
                    }
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_paren_marks_adjustment() {
        assert!(matches!(single_expression("(f())"), Expression::Paren(_)));
    }

    #[test]
    fn test_suffix_chain() {
        match single_expression("a.b[1]:m(2)") {
            Expression::MethodCall { object, method, args } => {
                assert_eq!(method, "m");
                assert_eq!(args.len(), 1);
                assert!(matches!(object.value, Expression::Index { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_call_sugar() {
        assert!(matches!(
            single_expression(r#"f"hello""#),
            Expression::Call { args, .. } if args.len() == 1
        ));
        assert!(matches!(
            single_expression("f{1, 2}"),
            Expression::Call { args, .. } if args.len() == 1
        ));
    }

    #[test]
    fn test_call_vs_assignment() {
        let block = parse_source("f(1)\nx = 1\nt[1], y = 2, 3").unwrap();
        assert!(matches!(block[0].value, Statement::Call(_)));
        assert!(matches!(block[1].value, Statement::Assign { .. }));
        match &block[2].value {
            Statement::Assign { targets, exprs } => {
                assert_eq!(targets.len(), 2);
                assert_eq!(exprs.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert!(parse_source("(x) = 1").is_err());
        assert!(parse_source("f() = 1").is_err());
    }

    #[test]
    fn test_method_declaration_gets_self() {
        let block = parse_source("function t.a:m(x) end").unwrap();
        match &block[0].value {
            Statement::FunctionDecl { name, body } => {
                assert_eq!(name.base, "t");
                assert_eq!(name.fields, vec!["a".to_string()]);
                assert_eq!(name.method.as_deref(), Some("m"));
                assert_eq!(body.params, vec!["self".to_string(), "x".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_numeric_vs_generic_for() {
        let block = parse_source("for i = 1, 10 do end\nfor k, v in pairs(t) do end").unwrap();
        assert!(matches!(block[0].value, Statement::NumericFor { .. }));
        match &block[1].value {
            Statement::GenericFor { names, .. } => assert_eq!(names.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_table_constructor_items() {
        match single_expression("{1, x = 2, [3] = 4, 5}") {
            Expression::Table(items) => {
                assert!(matches!(items[0], TableItem::Item(_)));
                assert!(matches!(items[1], TableItem::Named { .. }));
                assert!(matches!(items[2], TableItem::Computed { .. }));
                assert!(matches!(items[3], TableItem::Item(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_return_must_end_block() {
        assert!(parse_source("return 1; x = 2").is_err());
        assert!(parse_source("do return end").is_ok());
    }

    #[test]
    fn test_missing_terminators() {
        assert!(parse_source("if x then").is_err());
        assert!(parse_source("while x do").is_err());
        assert!(parse_source("repeat x()").is_err());
        assert!(parse_source("function f(").is_err());
    }

    #[test]
    fn test_reserved_word_as_name() {
        assert!(parse_source("local end = 1").is_err());
        assert!(parse_source("for while = 1, 2 do end").is_err());
    }

    #[test]
    fn test_depth_guard() {
        let source = format!("return {}1{}", "(".repeat(300), ")".repeat(300));
        assert!(parse_source(&source).is_err());
    }

    #[test]
    fn test_vararg_parameter() {
        let block = parse_source("local f = function(a, b, ...) end").unwrap();
        match &block[0].value {
            Statement::LocalAssign { exprs, .. } => match &exprs[0].value {
                Expression::Function(body) => {
                    assert_eq!(body.params.len(), 2);
                    assert!(body.is_vararg);
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }
}
