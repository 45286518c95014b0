// File: src/parser.rs
//
// Recursive-descent parser for Ember. Consumes the token stream and
// produces the AST in src/ast.rs, reporting syntax errors with line and
// column information. Operator precedence is conventional:
//   ||  &&  == !=  < <= > >=  + -  * / %  unary  call/index/field

use crate::ast::{AssignTarget, Expr, Stmt};
use crate::errors::{EmberError, SourceLocation};
use crate::lexer::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    pub fn parse(&mut self) -> Result<Vec<Stmt>, EmberError> {
        let mut stmts = Vec::new();
        while !self.at_eof() {
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    // === Token helpers ===

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check_punct(&self, c: char) -> bool {
        matches!(&self.peek().kind, TokenKind::Punctuation(p) if *p == c)
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Operator(o) if o == op)
    }

    fn check_keyword(&self, kw: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Keyword(k) if k == kw)
    }

    fn match_punct(&mut self, c: char) -> bool {
        if self.check_punct(c) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn match_keyword(&mut self, kw: &str) -> bool {
        if self.check_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char, context: &str) -> Result<(), EmberError> {
        if self.match_punct(c) {
            Ok(())
        } else {
            Err(self.error_here(format!("Expected '{}' {}", c, context)))
        }
    }

    fn expect_identifier(&mut self, context: &str) -> Result<(String, usize), EmberError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Identifier(name) => Ok((name, token.line)),
            _ => Err(EmberError::syntax(
                format!("Expected identifier {}", context),
                token.location(),
            )),
        }
    }

    fn error_here(&self, message: String) -> EmberError {
        EmberError::syntax(message, self.peek().location())
    }

    fn skip_semicolons(&mut self) {
        while self.match_punct(';') {}
    }

    // === Statements ===

    fn statement(&mut self) -> Result<Stmt, EmberError> {
        let stmt = self.statement_inner()?;
        self.skip_semicolons();
        Ok(stmt)
    }

    fn statement_inner(&mut self) -> Result<Stmt, EmberError> {
        let line = self.peek().line;

        if self.check_keyword("function") {
            // Anonymous functions are expressions; a named definition is
            // a statement. Peek past the keyword to tell them apart.
            if let Some(next) = self.tokens.get(self.pos + 1) {
                if matches!(next.kind, TokenKind::Identifier(_)) {
                    return self.function_statement();
                }
            }
            return self.simple_statement();
        }
        if self.check_keyword("if") {
            return self.if_statement();
        }
        if self.match_keyword("while") {
            let condition = self.expression()?;
            let body = self.block("after while condition")?;
            return Ok(Stmt::While { condition, body, line });
        }
        if self.match_keyword("for") {
            return self.for_statement(line);
        }
        if self.match_keyword("return") {
            let value = if self.check_punct(';') || self.check_punct('}') || self.at_eof() {
                None
            } else {
                Some(self.expression()?)
            };
            return Ok(Stmt::Return { value, line });
        }
        if self.match_keyword("try") {
            return self.try_statement(line);
        }
        if self.match_keyword("throw") {
            let value = self.expression()?;
            return Ok(Stmt::Throw { value, line });
        }
        if self.match_keyword("import") {
            let name = match self.advance() {
                Token { kind: TokenKind::Identifier(name), .. } => name,
                Token { kind: TokenKind::String(name), .. } => name,
                token => {
                    return Err(EmberError::syntax(
                        "Expected module name after 'import'",
                        token.location(),
                    ))
                }
            };
            return Ok(Stmt::Import { name, line });
        }
        if self.match_keyword("break") {
            return Ok(Stmt::Break { line });
        }
        if self.match_keyword("continue") {
            return Ok(Stmt::Continue { line });
        }
        if self.check_punct('{') {
            let body = self.block("at block start")?;
            return Ok(Stmt::Block(body));
        }

        self.simple_statement()
    }

    /// Assignment or expression statement
    fn simple_statement(&mut self) -> Result<Stmt, EmberError> {
        let line = self.peek().line;
        let expr = self.expression()?;

        if self.check_op("=") {
            self.advance();
            let target = match expr {
                Expr::Identifier { name, .. } => AssignTarget::Name(name),
                Expr::Index { object, index, .. } => {
                    AssignTarget::Index { object: *object, index: *index }
                }
                Expr::Field { object, name, .. } => {
                    AssignTarget::Field { object: *object, name }
                }
                _ => {
                    return Err(EmberError::syntax(
                        "Invalid assignment target",
                        SourceLocation::new(line, 1),
                    ))
                }
            };
            let value = self.expression()?;
            return Ok(Stmt::Assign { target, value, line });
        }

        Ok(Stmt::ExprStmt { expr, line })
    }

    fn function_statement(&mut self) -> Result<Stmt, EmberError> {
        let line = self.peek().line;
        self.advance(); // function
        let (name, _) = self.expect_identifier("after 'function'")?;
        let params = self.parameter_list()?;
        let body = self.block("after function parameters")?;
        Ok(Stmt::FuncDef { name, params, body, line })
    }

    fn parameter_list(&mut self) -> Result<Vec<String>, EmberError> {
        self.expect_punct('(', "before parameter list")?;
        let mut params = Vec::new();
        if !self.check_punct(')') {
            loop {
                let (name, _) = self.expect_identifier("in parameter list")?;
                params.push(name);
                if !self.match_punct(',') {
                    break;
                }
            }
        }
        self.expect_punct(')', "after parameter list")?;
        Ok(params)
    }

    fn if_statement(&mut self) -> Result<Stmt, EmberError> {
        let line = self.peek().line;
        self.advance(); // if
        let condition = self.expression()?;

        if self.check_punct('{') {
            let then_branch = self.block("after if condition")?;
            let else_branch = if self.match_keyword("else") {
                if self.check_keyword("if") {
                    Some(vec![self.if_statement()?])
                } else {
                    Some(self.block("after else")?)
                }
            } else {
                None
            };
            return Ok(Stmt::If { condition, then_branch, else_branch, line });
        }

        // No brace: this is the expression form `if c a else b` used as a
        // statement.
        let then_value = self.expression()?;
        if !self.match_keyword("else") {
            return Err(self.error_here(
                "Expected 'else' in if-expression (or '{' for an if statement)".to_string(),
            ));
        }
        let else_value = self.expression()?;
        Ok(Stmt::ExprStmt {
            expr: Expr::IfExpr {
                condition: Box::new(condition),
                then_value: Box::new(then_value),
                else_value: Box::new(else_value),
                line,
            },
            line,
        })
    }

    fn for_statement(&mut self, line: usize) -> Result<Stmt, EmberError> {
        self.expect_punct('(', "after 'for'")?;

        let init = if self.check_punct(';') {
            None
        } else {
            Some(Box::new(self.simple_statement()?))
        };
        self.expect_punct(';', "after for-loop initializer")?;

        let condition = if self.check_punct(';') { None } else { Some(self.expression()?) };
        self.expect_punct(';', "after for-loop condition")?;

        let step = if self.check_punct(')') {
            None
        } else {
            Some(Box::new(self.simple_statement()?))
        };
        self.expect_punct(')', "after for-loop clauses")?;

        let body = self.block("after for-loop header")?;
        Ok(Stmt::For { init, condition, step, body, line })
    }

    fn try_statement(&mut self, line: usize) -> Result<Stmt, EmberError> {
        let try_block = self.block("after 'try'")?;

        let (catch_var, catch_block) = if self.match_keyword("catch") {
            self.expect_punct('(', "after 'catch'")?;
            let (name, _) = self.expect_identifier("as catch binding")?;
            self.expect_punct(')', "after catch binding")?;
            let block = self.block("after catch binding")?;
            (Some(name), Some(block))
        } else {
            (None, None)
        };

        let finally_block = if self.match_keyword("finally") {
            Some(self.block("after 'finally'")?)
        } else {
            None
        };

        if catch_block.is_none() && finally_block.is_none() {
            return Err(EmberError::syntax(
                "try requires a catch or finally block",
                SourceLocation::new(line, 1),
            ));
        }

        Ok(Stmt::Try { try_block, catch_var, catch_block, finally_block, line })
    }

    fn block(&mut self, context: &str) -> Result<Vec<Stmt>, EmberError> {
        self.expect_punct('{', context)?;
        let mut stmts = Vec::new();
        while !self.check_punct('}') {
            if self.at_eof() {
                return Err(self.error_here("Unterminated block: expected '}'".to_string()));
            }
            stmts.push(self.statement()?);
        }
        self.advance(); // }
        Ok(stmts)
    }

    // === Expressions ===

    pub fn expression(&mut self) -> Result<Expr, EmberError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, EmberError> {
        let mut left = self.and_expr()?;
        while self.check_op("||") || self.check_keyword("or") {
            let line = self.peek().line;
            self.advance();
            let right = self.and_expr()?;
            left = Expr::Logical {
                left: Box::new(left),
                op: "||".to_string(),
                right: Box::new(right),
                line,
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, EmberError> {
        let mut left = self.equality()?;
        while self.check_op("&&") || self.check_keyword("and") {
            let line = self.peek().line;
            self.advance();
            let right = self.equality()?;
            left = Expr::Logical {
                left: Box::new(left),
                op: "&&".to_string(),
                right: Box::new(right),
                line,
            };
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, EmberError> {
        let mut left = self.comparison()?;
        while self.check_op("==") || self.check_op("!=") {
            let line = self.peek().line;
            let op = match self.advance().kind {
                TokenKind::Operator(op) => op,
                _ => unreachable!(),
            };
            let right = self.comparison()?;
            left = Expr::Binary { left: Box::new(left), op, right: Box::new(right), line };
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, EmberError> {
        let mut left = self.term()?;
        while self.check_op("<") || self.check_op("<=") || self.check_op(">") || self.check_op(">=")
        {
            let line = self.peek().line;
            let op = match self.advance().kind {
                TokenKind::Operator(op) => op,
                _ => unreachable!(),
            };
            let right = self.term()?;
            left = Expr::Binary { left: Box::new(left), op, right: Box::new(right), line };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, EmberError> {
        let mut left = self.factor()?;
        while self.check_op("+") || self.check_op("-") {
            let line = self.peek().line;
            let op = match self.advance().kind {
                TokenKind::Operator(op) => op,
                _ => unreachable!(),
            };
            let right = self.factor()?;
            left = Expr::Binary { left: Box::new(left), op, right: Box::new(right), line };
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, EmberError> {
        let mut left = self.unary()?;
        while self.check_op("*") || self.check_op("/") || self.check_op("%") {
            let line = self.peek().line;
            let op = match self.advance().kind {
                TokenKind::Operator(op) => op,
                _ => unreachable!(),
            };
            let right = self.unary()?;
            left = Expr::Binary { left: Box::new(left), op, right: Box::new(right), line };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EmberError> {
        if self.check_op("-") || self.check_op("!") || self.check_keyword("not") {
            let line = self.peek().line;
            let op = match self.advance().kind {
                TokenKind::Operator(op) => op,
                TokenKind::Keyword(_) => "!".to_string(),
                _ => unreachable!(),
            };
            let operand = self.unary()?;
            return Ok(Expr::Unary { op, operand: Box::new(operand), line });
        }
        self.postfix()
    }

    /// Calls, indexing, and field access bind tightest
    fn postfix(&mut self) -> Result<Expr, EmberError> {
        let mut expr = self.primary()?;
        loop {
            let line = self.peek().line;
            if self.match_punct('(') {
                let mut args = Vec::new();
                if !self.check_punct(')') {
                    loop {
                        args.push(self.expression()?);
                        if !self.match_punct(',') {
                            break;
                        }
                    }
                }
                self.expect_punct(')', "after call arguments")?;
                expr = Expr::Call { callee: Box::new(expr), args, line };
            } else if self.match_punct('[') {
                let index = self.expression()?;
                self.expect_punct(']', "after index expression")?;
                expr = Expr::Index { object: Box::new(expr), index: Box::new(index), line };
            } else if self.match_punct('.') {
                let (name, _) = self.expect_identifier("after '.'")?;
                expr = Expr::Field { object: Box::new(expr), name, line };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, EmberError> {
        let token = self.advance();
        let line = token.line;
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::String(s) => Ok(Expr::String(s)),
            TokenKind::Identifier(name) => Ok(Expr::Identifier { name, line }),
            TokenKind::Keyword(ref kw) => match kw.as_str() {
                "nil" => Ok(Expr::Nil),
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "if" => {
                    let condition = self.expression()?;
                    let then_value = self.expression()?;
                    if !self.match_keyword("else") {
                        return Err(self
                            .error_here("Expected 'else' in if-expression".to_string()));
                    }
                    let else_value = self.expression()?;
                    Ok(Expr::IfExpr {
                        condition: Box::new(condition),
                        then_value: Box::new(then_value),
                        else_value: Box::new(else_value),
                        line,
                    })
                }
                "function" => {
                    let params = self.parameter_list()?;
                    let body = self.block("after function parameters")?;
                    Ok(Expr::Function { params, body, line })
                }
                other => Err(EmberError::syntax(
                    format!("Unexpected keyword '{}'", other),
                    token.location(),
                )),
            },
            TokenKind::Punctuation('(') => {
                let expr = self.expression()?;
                self.expect_punct(')', "after grouped expression")?;
                Ok(expr)
            }
            TokenKind::Punctuation('[') => {
                let mut elements = Vec::new();
                if !self.check_punct(']') {
                    loop {
                        elements.push(self.expression()?);
                        if !self.match_punct(',') {
                            break;
                        }
                    }
                }
                self.expect_punct(']', "after array elements")?;
                Ok(Expr::Array { elements, line })
            }
            TokenKind::Punctuation('{') => {
                let mut entries = Vec::new();
                if !self.check_punct('}') {
                    loop {
                        let key = self.map_key()?;
                        self.expect_punct(':', "after map key")?;
                        let value = self.expression()?;
                        entries.push((key, value));
                        if !self.match_punct(',') {
                            break;
                        }
                    }
                }
                self.expect_punct('}', "after map entries")?;
                Ok(Expr::Map { entries, line })
            }
            _ => Err(EmberError::syntax(
                "Unexpected token in expression",
                token.location(),
            )),
        }
    }

    /// Map keys: bare identifiers mean string keys; numbers and strings
    /// are literal keys; `[expr]` is a computed key.
    fn map_key(&mut self) -> Result<Expr, EmberError> {
        if self.check_punct('[') {
            self.advance();
            let key = self.expression()?;
            self.expect_punct(']', "after computed map key")?;
            return Ok(key);
        }
        let token = self.advance();
        match token.kind {
            TokenKind::Identifier(name) => Ok(Expr::String(name)),
            TokenKind::String(s) => Ok(Expr::String(s)),
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            _ => Err(EmberError::syntax("Invalid map key", token.location())),
        }
    }
}
