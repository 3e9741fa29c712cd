//! Recursive-descent parser with precedence climbing for expressions.
//!
//! On a syntax error the parser reports through a [`DiagnosticSink`] and
//! synchronizes at the next statement boundary rather than aborting
//! immediately, so one source can surface more than one diagnostic; if any
//! error was reported, [`Parser::parse_program`] still returns the partial
//! tree but the caller (the compiler) treats the whole unit as failed.

use crate::arena::Arena;
use crate::ast::{
    ClassDecl, ExceptClause, Expr, For, Foreach, FunLit, If, Import, ImportBinding, ImportKind, MethodDecl, Params,
    Stmt, Try, VarDecl, While, With,
};
use crate::ast::{BinaryOp, LogicalOp, UnaryOp};
use crate::diagnostics::{CompileError, DiagnosticSink};
use crate::lexer::{Lexer, Token, TokenKind};

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Loop,
    Try,
}

pub struct Parser<'a, S: DiagnosticSink> {
    lexer: Lexer<'a>,
    arena: &'a Arena,
    file: String,
    current: Token<'a>,
    previous: Token<'a>,
    sink: &'a mut S,
    had_error: bool,
    panic_mode: bool,
    scopes: Vec<ScopeKind>,
}

impl<'a, S: DiagnosticSink> Parser<'a, S> {
    #[must_use]
    pub fn new(src: &'a str, file: impl Into<String>, arena: &'a Arena, sink: &'a mut S) -> Self {
        let mut lexer = Lexer::new(src);
        let first = lexer.next_token();
        Self {
            lexer,
            arena,
            file: file.into(),
            current: first,
            previous: first,
            sink,
            had_error: false,
            panic_mode: false,
            scopes: Vec::new(),
        }
    }

    #[must_use]
    pub fn had_error(&self) -> bool {
        self.had_error
    }

    /// Parses the whole source as a sequence of statements. Returns `None`
    /// if any syntax error was reported, signalling compile failure as §4.3
    /// requires.
    pub fn parse_program(&mut self) -> Option<&'a [Stmt<'a>]> {
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !self.check(TokenKind::Eof) {
            if let Some(stmt) = self.declaration() {
                stmts.push(stmt);
            }
            self.skip_newlines();
        }
        if self.had_error {
            return None;
        }
        Some(self.arena.alloc_slice(stmts.len(), |i| stmts[i]))
    }

    // --- token plumbing ---

    fn advance(&mut self) -> Token<'a> {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Err {
                break;
            }
            self.error_at_current("unexpected character");
        }
        self.previous
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, message: &str) -> Token<'a> {
        if self.check(kind) {
            return self.advance();
        }
        self.error_at_current(message);
        self.current
    }

    fn skip_newlines(&mut self) {
        while self.matches(TokenKind::Newline) || self.matches(TokenKind::Semicolon) {}
    }

    fn end_of_statement(&mut self) {
        if self.check(TokenKind::Eof) || self.check(TokenKind::RBrace) {
            return;
        }
        if !self.matches(TokenKind::Newline) {
            self.matches(TokenKind::Semicolon);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current.line, message);
    }

    fn error_at_previous(&mut self, message: &str) {
        self.error_at(self.previous.line, message);
    }

    fn error_at(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.sink.report(CompileError::new(self.file.clone(), line, message.to_string()));
    }

    /// Resynchronizes at the next statement boundary after a syntax error,
    /// so a single malformed statement does not abort the whole parse.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Newline || self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Native
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Import
                | TokenKind::Try
                | TokenKind::Raise => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // --- declarations / statements ---

    fn declaration(&mut self) -> Option<Stmt<'a>> {
        let stmt = if self.matches(TokenKind::Var) {
            self.var_decl()
        } else if self.matches(TokenKind::Fun) {
            self.fun_decl()
        } else if self.matches(TokenKind::Native) {
            self.native_decl()
        } else if self.matches(TokenKind::Class) {
            self.class_decl()
        } else {
            self.statement()
        };
        if self.panic_mode {
            self.synchronize();
        }
        stmt
    }

    fn block(&mut self) -> &'a [Stmt<'a>] {
        self.expect(TokenKind::LBrace, "expected '{' to start a block");
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            if let Some(stmt) = self.declaration() {
                stmts.push(stmt);
            }
            self.skip_newlines();
        }
        self.expect(TokenKind::RBrace, "expected '}' to close a block");
        self.arena.alloc_slice(stmts.len(), |i| stmts[i])
    }

    fn ident_name(&mut self, message: &str) -> &'a str {
        let tok = self.expect(TokenKind::Ident, message);
        self.arena.alloc_str(tok.lexeme)
    }

    fn var_decl(&mut self) -> Option<Stmt<'a>> {
        let mut targets = vec![self.ident_name("expected variable name")];
        while self.matches(TokenKind::Comma) {
            targets.push(self.ident_name("expected variable name"));
        }
        let value = if self.matches(TokenKind::Eq) { Some(self.expression()) } else { None };
        self.end_of_statement();
        let targets = self.arena.alloc_slice(targets.len(), |i| targets[i]);
        Some(Stmt::VarDecl(VarDecl { targets, value }))
    }

    fn params(&mut self) -> Params<'a> {
        self.expect(TokenKind::LParen, "expected '(' to start a parameter list");
        let mut names = Vec::new();
        let mut defaults = Vec::new();
        let mut variadic = false;
        if !self.check(TokenKind::RParen) {
            loop {
                let is_variadic = self.matches(TokenKind::DotDotDot);
                let name = self.ident_name("expected parameter name");
                names.push(name);
                if is_variadic {
                    variadic = true;
                    defaults.push(None);
                    break;
                }
                if self.matches(TokenKind::Eq) {
                    defaults.push(Some(self.expression()));
                } else {
                    defaults.push(None);
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "expected ')' to close a parameter list");
        Params {
            names: self.arena.alloc_slice(names.len(), |i| names[i]),
            defaults: self.arena.alloc_slice(defaults.len(), |i| defaults[i]),
            variadic,
        }
    }

    fn body_is_generator(body: &[Stmt<'_>]) -> bool {
        fn expr_has_yield(e: &Expr<'_>) -> bool {
            match e {
                Expr::Yield(_) => true,
                Expr::Unary(_, a) => expr_has_yield(a),
                Expr::Binary(_, a, b) | Expr::Logical(_, a, b) | Expr::Assign(a, b) | Expr::CompoundAssign(_, a, b) => {
                    expr_has_yield(a) || expr_has_yield(b)
                }
                Expr::Call(c, args) => expr_has_yield(c) || args.iter().any(expr_has_yield),
                Expr::GetField(r, _) => expr_has_yield(r),
                Expr::Subscript(r, i) => expr_has_yield(r) || expr_has_yield(i),
                Expr::List(items) | Expr::Tuple(items) => items.iter().any(expr_has_yield),
                Expr::Table(pairs) => pairs.iter().any(|(k, v)| expr_has_yield(k) || expr_has_yield(v)),
                _ => false,
            }
        }
        fn stmt_has_yield(s: &Stmt<'_>) -> bool {
            match s {
                Stmt::Expr(e) | Stmt::Raise(e) => expr_has_yield(e),
                Stmt::VarDecl(v) => v.value.as_ref().is_some_and(expr_has_yield),
                Stmt::Return(e) => e.as_ref().is_some_and(expr_has_yield),
                Stmt::Block(b) => b.iter().any(stmt_has_yield),
                Stmt::If(i) => {
                    expr_has_yield(&i.cond)
                        || i.then_branch.iter().any(stmt_has_yield)
                        || i.elifs.iter().any(|(c, b)| expr_has_yield(c) || b.iter().any(stmt_has_yield))
                        || i.else_branch.is_some_and(|b| b.iter().any(stmt_has_yield))
                }
                Stmt::While(w) => expr_has_yield(&w.cond) || w.body.iter().any(stmt_has_yield),
                Stmt::For(f) => f.body.iter().any(stmt_has_yield),
                Stmt::Foreach(f) => expr_has_yield(&f.iterable) || f.body.iter().any(stmt_has_yield),
                Stmt::Try(t) => {
                    t.body.iter().any(stmt_has_yield)
                        || t.excepts.iter().any(|e| e.body.iter().any(stmt_has_yield))
                        || t.ensure.is_some_and(|b| b.iter().any(stmt_has_yield))
                }
                Stmt::With(w) => expr_has_yield(&w.expr) || w.body.iter().any(stmt_has_yield),
                _ => false,
            }
        }
        body.iter().any(stmt_has_yield)
    }

    fn fun_decl(&mut self) -> Option<Stmt<'a>> {
        let name = self.ident_name("expected function name");
        let params = self.params();
        let body = self.block();
        let is_generator = Self::body_is_generator(body);
        let fun = self.arena.alloc(FunLit { name: Some(name), params, body, is_generator });
        Some(Stmt::FunDecl(fun))
    }

    fn native_decl(&mut self) -> Option<Stmt<'a>> {
        self.matches(TokenKind::Fun);
        let name = self.ident_name("expected native function name");
        let params = self.params();
        self.end_of_statement();
        Some(Stmt::NativeDecl { name, params })
    }

    fn class_decl(&mut self) -> Option<Stmt<'a>> {
        let name = self.ident_name("expected class name");
        let superclass = if self.matches(TokenKind::Is) { Some(self.ident_name("expected superclass name")) } else { None };
        self.expect(TokenKind::LBrace, "expected '{' to start a class body");
        let mut methods = Vec::new();
        self.skip_newlines();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            let is_static = self.matches(TokenKind::Static);
            if self.matches(TokenKind::Construct) {
                let params = self.params();
                let body = self.block();
                methods.push(MethodDecl { name: "construct", params, body, is_static: false, is_generator: false, native: false });
            } else if self.matches(TokenKind::Native) {
                self.expect(TokenKind::Fun, "expected 'fun' after 'native' in a method declaration");
                let name = self.ident_name("expected method name");
                let params = self.params();
                self.end_of_statement();
                methods.push(MethodDecl { name, params, body: &[], is_static, is_generator: false, native: true });
            } else {
                self.expect(TokenKind::Fun, "expected a method declaration");
                let name = self.ident_name("expected method name");
                let params = self.params();
                let body = self.block();
                let is_generator = Self::body_is_generator(body);
                methods.push(MethodDecl { name, params, body, is_static, is_generator, native: false });
            }
            self.skip_newlines();
        }
        self.expect(TokenKind::RBrace, "expected '}' to close a class body");
        let methods = self.arena.alloc_slice(methods.len(), |i| methods[i]);
        let class = self.arena.alloc(ClassDecl { name, superclass, methods });
        Some(Stmt::ClassDecl(class))
    }

    fn statement(&mut self) -> Option<Stmt<'a>> {
        if self.matches(TokenKind::If) {
            self.if_stmt()
        } else if self.matches(TokenKind::While) {
            self.while_stmt()
        } else if self.matches(TokenKind::For) {
            self.for_or_foreach_stmt()
        } else if self.matches(TokenKind::Return) {
            self.return_stmt()
        } else if self.matches(TokenKind::Break) {
            self.break_stmt()
        } else if self.matches(TokenKind::Continue) {
            self.continue_stmt()
        } else if self.matches(TokenKind::Import) {
            self.import_stmt()
        } else if self.matches(TokenKind::Try) {
            self.try_stmt()
        } else if self.matches(TokenKind::Raise) {
            self.raise_stmt()
        } else if self.matches(TokenKind::With) {
            self.with_stmt()
        } else if self.check(TokenKind::LBrace) {
            Some(Stmt::Block(self.block()))
        } else {
            self.expr_stmt()
        }
    }

    fn expr_stmt(&mut self) -> Option<Stmt<'a>> {
        let expr = self.expression();
        self.end_of_statement();
        Some(Stmt::Expr(expr))
    }

    fn if_stmt(&mut self) -> Option<Stmt<'a>> {
        let cond = self.expression();
        let then_branch = self.block();
        let mut elifs = Vec::new();
        while self.matches(TokenKind::Elif) {
            let c = self.expression();
            let b = self.block();
            elifs.push((c, b));
        }
        let else_branch = if self.matches(TokenKind::Else) { Some(self.block()) } else { None };
        let elifs = self.arena.alloc_slice(elifs.len(), |i| elifs[i]);
        let node = self.arena.alloc(If { cond, then_branch, elifs, else_branch });
        Some(Stmt::If(node))
    }

    fn while_stmt(&mut self) -> Option<Stmt<'a>> {
        let cond = self.expression();
        self.scopes.push(ScopeKind::Loop);
        let body = self.block();
        self.scopes.pop();
        let node = self.arena.alloc(While { cond, body });
        Some(Stmt::While(node))
    }

    fn for_or_foreach_stmt(&mut self) -> Option<Stmt<'a>> {
        if self.matches(TokenKind::Var) {
            let mut vars = vec![self.ident_name("expected loop variable name")];
            while self.matches(TokenKind::Comma) {
                vars.push(self.ident_name("expected loop variable name"));
            }
            if self.matches(TokenKind::In) {
                let iterable = self.expression();
                self.scopes.push(ScopeKind::Loop);
                let body = self.block();
                self.scopes.pop();
                let vars = self.arena.alloc_slice(vars.len(), |i| vars[i]);
                let node = self.arena.alloc(Foreach { vars, iterable, body });
                return Some(Stmt::Foreach(node));
            }
            // Not a foreach: fall through to a classic C-style `for` whose
            // init clause is this var declaration.
            let value = if self.matches(TokenKind::Eq) { Some(self.expression()) } else { None };
            let vars = self.arena.alloc_slice(vars.len(), |i| vars[i]);
            self.expect(TokenKind::Semicolon, "expected ';' after for-loop initializer");
            let init = self.arena.alloc(Stmt::VarDecl(VarDecl { targets: vars, value }));
            return self.classic_for(Some(init));
        }
        if self.check(TokenKind::Semicolon) {
            return self.classic_for(None);
        }
        let init_expr = self.expression();
        self.expect(TokenKind::Semicolon, "expected ';' after for-loop initializer");
        let init = self.arena.alloc(Stmt::Expr(init_expr));
        self.classic_for(Some(init))
    }

    fn classic_for(&mut self, init: Option<&'a Stmt<'a>>) -> Option<Stmt<'a>> {
        let cond = if self.check(TokenKind::Semicolon) { None } else { Some(self.expression()) };
        self.expect(TokenKind::Semicolon, "expected ';' after for-loop condition");
        let post = if self.check(TokenKind::LBrace) {
            None
        } else {
            let e = self.expression();
            Some(&*self.arena.alloc(Stmt::Expr(e)))
        };
        self.scopes.push(ScopeKind::Loop);
        let body = self.block();
        self.scopes.pop();
        let node = self.arena.alloc(For { init, cond, post, body });
        Some(Stmt::For(node))
    }

    fn return_stmt(&mut self) -> Option<Stmt<'a>> {
        let value = if self.check(TokenKind::Newline) || self.check(TokenKind::Semicolon) || self.check(TokenKind::RBrace)
        {
            None
        } else {
            Some(self.expression())
        };
        self.end_of_statement();
        Some(Stmt::Return(value))
    }

    fn break_stmt(&mut self) -> Option<Stmt<'a>> {
        self.check_loop_crossing("break");
        self.end_of_statement();
        Some(Stmt::Break)
    }

    fn continue_stmt(&mut self) -> Option<Stmt<'a>> {
        self.check_loop_crossing("continue");
        self.end_of_statement();
        Some(Stmt::Continue)
    }

    /// Enforces "exiting across an active try/ensure is a compile error":
    /// walks the enclosing-scope stack from innermost outward, erroring if a
    /// `try` scope is crossed before a `loop` scope is found.
    fn check_loop_crossing(&mut self, keyword: &str) {
        let mut saw_try = false;
        let mut found_loop = false;
        for scope in self.scopes.iter().rev() {
            match scope {
                ScopeKind::Loop => {
                    found_loop = true;
                    break;
                }
                ScopeKind::Try => saw_try = true,
            }
        }
        if !found_loop {
            self.error_at_previous(&format!("'{keyword}' used outside of a loop"));
        } else if saw_try {
            self.error_at_previous(&format!("cannot '{keyword}' across an active try block"));
        }
    }

    fn dotted_path(&mut self) -> Vec<&'a str> {
        let mut path = vec![self.ident_name("expected module name")];
        while self.matches(TokenKind::Dot) {
            path.push(self.ident_name("expected module name component"));
        }
        path
    }

    fn import_stmt(&mut self) -> Option<Stmt<'a>> {
        let path = self.dotted_path();
        let kind = if self.matches(TokenKind::As) {
            let alias = self.ident_name("expected alias after 'as'");
            ImportKind::Module { alias: Some(alias) }
        } else if self.matches(TokenKind::For) {
            let mut bindings = Vec::new();
            loop {
                let name = self.ident_name("expected imported name");
                let alias = if self.matches(TokenKind::As) { Some(self.ident_name("expected alias after 'as'")) } else { None };
                bindings.push(ImportBinding { name, alias });
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            ImportKind::Names(self.arena.alloc_slice(bindings.len(), |i| bindings[i]))
        } else {
            ImportKind::Module { alias: None }
        };
        self.end_of_statement();
        let path = self.arena.alloc_slice(path.len(), |i| path[i]);
        let import = self.arena.alloc(Import { path, kind });
        Some(Stmt::Import(import))
    }

    fn try_stmt(&mut self) -> Option<Stmt<'a>> {
        self.scopes.push(ScopeKind::Try);
        let body = self.block();
        self.scopes.pop();
        let mut excepts = Vec::new();
        while self.matches(TokenKind::Except) {
            let class_name = self.ident_name("expected exception class name");
            let binding = if self.check(TokenKind::Ident) { Some(self.advance().lexeme) } else { None };
            let binding = binding.map(|b| &*self.arena.alloc_str(b));
            let body = self.block();
            excepts.push(ExceptClause { class_name, binding, body });
        }
        let ensure = if self.matches(TokenKind::Ensure) { Some(self.block()) } else { None };
        if excepts.is_empty() && ensure.is_none() {
            self.error_at_previous("expected 'except' or 'ensure' after 'try' block");
        }
        let excepts = self.arena.alloc_slice(excepts.len(), |i| excepts[i]);
        let node = self.arena.alloc(Try { body, excepts, ensure });
        Some(Stmt::Try(node))
    }

    fn raise_stmt(&mut self) -> Option<Stmt<'a>> {
        let expr = self.expression();
        self.end_of_statement();
        Some(Stmt::Raise(expr))
    }

    fn with_stmt(&mut self) -> Option<Stmt<'a>> {
        let binding = self.ident_name("expected binding name after 'with'");
        self.expect(TokenKind::Eq, "expected '=' after a 'with' binding name");
        let expr = self.expression();
        let body = self.block();
        let node = self.arena.alloc(With { binding, expr, body });
        Some(Stmt::With(node))
    }

    // --- expressions ---

    fn expression(&mut self) -> Expr<'a> {
        self.assignment()
    }

    fn assignment(&mut self) -> Expr<'a> {
        let expr = self.or_expr();
        if self.matches(TokenKind::Eq) {
            let value = self.assignment();
            return Expr::Assign(self.arena.alloc(expr), self.arena.alloc(value));
        }
        let op = match self.current.kind {
            TokenKind::PlusEq => Some(BinaryOp::Add),
            TokenKind::MinusEq => Some(BinaryOp::Sub),
            TokenKind::StarEq => Some(BinaryOp::Mul),
            TokenKind::SlashEq => Some(BinaryOp::Div),
            TokenKind::PercentEq => Some(BinaryOp::Mod),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let value = self.assignment();
            return Expr::CompoundAssign(op, self.arena.alloc(expr), self.arena.alloc(value));
        }
        expr
    }

    fn or_expr(&mut self) -> Expr<'a> {
        let mut expr = self.and_expr();
        while self.matches(TokenKind::Or) {
            let rhs = self.and_expr();
            expr = Expr::Logical(LogicalOp::Or, self.arena.alloc(expr), self.arena.alloc(rhs));
        }
        expr
    }

    fn and_expr(&mut self) -> Expr<'a> {
        let mut expr = self.equality();
        while self.matches(TokenKind::And) {
            let rhs = self.equality();
            expr = Expr::Logical(LogicalOp::And, self.arena.alloc(expr), self.arena.alloc(rhs));
        }
        expr
    }

    fn equality(&mut self) -> Expr<'a> {
        let mut expr = self.comparison();
        loop {
            let op = match self.current.kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::BangEq => BinaryOp::Ne,
                TokenKind::Is => BinaryOp::Is,
                _ => break,
            };
            self.advance();
            let rhs = self.comparison();
            expr = Expr::Binary(op, self.arena.alloc(expr), self.arena.alloc(rhs));
        }
        expr
    }

    fn comparison(&mut self) -> Expr<'a> {
        let mut expr = self.term();
        loop {
            let op = match self.current.kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::LtEq => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::GtEq => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.term();
            expr = Expr::Binary(op, self.arena.alloc(expr), self.arena.alloc(rhs));
        }
        expr
    }

    fn term(&mut self) -> Expr<'a> {
        let mut expr = self.factor();
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.factor();
            expr = Expr::Binary(op, self.arena.alloc(expr), self.arena.alloc(rhs));
        }
        expr
    }

    fn factor(&mut self) -> Expr<'a> {
        let mut expr = self.power();
        loop {
            let op = match self.current.kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.power();
            expr = Expr::Binary(op, self.arena.alloc(expr), self.arena.alloc(rhs));
        }
        expr
    }

    /// `**` is right-associative, unlike the other binary operators.
    fn power(&mut self) -> Expr<'a> {
        let base = self.unary();
        if self.matches(TokenKind::StarStar) {
            let exp = self.power();
            return Expr::Binary(BinaryOp::Pow, self.arena.alloc(base), self.arena.alloc(exp));
        }
        base
    }

    fn unary(&mut self) -> Expr<'a> {
        if self.matches(TokenKind::Minus) {
            let operand = self.unary();
            return Expr::Unary(UnaryOp::Neg, self.arena.alloc(operand));
        }
        if self.matches(TokenKind::Bang) {
            let operand = self.unary();
            return Expr::Unary(UnaryOp::Not, self.arena.alloc(operand));
        }
        if self.matches(TokenKind::Yield) {
            let operand = self.unary();
            return Expr::Yield(self.arena.alloc(operand));
        }
        self.call_postfix()
    }

    fn call_postfix(&mut self) -> Expr<'a> {
        let mut expr = self.primary();
        loop {
            if self.matches(TokenKind::LParen) {
                let args = self.arguments();
                expr = Expr::Call(self.arena.alloc(expr), args);
            } else if self.matches(TokenKind::Dot) {
                let name = self.ident_name("expected property name after '.'");
                expr = Expr::GetField(self.arena.alloc(expr), name);
            } else if self.matches(TokenKind::LBracket) {
                let index = self.expression();
                self.expect(TokenKind::RBracket, "expected ']' after subscript index");
                expr = Expr::Subscript(self.arena.alloc(expr), self.arena.alloc(index));
            } else {
                break;
            }
        }
        expr
    }

    fn arguments(&mut self) -> &'a [Expr<'a>] {
        let mut args = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                args.push(self.expression());
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "expected ')' after call arguments");
        self.arena.alloc_slice(args.len(), |i| args[i])
    }

    fn primary(&mut self) -> Expr<'a> {
        if self.matches(TokenKind::True) {
            return Expr::Bool(true);
        }
        if self.matches(TokenKind::False) {
            return Expr::Bool(false);
        }
        if self.matches(TokenKind::Null) {
            return Expr::Null;
        }
        if self.matches(TokenKind::This) {
            return Expr::This;
        }
        if self.matches(TokenKind::Super) {
            let name = if self.matches(TokenKind::Dot) { Some(self.ident_name("expected method name after 'super.'")) } else { None };
            return Expr::Super(name);
        }
        if self.check(TokenKind::Number) {
            let tok = self.advance();
            return Expr::Number(parse_number(tok.lexeme));
        }
        if self.check(TokenKind::Str) {
            let tok = self.advance();
            return Expr::Str(self.arena.alloc_str(tok.lexeme));
        }
        if self.check(TokenKind::Ident) {
            let tok = self.advance();
            return Expr::Ident(self.arena.alloc_str(tok.lexeme));
        }
        if self.matches(TokenKind::Fun) {
            let params = self.params();
            let body = self.block();
            let is_generator = Self::body_is_generator(body);
            let fun = self.arena.alloc(FunLit { name: None, params, body, is_generator });
            return Expr::Fun(fun);
        }
        if self.matches(TokenKind::LBracket) {
            return self.list_literal();
        }
        if self.matches(TokenKind::LBrace) {
            return self.table_literal();
        }
        if self.matches(TokenKind::LParen) {
            return self.paren_or_tuple();
        }
        self.error_at_current("expected an expression");
        self.advance();
        Expr::Null
    }

    fn list_literal(&mut self) -> Expr<'a> {
        let mut items = Vec::new();
        self.skip_newlines();
        if !self.check(TokenKind::RBracket) {
            loop {
                self.skip_newlines();
                items.push(self.expression());
                self.skip_newlines();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.skip_newlines();
        self.expect(TokenKind::RBracket, "expected ']' after list elements");
        Expr::List(self.arena.alloc_slice(items.len(), |i| items[i]))
    }

    fn table_literal(&mut self) -> Expr<'a> {
        let mut pairs = Vec::new();
        self.skip_newlines();
        if !self.check(TokenKind::RBrace) {
            loop {
                self.skip_newlines();
                let key = self.expression();
                self.expect(TokenKind::Colon, "expected ':' after a table key");
                let value = self.expression();
                pairs.push((key, value));
                self.skip_newlines();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.skip_newlines();
        self.expect(TokenKind::RBrace, "expected '}' after table entries");
        Expr::Table(self.arena.alloc_slice(pairs.len(), |i| pairs[i]))
    }

    fn paren_or_tuple(&mut self) -> Expr<'a> {
        if self.matches(TokenKind::RParen) {
            return Expr::Tuple(&[]);
        }
        let first = self.expression();
        if self.matches(TokenKind::Comma) {
            let mut items = vec![first];
            if !self.check(TokenKind::RParen) {
                loop {
                    items.push(self.expression());
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                    if self.check(TokenKind::RParen) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RParen, "expected ')' after tuple elements");
            return Expr::Tuple(self.arena.alloc_slice(items.len(), |i| items[i]));
        }
        self.expect(TokenKind::RParen, "expected ')' after a parenthesized expression");
        first
    }
}

fn parse_number(lexeme: &str) -> f64 {
    if let Some(hex) = lexeme.strip_prefix("0x").or_else(|| lexeme.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map(|v| v as f64).unwrap_or(f64::NAN);
    }
    lexeme.parse().unwrap_or(f64::NAN)
}

/// Extension used only by the parser: interning raw source slices into the
/// arena so the returned AST does not borrow from a `&str` with a shorter
/// lifetime than the arena itself.
trait ArenaStrExt {
    fn alloc_str<'a>(&'a self, s: &str) -> &'a str;
}

impl ArenaStrExt for Arena {
    fn alloc_str<'a>(&'a self, s: &str) -> &'a str {
        let bytes = self.alloc_slice(s.len(), |i| s.as_bytes()[i]);
        std::str::from_utf8(bytes).expect("source text is valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;

    fn parse(src: &str) -> (bool, usize) {
        let arena = Arena::new();
        let mut sink = CollectingSink::default();
        let mut parser = Parser::new(src, "<test>", &arena, &mut sink);
        let prog = parser.parse_program();
        (prog.is_some(), sink.errors.len())
    }

    #[test]
    fn parses_closure_example() {
        let (ok, errs) =
            parse("fun mk() { var x = 1; fun inc() { x = x + 1; return x } return inc } var c = mk(); print(c())");
        assert!(ok, "errors: {errs}");
    }

    #[test]
    fn parses_class_with_superclass_and_methods() {
        let (ok, _) = parse("class R is Base { construct(n) { this.n = n } fun __iter__(s) { return s } }");
        assert!(ok);
    }

    #[test]
    fn break_across_try_is_a_compile_error() {
        let (ok, errs) = parse("while true { try { break } except Exception e { } }");
        assert!(!ok);
        assert!(errs > 0);
    }

    #[test]
    fn break_outside_try_in_loop_is_fine() {
        let (ok, _) = parse("while true { if true { break } }");
        assert!(ok);
    }

    #[test]
    fn foreach_parses() {
        let (ok, _) = parse("var out = [] for var v in R(3) { out.add(v) }");
        assert!(ok);
    }

    #[test]
    fn try_except_ensure_parses() {
        let (ok, _) = parse("try { raise Exception(\"x\") } except Exception e { } ensure { }");
        assert!(ok);
    }
}
