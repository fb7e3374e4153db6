/// Recursive-descent parser with Pratt-style expression parsing.
///
/// Consumes the lexer's token stream (one token of committed context plus
/// the lexer's materialized `next` slot for two-token decisions) and builds
/// the AST arena. Errors use panic-mode recovery: on a syntax error the
/// parser discards tokens until a statement boundary and continues, so one
/// run reports every independent error.

use crate::ast::{Ast, AstId, AstKind, Modifiers};
use crate::errors::{ParseError, Span};
use crate::lexer::{Lexer, Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    Range,
    Term,
    Factor,
    Unary,
    Call,
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::Question | TokenKind::QuestionQuestion | TokenKind::QuestionColon => {
            Precedence::Ternary
        }
        TokenKind::Or => Precedence::Or,
        TokenKind::And => Precedence::And,
        TokenKind::EqualEqual | TokenKind::BangEqual => Precedence::Equality,
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => Precedence::Comparison,
        TokenKind::DotDot => Precedence::Range,
        TokenKind::Plus | TokenKind::Minus => Precedence::Term,
        TokenKind::Slash | TokenKind::Star | TokenKind::Modulo => Precedence::Factor,
        TokenKind::LeftParen
        | TokenKind::QuestionParen
        | TokenKind::Dot
        | TokenKind::QuestionDot
        | TokenKind::LeftBracket
        | TokenKind::QuestionBracket => Precedence::Call,
        _ => Precedence::None,
    }
}

pub struct Parser {
    lexer: Lexer,
    previous: Token,
    current: Token,
    pub ast: Ast,
    pub errors: Vec<ParseError>,
    panic_mode: bool,
}

impl Parser {
    pub fn new(source: &str) -> Parser {
        let mut parser = Parser {
            lexer: Lexer::new(source),
            previous: Token::eof(0),
            current: Token::eof(0),
            ast: Ast::new(),
            errors: Vec::new(),
            panic_mode: false,
        };
        parser.advance();
        parser
    }

    /// Parses a whole program. The returned id is the `Program` node; lex
    /// errors surface through `lexer_errors`, parse errors through `errors`.
    pub fn parse(mut self) -> (Ast, Vec<crate::errors::LexError>, Vec<ParseError>) {
        let mut decls = Vec::new();
        while !self.check(TokenKind::Eof) {
            decls.push(self.declaration());
        }
        let root = self
            .ast
            .add(AstKind::Program, Token::synthetic(""), Modifiers::default(), decls);
        self.ast.root = root;
        (self.ast, self.lexer.errors, self.errors)
    }

    // ── Token plumbing ──────────────────────────────────────────────────────

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, Token::eof(0));
        loop {
            self.current = self.lexer.advance();
            if self.current.kind != TokenKind::Error {
                break;
            }
            // The lexer already recorded the precise error; enter panic mode
            // so cascading parse errors stay quiet.
            self.panic_mode = true;
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn check_next(&self, kind: TokenKind) -> bool {
        self.lexer.peek_next().kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.errors.push(ParseError {
            message: format!("{}{}", message, location),
            span: Span::new(0, 0, token.line),
        });
    }

    /// Panic-mode recovery: skip to the next statement boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Trait
                | TokenKind::Namespace
                | TokenKind::Fun
                | TokenKind::Val
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Switch
                | TokenKind::Try
                | TokenKind::Throw
                | TokenKind::Return
                | TokenKind::Require
                | TokenKind::Using
                | TokenKind::Yield => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn add(&mut self, kind: AstKind, token: Token, children: Vec<AstId>) -> AstId {
        self.ast.add(kind, token, Modifiers::default(), children)
    }

    fn add_with(
        &mut self,
        kind: AstKind,
        token: Token,
        modifiers: Modifiers,
        children: Vec<AstId>,
    ) -> AstId {
        self.ast.add(kind, token, modifiers, children)
    }

    // ── Declarations ────────────────────────────────────────────────────────

    fn declaration(&mut self) -> AstId {
        let decl = if self.match_token(TokenKind::Class) {
            self.class_declaration()
        } else if self.match_token(TokenKind::Trait) {
            self.trait_declaration()
        } else if self.match_token(TokenKind::Namespace) {
            self.namespace_declaration()
        } else if self.check(TokenKind::Async) && self.check_next(TokenKind::Fun) {
            self.advance();
            self.advance();
            self.fun_declaration(true)
        } else if self.check(TokenKind::Fun) && self.check_next(TokenKind::Identifier) {
            self.advance();
            self.fun_declaration(false)
        } else if self.match_token(TokenKind::Val) {
            self.var_declaration(false)
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(true)
        } else {
            self.statement()
        };
        if self.panic_mode {
            self.synchronize();
        }
        decl
    }

    fn class_declaration(&mut self) -> AstId {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name = self.previous.clone();
        let body = self.behavior_body(false);
        self.add(AstKind::DeclClass, name, vec![body])
    }

    fn trait_declaration(&mut self) -> AstId {
        self.consume(TokenKind::Identifier, "Expect trait name.");
        let name = self.previous.clone();
        let body = self.behavior_body(true);
        self.add(AstKind::DeclTrait, name, vec![body])
    }

    /// Superclass clause, trait list and member list shared by class/trait
    /// declarations and anonymous behavior expressions. Returns a
    /// `ClassBody` node: [superclass expr, TraitList, members...].
    fn behavior_body(&mut self, is_trait: bool) -> AstId {
        let superclass = if !is_trait && self.match_token(TokenKind::Colon) {
            self.parse_precedence(Precedence::Call)
        } else {
            let token = Token::synthetic("Object");
            self.add(AstKind::ExprVariable, token, vec![])
        };

        let mut traits = Vec::new();
        if self.match_token(TokenKind::With) {
            loop {
                self.consume(TokenKind::Identifier, "Expect trait name after 'with'.");
                let t = self.previous.clone();
                traits.push(self.add(AstKind::ExprVariable, t, vec![]));
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        let trait_list = self.add(AstKind::TraitList, Token::synthetic(""), traits);

        self.consume(TokenKind::LeftBrace, "Expect '{' before behavior body.");
        let mut members = vec![superclass, trait_list];
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            members.push(self.member_declaration(is_trait));
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after behavior body.");
        self.add(AstKind::ClassBody, Token::synthetic(""), members)
    }

    fn member_declaration(&mut self, is_trait: bool) -> AstId {
        if self.match_token(TokenKind::Val) {
            return self.field_declaration(false);
        }
        if self.match_token(TokenKind::Var) {
            return self.field_declaration(true);
        }

        let is_class_method = self.match_token(TokenKind::Class);
        let is_async = self.match_token(TokenKind::Async);
        if is_class_method && is_trait {
            self.error("Traits cannot declare class methods.");
        }
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.clone();
        let is_initializer = !is_class_method && name.lexeme == "init";
        let modifiers = Modifiers {
            is_class: is_class_method,
            is_async,
            is_initializer,
            ..Modifiers::default()
        };
        let (params, body) = self.function_rest();
        self.add_with(AstKind::DeclMethod, name, modifiers, vec![params, body])
    }

    fn field_declaration(&mut self, is_mutable: bool) -> AstId {
        self.consume(TokenKind::Identifier, "Expect class variable name.");
        let name = self.previous.clone();
        let mut children = Vec::new();
        if self.match_token(TokenKind::Equal) {
            children.push(self.expression());
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after class variable.");
        let modifiers = Modifiers {
            is_mutable,
            ..Modifiers::default()
        };
        self.add_with(AstKind::DeclField, name, modifiers, children)
    }

    fn fun_declaration(&mut self, is_async: bool) -> AstId {
        self.consume(TokenKind::Identifier, "Expect function name.");
        let name = self.previous.clone();
        let (params, body) = self.function_rest();
        let modifiers = Modifiers {
            is_async,
            ..Modifiers::default()
        };
        let function = self.add_with(
            AstKind::ExprFunction,
            name.clone(),
            modifiers,
            vec![params, body],
        );
        self.add(AstKind::DeclFun, name, vec![function])
    }

    /// Parameter list and body, shared by functions, methods and lambdas.
    fn function_rest(&mut self) -> (AstId, AstId) {
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        let mut params = Vec::new();
        let mut variadic_seen = false;
        if !self.check(TokenKind::RightParen) {
            loop {
                if params.len() >= 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let is_mutable = self.match_token(TokenKind::Var);
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                let name = self.previous.clone();
                let is_variadic = self.match_token(TokenKind::DotDot);
                if variadic_seen {
                    self.error("Variadic parameter must be the last parameter.");
                }
                variadic_seen |= is_variadic;
                let modifiers = Modifiers {
                    is_mutable,
                    is_variadic,
                    ..Modifiers::default()
                };
                params.push(self.add_with(AstKind::ExprParam, name, modifiers, vec![]));
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        let param_list = self.add(AstKind::ParamList, Token::synthetic(""), params);

        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        let body = self.block_statements();
        (param_list, body)
    }

    fn var_declaration(&mut self, is_mutable: bool) -> AstId {
        self.consume(TokenKind::Identifier, "Expect variable name.");
        let name = self.previous.clone();
        let mut children = Vec::new();
        if self.match_token(TokenKind::Equal) {
            children.push(self.expression());
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        let modifiers = Modifiers {
            is_mutable,
            ..Modifiers::default()
        };
        self.add_with(AstKind::DeclVar, name, modifiers, children)
    }

    fn namespace_declaration(&mut self) -> AstId {
        let keyword = self.previous.clone();
        let idents = self.dotted_identifiers("Expect namespace identifier.");
        self.consume(TokenKind::Semicolon, "Expect ';' after namespace declaration.");
        self.add(AstKind::DeclNamespace, keyword, vec![idents])
    }

    fn dotted_identifiers(&mut self, message: &str) -> AstId {
        let mut idents = Vec::new();
        loop {
            self.consume(TokenKind::Identifier, message);
            let name = self.previous.clone();
            idents.push(self.add(AstKind::VarName, name, vec![]));
            if !self.match_token(TokenKind::Dot) {
                break;
            }
        }
        self.add(AstKind::IdentList, Token::synthetic(""), idents)
    }

    // ── Statements ──────────────────────────────────────────────────────────

    fn statement(&mut self) -> AstId {
        if self.match_token(TokenKind::LeftBrace) {
            let block = self.block_statements();
            return block;
        }
        if self.match_token(TokenKind::If) {
            return self.if_statement();
        }
        if self.match_token(TokenKind::While) {
            return self.while_statement();
        }
        if self.match_token(TokenKind::For) {
            return self.for_statement();
        }
        if self.match_token(TokenKind::Switch) {
            return self.switch_statement();
        }
        if self.match_token(TokenKind::Break) {
            let token = self.previous.clone();
            self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
            return self.add(AstKind::StmtBreak, token, vec![]);
        }
        if self.match_token(TokenKind::Continue) {
            let token = self.previous.clone();
            self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
            return self.add(AstKind::StmtContinue, token, vec![]);
        }
        if self.match_token(TokenKind::Return) {
            return self.return_statement();
        }
        if self.match_token(TokenKind::Throw) {
            let token = self.previous.clone();
            let value = self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after thrown exception object.");
            return self.add(AstKind::StmtThrow, token, vec![value]);
        }
        if self.match_token(TokenKind::Try) {
            return self.try_statement();
        }
        if self.match_token(TokenKind::Require) {
            let token = self.previous.clone();
            let path = self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after required path.");
            return self.add(AstKind::StmtRequire, token, vec![path]);
        }
        if self.match_token(TokenKind::Using) {
            return self.using_statement();
        }
        if self.match_token(TokenKind::Yield) {
            return self.yield_statement();
        }
        if self.check(TokenKind::Await) {
            // Statement-level await: `await expr;`
            self.advance();
            let token = self.previous.clone();
            let value = self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after awaited expression.");
            return self.add(AstKind::StmtAwait, token, vec![value]);
        }
        self.expression_statement()
    }

    /// Statements until the closing brace; the opening brace is consumed.
    fn block_statements(&mut self) -> AstId {
        let mut stmts = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            stmts.push(self.declaration());
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
        let list = self.add(AstKind::StmtList, Token::synthetic(""), stmts);
        self.add(AstKind::StmtBlock, Token::synthetic(""), vec![list])
    }

    fn expression_statement(&mut self) -> AstId {
        let expr = self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.add(AstKind::StmtExpression, Token::synthetic(""), vec![expr])
    }

    fn if_statement(&mut self) -> AstId {
        let token = self.previous.clone();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        let condition = self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let then_branch = self.statement();
        let mut children = vec![condition, then_branch];
        if self.match_token(TokenKind::Else) {
            children.push(self.statement());
        }
        self.add(AstKind::StmtIf, token, children)
    }

    fn while_statement(&mut self) -> AstId {
        let token = self.previous.clone();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        let condition = self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let body = self.statement();
        self.add(AstKind::StmtWhile, token, vec![condition, body])
    }

    /// `for (decl : collection) body` — one name for the value or two for
    /// index and value. The body runs under the `next`/`nextValue` protocol.
    fn for_statement(&mut self) -> AstId {
        let token = self.previous.clone();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        self.match_token(TokenKind::Var);
        self.consume(TokenKind::Identifier, "Expect loop variable name.");
        let first = self.previous.clone();
        let mut names = vec![self.add(AstKind::VarName, first, vec![])];
        if self.match_token(TokenKind::Comma) {
            self.match_token(TokenKind::Var);
            self.consume(TokenKind::Identifier, "Expect loop value name.");
            let second = self.previous.clone();
            names.push(self.add(AstKind::VarName, second, vec![]));
        }
        let decl = self.add(AstKind::IdentList, Token::synthetic(""), names);
        self.consume(TokenKind::Colon, "Expect ':' after loop variables.");
        let collection = self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after collection.");
        let body = self.statement();
        self.add(AstKind::StmtFor, token, vec![decl, collection, body])
    }

    fn switch_statement(&mut self) -> AstId {
        let token = self.previous.clone();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        let subject = self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch value.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch cases.");

        let mut cases = Vec::new();
        let mut default = None;
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Case) {
                if default.is_some() {
                    self.error("No case may follow the default case.");
                }
                let case_token = self.previous.clone();
                let value = self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after case value.");
                let stmts = self.case_body();
                cases.push(self.add(AstKind::StmtCase, case_token, vec![value, stmts]));
            } else if self.match_token(TokenKind::Default) {
                if default.is_some() {
                    self.error("Switch may have only one default case.");
                }
                let default_token = self.previous.clone();
                self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
                let stmts = self.case_body();
                default = Some(self.add(AstKind::StmtDefault, default_token, vec![stmts]));
            } else {
                self.error_at_current("Expect 'case' or 'default' inside switch.");
                self.advance();
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after switch cases.");

        let case_list = self.add(AstKind::CaseList, Token::synthetic(""), cases);
        let mut children = vec![subject, case_list];
        if let Some(default) = default {
            children.push(default);
        }
        self.add(AstKind::StmtSwitch, token, children)
    }

    fn case_body(&mut self) -> AstId {
        let mut stmts = Vec::new();
        while !self.check(TokenKind::Case)
            && !self.check(TokenKind::Default)
            && !self.check(TokenKind::RightBrace)
            && !self.check(TokenKind::Eof)
        {
            stmts.push(self.declaration());
        }
        self.add(AstKind::StmtList, Token::synthetic(""), stmts)
    }

    fn return_statement(&mut self) -> AstId {
        let token = self.previous.clone();
        let mut children = Vec::new();
        if !self.check(TokenKind::Semicolon) {
            children.push(self.expression());
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
        self.add(AstKind::StmtReturn, token, children)
    }

    /// `try stmt catch (Class name?) stmt (finally stmt)?` — the catch
    /// clause is mandatory, finally optional.
    fn try_statement(&mut self) -> AstId {
        let token = self.previous.clone();
        let try_block = self.statement();

        if !self.match_token(TokenKind::Catch) {
            self.error_at_current("Must have a catch clause following a try statement.");
            return self.add(AstKind::StmtTry, token, vec![try_block]);
        }
        self.consume(TokenKind::LeftParen, "Expect '(' after 'catch'.");
        self.consume(TokenKind::Identifier, "Expect exception class name.");
        let class_name = self.previous.clone();
        let mut catch_children = Vec::new();
        if self.match_token(TokenKind::Identifier) {
            let var = self.previous.clone();
            catch_children.push(self.add(AstKind::VarName, var, vec![]));
        }
        self.consume(TokenKind::RightParen, "Expect ')' after catch clause.");
        catch_children.push(self.statement());
        let catch_clause = self.add(AstKind::CatchClause, class_name, catch_children);

        let mut children = vec![try_block, catch_clause];
        if self.match_token(TokenKind::Finally) {
            let finally_token = self.previous.clone();
            let finally_block = self.statement();
            children.push(self.add(AstKind::FinallyClause, finally_token, vec![finally_block]));
        }
        self.add(AstKind::StmtTry, token, children)
    }

    fn using_statement(&mut self) -> AstId {
        let token = self.previous.clone();
        let path = self.dotted_identifiers("Expect namespace identifier.");
        let mut children = vec![path];
        if self.match_token(TokenKind::As) {
            self.consume(TokenKind::Identifier, "Expect alias name after 'as'.");
            let alias = self.previous.clone();
            children.push(self.add(AstKind::VarName, alias, vec![]));
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after using statement.");
        self.add(AstKind::StmtUsing, token, children)
    }

    fn yield_statement(&mut self) -> AstId {
        let token = self.previous.clone();
        if self.match_token(TokenKind::Semicolon) {
            return self.add(AstKind::StmtYield, token, vec![]);
        }
        // `yield from expr;` delegates to an inner generator.
        if self.check(TokenKind::Identifier)
            && self.current.lexeme == "from"
        {
            self.advance();
            let inner = self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after yield value.");
            return self.add(AstKind::StmtYieldFrom, token, vec![inner]);
        }
        let value = self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after yield value.");
        self.add(AstKind::StmtYield, token, vec![value])
    }

    // ── Expressions ─────────────────────────────────────────────────────────

    fn expression(&mut self) -> AstId {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> AstId {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        let mut expr = self.prefix(can_assign);

        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            expr = self.infix(expr, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
        expr
    }

    fn prefix(&mut self, can_assign: bool) -> AstId {
        let token = self.previous.clone();
        match token.kind {
            TokenKind::Int | TokenKind::Float | TokenKind::String | TokenKind::True
            | TokenKind::False | TokenKind::Nil => self.add(AstKind::ExprLiteral, token, vec![]),
            TokenKind::Interpolation => self.interpolation(token),
            TokenKind::Identifier => self.variable(token, can_assign),
            TokenKind::This => self.add(AstKind::ExprThis, token, vec![]),
            TokenKind::Super => self.super_expression(),
            TokenKind::LeftParen => {
                let inner = self.expression();
                self.consume(TokenKind::RightParen, "Expect ')' after expression.");
                self.add(AstKind::ExprGrouping, token, vec![inner])
            }
            TokenKind::LeftBracket => self.array_literal(token),
            TokenKind::LeftBrace => self.dictionary_literal(token),
            TokenKind::Minus | TokenKind::Bang => {
                let operand = self.parse_precedence(Precedence::Unary);
                self.add(AstKind::ExprUnary, token, vec![operand])
            }
            TokenKind::Fun => self.lambda(false),
            TokenKind::Async => {
                self.consume(TokenKind::Fun, "Expect 'fun' after 'async' in expression.");
                self.lambda(true)
            }
            TokenKind::Await => {
                let value = self.parse_precedence(Precedence::Unary);
                self.add(AstKind::ExprAwait, token, vec![value])
            }
            TokenKind::Yield => {
                if self.check(TokenKind::Identifier) && self.current.lexeme == "from" {
                    self.advance();
                    let inner = self.parse_precedence(Precedence::Unary);
                    self.add(AstKind::ExprYieldFrom, token, vec![inner])
                } else {
                    let value = self.parse_precedence(Precedence::Unary);
                    self.add(AstKind::ExprYield, token, vec![value])
                }
            }
            TokenKind::Class => {
                let body = self.behavior_body(false);
                self.add(AstKind::ExprClass, Token::synthetic(""), vec![body])
            }
            TokenKind::Trait => {
                let body = self.behavior_body(true);
                self.add(AstKind::ExprTrait, Token::synthetic(""), vec![body])
            }
            _ => {
                self.error("Expect expression.");
                self.add(AstKind::ExprLiteral, Token::synthetic("nil"), vec![])
            }
        }
    }

    fn infix(&mut self, left: AstId, can_assign: bool) -> AstId {
        let token = self.previous.clone();
        match token.kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Modulo
            | TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::DotDot => {
                let next = next_higher(infix_precedence(token.kind));
                let right = self.parse_precedence(next);
                self.add(AstKind::ExprBinary, token, vec![left, right])
            }
            TokenKind::And => {
                let right = self.parse_precedence(Precedence::Equality);
                self.add(AstKind::ExprAnd, token, vec![left, right])
            }
            TokenKind::Or => {
                let right = self.parse_precedence(Precedence::And);
                self.add(AstKind::ExprOr, token, vec![left, right])
            }
            TokenKind::Question => {
                let then_branch = self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after ternary then-branch.");
                let else_branch = self.parse_precedence(Precedence::Ternary);
                self.add(AstKind::ExprTernary, token, vec![left, then_branch, else_branch])
            }
            TokenKind::QuestionQuestion => {
                let right = self.parse_precedence(Precedence::Or);
                self.add(AstKind::ExprNilCoalescing, token, vec![left, right])
            }
            TokenKind::QuestionColon => {
                let right = self.parse_precedence(Precedence::Or);
                self.add(AstKind::ExprElvis, token, vec![left, right])
            }
            TokenKind::LeftParen => {
                let args = self.argument_list();
                self.add(AstKind::ExprCall, token, vec![left, args])
            }
            TokenKind::QuestionParen => {
                let args = self.argument_list();
                self.add(AstKind::ExprOptionalCall, token, vec![left, args])
            }
            TokenKind::Dot => self.dot(left, can_assign, false),
            TokenKind::QuestionDot => self.dot(left, can_assign, true),
            TokenKind::LeftBracket => {
                let index = self.expression();
                self.consume(TokenKind::RightBracket, "Expect ']' after subscript.");
                if can_assign && self.match_token(TokenKind::Equal) {
                    let value = self.expression();
                    self.add(AstKind::ExprSubscriptSet, token, vec![left, index, value])
                } else {
                    self.add(AstKind::ExprSubscriptGet, token, vec![left, index])
                }
            }
            TokenKind::QuestionBracket => {
                let index = self.expression();
                self.consume(TokenKind::RightBracket, "Expect ']' after subscript.");
                self.add(AstKind::ExprSubscriptGetOptional, token, vec![left, index])
            }
            _ => {
                self.error("Invalid infix operator.");
                left
            }
        }
    }

    fn variable(&mut self, token: Token, can_assign: bool) -> AstId {
        if can_assign && self.match_token(TokenKind::Equal) {
            let value = self.expression();
            self.add(AstKind::ExprAssign, token, vec![value])
        } else {
            self.add(AstKind::ExprVariable, token, vec![])
        }
    }

    fn dot(&mut self, left: AstId, can_assign: bool, optional: bool) -> AstId {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.clone();
        if self.match_token(TokenKind::LeftParen) {
            let args = self.argument_list();
            let kind = if optional {
                AstKind::ExprOptionalInvoke
            } else {
                AstKind::ExprInvoke
            };
            return self.add(kind, name, vec![left, args]);
        }
        if !optional && can_assign && self.match_token(TokenKind::Equal) {
            let value = self.expression();
            return self.add(AstKind::ExprPropertySet, name, vec![left, value]);
        }
        let kind = if optional {
            AstKind::ExprPropertyGetOptional
        } else {
            AstKind::ExprPropertyGet
        };
        self.add(kind, name, vec![left])
    }

    fn super_expression(&mut self) -> AstId {
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.clone();
        if self.match_token(TokenKind::LeftParen) {
            let args = self.argument_list();
            self.add(AstKind::ExprSuperInvoke, name, vec![args])
        } else {
            self.add(AstKind::ExprSuperGet, name, vec![])
        }
    }

    /// The opening paren is already consumed.
    fn argument_list(&mut self) -> AstId {
        let mut args = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                if args.len() >= 255 {
                    self.error_at_current("Can't have more than 255 arguments.");
                }
                args.push(self.expression());
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        self.add(AstKind::ArgList, Token::synthetic(""), args)
    }

    fn array_literal(&mut self, token: Token) -> AstId {
        let mut elements = Vec::new();
        if !self.check(TokenKind::RightBracket) {
            loop {
                elements.push(self.expression());
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after array elements.");
        let list = self.add(AstKind::ArgList, Token::synthetic(""), elements);
        self.add(AstKind::ExprArray, token, vec![list])
    }

    fn dictionary_literal(&mut self, token: Token) -> AstId {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        if !self.check(TokenKind::RightBrace) {
            loop {
                keys.push(self.expression());
                self.consume(TokenKind::Colon, "Expect ':' after dictionary key.");
                values.push(self.expression());
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after dictionary entries.");
        let key_list = self.add(AstKind::ArgList, Token::synthetic(""), keys);
        let value_list = self.add(AstKind::ArgList, Token::synthetic(""), values);
        self.add(AstKind::ExprDictionary, token, vec![key_list, value_list])
    }

    fn lambda(&mut self, is_async: bool) -> AstId {
        let token = Token::synthetic("");
        let (params, body) = self.function_rest();
        let modifiers = Modifiers {
            is_async,
            is_lambda: true,
            ..Modifiers::default()
        };
        self.add_with(AstKind::ExprFunction, token, modifiers, vec![params, body])
    }

    /// The `Interpolation` token carries the first cooked segment; segments
    /// and expressions alternate until the closing `String` token.
    fn interpolation(&mut self, first: Token) -> AstId {
        let mut parts = Vec::new();
        if !first.lexeme.is_empty() {
            let mut literal = first.clone();
            literal.kind = TokenKind::String;
            parts.push(self.add(AstKind::ExprLiteral, literal, vec![]));
        }
        loop {
            parts.push(self.expression());
            if self.match_token(TokenKind::Interpolation) {
                let segment = self.previous.clone();
                if !segment.lexeme.is_empty() {
                    let mut literal = segment;
                    literal.kind = TokenKind::String;
                    parts.push(self.add(AstKind::ExprLiteral, literal, vec![]));
                }
                continue;
            }
            self.consume(TokenKind::String, "Expect end of string interpolation.");
            let tail = self.previous.clone();
            if !tail.lexeme.is_empty() {
                parts.push(self.add(AstKind::ExprLiteral, tail, vec![]));
            }
            break;
        }
        let list = self.add(AstKind::ArgList, Token::synthetic(""), parts);
        self.add(AstKind::ExprInterpolation, first, vec![list])
    }
}

fn next_higher(precedence: Precedence) -> Precedence {
    match precedence {
        Precedence::None => Precedence::Assignment,
        Precedence::Assignment => Precedence::Ternary,
        Precedence::Ternary => Precedence::Or,
        Precedence::Or => Precedence::And,
        Precedence::And => Precedence::Equality,
        Precedence::Equality => Precedence::Comparison,
        Precedence::Comparison => Precedence::Range,
        Precedence::Range => Precedence::Term,
        Precedence::Term => Precedence::Factor,
        Precedence::Factor => Precedence::Unary,
        Precedence::Unary => Precedence::Call,
        Precedence::Call => Precedence::Call,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstKind;

    fn parse_ok(source: &str) -> Ast {
        let (ast, lex_errors, parse_errors) = Parser::new(source).parse();
        assert!(lex_errors.is_empty(), "lex errors: {:?}", lex_errors);
        assert!(parse_errors.is_empty(), "parse errors: {:?}", parse_errors);
        ast
    }

    #[test]
    fn test_precedence_shapes_binary_trees() {
        let ast = parse_ok("val x = 1 + 2 * 3;");
        let decl = ast.child(ast.root, 0);
        let add = ast.child(decl, 0);
        assert_eq!(ast.node(add).kind, AstKind::ExprBinary);
        assert_eq!(ast.node(add).token.lexeme, "+");
        let mul = ast.child(add, 1);
        assert_eq!(ast.node(mul).token.lexeme, "*");
    }

    #[test]
    fn test_assignment_is_right_associative() {
        let ast = parse_ok("a = b = 1;");
        let stmt = ast.child(ast.root, 0);
        let outer = ast.child(stmt, 0);
        assert_eq!(ast.node(outer).kind, AstKind::ExprAssign);
        assert_eq!(ast.node(outer).token.lexeme, "a");
        let inner = ast.child(outer, 0);
        assert_eq!(ast.node(inner).kind, AstKind::ExprAssign);
        assert_eq!(ast.node(inner).token.lexeme, "b");
    }

    #[test]
    fn test_class_declaration_with_superclass_and_traits() {
        let ast = parse_ok("class B : A with T1, T2 { greet() { return 1; } }");
        let decl = ast.child(ast.root, 0);
        assert_eq!(ast.node(decl).kind, AstKind::DeclClass);
        let body = ast.child(decl, 0);
        assert_eq!(ast.node(body).kind, AstKind::ClassBody);
        let superclass = ast.child(body, 0);
        assert_eq!(ast.node(superclass).token.lexeme, "A");
        let traits = ast.child(body, 1);
        assert_eq!(ast.child_count(traits), 2);
        let method = ast.child(body, 2);
        assert_eq!(ast.node(method).kind, AstKind::DeclMethod);
    }

    #[test]
    fn test_method_modifiers() {
        let ast = parse_ok("class C { init() { } class make() { } async fetch() { } }");
        let decl = ast.child(ast.root, 0);
        let body = ast.child(decl, 0);
        assert!(ast.node(ast.child(body, 2)).modifiers.is_initializer);
        assert!(ast.node(ast.child(body, 3)).modifiers.is_class);
        assert!(ast.node(ast.child(body, 4)).modifiers.is_async);
    }

    #[test]
    fn test_try_catch_finally() {
        let ast = parse_ok("try { throw Error(\"x\"); } catch (Error e) { } finally { }");
        let stmt = ast.child(ast.root, 0);
        assert_eq!(ast.node(stmt).kind, AstKind::StmtTry);
        assert_eq!(ast.child_count(stmt), 3);
        let catch = ast.child(stmt, 1);
        assert_eq!(ast.node(catch).kind, AstKind::CatchClause);
        assert_eq!(ast.node(catch).token.lexeme, "Error");
        assert_eq!(ast.child_count(catch), 2);
    }

    #[test]
    fn test_for_loop_with_index_and_value() {
        let ast = parse_ok("for (k, v : d) { print(k); }");
        let stmt = ast.child(ast.root, 0);
        assert_eq!(ast.node(stmt).kind, AstKind::StmtFor);
        let decl = ast.child(stmt, 0);
        assert_eq!(ast.child_count(decl), 2);
    }

    #[test]
    fn test_yield_forms() {
        let ast = parse_ok("fun g() { yield 1; yield from h(); yield; }");
        let decl = ast.child(ast.root, 0);
        let function = ast.child(decl, 0);
        let body = ast.child(function, 1);
        let stmts = ast.child(body, 0);
        assert_eq!(ast.node(ast.child(stmts, 0)).kind, AstKind::StmtYield);
        assert_eq!(ast.node(ast.child(stmts, 1)).kind, AstKind::StmtYieldFrom);
        assert_eq!(ast.node(ast.child(stmts, 2)).kind, AstKind::StmtYield);
    }

    #[test]
    fn test_interpolation_parts() {
        let ast = parse_ok("val s = \"a ${x} b\";");
        let decl = ast.child(ast.root, 0);
        let interp = ast.child(decl, 0);
        assert_eq!(ast.node(interp).kind, AstKind::ExprInterpolation);
        let parts = ast.child(interp, 0);
        assert_eq!(ast.child_count(parts), 3);
    }

    #[test]
    fn test_panic_mode_recovers_per_statement() {
        let (_, _, errors) = Parser::new("val = 1; val ok = 2; var = 3;").parse();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_optional_operators() {
        let ast = parse_ok("val x = a?.b ?? c ?: d;");
        let decl = ast.child(ast.root, 0);
        let elvis = ast.child(decl, 0);
        assert_eq!(ast.node(elvis).kind, AstKind::ExprElvis);
    }

    #[test]
    fn test_variadic_parameter() {
        let ast = parse_ok("fun f(xs..) { }");
        let decl = ast.child(ast.root, 0);
        let function = ast.child(decl, 0);
        let params = ast.child(function, 0);
        assert!(ast.node(ast.child(params, 0)).modifiers.is_variadic);
    }
}
