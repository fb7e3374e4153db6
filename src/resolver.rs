/// Semantic resolver: walks the AST, builds per-scope symbol tables, and
/// enforces the rules the emitter relies on.
///
/// Checks: redeclaration in a scope, assignment to immutable bindings,
/// `this`/`super` outside classes, `break`/`continue` outside loops,
/// `case`/`default` outside switches, `return`/`yield` outside functions,
/// `await` outside async functions. A top-level `await` is not an error: it
/// lifts the script closure to async. Optional warnings (unused local,
/// never-modified mutable, unused import) follow the configuration flags.

use crate::ast::{Ast, AstId, AstKind};
use crate::conf::{Configuration, FlagLevel};
use crate::errors::{ResolveError, Span};
use crate::lexer::Token;
use crate::symtab::{
    ScopeKind, SymbolCategory, SymbolEntry, SymbolState, SymbolTables,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Function,
    Method,
    Initializer,
    Lambda,
}

struct FunctionCtx {
    kind: FnKind,
    is_async: bool,
}

struct ClassCtx {
    is_trait: bool,
}

pub struct ResolveOutput {
    pub tables: SymbolTables,
    pub warnings: Vec<String>,
    /// True when a top-level await lifted the script closure to async.
    pub script_is_async: bool,
}

pub struct Resolver<'a> {
    conf: &'a Configuration,
    tables: SymbolTables,
    current_table: u32,
    depth: u32,
    functions: Vec<FunctionCtx>,
    classes: Vec<ClassCtx>,
    loop_depth: usize,
    switch_depth: usize,
    errors: Vec<ResolveError>,
    warnings: Vec<String>,
    /// (alias name, token) pairs introduced by `using`, checked for use at
    /// the end of the module.
    using_aliases: Vec<(String, Token)>,
}

impl<'a> Resolver<'a> {
    pub fn new(conf: &'a Configuration) -> Resolver<'a> {
        Resolver {
            conf,
            tables: SymbolTables::new(),
            current_table: 0,
            depth: 0,
            functions: Vec::new(),
            classes: Vec::new(),
            loop_depth: 0,
            switch_depth: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            using_aliases: Vec::new(),
        }
    }

    pub fn resolve(mut self, ast: &mut Ast) -> Result<ResolveOutput, Vec<ResolveError>> {
        let module_table = self.tables.push(None, ScopeKind::Module, 0);
        self.current_table = module_table;
        ast.node_mut(ast.root).symtab = Some(module_table);
        self.functions.push(FunctionCtx {
            kind: FnKind::Script,
            is_async: false,
        });

        let root = ast.root;
        for i in 0..ast.child_count(root) {
            let child = ast.child(root, i);
            self.visit(ast, child);
        }

        self.check_unused_imports();
        self.check_scope_hygiene(module_table);

        let script_is_async = self.functions[0].is_async;
        if self.errors.is_empty() {
            Ok(ResolveOutput {
                tables: self.tables,
                warnings: self.warnings,
                script_is_async,
            })
        } else {
            Err(self.errors)
        }
    }

    // ── Bookkeeping ─────────────────────────────────────────────────────────

    fn error(&mut self, token: &Token, message: impl Into<String>) {
        self.errors.push(ResolveError {
            message: message.into(),
            span: Span::new(0, 0, token.line),
        });
    }

    fn begin_scope(&mut self, ast: &mut Ast, node: AstId, scope: ScopeKind) -> u32 {
        self.depth += 1;
        let table = self
            .tables
            .push(Some(self.current_table), scope, self.depth);
        self.current_table = table;
        ast.node_mut(node).symtab = Some(table);
        table
    }

    fn end_scope(&mut self) {
        let table = self.current_table;
        self.check_scope_hygiene(table);
        if let Some(parent) = self.tables.table(table).parent {
            self.current_table = parent;
        }
        self.depth -= 1;
    }

    /// Unused-local and never-modified-mutable diagnostics for a scope that
    /// is being left.
    fn check_scope_hygiene(&mut self, table: u32) {
        let mut complaints: Vec<(String, u32, bool)> = Vec::new();
        for (name, entry) in &self.tables.table(table).entries {
            if name == "this" || name == "super" || name.ends_with(' ') {
                continue;
            }
            if entry.state < SymbolState::Accessed {
                complaints.push((name.clone(), entry.token.line, false));
            } else if entry.is_mutable && entry.state != SymbolState::Modified {
                complaints.push((name.clone(), entry.token.line, true));
            }
        }
        for (name, line, mutable_complaint) in complaints {
            if mutable_complaint {
                let message =
                    format!("[line {}] Mutable variable '{}' is never modified; declare it with 'val'.", line, name);
                match self.conf.flag_mutable_variable {
                    FlagLevel::None => {}
                    FlagLevel::Warn => self.warnings.push(message),
                    FlagLevel::Error => self.errors.push(ResolveError {
                        message,
                        span: Span::new(0, 0, line),
                    }),
                }
            } else {
                let message = format!("[line {}] Variable '{}' is never used.", line, name);
                match self.conf.flag_unused_variable {
                    FlagLevel::None => {}
                    FlagLevel::Warn => self.warnings.push(message),
                    FlagLevel::Error => self.errors.push(ResolveError {
                        message,
                        span: Span::new(0, 0, line),
                    }),
                }
            }
        }
    }

    fn check_unused_imports(&mut self) {
        let aliases = std::mem::take(&mut self.using_aliases);
        for (name, token) in aliases {
            let used = self
                .tables
                .lookup(self.current_table, &name)
                .map_or(true, |(_, entry)| entry.state >= SymbolState::Accessed);
            if !used {
                let message =
                    format!("[line {}] Imported name '{}' is never used.", token.line, name);
                match self.conf.flag_unused_import {
                    FlagLevel::None => {}
                    FlagLevel::Warn => self.warnings.push(message),
                    FlagLevel::Error => self.errors.push(ResolveError {
                        message,
                        span: Span::new(0, 0, token.line),
                    }),
                }
            }
        }
    }

    fn declare(&mut self, token: &Token, is_mutable: bool) {
        let table = self.tables.table_mut(self.current_table);
        let category = if table.scope == ScopeKind::Module {
            SymbolCategory::Global
        } else {
            SymbolCategory::Local
        };
        if table.entries.contains_key(&token.lexeme) {
            let token = token.clone();
            self.error(
                &token,
                format!("Already a variable named '{}' in this scope.", token.lexeme),
            );
            return;
        }
        let index = table.entries.len();
        table.entries.insert(
            token.lexeme.clone(),
            SymbolEntry {
                category,
                state: SymbolState::Declared,
                index,
                is_mutable,
                token: token.clone(),
            },
        );
    }

    fn define(&mut self, token: &Token) {
        let table = self.tables.table_mut(self.current_table);
        if let Some(entry) = table.entries.get_mut(&token.lexeme) {
            if entry.state < SymbolState::Defined {
                entry.state = SymbolState::Defined;
            }
        }
    }

    fn mark(&mut self, name: &str, state: SymbolState) {
        let owner = self
            .tables
            .lookup(self.current_table, name)
            .map(|(owner, _)| owner);
        if let Some(owner) = owner {
            if let Some(entry) = self.tables.table_mut(owner).entries.get_mut(name) {
                if state > entry.state {
                    entry.state = state;
                }
            }
        }
    }

    // ── Traversal ───────────────────────────────────────────────────────────

    fn visit(&mut self, ast: &mut Ast, node: AstId) {
        let kind = ast.node(node).kind;
        match kind {
            AstKind::DeclVar => self.visit_var_decl(ast, node),
            AstKind::DeclFun => self.visit_fun_decl(ast, node),
            AstKind::DeclClass => self.visit_behavior_decl(ast, node, false),
            AstKind::DeclTrait => self.visit_behavior_decl(ast, node, true),
            AstKind::DeclNamespace => {}
            AstKind::StmtBlock => {
                self.begin_scope(ast, node, ScopeKind::Block);
                self.visit_children(ast, node);
                self.end_scope();
            }
            AstKind::StmtWhile => {
                let condition = ast.child(node, 0);
                self.visit(ast, condition);
                self.loop_depth += 1;
                let body = ast.child(node, 1);
                self.visit(ast, body);
                self.loop_depth -= 1;
            }
            AstKind::StmtFor => self.visit_for(ast, node),
            AstKind::StmtBreak => {
                if self.loop_depth == 0 {
                    let token = ast.node(node).token.clone();
                    self.error(&token, "Cannot use 'break' outside of a loop.");
                }
            }
            AstKind::StmtContinue => {
                if self.loop_depth == 0 {
                    let token = ast.node(node).token.clone();
                    self.error(&token, "Cannot use 'continue' outside of a loop.");
                }
            }
            AstKind::StmtSwitch => {
                let subject = ast.child(node, 0);
                self.visit(ast, subject);
                self.switch_depth += 1;
                for i in 1..ast.child_count(node) {
                    let child = ast.child(node, i);
                    self.visit(ast, child);
                }
                self.switch_depth -= 1;
            }
            AstKind::StmtCase | AstKind::StmtDefault => {
                if self.switch_depth == 0 {
                    let token = ast.node(node).token.clone();
                    self.error(&token, "Cannot use 'case' or 'default' outside of a switch.");
                }
                self.visit_children(ast, node);
            }
            AstKind::StmtReturn => self.visit_return(ast, node),
            AstKind::StmtYield | AstKind::StmtYieldFrom | AstKind::ExprYield
            | AstKind::ExprYieldFrom => self.visit_yield(ast, node),
            AstKind::StmtAwait | AstKind::ExprAwait => self.visit_await(ast, node),
            AstKind::StmtTry => self.visit_try(ast, node),
            AstKind::StmtUsing => self.visit_using(ast, node),
            AstKind::ExprThis => {
                if self.classes.is_empty() {
                    let token = ast.node(node).token.clone();
                    self.error(&token, "Cannot use 'this' outside of a class.");
                }
            }
            AstKind::ExprSuperGet | AstKind::ExprSuperInvoke => {
                let token = ast.node(node).token.clone();
                match self.classes.last() {
                    None => self.error(&token, "Cannot use 'super' outside of a class."),
                    Some(class) if class.is_trait => {
                        self.error(&token, "Cannot use 'super' inside a trait.")
                    }
                    _ => {}
                }
                self.visit_children(ast, node);
            }
            AstKind::ExprVariable => {
                let name = ast.node(node).token.lexeme.clone();
                self.mark(&name, SymbolState::Accessed);
            }
            AstKind::ExprAssign => {
                let token = ast.node(node).token.clone();
                let immutable = self
                    .tables
                    .lookup(self.current_table, &token.lexeme)
                    .map_or(false, |(_, entry)| !entry.is_mutable);
                if immutable {
                    self.error(
                        &token,
                        format!("Cannot assign to immutable variable '{}'.", token.lexeme),
                    );
                }
                self.visit_children(ast, node);
                self.mark(&token.lexeme, SymbolState::Modified);
            }
            AstKind::ExprFunction => {
                let is_lambda = ast.node(node).modifiers.is_lambda;
                let is_async = ast.node(node).modifiers.is_async;
                let kind = if is_lambda { FnKind::Lambda } else { FnKind::Function };
                self.visit_function(ast, node, kind, is_async);
            }
            AstKind::ExprClass => {
                let body = ast.child(node, 0);
                self.visit_behavior_body(ast, body, false);
            }
            AstKind::ExprTrait => {
                let body = ast.child(node, 0);
                self.visit_behavior_body(ast, body, true);
            }
            _ => self.visit_children(ast, node),
        }
    }

    fn visit_children(&mut self, ast: &mut Ast, node: AstId) {
        for i in 0..ast.child_count(node) {
            let child = ast.child(node, i);
            self.visit(ast, child);
        }
    }

    fn visit_var_decl(&mut self, ast: &mut Ast, node: AstId) {
        let token = ast.node(node).token.clone();
        let is_mutable = ast.node(node).modifiers.is_mutable;
        if !is_mutable && ast.child_count(node) == 0 {
            self.error(
                &token,
                "Immutable variable must be initialized upon declaration.",
            );
        }
        self.declare(&token, is_mutable);
        self.visit_children(ast, node);
        self.define(&token);
    }

    fn visit_fun_decl(&mut self, ast: &mut Ast, node: AstId) {
        let token = ast.node(node).token.clone();
        self.declare(&token, false);
        self.define(&token);
        let function = ast.child(node, 0);
        let is_async = ast.node(function).modifiers.is_async;
        self.visit_function(ast, function, FnKind::Function, is_async);
    }

    fn visit_function(&mut self, ast: &mut Ast, node: AstId, kind: FnKind, is_async: bool) {
        let scope = if kind == FnKind::Method || kind == FnKind::Initializer {
            ScopeKind::Method
        } else {
            ScopeKind::Function
        };
        self.functions.push(FunctionCtx { kind, is_async });
        // Loop and switch contexts do not cross function boundaries.
        let saved_loop = std::mem::take(&mut self.loop_depth);
        let saved_switch = std::mem::take(&mut self.switch_depth);

        self.begin_scope(ast, node, scope);
        let params = ast.child(node, 0);
        for i in 0..ast.child_count(params) {
            let param = ast.child(params, i);
            let token = ast.node(param).token.clone();
            let is_mutable = ast.node(param).modifiers.is_mutable;
            self.declare(&token, is_mutable);
            self.define(&token);
        }
        let body = ast.child(node, 1);
        // The body block shares the function scope.
        let stmts = ast.child(body, 0);
        self.visit_children(ast, stmts);
        self.end_scope();

        self.loop_depth = saved_loop;
        self.switch_depth = saved_switch;
        self.functions.pop();
    }

    fn visit_behavior_decl(&mut self, ast: &mut Ast, node: AstId, is_trait: bool) {
        let token = ast.node(node).token.clone();
        if token.lexeme == "Object" {
            self.error(&token, "Cannot redeclare root class Object.");
        }
        let body = ast.child(node, 0);
        if !is_trait {
            let superclass = ast.child(body, 0);
            if ast.node(superclass).kind == AstKind::ExprVariable
                && ast.node(superclass).token.lexeme == token.lexeme
            {
                self.error(&token, "A class cannot inherit from itself.");
            }
        }
        self.declare(&token, false);
        self.define(&token);
        self.visit_behavior_body(ast, body, is_trait);
    }

    fn visit_behavior_body(&mut self, ast: &mut Ast, body: AstId, is_trait: bool) {
        let superclass = ast.child(body, 0);
        self.visit(ast, superclass);
        let traits = ast.child(body, 1);
        self.visit_children(ast, traits);

        self.classes.push(ClassCtx { is_trait });
        let scope = if is_trait { ScopeKind::Trait } else { ScopeKind::Class };
        self.begin_scope(ast, body, scope);
        for i in 2..ast.child_count(body) {
            let member = ast.child(body, i);
            match ast.node(member).kind {
                AstKind::DeclMethod => {
                    let is_initializer = ast.node(member).modifiers.is_initializer;
                    let is_async = ast.node(member).modifiers.is_async;
                    let kind = if is_initializer {
                        FnKind::Initializer
                    } else {
                        FnKind::Method
                    };
                    self.visit_function(ast, member, kind, is_async);
                }
                AstKind::DeclField => self.visit_children(ast, member),
                _ => self.visit(ast, member),
            }
        }
        self.end_scope();
        self.classes.pop();
    }

    fn visit_for(&mut self, ast: &mut Ast, node: AstId) {
        let collection = ast.child(node, 1);
        self.visit(ast, collection);

        self.begin_scope(ast, node, ScopeKind::Block);
        let decl = ast.child(node, 0);
        for i in 0..ast.child_count(decl) {
            let name = ast.child(decl, i);
            let token = ast.node(name).token.clone();
            self.declare(&token, true);
            self.define(&token);
            // The protocol writes the loop variables each iteration.
            self.mark(&token.lexeme, SymbolState::Modified);
        }
        self.loop_depth += 1;
        let body = ast.child(node, 2);
        self.visit(ast, body);
        self.loop_depth -= 1;
        self.end_scope();
    }

    fn visit_return(&mut self, ast: &mut Ast, node: AstId) {
        let token = ast.node(node).token.clone();
        match self.functions.last().map(|f| f.kind) {
            Some(FnKind::Script) | None => {
                self.error(&token, "Can't return from top-level code.");
            }
            Some(FnKind::Initializer) if ast.child_count(node) > 0 => {
                self.error(&token, "Cannot return a value from an initializer.");
            }
            _ => {}
        }
        self.visit_children(ast, node);
    }

    fn visit_yield(&mut self, ast: &mut Ast, node: AstId) {
        let token = ast.node(node).token.clone();
        match self.functions.last().map(|f| f.kind) {
            Some(FnKind::Script) | None => {
                self.error(&token, "Can't yield from top-level code.");
            }
            Some(FnKind::Initializer) => {
                self.error(&token, "Cannot yield from an initializer.");
            }
            _ => {}
        }
        self.visit_children(ast, node);
    }

    fn visit_await(&mut self, ast: &mut Ast, node: AstId) {
        let token = ast.node(node).token.clone();
        match self.functions.last().map(|f| f.kind) {
            // A top-level await lifts the script closure to async.
            Some(FnKind::Script) => {
                self.functions[0].is_async = true;
            }
            Some(_) => {
                let is_async = self.functions.last().map_or(false, |f| f.is_async);
                if !is_async {
                    self.error(
                        &token,
                        "Can only use 'await' in async functions or top level code.",
                    );
                }
            }
            None => {}
        }
        self.visit_children(ast, node);
    }

    fn visit_try(&mut self, ast: &mut Ast, node: AstId) {
        let try_block = ast.child(node, 0);
        self.visit(ast, try_block);
        for i in 1..ast.child_count(node) {
            let clause = ast.child(node, i);
            match ast.node(clause).kind {
                AstKind::CatchClause => {
                    self.begin_scope(ast, clause, ScopeKind::Block);
                    let count = ast.child_count(clause);
                    if count == 2 {
                        let var = ast.child(clause, 0);
                        let token = ast.node(var).token.clone();
                        self.declare(&token, false);
                        self.define(&token);
                        // The binding is written by the handler itself.
                        self.mark(&token.lexeme, SymbolState::Accessed);
                    }
                    let block = ast.child(clause, count - 1);
                    self.visit(ast, block);
                    self.end_scope();
                }
                AstKind::FinallyClause => self.visit_children(ast, clause),
                _ => {}
            }
        }
    }

    fn visit_using(&mut self, ast: &mut Ast, node: AstId) {
        let path = ast.child(node, 0);
        let count = ast.child_count(path);
        let alias_token = if ast.child_count(node) > 1 {
            let alias = ast.child(node, 1);
            ast.node(alias).token.clone()
        } else {
            let last = ast.child(path, count - 1);
            ast.node(last).token.clone()
        };
        self.declare(&alias_token, false);
        self.define(&alias_token);
        self.using_aliases
            .push((alias_token.lexeme.clone(), alias_token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn resolve(source: &str) -> Result<ResolveOutput, Vec<ResolveError>> {
        let (mut ast, lex_errors, parse_errors) = Parser::new(source).parse();
        assert!(lex_errors.is_empty() && parse_errors.is_empty());
        let conf = Configuration::default();
        let resolver = Resolver::new(&conf);
        let result = resolver.resolve(&mut ast);
        result
    }

    fn resolve_errors(source: &str) -> Vec<String> {
        match resolve(source) {
            Ok(_) => vec![],
            Err(errors) => errors.into_iter().map(|e| e.message).collect(),
        }
    }

    #[test]
    fn test_redeclaration_in_scope_is_an_error() {
        let errors = resolve_errors("{ val x = 1; val x = 2; }");
        assert!(errors.iter().any(|e| e.contains("Already a variable")));
    }

    #[test]
    fn test_assignment_to_immutable_is_an_error() {
        let errors = resolve_errors("val x = 1; x = 2;");
        assert!(errors.iter().any(|e| e.contains("immutable")));
    }

    #[test]
    fn test_this_outside_class() {
        let errors = resolve_errors("print(this);");
        assert!(errors.iter().any(|e| e.contains("'this' outside of a class")));
    }

    #[test]
    fn test_break_outside_loop() {
        let errors = resolve_errors("break;");
        assert!(errors.iter().any(|e| e.contains("'break' outside of a loop")));
    }

    #[test]
    fn test_return_at_top_level() {
        let errors = resolve_errors("return 1;");
        assert!(errors.iter().any(|e| e.contains("top-level code")));
    }

    #[test]
    fn test_yield_at_top_level() {
        let errors = resolve_errors("yield 1;");
        assert!(errors.iter().any(|e| e.contains("yield")));
    }

    #[test]
    fn test_await_in_plain_function_is_an_error() {
        let errors = resolve_errors("fun f() { await g(); }");
        assert!(errors.iter().any(|e| e.contains("await")));
    }

    #[test]
    fn test_top_level_await_lifts_script_to_async() {
        let output = resolve("await f();").expect("resolves");
        assert!(output.script_is_async);
    }

    #[test]
    fn test_await_in_async_function_is_fine() {
        assert!(resolve("async fun f() { await g(); }").is_ok());
    }

    #[test]
    fn test_self_inheritance_is_an_error() {
        let errors = resolve_errors("class A : A { }");
        assert!(errors.iter().any(|e| e.contains("inherit from itself")));
    }

    #[test]
    fn test_object_redeclaration_is_an_error() {
        let errors = resolve_errors("class Object { }");
        assert!(errors.iter().any(|e| e.contains("root class Object")));
    }

    #[test]
    fn test_unused_variable_warning_follows_flag() {
        let (mut ast, _, _) = Parser::new("{ val unused = 1; }").parse();
        let mut conf = Configuration::default();
        conf.flag_unused_variable = FlagLevel::Warn;
        let output = Resolver::new(&conf).resolve(&mut ast).expect("resolves");
        assert!(output
            .warnings
            .iter()
            .any(|w| w.contains("'unused' is never used")));
    }

    #[test]
    fn test_immutable_must_be_initialized() {
        let errors = resolve_errors("val x;");
        assert!(errors.iter().any(|e| e.contains("must be initialized")));
    }
}
