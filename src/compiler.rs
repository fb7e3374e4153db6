/// Bytecode emitter: resolved AST → chunks.
///
/// One `FnCompiler` per function, chained through `enclosing` (script →
/// function → nested function). Each tracks locals (≤ 256 slots including
/// the reserved receiver slot), upvalues, scope depth and arity, plus the
/// loop and switch contexts that drive `break`/`continue` and case
/// emission. Class context lives on the outer `Compiler` because methods
/// compile inside their class's lexical scope.
///
/// Emission notes:
///   • `for (v : coll)` desugars to synthetic `collection`/`index` locals
///     driving the `next`/`nextValue` protocol
///   • try/catch reserves a six-byte TRY operand patched with the handler
///     and finally addresses; the finally body is emitted twice, once on
///     the normal path and once on the exceptional re-throw path
///   • `yield` marks the enclosing function as a generator
///   • a class body binds the synthetic locals ` class` and `super`; method
///     compilers capture `super` as an upvalue for super-dispatch

use indexmap::IndexMap;

use crate::ast::{Ast, AstId, AstKind};
use crate::chunk::{Chunk, OpCode};
use crate::errors::CompileError;
use crate::lexer::{Token, TokenKind};
use crate::object::{FunctionObj, ModuleObj, ObjData};
use crate::value::{HeapId, Value};
use crate::vm::Vm;

pub const MAX_LOCALS: usize = 256;
pub const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompileKind {
    Script,
    Function,
    Initializer,
    Lambda,
    Method,
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
    is_mutable: bool,
}

#[derive(Clone, Copy)]
pub struct UpvalueDesc {
    pub index: u8,
    pub is_local: bool,
    pub is_mutable: bool,
}

struct LoopCtx {
    start: usize,
    scope_depth: i32,
}

/// Marker for the enclosing-behavior chain; gates `this`/`super` emission.
struct ClassCtx;

struct FnCompiler {
    enclosing: Option<Box<FnCompiler>>,
    kind: CompileKind,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    arity: i32,
    is_async: bool,
    is_generator: bool,
    name: Option<String>,
    /// Dedupe map for named identifier-pool entries.
    ident_map: IndexMap<String, u8>,
    loops: Vec<LoopCtx>,
}

impl FnCompiler {
    fn new(kind: CompileKind, is_async: bool, name: Option<String>) -> FnCompiler {
        let slot_zero = if kind == CompileKind::Method || kind == CompileKind::Initializer {
            "this"
        } else {
            ""
        };
        FnCompiler {
            enclosing: None,
            kind,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                is_captured: false,
                is_mutable: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            arity: 0,
            is_async,
            is_generator: false,
            name,
            ident_map: IndexMap::new(),
            loops: Vec::new(),
        }
    }
}

fn resolve_local(fc: &FnCompiler, name: &str) -> Option<(u8, bool, bool)> {
    for (i, local) in fc.locals.iter().enumerate().rev() {
        if local.name == name {
            // depth −1 marks a declared-but-undefined local (own initializer).
            return Some((i as u8, local.is_mutable, local.depth == -1));
        }
    }
    None
}

fn add_upvalue(
    fc: &mut FnCompiler,
    index: u8,
    is_local: bool,
    is_mutable: bool,
    errors: &mut Vec<CompileError>,
    line: u32,
) -> u8 {
    for (i, upvalue) in fc.upvalues.iter().enumerate() {
        if upvalue.index == index && upvalue.is_local == is_local {
            return i as u8;
        }
    }
    if fc.upvalues.len() >= MAX_UPVALUES {
        errors.push(CompileError {
            message: "Too many closure variables in function.".into(),
            line,
        });
        return 0;
    }
    fc.upvalues.push(UpvalueDesc {
        index,
        is_local,
        is_mutable,
    });
    (fc.upvalues.len() - 1) as u8
}

fn resolve_upvalue(
    fc: &mut FnCompiler,
    name: &str,
    errors: &mut Vec<CompileError>,
    line: u32,
) -> Option<(u8, bool)> {
    fc.enclosing.as_deref_mut()?;

    let local = {
        let enclosing = fc.enclosing.as_deref_mut()?;
        match resolve_local(enclosing, name) {
            Some((index, is_mutable, _)) => {
                enclosing.locals[index as usize].is_captured = true;
                Some((index, is_mutable))
            }
            None => None,
        }
    };
    if let Some((index, is_mutable)) = local {
        let slot = add_upvalue(fc, index, true, is_mutable, errors, line);
        return Some((slot, is_mutable));
    }

    let upvalue = {
        let enclosing = fc.enclosing.as_deref_mut()?;
        resolve_upvalue(enclosing, name, errors, line)
    };
    if let Some((index, is_mutable)) = upvalue {
        let slot = add_upvalue(fc, index, false, is_mutable, errors, line);
        return Some((slot, is_mutable));
    }
    None
}

pub struct Compiler<'a> {
    vm: &'a mut Vm,
    module: HeapId,
    current: Box<FnCompiler>,
    classes: Vec<ClassCtx>,
    errors: Vec<CompileError>,
    line: u32,
}

/// Compiles a resolved program into the module's top-level function.
pub fn compile(
    vm: &mut Vm,
    ast: &Ast,
    module: HeapId,
    script_is_async: bool,
) -> Result<HeapId, Vec<CompileError>> {
    let mut compiler = Compiler {
        vm,
        module,
        current: Box::new(FnCompiler::new(CompileKind::Script, script_is_async, None)),
        classes: Vec::new(),
        errors: Vec::new(),
        line: 1,
    };

    let root = ast.root;
    for i in 0..ast.child_count(root) {
        compiler.declaration(ast, ast.child(root, i));
    }
    compiler.emit_return(0);

    if !compiler.errors.is_empty() {
        return Err(compiler.errors);
    }

    let finished = *compiler.current;
    let chunk_id = compiler.vm.chunks.len() as u32;
    compiler.vm.chunks.push(finished.chunk);
    let function = compiler.vm.heap.alloc(
        ObjData::Function(FunctionObj {
            name: None,
            arity: 0,
            upvalue_count: 0,
            chunk: chunk_id,
            is_generator: false,
            is_async: finished.is_async,
        }),
        None,
    );
    Ok(function)
}

impl<'a> Compiler<'a> {
    // ── Emission helpers ────────────────────────────────────────────────────

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(CompileError {
            message: message.into(),
            line: self.line,
        });
    }

    fn track_line(&mut self, token: &Token) {
        if token.line > 0 {
            self.line = token.line;
        }
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line;
        self.current.chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, a: OpCode, b: OpCode) {
        self.emit_op(a);
        self.emit_op(b);
    }

    fn emit_with_operand(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current.chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current.chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        self.current.chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        self.current.chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    /// Writes the current position into a two-byte address placeholder.
    fn patch_address(&mut self, offset: usize) {
        let target = self.current.chunk.code.len();
        if target > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        self.current.chunk.code[offset] = ((target >> 8) & 0xff) as u8;
        self.current.chunk.code[offset + 1] = (target & 0xff) as u8;
    }

    fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current.chunk.code.len() - start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if self.current.chunk.constants.len() > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        self.current.chunk.add_constant(value) as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_with_operand(OpCode::Constant, index);
    }

    /// Interns `name` and returns its identifier-pool index, reusing an
    /// existing entry for the same spelling.
    fn make_identifier(&mut self, name: &str) -> u8 {
        if let Some(&index) = self.current.ident_map.get(name) {
            return index;
        }
        if self.current.chunk.identifiers.len() > u8::MAX as usize {
            self.error("Too many identifiers in one chunk.");
            return 0;
        }
        let id = self.vm.heap.copy_string(name);
        let index = self.current.chunk.add_identifier(Value::Obj(id)) as u8;
        self.current.ident_map.insert(name.to_string(), index);
        index
    }

    /// Adds a non-name pool entry (a nested function object).
    fn make_identifier_value(&mut self, value: Value) -> u8 {
        if self.current.chunk.identifiers.len() > u8::MAX as usize {
            self.error("Too many identifiers in one chunk.");
            return 0;
        }
        self.current.chunk.add_identifier(value) as u8
    }

    fn emit_return(&mut self, depth: u8) {
        if self.current.kind == CompileKind::Initializer {
            self.emit_with_operand(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        if depth == 0 {
            self.emit_op(OpCode::Return);
        } else {
            self.emit_with_operand(OpCode::ReturnNonlocal, depth);
        }
    }

    // ── Scopes and variables ────────────────────────────────────────────────

    fn begin_scope(&mut self) {
        self.current.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current.scope_depth -= 1;
        while let Some(local) = self.current.locals.last() {
            if local.depth <= self.current.scope_depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current.locals.pop();
        }
    }

    fn add_local(&mut self, name: &str, is_mutable: bool) -> u8 {
        if self.current.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return 0;
        }
        self.current.locals.push(Local {
            name: name.to_string(),
            depth: -1,
            is_captured: false,
            is_mutable,
        });
        (self.current.locals.len() - 1) as u8
    }

    fn mark_initialized(&mut self, is_mutable: bool) {
        if self.current.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.current.locals.last_mut() {
            local.depth = self.current.scope_depth;
            local.is_mutable = is_mutable;
        }
    }

    fn declare_variable(&mut self, token: &Token) {
        if self.current.scope_depth == 0 {
            return;
        }
        let mut shadows = false;
        for local in self.current.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.current.scope_depth {
                break;
            }
            if local.name == token.lexeme {
                shadows = true;
                break;
            }
        }
        if shadows {
            self.error(format!(
                "Already a variable named '{}' in this scope.",
                token.lexeme
            ));
        }
        self.add_local(&token.lexeme, true);
    }

    /// Creates the binding for a declaration: locals become initialized, and
    /// module-scope names get a binding slot in the current module plus a
    /// DEFINE_GLOBAL_* instruction.
    fn define_variable(&mut self, ident: u8, is_mutable: bool) {
        if self.current.scope_depth > 0 {
            self.mark_initialized(is_mutable);
            return;
        }
        let name = match self.current.chunk.identifiers[ident as usize] {
            Value::Obj(id) => id,
            _ => return,
        };
        let redeclared = {
            let module = self.module_obj();
            module.val_indexes.contains_key(&name) || module.var_indexes.contains_key(&name)
        };
        if redeclared {
            self.error("Cannot redeclare global variable.");
            return;
        }
        let module = self.module_obj();
        if is_mutable {
            let slot = module.var_fields.len();
            module.var_indexes.insert(name, slot);
            module.var_fields.push(Value::Nil);
        } else {
            let slot = module.val_fields.len();
            module.val_indexes.insert(name, slot);
            module.val_fields.push(Value::Nil);
        }
        let op = if is_mutable {
            OpCode::DefineGlobalVar
        } else {
            OpCode::DefineGlobalVal
        };
        self.emit_with_operand(op, ident);
    }

    fn module_obj(&mut self) -> &mut ModuleObj {
        match self.vm.heap.data_mut(self.module) {
            ObjData::Module(m) => m,
            other => panic!("compiler module is a {}", other.kind_name()),
        }
    }

    fn get_variable(&mut self, name: &str) {
        if let Some((slot, _, in_initializer)) = resolve_local(&self.current, name) {
            if in_initializer {
                self.error("Can't read local variable in its own initializer.");
            }
            self.emit_with_operand(OpCode::GetLocal, slot);
            return;
        }
        let line = self.line;
        if let Some((slot, _)) =
            resolve_upvalue(&mut self.current, name, &mut self.errors, line)
        {
            self.emit_with_operand(OpCode::GetUpvalue, slot);
            return;
        }
        let ident = self.make_identifier(name);
        self.emit_with_operand(OpCode::GetGlobal, ident);
    }

    fn set_variable(&mut self, name: &str) {
        if let Some((slot, is_mutable, _)) = resolve_local(&self.current, name) {
            if !is_mutable {
                self.error("Cannot assign to immutable local variable.");
            }
            self.emit_with_operand(OpCode::SetLocal, slot);
            return;
        }
        let line = self.line;
        if let Some((slot, is_mutable)) =
            resolve_upvalue(&mut self.current, name, &mut self.errors, line)
        {
            if !is_mutable {
                self.error("Cannot assign to immutable captured upvalue.");
            }
            self.emit_with_operand(OpCode::SetUpvalue, slot);
            return;
        }
        let ident = self.make_identifier(name);
        let name_id = match self.current.chunk.identifiers[ident as usize] {
            Value::Obj(id) => Some(id),
            _ => None,
        };
        if let Some(name_id) = name_id {
            let immutable = self.module_obj().val_indexes.contains_key(&name_id);
            if immutable {
                self.error("Cannot assign to immutable global variable.");
            }
        }
        self.emit_with_operand(OpCode::SetGlobal, ident);
    }

    // ── Declarations ────────────────────────────────────────────────────────

    fn declaration(&mut self, ast: &Ast, node: AstId) {
        let token = ast.node(node).token.clone();
        self.track_line(&token);
        match ast.node(node).kind {
            AstKind::DeclVar => self.var_declaration(ast, node),
            AstKind::DeclFun => self.fun_declaration(ast, node),
            AstKind::DeclClass => self.behavior_declaration(ast, node, false),
            AstKind::DeclTrait => self.behavior_declaration(ast, node, true),
            AstKind::DeclNamespace => self.namespace_declaration(ast, node),
            _ => self.statement(ast, node),
        }
    }

    fn var_declaration(&mut self, ast: &Ast, node: AstId) {
        let token = ast.node(node).token.clone();
        let is_mutable = ast.node(node).modifiers.is_mutable;
        self.declare_variable(&token);
        let ident = if self.current.scope_depth == 0 {
            self.make_identifier(&token.lexeme)
        } else {
            0
        };
        if ast.child_count(node) > 0 {
            self.expression(ast, ast.child(node, 0));
        } else if !is_mutable {
            self.error("Immutable variable must be initialized upon declaration.");
            self.emit_op(OpCode::Nil);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.define_variable(ident, is_mutable);
    }

    fn fun_declaration(&mut self, ast: &Ast, node: AstId) {
        let token = ast.node(node).token.clone();
        self.declare_variable(&token);
        let ident = if self.current.scope_depth == 0 {
            self.make_identifier(&token.lexeme)
        } else {
            0
        };
        self.mark_initialized(false);
        let function = ast.child(node, 0);
        let kind = CompileKind::Function;
        let is_async = ast.node(function).modifiers.is_async;
        self.compile_function(ast, function, kind, is_async, Some(token.lexeme.clone()));
        self.define_variable(ident, false);
    }

    fn compile_function(
        &mut self,
        ast: &Ast,
        node: AstId,
        kind: CompileKind,
        is_async: bool,
        name: Option<String>,
    ) {
        let fresh = Box::new(FnCompiler::new(kind, is_async, name));
        let enclosing = std::mem::replace(&mut self.current, fresh);
        self.current.enclosing = Some(enclosing);
        self.begin_scope();

        let params = ast.child(node, 0);
        for i in 0..ast.child_count(params) {
            let param = ast.child(params, i);
            let token = ast.node(param).token.clone();
            let modifiers = ast.node(param).modifiers;
            if modifiers.is_variadic {
                self.current.arity = -1;
            } else if self.current.arity >= 0 {
                self.current.arity += 1;
            }
            self.declare_variable(&token);
            self.mark_initialized(modifiers.is_mutable);
        }

        let body = ast.child(node, 1);
        let stmts = ast.child(body, 0);
        let count = ast.child_count(stmts);
        for i in 0..count {
            let stmt = ast.child(stmts, i);
            // A lambda whose last statement is an expression yields it.
            if kind == CompileKind::Lambda
                && i + 1 == count
                && ast.node(stmt).kind == AstKind::StmtExpression
            {
                self.expression(ast, ast.child(stmt, 0));
                self.emit_op(OpCode::Return);
            } else {
                self.declaration(ast, stmt);
            }
        }
        self.emit_return(0);

        let enclosing = match self.current.enclosing.take() {
            Some(enclosing) => enclosing,
            None => return,
        };
        let finished = std::mem::replace(&mut self.current, enclosing);

        let chunk_id = self.vm.chunks.len() as u32;
        self.vm.chunks.push(finished.chunk);
        let name_id = finished.name.as_deref().map(|n| self.vm.heap.copy_string(n));
        let function = self.vm.heap.alloc(
            ObjData::Function(FunctionObj {
                name: name_id,
                arity: finished.arity,
                upvalue_count: finished.upvalues.len(),
                chunk: chunk_id,
                is_generator: finished.is_generator,
                is_async: finished.is_async,
            }),
            None,
        );
        let ident = self.make_identifier_value(Value::Obj(function));
        self.emit_with_operand(OpCode::Closure, ident);
        for upvalue in &finished.upvalues {
            let is_local = upvalue.is_local as u8;
            let index = upvalue.index;
            self.emit_byte(is_local);
            self.emit_byte(index);
        }
    }

    fn behavior_declaration(&mut self, ast: &Ast, node: AstId, is_trait: bool) {
        let token = ast.node(node).token.clone();
        let ident = self.make_identifier(&token.lexeme);
        self.declare_variable(&token);
        let op = if is_trait { OpCode::Trait } else { OpCode::Class };
        self.emit_with_operand(op, ident);
        self.define_variable(ident, false);

        let body = ast.child(node, 0);
        self.compile_behavior_body(ast, body, Some(&token.lexeme), is_trait);
    }

    /// Shared by declarations and anonymous behavior expressions. Named
    /// behaviors open a scope binding the synthetic ` class` and `super`
    /// locals; anonymous behaviors keep the class on the stack and do not
    /// support `super`.
    fn compile_behavior_body(
        &mut self,
        ast: &Ast,
        body: AstId,
        name: Option<&str>,
        is_trait: bool,
    ) {
        let named = name.is_some();
        if let Some(name) = name {
            self.begin_scope();
            self.get_variable(name);
            let class_slot = self.add_local(" class", false);
            self.mark_initialized(false);
            if is_trait {
                self.emit_op(OpCode::Nil);
            } else {
                let superclass = ast.child(body, 0);
                self.expression(ast, superclass);
            }
            self.add_local("super", false);
            self.mark_initialized(false);
            if !is_trait {
                self.emit_op(OpCode::Inherit);
            }
            self.classes.push(ClassCtx);
            // Bring the class to the top for member definition.
            self.emit_with_operand(OpCode::GetLocal, class_slot);
        } else {
            // Anonymous behaviors inherit Object implicitly and bind no
            // `super` local.
            if !is_trait {
                let superclass = ast.child(body, 0);
                let default = ast.node(superclass).kind == AstKind::ExprVariable
                    && ast.node(superclass).token.line == 0
                    && ast.node(superclass).token.lexeme == "Object";
                if !default {
                    self.error("Anonymous classes cannot declare a superclass.");
                }
            }
            let kind = if is_trait { 1u8 } else { 0u8 };
            self.emit_with_operand(OpCode::Anonymous, kind);
            self.classes.push(ClassCtx);
        }

        let trait_list = ast.child(body, 1);
        let trait_count = ast.child_count(trait_list);
        if trait_count > 0 {
            if trait_count > u8::MAX as usize {
                self.error("Too many traits applied to one behavior.");
            }
            for i in 0..trait_count {
                self.expression(ast, ast.child(trait_list, i));
            }
            self.emit_with_operand(OpCode::Implement, trait_count as u8);
        }

        for i in 2..ast.child_count(body) {
            let member = ast.child(body, i);
            let member_token = ast.node(member).token.clone();
            self.track_line(&member_token);
            match ast.node(member).kind {
                AstKind::DeclMethod => {
                    let modifiers = ast.node(member).modifiers;
                    let ident = self.make_identifier(&member_token.lexeme);
                    let kind = if modifiers.is_initializer {
                        CompileKind::Initializer
                    } else {
                        CompileKind::Method
                    };
                    self.compile_function(
                        ast,
                        member,
                        kind,
                        modifiers.is_async,
                        Some(member_token.lexeme.clone()),
                    );
                    let op = if modifiers.is_class {
                        OpCode::ClassMethod
                    } else {
                        OpCode::InstanceMethod
                    };
                    self.emit_with_operand(op, ident);
                }
                AstKind::DeclField => {
                    let ident = self.make_identifier(&member_token.lexeme);
                    self.emit_op(OpCode::Dup);
                    if ast.child_count(member) > 0 {
                        self.expression(ast, ast.child(member, 0));
                    } else {
                        self.emit_op(OpCode::Nil);
                    }
                    self.emit_with_operand(OpCode::SetProperty, ident);
                    self.emit_op(OpCode::Pop);
                }
                _ => self.error("Invalid member in behavior body."),
            }
        }

        self.classes.pop();
        if named {
            self.emit_op(OpCode::Pop);
            self.end_scope();
        }
    }

    fn namespace_declaration(&mut self, ast: &Ast, node: AstId) {
        let idents = ast.child(node, 0);
        let count = ast.child_count(idents);
        for i in 0..count {
            let segment = ast.child(idents, i);
            let name = ast.node(segment).token.lexeme.clone();
            let ident = self.make_identifier(&name);
            self.emit_with_operand(OpCode::Namespace, ident);
        }
        if count > u8::MAX as usize {
            self.error("Namespace nesting too deep.");
        }
        self.emit_with_operand(OpCode::DeclareNamespace, count as u8);
    }

    // ── Statements ──────────────────────────────────────────────────────────

    fn statement(&mut self, ast: &Ast, node: AstId) {
        let token = ast.node(node).token.clone();
        self.track_line(&token);
        match ast.node(node).kind {
            AstKind::StmtExpression => {
                self.expression(ast, ast.child(node, 0));
                self.emit_op(OpCode::Pop);
            }
            AstKind::StmtBlock => {
                self.begin_scope();
                let stmts = ast.child(node, 0);
                for i in 0..ast.child_count(stmts) {
                    self.declaration(ast, ast.child(stmts, i));
                }
                self.end_scope();
            }
            AstKind::StmtIf => self.if_statement(ast, node),
            AstKind::StmtWhile => self.while_statement(ast, node),
            AstKind::StmtFor => self.for_statement(ast, node),
            AstKind::StmtSwitch => self.switch_statement(ast, node),
            AstKind::StmtBreak => self.break_statement(),
            AstKind::StmtContinue => self.continue_statement(),
            AstKind::StmtReturn => self.return_statement(ast, node),
            AstKind::StmtThrow => {
                self.expression(ast, ast.child(node, 0));
                self.emit_op(OpCode::Throw);
            }
            AstKind::StmtTry => self.try_statement(ast, node),
            AstKind::StmtRequire => {
                if self.current.kind != CompileKind::Script {
                    self.error("Can only require source files from top-level code.");
                }
                self.expression(ast, ast.child(node, 0));
                self.emit_op(OpCode::Require);
            }
            AstKind::StmtUsing => self.using_statement(ast, node),
            AstKind::StmtYield => {
                self.mark_generator();
                if ast.child_count(node) > 0 {
                    self.expression(ast, ast.child(node, 0));
                } else {
                    self.emit_op(OpCode::Nil);
                }
                self.emit_ops(OpCode::Yield, OpCode::Pop);
            }
            AstKind::StmtYieldFrom => {
                self.mark_generator();
                self.expression(ast, ast.child(node, 0));
                self.emit_ops(OpCode::YieldFrom, OpCode::Pop);
            }
            AstKind::StmtAwait => {
                self.mark_async();
                self.expression(ast, ast.child(node, 0));
                self.emit_ops(OpCode::Await, OpCode::Pop);
            }
            _ => self.error("Invalid AST statement type."),
        }
    }

    fn mark_generator(&mut self) {
        match self.current.kind {
            CompileKind::Script => self.error("Can't yield from top-level code."),
            CompileKind::Initializer => self.error("Cannot yield from an initializer."),
            _ => self.current.is_generator = true,
        }
    }

    fn mark_async(&mut self) {
        if self.current.kind == CompileKind::Script {
            self.current.is_async = true;
        } else if !self.current.is_async {
            self.error("Can only use 'await' in async functions or top level code.");
        }
    }

    fn if_statement(&mut self, ast: &Ast, node: AstId) {
        self.expression(ast, ast.child(node, 0));
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(ast, ast.child(node, 1));
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if ast.child_count(node) > 2 {
            self.statement(ast, ast.child(node, 2));
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self, ast: &Ast, node: AstId) {
        let start = self.current.chunk.code.len();
        let scope_depth = self.current.scope_depth;
        self.current.loops.push(LoopCtx { start, scope_depth });

        self.expression(ast, ast.child(node, 0));
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(ast, ast.child(node, 1));
        self.emit_loop(start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.end_loop();
    }

    /// `for (v : coll)` / `for (i, v : coll)` desugars into the iteration
    /// protocol: `index = coll.next(index)` until nil, `v =
    /// coll.nextValue(index)` each round.
    fn for_statement(&mut self, ast: &Ast, node: AstId) {
        self.begin_scope();
        let decl = ast.child(node, 0);
        let (index_name, value_name) = if ast.child_count(decl) > 1 {
            (
                ast.node(ast.child(decl, 0)).token.lexeme.clone(),
                ast.node(ast.child(decl, 1)).token.lexeme.clone(),
            )
        } else {
            (
                " index".to_string(),
                ast.node(ast.child(decl, 0)).token.lexeme.clone(),
            )
        };

        self.expression(ast, ast.child(node, 1));
        let collection_slot = self.add_local(" collection", false);
        self.mark_initialized(false);
        self.emit_op(OpCode::Nil);
        let index_slot = self.add_local(&index_name, true);
        self.mark_initialized(true);

        let start = self.current.chunk.code.len();
        let scope_depth = self.current.scope_depth;
        self.current.loops.push(LoopCtx { start, scope_depth });

        self.emit_with_operand(OpCode::GetLocal, collection_slot);
        self.emit_with_operand(OpCode::GetLocal, index_slot);
        self.invoke_method("next", 1);
        self.emit_with_operand(OpCode::SetLocal, index_slot);
        let exit_jump = self.emit_jump(OpCode::JumpIfEmpty);
        self.emit_op(OpCode::Pop);

        self.emit_with_operand(OpCode::GetLocal, collection_slot);
        self.emit_with_operand(OpCode::GetLocal, index_slot);
        self.invoke_method("nextValue", 1);

        self.begin_scope();
        self.add_local(&value_name, false);
        self.mark_initialized(false);
        self.statement(ast, ast.child(node, 2));
        self.end_scope();

        self.emit_loop(start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.end_loop();
        self.end_scope();
    }

    fn invoke_method(&mut self, name: &str, argc: u8) {
        let ident = self.make_identifier(name);
        self.emit_op(OpCode::Invoke);
        self.emit_byte(ident);
        self.emit_byte(argc);
    }

    fn switch_statement(&mut self, ast: &Ast, node: AstId) {
        // The subject becomes a synthetic local so case bodies keep their
        // locals aligned with the stack.
        self.begin_scope();
        self.expression(ast, ast.child(node, 0));
        self.add_local(" switch", false);
        self.mark_initialized(false);

        let case_list = ast.child(node, 1);
        let mut case_ends = Vec::new();
        for i in 0..ast.child_count(case_list) {
            let case = ast.child(case_list, i);
            self.emit_op(OpCode::Dup);
            self.expression(ast, ast.child(case, 0));
            self.emit_op(OpCode::Equal);
            let skip = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);
            self.begin_scope();
            let stmts = ast.child(case, 1);
            for j in 0..ast.child_count(stmts) {
                self.declaration(ast, ast.child(stmts, j));
            }
            self.end_scope();
            case_ends.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(skip);
            self.emit_op(OpCode::Pop);
        }

        if ast.child_count(node) > 2 {
            let default = ast.child(node, 2);
            self.begin_scope();
            let stmts = ast.child(default, 0);
            for j in 0..ast.child_count(stmts) {
                self.declaration(ast, ast.child(stmts, j));
            }
            self.end_scope();
        }
        for end in case_ends {
            self.patch_jump(end);
        }
        self.end_scope();
    }

    /// Pops locals belonging to scopes inside the innermost loop, without
    /// forgetting them (the surrounding code is still inside those scopes).
    fn discard_loop_locals(&mut self) {
        let Some(loop_ctx) = self.current.loops.last() else { return };
        let scope_depth = loop_ctx.scope_depth;
        let mut emit: Vec<OpCode> = Vec::new();
        for local in self.current.locals.iter().rev() {
            if local.depth <= scope_depth {
                break;
            }
            emit.push(if local.is_captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            });
        }
        for op in emit {
            self.emit_op(op);
        }
    }

    fn break_statement(&mut self) {
        if self.current.loops.is_empty() {
            self.error("Cannot use 'break' outside of a loop.");
            return;
        }
        self.discard_loop_locals();
        self.emit_jump(OpCode::End);
    }

    fn continue_statement(&mut self) {
        if self.current.loops.is_empty() {
            self.error("Cannot use 'continue' outside of a loop.");
            return;
        }
        self.discard_loop_locals();
        let start = match self.current.loops.last() {
            Some(l) => l.start,
            None => return,
        };
        self.emit_loop(start);
    }

    /// Rewrites every `End` placeholder inside the finished loop into a
    /// forward `Jump` landing at the current position.
    fn end_loop(&mut self) {
        let Some(loop_ctx) = self.current.loops.pop() else { return };
        let mut offset = loop_ctx.start;
        while offset < self.current.chunk.code.len() {
            if self.current.chunk.code[offset] == OpCode::End as u8 {
                self.current.chunk.code[offset] = OpCode::Jump as u8;
                self.patch_jump(offset + 1);
            } else {
                let width = self
                    .current
                    .chunk
                    .instruction_width(offset, &self.vm.heap);
                offset += width;
                continue;
            }
            offset += 3;
        }
    }

    fn return_statement(&mut self, ast: &Ast, node: AstId) {
        match self.current.kind {
            CompileKind::Script => {
                self.error("Can't return from top-level code.");
            }
            CompileKind::Initializer if ast.child_count(node) > 0 => {
                self.error("Cannot return a value from an initializer.");
            }
            _ => {}
        }

        let depth = if self.current.kind == CompileKind::Lambda {
            self.lambda_depth()
        } else {
            0
        };
        if ast.child_count(node) > 0 {
            self.expression(ast, ast.child(node, 0));
            if depth == 0 {
                self.emit_op(OpCode::Return);
            } else {
                self.emit_with_operand(OpCode::ReturnNonlocal, depth);
            }
        } else {
            self.emit_return(depth);
        }
    }

    fn lambda_depth(&self) -> u8 {
        let mut depth: u8 = 1;
        let mut current = self.current.enclosing.as_deref();
        while let Some(fc) = current {
            if fc.kind != CompileKind::Lambda {
                break;
            }
            depth = depth.saturating_add(1);
            current = fc.enclosing.as_deref();
        }
        depth
    }

    fn try_statement(&mut self, ast: &Ast, node: AstId) {
        self.emit_op(OpCode::Try);
        let exception_ident = self.current.chunk.code.len();
        self.emit_byte(0xff);
        let handler_address = self.current.chunk.code.len();
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        let finally_address = self.current.chunk.code.len();
        self.emit_byte(0xff);
        self.emit_byte(0xff);

        self.statement(ast, ast.child(node, 0));
        self.emit_op(OpCode::Catch);
        let catch_jump = self.emit_jump(OpCode::Jump);

        // Catch clause: the propagated exception instance lands exactly in
        // the slot of the handler variable.
        let mut finally_node = None;
        let mut handled = false;
        for i in 1..ast.child_count(node) {
            let clause = ast.child(node, i);
            match ast.node(clause).kind {
                AstKind::CatchClause => {
                    handled = true;
                    let class_token = ast.node(clause).token.clone();
                    let ident = self.make_identifier(&class_token.lexeme);
                    self.current.chunk.code[exception_ident] = ident;
                    self.patch_address(handler_address);

                    self.begin_scope();
                    let count = ast.child_count(clause);
                    let var_name = if count == 2 {
                        ast.node(ast.child(clause, 0)).token.lexeme.clone()
                    } else {
                        " exception".to_string()
                    };
                    self.add_local(&var_name, false);
                    self.mark_initialized(false);
                    self.emit_op(OpCode::Catch);
                    self.statement(ast, ast.child(clause, count - 1));
                    self.end_scope();
                }
                AstKind::FinallyClause => finally_node = Some(clause),
                _ => {}
            }
        }
        if !handled {
            self.error("Must have a catch clause following a try statement.");
        }
        self.patch_jump(catch_jump);

        if let Some(finally) = finally_node {
            let body = ast.child(finally, 0);
            // Normal path.
            self.statement(ast, body);
            let end_jump = self.emit_jump(OpCode::Jump);
            // Exceptional path: entered by propagation with the exception on
            // the stack; re-throws after the body runs.
            self.patch_address(finally_address);
            self.begin_scope();
            let slot = self.add_local(" exception", false);
            self.mark_initialized(false);
            self.statement(ast, body);
            self.emit_with_operand(OpCode::GetLocal, slot);
            self.emit_op(OpCode::Finally);
            // Unreachable past FINALLY; discard scope bookkeeping silently.
            self.current.locals.pop();
            self.current.scope_depth -= 1;
            self.patch_jump(end_jump);
        }
    }

    fn using_statement(&mut self, ast: &Ast, node: AstId) {
        let path = ast.child(node, 0);
        let count = ast.child_count(path);
        for i in 0..count {
            let segment = ast.child(path, i);
            let name = ast.node(segment).token.lexeme.clone();
            let ident = self.make_identifier(&name);
            self.emit_with_operand(OpCode::Namespace, ident);
        }
        self.emit_with_operand(OpCode::GetNamespace, count as u8);

        let alias = if ast.child_count(node) > 1 {
            ast.node(ast.child(node, 1)).token.lexeme.clone()
        } else {
            ast.node(ast.child(path, count - 1)).token.lexeme.clone()
        };
        let alias_ident = self.make_identifier(&alias);
        self.emit_with_operand(OpCode::UsingNamespace, alias_ident);
    }

    // ── Expressions ─────────────────────────────────────────────────────────

    fn expression(&mut self, ast: &Ast, node: AstId) {
        let token = ast.node(node).token.clone();
        self.track_line(&token);
        match ast.node(node).kind {
            AstKind::ExprLiteral => self.literal(&token),
            AstKind::ExprInterpolation => self.interpolation(ast, node),
            AstKind::ExprGrouping => self.expression(ast, ast.child(node, 0)),
            AstKind::ExprVariable => self.get_variable(&token.lexeme),
            AstKind::ExprAssign => {
                self.expression(ast, ast.child(node, 0));
                self.set_variable(&token.lexeme);
            }
            AstKind::ExprUnary => {
                self.expression(ast, ast.child(node, 0));
                match token.kind {
                    TokenKind::Minus => self.emit_op(OpCode::Negate),
                    TokenKind::Bang => self.emit_op(OpCode::Not),
                    _ => self.error("Invalid unary operator."),
                }
            }
            AstKind::ExprBinary => self.binary(ast, node, &token),
            AstKind::ExprAnd => {
                self.expression(ast, ast.child(node, 0));
                let end_jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit_op(OpCode::Pop);
                self.expression(ast, ast.child(node, 1));
                self.patch_jump(end_jump);
            }
            AstKind::ExprOr => {
                self.expression(ast, ast.child(node, 0));
                let else_jump = self.emit_jump(OpCode::JumpIfFalse);
                let end_jump = self.emit_jump(OpCode::Jump);
                self.patch_jump(else_jump);
                self.emit_op(OpCode::Pop);
                self.expression(ast, ast.child(node, 1));
                self.patch_jump(end_jump);
            }
            AstKind::ExprTernary => {
                self.expression(ast, ast.child(node, 0));
                let else_jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit_op(OpCode::Pop);
                self.expression(ast, ast.child(node, 1));
                let end_jump = self.emit_jump(OpCode::Jump);
                self.patch_jump(else_jump);
                self.emit_op(OpCode::Pop);
                self.expression(ast, ast.child(node, 2));
                self.patch_jump(end_jump);
            }
            AstKind::ExprNilCoalescing => {
                self.expression(ast, ast.child(node, 0));
                self.expression(ast, ast.child(node, 1));
                self.emit_op(OpCode::NilCoalescing);
            }
            AstKind::ExprElvis => {
                self.expression(ast, ast.child(node, 0));
                self.expression(ast, ast.child(node, 1));
                self.emit_op(OpCode::Elvis);
            }
            AstKind::ExprCall | AstKind::ExprOptionalCall => {
                self.expression(ast, ast.child(node, 0));
                let argc = self.argument_list(ast, ast.child(node, 1));
                let op = if ast.node(node).kind == AstKind::ExprCall {
                    OpCode::Call
                } else {
                    OpCode::OptionalCall
                };
                self.emit_with_operand(op, argc);
            }
            AstKind::ExprInvoke | AstKind::ExprOptionalInvoke => {
                self.expression(ast, ast.child(node, 0));
                let ident = self.make_identifier(&token.lexeme);
                let argc = self.argument_list(ast, ast.child(node, 1));
                let op = if ast.node(node).kind == AstKind::ExprInvoke {
                    OpCode::Invoke
                } else {
                    OpCode::OptionalInvoke
                };
                self.emit_op(op);
                self.emit_byte(ident);
                self.emit_byte(argc);
            }
            AstKind::ExprPropertyGet | AstKind::ExprPropertyGetOptional => {
                self.expression(ast, ast.child(node, 0));
                let ident = self.make_identifier(&token.lexeme);
                let op = if ast.node(node).kind == AstKind::ExprPropertyGet {
                    OpCode::GetProperty
                } else {
                    OpCode::GetPropertyOptional
                };
                self.emit_with_operand(op, ident);
            }
            AstKind::ExprPropertySet => {
                self.expression(ast, ast.child(node, 0));
                let ident = self.make_identifier(&token.lexeme);
                self.expression(ast, ast.child(node, 1));
                self.emit_with_operand(OpCode::SetProperty, ident);
            }
            AstKind::ExprSubscriptGet | AstKind::ExprSubscriptGetOptional => {
                self.expression(ast, ast.child(node, 0));
                self.expression(ast, ast.child(node, 1));
                let op = if ast.node(node).kind == AstKind::ExprSubscriptGet {
                    OpCode::GetSubscript
                } else {
                    OpCode::GetSubscriptOptional
                };
                self.emit_op(op);
            }
            AstKind::ExprSubscriptSet => {
                self.expression(ast, ast.child(node, 0));
                self.expression(ast, ast.child(node, 1));
                self.expression(ast, ast.child(node, 2));
                self.emit_op(OpCode::SetSubscript);
            }
            AstKind::ExprThis => {
                if self.classes.is_empty() {
                    self.error("Cannot use 'this' outside of a class.");
                }
                self.get_variable("this");
            }
            AstKind::ExprSuperGet => {
                if self.classes.is_empty() {
                    self.error("Cannot use 'super' outside of a class.");
                }
                let ident = self.make_identifier(&token.lexeme);
                self.get_variable("this");
                self.get_variable("super");
                self.emit_with_operand(OpCode::GetSuper, ident);
            }
            AstKind::ExprSuperInvoke => {
                if self.classes.is_empty() {
                    self.error("Cannot use 'super' outside of a class.");
                }
                let ident = self.make_identifier(&token.lexeme);
                self.get_variable("this");
                let argc = self.argument_list(ast, ast.child(node, 0));
                self.get_variable("super");
                self.emit_op(OpCode::SuperInvoke);
                self.emit_byte(ident);
                self.emit_byte(argc);
            }
            AstKind::ExprArray => {
                let list = ast.child(node, 0);
                let count = ast.child_count(list);
                if count > u8::MAX as usize {
                    self.error("Array literal has too many elements.");
                }
                for i in 0..count {
                    self.expression(ast, ast.child(list, i));
                }
                self.emit_with_operand(OpCode::Array, count as u8);
            }
            AstKind::ExprDictionary => {
                let keys = ast.child(node, 0);
                let values = ast.child(node, 1);
                let count = ast.child_count(keys);
                if count > u8::MAX as usize {
                    self.error("Dictionary literal has too many entries.");
                }
                for i in 0..count {
                    self.expression(ast, ast.child(keys, i));
                    self.expression(ast, ast.child(values, i));
                }
                self.emit_with_operand(OpCode::Dictionary, count as u8);
            }
            AstKind::ExprFunction => {
                let modifiers = ast.node(node).modifiers;
                let kind = if modifiers.is_lambda {
                    CompileKind::Lambda
                } else {
                    CompileKind::Function
                };
                let name = if token.lexeme.is_empty() {
                    None
                } else {
                    Some(token.lexeme.clone())
                };
                self.compile_function(ast, node, kind, modifiers.is_async, name);
            }
            AstKind::ExprClass => {
                let body = ast.child(node, 0);
                self.compile_behavior_body(ast, body, None, false);
            }
            AstKind::ExprTrait => {
                let body = ast.child(node, 0);
                self.compile_behavior_body(ast, body, None, true);
            }
            AstKind::ExprAwait => {
                self.mark_async();
                self.expression(ast, ast.child(node, 0));
                self.emit_op(OpCode::Await);
            }
            AstKind::ExprYield => {
                self.mark_generator();
                self.expression(ast, ast.child(node, 0));
                self.emit_op(OpCode::Yield);
            }
            AstKind::ExprYieldFrom => {
                self.mark_generator();
                self.expression(ast, ast.child(node, 0));
                self.emit_op(OpCode::YieldFrom);
            }
            _ => self.error("Invalid AST expression type."),
        }
    }

    fn literal(&mut self, token: &Token) {
        match token.kind {
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Int => match token.lexeme.parse::<i32>() {
                Ok(n) => self.emit_constant(Value::Int(n)),
                // Too wide for int32: fall back to the float representation.
                Err(_) => match token.lexeme.parse::<f64>() {
                    Ok(n) => self.emit_constant(Value::Float(n)),
                    Err(_) => self.error("Invalid integer literal."),
                },
            },
            TokenKind::Float => match token.lexeme.parse::<f64>() {
                Ok(n) => self.emit_constant(Value::Float(n)),
                Err(_) => self.error("Invalid number literal."),
            },
            TokenKind::String => {
                let id = self.vm.heap.copy_string(&token.lexeme);
                self.emit_constant(Value::Obj(id));
            }
            TokenKind::Empty if token.lexeme == "nil" => self.emit_op(OpCode::Nil),
            _ => self.error("Invalid AST literal type."),
        }
    }

    fn binary(&mut self, ast: &Ast, node: AstId, token: &Token) {
        self.expression(ast, ast.child(node, 0));
        self.expression(ast, ast.child(node, 1));
        match token.kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Modulo => self.emit_op(OpCode::Modulo),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::DotDot => self.emit_op(OpCode::Range),
            _ => self.error("Invalid binary operator."),
        }
    }

    /// Segments concatenate left to right; non-string segments are sent
    /// `toString` first.
    fn interpolation(&mut self, ast: &Ast, node: AstId) {
        let parts = ast.child(node, 0);
        let count = ast.child_count(parts);
        for i in 0..count {
            let part = ast.child(parts, i);
            let is_string_literal = ast.node(part).kind == AstKind::ExprLiteral
                && ast.node(part).token.kind == TokenKind::String;
            self.expression(ast, part);
            if !is_string_literal {
                self.invoke_method("toString", 0);
            }
            if i > 0 {
                self.emit_op(OpCode::Add);
            }
        }
        if count == 0 {
            let id = self.vm.heap.copy_string("");
            self.emit_constant(Value::Obj(id));
        }
    }

    fn argument_list(&mut self, ast: &Ast, list: AstId) -> u8 {
        let count = ast.child_count(list);
        if count > 255 {
            self.error("Can't have more than 255 arguments.");
        }
        for i in 0..count {
            self.expression(ast, ast.child(list, i));
        }
        count as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::vm::Vm;

    fn compile_source(source: &str) -> Result<(), Vec<CompileError>> {
        let (ast, lex_errors, parse_errors) = Parser::new(source).parse();
        assert!(lex_errors.is_empty(), "lex errors: {:?}", lex_errors);
        assert!(parse_errors.is_empty(), "parse errors: {:?}", parse_errors);
        let mut vm = Vm::new(crate::conf::Configuration::default());
        let module = vm.new_module("test.kes");
        compile(&mut vm, &ast, module, false).map(|_| ())
    }

    #[test]
    fn test_simple_program_compiles() {
        assert!(compile_source("val x = 1 + 2; print(x);").is_ok());
    }

    #[test]
    fn test_closure_program_compiles() {
        assert!(compile_source(
            "fun makeCounter() { var i = 0; return fun() { i = i + 1; return i; }; }"
        )
        .is_ok());
    }

    #[test]
    fn test_class_program_compiles() {
        assert!(compile_source(
            "class A { greet() { return \"hi\"; } } class B : A { greet() { return super.greet() + \"!\"; } }"
        )
        .is_ok());
    }

    #[test]
    fn test_too_many_locals_is_a_compile_error() {
        // The receiver slot is local 0; slots 1..=255 hold user locals, so
        // 255 locals fill the frame and a 256th overflows it.
        let mut ok = String::from("fun f() {\n");
        for i in 0..255 {
            ok.push_str(&format!("var l{} = {};\n", i, i));
        }
        ok.push('}');
        assert!(compile_source(&ok).is_ok(), "255 locals must compile");

        let mut bad = String::from("fun f() {\n");
        for i in 0..256 {
            bad.push_str(&format!("var l{} = {};\n", i, i));
        }
        bad.push('}');
        let errors = compile_source(&bad).expect_err("256 locals must fail");
        assert!(errors
            .iter()
            .any(|e| e.message.contains("Too many local variables")));
    }

    #[test]
    fn test_global_redeclaration_is_a_compile_error() {
        let errors = compile_source("val x = 1; val x = 2;").expect_err("redeclaration");
        assert!(errors
            .iter()
            .any(|e| e.message.contains("Cannot redeclare global")));
    }

    #[test]
    fn test_assignment_to_global_val_is_a_compile_error() {
        let errors = compile_source("val x = 1; x = 2;").expect_err("immutable global");
        assert!(errors
            .iter()
            .any(|e| e.message.contains("immutable global")));
    }

    #[test]
    fn test_yield_marks_generator() {
        assert!(compile_source("fun g() { yield 1; }").is_ok());
    }

    #[test]
    fn test_require_outside_script_is_an_error() {
        let errors =
            compile_source("fun f() { require \"x\"; }").expect_err("require in function");
        assert!(errors
            .iter()
            .any(|e| e.message.contains("top-level code")));
    }
}
