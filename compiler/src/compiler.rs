//! Single-pass Pratt compiler: parsing and code generation happen in the
//! same walk, with no intermediate AST. Structurally this is a
//! direct generalization of a textbook Pratt parser — a rule table keyed by
//! token type, each cell an optional prefix handler, optional infix handler
//! and a binding precedence — extended with the scope/local/upvalue/class
//! bookkeeping a real language needs.
use crate::chunk::{Chunk, OpCode};
use crate::error::{CompileError, CompileErrors};
use crate::gc::{Gc, MarkRoots};
use crate::object::{GcRef, ObjFunction, ObjString};
use crate::value::Value;
use lexer::{Lexer, Token, TokenType};

const MAX_LOCALS: usize = 256;
const MAX_CONSTANTS: usize = 256;

/// Compiles a complete source file into a top-level function (the
/// "compile" entry point). The returned function's chunk is what the VM
/// executes as the implicit top-level `main`.
pub fn compile(source: &str, gc: &mut Gc) -> Result<GcRef<ObjFunction>, CompileErrors> {
    let parser = Parser::new(source);
    let scope = FunctionScope::new(gc, None, FunctionType::Script);
    let mut compiler = Compiler {
        parser,
        scope,
        class: None,
        gc,
    };

    while !compiler.check(TokenType::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenType::Eof, "Expect end of expression.");
    compiler.emit_return();

    if compiler.parser.had_error {
        Err(CompileErrors(compiler.parser.errors))
    } else {
        Ok(compiler.scope.function)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: Token<'src>,
    depth: Option<i32>,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compile state. Chained through `enclosing` the same way
/// clox's `Compiler` chains through a C global; compiling a nested `fun`
/// pushes a fresh scope and compiling its body pops back to this one.
struct FunctionScope<'src> {
    function: GcRef<ObjFunction>,
    fn_type: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    enclosing: Option<Box<FunctionScope<'src>>>,
}

impl<'src> FunctionScope<'src> {
    fn new(gc: &mut Gc, name: Option<GcRef<ObjString>>, fn_type: FunctionType) -> Self {
        let function = gc.alloc_function(name);
        let mut locals = Vec::with_capacity(MAX_LOCALS);
        // Slot 0 is reserved: the receiver in methods, unnamed (and thus
        // unreachable by source code) everywhere else.
        let slot_name = match fn_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            _ => "",
        };
        locals.push(Local {
            name: Token::new(TokenType::Identifier, slot_name, 0),
            depth: Some(0),
            is_captured: false,
        });
        Self {
            function,
            fn_type,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            enclosing: None,
        }
    }
}

/// Tracks whether the class currently being compiled has a superclass, so
/// `super` expressions can be rejected outside that context.
struct ClassScope {
    has_superclass: bool,
    enclosing: Option<Box<ClassScope>>,
}

struct Parser<'src> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.scan_token();
        Self {
            lexer,
            previous: current,
            current,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
        }
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.kind() {
            TokenType::Eof => "at end".to_string(),
            TokenType::Error => String::new(),
            _ => format!("at '{}'", token.lexeme()),
        };
        self.errors.push(CompileError {
            line: token.line(),
            location,
            message: message.to_string(),
        });
    }
}

struct Compiler<'src, 'gc> {
    parser: Parser<'src>,
    scope: FunctionScope<'src>,
    class: Option<Box<ClassScope>>,
    gc: &'gc mut Gc,
}

type ParserFn = for<'src, 'gc> fn(&mut Compiler<'src, 'gc>, bool);

#[derive(Clone, Copy)]
struct ParserRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn higher(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

/// Marks every function currently under construction — the active
/// `FunctionScope` plus its whole `enclosing` chain — so a collection
/// triggered mid-compile doesn't free a function (and, transitively, the
/// constants/names already emitted into its chunk) before `compile` has
/// had a chance to return it or fold it into an enclosing chunk.
impl<'src, 'gc> MarkRoots for Compiler<'src, 'gc> {
    fn mark_roots(&mut self, gc: &mut Gc) {
        let mut scope = Some(&self.scope);
        while let Some(current) = scope {
            gc.mark_object(current.function.erase());
            scope = current.enclosing.as_deref();
        }
    }
}

impl<'src, 'gc> Compiler<'src, 'gc> {
    /// Runs a full mark-sweep cycle rooted at this compiler's in-progress
    /// functions. `self.gc` is only ever borrowed, not owned, so the usual
    /// take-swap-restore trick operates on the referent rather than the
    /// field itself.
    fn collect_garbage(&mut self) {
        let mut gc = std::mem::take(&mut *self.gc);
        gc.collect_garbage(self);
        *self.gc = gc;
    }

    fn maybe_collect_garbage(&mut self) {
        if self.gc.should_collect() {
            self.collect_garbage();
        }
    }

    // --------------------------------------------------------------- token plumbing

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.parser.lexer.scan_token();
            if self.parser.current.kind() != TokenType::Error {
                break;
            }
            let message = self.parser.current.lexeme().to_string();
            self.parser.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenType) -> bool {
        self.parser.current.kind() == kind
    }

    fn match_token(&mut self, kind: TokenType) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenType, message: &str) {
        if self.check(kind) {
            self.advance();
            return;
        }
        self.parser.error_at_current(message);
    }

    fn error(&mut self, message: &str) {
        self.parser.error(message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.parser.error_at_current(message);
    }

    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind() != TokenType::Eof {
            if self.parser.previous.kind() == TokenType::Semicolon {
                return;
            }
            match self.parser.current.kind() {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => self.advance(),
            }
        }
    }

    // --------------------------------------------------------------- bytecode emission

    fn chunk(&self) -> &Chunk {
        &self.scope.function.as_ref().chunk
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.scope.function.as_mut().chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line();
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_return(&mut self) {
        if self.scope.fn_type == FunctionType::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.chunk_mut().add_constant(value);
        if index >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(index);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.gc.intern(name);
        self.make_constant(Value::Obj(interned.erase()))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let bytes = (jump as u16).to_be_bytes();
        self.chunk_mut().code[offset] = bytes[0];
        self.chunk_mut().code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    // --------------------------------------------------------------- scopes & locals

    fn begin_scope(&mut self) {
        self.scope.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.scope.scope_depth -= 1;
        while let Some(local) = self.scope.locals.last() {
            if local.depth.map_or(false, |d| d > self.scope.scope_depth) {
                if local.is_captured {
                    self.emit_op(OpCode::CloseUpvalue);
                } else {
                    self.emit_op(OpCode::Pop);
                }
                self.scope.locals.pop();
            } else {
                break;
            }
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.scope.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.scope.locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.scope.scope_depth == 0 {
            return;
        }
        let name = self.parser.previous;
        let mut duplicate = false;
        for local in self.scope.locals.iter().rev() {
            if let Some(depth) = local.depth {
                if depth < self.scope.scope_depth {
                    break;
                }
            }
            if local.name.lexeme() == name.lexeme() {
                duplicate = true;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);
        self.declare_variable();
        if self.scope.scope_depth > 0 {
            return 0;
        }
        let name = self.parser.previous.lexeme();
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        if self.scope.scope_depth == 0 {
            return;
        }
        let depth = self.scope.scope_depth;
        self.scope.locals.last_mut().unwrap().depth = Some(depth);
    }

    fn define_variable(&mut self, global: u8) {
        if self.scope.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global);
    }

    fn resolve_local(&mut self, name: &str) -> Option<u8> {
        match resolve_local_in(&self.scope, name) {
            Some((index, true)) => {
                self.error("Can't read local variable in its own initializer.");
                Some(index)
            }
            Some((index, false)) => Some(index),
            None => None,
        }
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let (get_op, set_op, arg) = if let Some(index) = self.resolve_local(name.lexeme()) {
            (OpCode::GetLocal, OpCode::SetLocal, index)
        } else if let Some(index) = resolve_upvalue(&mut self.scope, name.lexeme()) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let index = self.identifier_constant(name.lexeme());
            (OpCode::GetGlobal, OpCode::SetGlobal, index)
        };

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_op(set_op);
            self.emit_byte(arg);
        } else {
            self.emit_op(get_op);
            self.emit_byte(arg);
        }
    }

    // --------------------------------------------------------------- declarations & statements

    fn declaration(&mut self) {
        if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.synchronize();
        }

        self.maybe_collect_garbage();
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.parser.previous;
        let name_constant = self.identifier_constant(class_name.lexeme());
        self.declare_variable();

        self.emit_op(OpCode::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);

        self.class = Some(Box::new(ClassScope {
            has_superclass: false,
            enclosing: self.class.take(),
        }));

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            let superclass_name = self.parser.previous;
            self.variable(false);
            if superclass_name.lexeme() == class_name.lexeme() {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local(Token::new(TokenType::Identifier, "super", superclass_name.line()));
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.class.as_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let class_scope = self.class.take().unwrap();
        if class_scope.has_superclass {
            self.end_scope();
        }
        self.class = class_scope.enclosing;
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name = self.parser.previous.lexeme();
        let constant = self.identifier_constant(name);
        let fn_type = if name == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(fn_type);
        self.emit_op(OpCode::Method);
        self.emit_byte(constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, fn_type: FunctionType) {
        let name = self.gc.intern(self.parser.previous.lexeme());
        let enclosing = std::mem::replace(&mut self.scope, FunctionScope::new(self.gc, Some(name), fn_type));
        self.scope.enclosing = Some(Box::new(enclosing));
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                let arity = self.scope.function.as_ref().arity as u32 + 1;
                if arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.scope.function.as_mut().arity = arity as u8;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        self.emit_return();
        let enclosing = self.scope.enclosing.take().expect("function() always has an enclosing scope");
        let finished = std::mem::replace(&mut self.scope, *enclosing);

        let constant = self.make_constant(Value::Obj(finished.function.erase()));
        self.emit_op(OpCode::Closure);
        self.emit_byte(constant);
        for upvalue in finished.upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::Print) {
            self.print_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.scope.fn_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.scope.fn_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenType::Semicolon) {
            // no initializer
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    // --------------------------------------------------------------- expressions

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;

        match get_rule(self.parser.previous.kind()).prefix {
            Some(prefix) => prefix(self, can_assign),
            None => {
                self.error("Expect expression.");
                return;
            }
        }

        while precedence <= get_rule(self.parser.current.kind()).precedence {
            self.advance();
            let infix = get_rule(self.parser.previous.kind())
                .infix
                .expect("a rule with a binding precedence must have an infix handler");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.parser.previous;
        self.named_variable(name, can_assign);
    }
}

// --------------------------------------------------------------- upvalue resolution
// Free functions because they walk ancestor `FunctionScope`s, not the one
// `self.scope` currently points at.

fn resolve_local_in(scope: &FunctionScope, name: &str) -> Option<(u8, bool)> {
    for (i, local) in scope.locals.iter().enumerate().rev() {
        if local.name.lexeme() == name {
            return Some((i as u8, local.depth.is_none()));
        }
    }
    None
}

fn add_upvalue(scope: &mut FunctionScope, index: u8, is_local: bool) -> u8 {
    for (i, existing) in scope.upvalues.iter().enumerate() {
        if existing.index == index && existing.is_local == is_local {
            return i as u8;
        }
    }
    scope.upvalues.push(UpvalueDesc { index, is_local });
    scope.function.as_mut().upvalue_count = scope.upvalues.len() as u8;
    (scope.upvalues.len() - 1) as u8
}

fn resolve_upvalue(scope: &mut FunctionScope, name: &str) -> Option<u8> {
    let enclosing = scope.enclosing.as_deref_mut()?;
    if let Some((index, _is_uninitialized)) = resolve_local_in(enclosing, name) {
        enclosing.locals[index as usize].is_captured = true;
        return Some(add_upvalue(scope, index, true));
    }
    if let Some(index) = resolve_upvalue(enclosing, name) {
        return Some(add_upvalue(scope, index, false));
    }
    None
}

// --------------------------------------------------------------- parser rule table

#[rustfmt::skip]
fn get_rule(kind: TokenType) -> ParserRule {
    use TokenType::*;
    const fn rule(prefix: Option<ParserFn>, infix: Option<ParserFn>, precedence: Precedence) -> ParserRule {
        ParserRule { prefix, infix, precedence }
    }
    match kind {
        LeftParen    => rule(Some(grouping), Some(call), Precedence::Call),
        RightParen   => rule(None,           None,       Precedence::None),
        LeftBrace    => rule(None,           None,       Precedence::None),
        RightBrace   => rule(None,           None,       Precedence::None),
        Comma        => rule(None,           None,       Precedence::None),
        Dot          => rule(None,           Some(dot),  Precedence::Call),
        Minus        => rule(Some(unary),    Some(binary), Precedence::Term),
        Plus         => rule(None,           Some(binary), Precedence::Term),
        Semicolon    => rule(None,           None,       Precedence::None),
        Slash        => rule(None,           Some(binary), Precedence::Factor),
        Star         => rule(None,           Some(binary), Precedence::Factor),
        Bang         => rule(Some(unary),    None,       Precedence::None),
        BangEqual    => rule(None,           Some(binary), Precedence::Equality),
        Equal        => rule(None,           None,       Precedence::None),
        EqualEqual   => rule(None,           Some(binary), Precedence::Equality),
        Greater      => rule(None,           Some(binary), Precedence::Comparison),
        GreaterEqual => rule(None,           Some(binary), Precedence::Comparison),
        Less         => rule(None,           Some(binary), Precedence::Comparison),
        LessEqual    => rule(None,           Some(binary), Precedence::Comparison),
        Identifier   => rule(Some(variable_rule), None,   Precedence::None),
        String       => rule(Some(string),   None,       Precedence::None),
        Number       => rule(Some(number),   None,       Precedence::None),
        And          => rule(None,           Some(and_), Precedence::And),
        Class        => rule(None,           None,       Precedence::None),
        Else         => rule(None,           None,       Precedence::None),
        False        => rule(Some(literal),  None,       Precedence::None),
        For          => rule(None,           None,       Precedence::None),
        Fun          => rule(None,           None,       Precedence::None),
        If           => rule(None,           None,       Precedence::None),
        Nil          => rule(Some(literal),  None,       Precedence::None),
        Or           => rule(None,           Some(or_),  Precedence::Or),
        Print        => rule(None,           None,       Precedence::None),
        Return       => rule(None,           None,       Precedence::None),
        Super        => rule(Some(super_),   None,       Precedence::None),
        This         => rule(Some(this_),    None,       Precedence::None),
        True         => rule(Some(literal),  None,       Precedence::None),
        Var          => rule(None,           None,       Precedence::None),
        While        => rule(None,           None,       Precedence::None),
        Error        => rule(None,           None,       Precedence::None),
        Eof          => rule(None,           None,       Precedence::None),
    }
}

fn grouping(compiler: &mut Compiler<'_, '_>, _can_assign: bool) {
    compiler.expression();
    compiler.consume(TokenType::RightParen, "Expect ')' after expression.");
}

fn number(compiler: &mut Compiler<'_, '_>, _can_assign: bool) {
    let value: f64 = compiler
        .parser
        .previous
        .lexeme()
        .parse()
        .expect("a Number token's lexeme always parses as f64");
    compiler.emit_constant(Value::Number(value));
}

fn string(compiler: &mut Compiler<'_, '_>, _can_assign: bool) {
    let lexeme = compiler.parser.previous.lexeme();
    let contents = &lexeme[1..lexeme.len() - 1];
    let interned = compiler.gc.intern(contents);
    compiler.emit_constant(Value::Obj(interned.erase()));
}

fn unary(compiler: &mut Compiler<'_, '_>, _can_assign: bool) {
    let operator = compiler.parser.previous.kind();
    compiler.parse_precedence(Precedence::Unary);
    match operator {
        TokenType::Bang => compiler.emit_op(OpCode::Not),
        TokenType::Minus => compiler.emit_op(OpCode::Negate),
        _ => unreachable!(),
    }
}

fn binary(compiler: &mut Compiler<'_, '_>, _can_assign: bool) {
    let operator = compiler.parser.previous.kind();
    let rule = get_rule(operator);
    compiler.parse_precedence(rule.precedence.higher());
    match operator {
        TokenType::BangEqual => {
            compiler.emit_op(OpCode::Equal);
            compiler.emit_op(OpCode::Not);
        }
        TokenType::EqualEqual => compiler.emit_op(OpCode::Equal),
        TokenType::Greater => compiler.emit_op(OpCode::Greater),
        TokenType::GreaterEqual => {
            compiler.emit_op(OpCode::Less);
            compiler.emit_op(OpCode::Not);
        }
        TokenType::Less => compiler.emit_op(OpCode::Less),
        TokenType::LessEqual => {
            compiler.emit_op(OpCode::Greater);
            compiler.emit_op(OpCode::Not);
        }
        TokenType::Plus => compiler.emit_op(OpCode::Add),
        TokenType::Minus => compiler.emit_op(OpCode::Subtract),
        TokenType::Star => compiler.emit_op(OpCode::Multiply),
        TokenType::Slash => compiler.emit_op(OpCode::Divide),
        _ => unreachable!(),
    }
}

fn literal(compiler: &mut Compiler<'_, '_>, _can_assign: bool) {
    match compiler.parser.previous.kind() {
        TokenType::False => compiler.emit_op(OpCode::False),
        TokenType::Nil => compiler.emit_op(OpCode::Nil),
        TokenType::True => compiler.emit_op(OpCode::True),
        _ => unreachable!(),
    }
}

fn variable_rule(compiler: &mut Compiler<'_, '_>, can_assign: bool) {
    compiler.variable(can_assign);
}

fn and_(compiler: &mut Compiler<'_, '_>, _can_assign: bool) {
    let end_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    compiler.emit_op(OpCode::Pop);
    compiler.parse_precedence(Precedence::And);
    compiler.patch_jump(end_jump);
}

fn or_(compiler: &mut Compiler<'_, '_>, _can_assign: bool) {
    let else_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    let end_jump = compiler.emit_jump(OpCode::Jump);
    compiler.patch_jump(else_jump);
    compiler.emit_op(OpCode::Pop);
    compiler.parse_precedence(Precedence::Or);
    compiler.patch_jump(end_jump);
}

fn call(compiler: &mut Compiler<'_, '_>, _can_assign: bool) {
    let arg_count = compiler.argument_list();
    compiler.emit_op(OpCode::Call);
    compiler.emit_byte(arg_count);
}

fn dot(compiler: &mut Compiler<'_, '_>, can_assign: bool) {
    compiler.consume(TokenType::Identifier, "Expect property name after '.'.");
    let name = compiler.parser.previous.lexeme();
    let name_constant = compiler.identifier_constant(name);

    if can_assign && compiler.match_token(TokenType::Equal) {
        compiler.expression();
        compiler.emit_op(OpCode::SetProperty);
        compiler.emit_byte(name_constant);
    } else if compiler.match_token(TokenType::LeftParen) {
        let arg_count = compiler.argument_list();
        compiler.emit_op(OpCode::Invoke);
        compiler.emit_byte(name_constant);
        compiler.emit_byte(arg_count);
    } else {
        compiler.emit_op(OpCode::GetProperty);
        compiler.emit_byte(name_constant);
    }
}

fn this_(compiler: &mut Compiler<'_, '_>, _can_assign: bool) {
    if compiler.class.is_none() {
        compiler.error("Can't use 'this' outside of a class.");
        return;
    }
    compiler.variable(false);
}

fn super_(compiler: &mut Compiler<'_, '_>, _can_assign: bool) {
    let line = compiler.parser.previous.line();
    compiler.consume(TokenType::Dot, "Expect '.' after 'super'.");
    compiler.consume(TokenType::Identifier, "Expect superclass method name.");
    let name_constant = compiler.identifier_constant(compiler.parser.previous.lexeme());

    match &compiler.class {
        None => compiler.error("Can't use 'super' outside of a class."),
        Some(class) if !class.has_superclass => {
            compiler.error("Can't use 'super' in a class with no superclass.")
        }
        Some(_) => {}
    }

    let this_token = Token::new(TokenType::Identifier, "this", line);
    let super_token = Token::new(TokenType::Identifier, "super", line);

    if compiler.match_token(TokenType::LeftParen) {
        let arg_count = compiler.argument_list();
        compiler.named_variable(this_token, false);
        compiler.named_variable(super_token, false);
        compiler.emit_op(OpCode::SuperInvoke);
        compiler.emit_byte(name_constant);
        compiler.emit_byte(arg_count);
    } else {
        compiler.named_variable(this_token, false);
        compiler.named_variable(super_token, false);
        compiler.emit_op(OpCode::GetSuper);
        compiler.emit_byte(name_constant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::OpCode;

    fn compile_ok(source: &str) -> GcRef<ObjFunction> {
        // Leaked so the returned `GcRef` stays valid for the rest of the
        // test; `gc` going out of scope here would free every object it
        // allocated, including the function being returned.
        let gc = Box::leak(Box::new(Gc::new()));
        compile(source, gc).unwrap_or_else(|errors| panic!("{errors}"))
    }

    fn opcodes(function: GcRef<ObjFunction>) -> Vec<u8> {
        function.as_ref().chunk.code.clone()
    }

    #[test]
    fn precedence_ordering_matches_grammar() {
        assert!(Precedence::Assignment < Precedence::Or);
        assert!(Precedence::Or < Precedence::And);
        assert!(Precedence::Factor > Precedence::Term);
        assert!(Precedence::Call > Precedence::Unary);
    }

    #[test]
    fn arithmetic_expression_compiles_with_correct_precedence() {
        let function = compile_ok("1 + 2 * 3;");
        let code = opcodes(function);
        // constant 1, constant 2, constant 3, multiply, add, pop, nil, return
        assert_eq!(
            code,
            vec![
                OpCode::Constant as u8, 0,
                OpCode::Constant as u8, 1,
                OpCode::Constant as u8, 2,
                OpCode::Multiply as u8,
                OpCode::Add as u8,
                OpCode::Pop as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
    }

    #[test]
    fn undefined_variable_reference_is_not_a_compile_error() {
        // Referencing an undefined global is only a *runtime* error;
        // the compiler just emits OP_GET_GLOBAL and lets the VM find it missing.
        compile_ok("print nope;");
    }

    #[test]
    fn return_at_top_level_is_a_compile_error() {
        let mut gc = Gc::new();
        let result = compile("return 1;", &mut gc);
        assert!(result.is_err());
    }

    #[test]
    fn redeclaring_a_local_in_the_same_scope_is_an_error() {
        let mut gc = Gc::new();
        let result = compile("{ var a = 1; var a = 2; }", &mut gc);
        assert!(result.is_err());
    }

    #[test]
    fn closures_capture_enclosing_locals_as_upvalues() {
        let function = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        // outer's chunk should contain a Closure opcode for `inner`.
        assert!(opcodes(function).contains(&(OpCode::Closure as u8)));
    }

    #[test]
    fn a_collection_mid_compile_does_not_free_the_function_under_construction() {
        let mut gc = Gc::new();
        gc.force_next_gc(0); // collect after every declaration
        let source = "fun a() { fun b() { fun c() { return 1; } return c; } return b; } \
                      print a()()();";
        let function = compile(source, &mut gc).unwrap_or_else(|errors| panic!("{errors}"));
        assert!(opcodes(function).contains(&(OpCode::Closure as u8)));
    }
}
