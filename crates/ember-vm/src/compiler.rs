//! The compiler: a single-pass Pratt parser that consumes tokens and emits
//! bytecode straight into a function under construction.
//!
//! There is no AST. Expressions are parsed by precedence climbing over a
//! static rule table; statements and declarations are recursive descent.
//! Each function being compiled gets a [`FunctionFrame`] holding its locals,
//! upvalue records, and scope depth; frames form a chain mirroring lexical
//! nesting, and every in-progress function object is rooted on the heap's
//! protect stack so a collection mid-compile cannot reclaim it.
//!
//! Errors go to the [`Handler`]; after one is reported the parser enters
//! panic mode and discards tokens until a statement boundary, so a single
//! mistake does not cascade.

use ember_core::{Chunk, Heap, ObjFunction, ObjHandle, Object, OpCode, Roots, Value};
use ember_lex::{Scanner, Token, TokenKind};
use ember_util::{Diagnostic, ErrorLocation, Handler};

/// Locals and upvalue records per function are capped so that slot operands
/// fit in one byte.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compile a source text into a top-level script function.
///
/// Returns `None` when any diagnostic was reported; the caller decides how
/// to surface the failure. With `dump_bytecode` set, each finished function
/// is disassembled to stdout.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    handler: &Handler,
    dump_bytecode: bool,
) -> Option<ObjHandle> {
    let _span = tracing::debug_span!("compile").entered();

    let mut parser = Parser::new(source, heap, handler, dump_bytecode);
    parser.advance();
    while !parser.matches(TokenKind::Eof) {
        parser.declaration();
    }

    let had_error = parser.had_error;
    let function = parser.finish();
    if had_error {
        None
    } else {
        Some(function)
    }
}

/// Expression precedence, lowest to highest. Parsing at level `p` consumes
/// every operator whose level is `>= p`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    /// One level tighter; used for left-associative infix operators.
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'ctx> = fn(&mut Parser<'src, 'ctx>, bool);

struct ParseRule<'src, 'ctx> {
    prefix: Option<ParseFn<'src, 'ctx>>,
    infix: Option<ParseFn<'src, 'ctx>>,
    precedence: Precedence,
}

/// The static Pratt table: what each token can start, what it can continue,
/// and how tightly it binds.
fn rule<'src, 'ctx>(kind: TokenKind) -> ParseRule<'src, 'ctx> {
    use TokenKind::*;
    let (prefix, infix, precedence): (
        Option<ParseFn<'src, 'ctx>>,
        Option<ParseFn<'src, 'ctx>>,
        Precedence,
    ) = match kind {
        LeftParen => (Some(Parser::grouping), Some(Parser::call), Precedence::Call),
        Dot => (None, Some(Parser::dot), Precedence::Call),
        Minus => (Some(Parser::unary), Some(Parser::binary), Precedence::Term),
        Plus => (None, Some(Parser::binary), Precedence::Term),
        Slash | Star => (None, Some(Parser::binary), Precedence::Factor),
        Bang => (Some(Parser::unary), None, Precedence::None),
        BangEqual | EqualEqual => (None, Some(Parser::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            (None, Some(Parser::binary), Precedence::Comparison)
        }
        Identifier => (Some(Parser::variable), None, Precedence::None),
        String => (Some(Parser::string), None, Precedence::None),
        Number => (Some(Parser::number), None, Precedence::None),
        And => (None, Some(Parser::and), Precedence::And),
        Or => (None, Some(Parser::or), Precedence::Or),
        False | Nil | True => (Some(Parser::literal), None, Precedence::None),
        Import => (Some(Parser::import), None, Precedence::None),
        Super => (Some(Parser::super_), None, Precedence::None),
        This => (Some(Parser::this), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

/// What kind of function body is being compiled; drives implicit returns
/// and the meaning of stack slot zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while the initializer is still running.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

/// Per-function compile state. Frames chain through `enclosing`, innermost
/// first, mirroring lexical nesting.
struct FunctionFrame<'src> {
    enclosing: Option<Box<FunctionFrame<'src>>>,
    function: ObjHandle,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
}

impl<'src> FunctionFrame<'src> {
    fn new(function: ObjHandle, kind: FunctionKind) -> Self {
        let mut frame = Self {
            enclosing: None,
            function,
            kind,
            locals: Vec::with_capacity(8),
            upvalues: Vec::new(),
            scope_depth: 0,
        };
        // Slot zero belongs to the callee: `this` inside methods, unnameable
        // otherwise.
        frame.locals.push(Local {
            name: if kind == FunctionKind::Function { "" } else { "this" },
            depth: 0,
            is_captured: false,
        });
        frame
    }

    fn resolve_local(&self, name: &str) -> Result<Option<u8>, &'static str> {
        for (slot, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err("Can't read local variable in its own initializer.");
                }
                return Ok(Some(slot as u8));
            }
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, &'static str> {
        for (slot, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(slot as u8);
            }
        }
        if self.upvalues.len() == MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.upvalues.push(CompilerUpvalue { index, is_local });
        Ok((self.upvalues.len() - 1) as u8)
    }

    /// Find `name` in an enclosing function, threading it down through one
    /// upvalue record per intermediate frame.
    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, &'static str> {
        let Some(enclosing) = self.enclosing.as_deref_mut() else {
            return Ok(None);
        };

        if let Some(local) = enclosing.resolve_local(name)? {
            enclosing.locals[local as usize].is_captured = true;
            return self.add_upvalue(local, true).map(Some);
        }

        if let Some(upvalue) = enclosing.resolve_upvalue(name)? {
            return self.add_upvalue(upvalue, false).map(Some);
        }

        Ok(None)
    }
}

/// Tracks the innermost `class` declaration, for `this`/`super` validation.
struct ClassFrame {
    enclosing: Option<Box<ClassFrame>>,
    has_superclass: bool,
}

pub struct Parser<'src, 'ctx> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    heap: &'ctx mut Heap,
    handler: &'ctx Handler,
    frame: FunctionFrame<'src>,
    class: Option<Box<ClassFrame>>,
    dump_bytecode: bool,
}

impl<'src, 'ctx> Parser<'src, 'ctx> {
    fn new(source: &'src str, heap: &'ctx mut Heap, handler: &'ctx Handler, dump_bytecode: bool) -> Self {
        let function = heap.alloc(Object::Function(ObjFunction::new()), Roots::EMPTY);
        heap.protect(function);
        Self {
            scanner: Scanner::new(source),
            current: Token::synthetic(""),
            previous: Token::synthetic(""),
            had_error: false,
            panic_mode: false,
            heap,
            handler,
            frame: FunctionFrame::new(function, FunctionKind::Script),
            class: None,
            dump_bytecode,
        }
    }

    // =========================================================================
    // TOKEN PLUMBING
    // =========================================================================

    fn advance(&mut self) {
        self.previous = self.current;

        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // =========================================================================
    // ERROR REPORTING
    // =========================================================================

    fn error_at(&mut self, token: Token<'_>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.kind {
            TokenKind::Eof => ErrorLocation::AtEnd,
            TokenKind::Error => ErrorLocation::Bare,
            _ => ErrorLocation::At(token.lexeme.to_string()),
        };
        self.handler
            .report(Diagnostic::error(token.line, location, message));
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    /// Leave panic mode by skipping to the next statement boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // =========================================================================
    // BYTECODE EMISSION
    // =========================================================================

    fn chunk(&self) -> &Chunk {
        &self.heap.function(self.frame.function).chunk
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.heap.function_mut(self.frame.function).chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.chunk_mut().write_op(op, line);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_pair(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    /// Emit a forward jump with a placeholder offset; returns the offset's
    /// position for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the two offset bytes themselves.
        let jump = self.chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }

        let chunk = self.chunk_mut();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);

        let offset = self.chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_return(&mut self) {
        if self.frame.kind == FunctionKind::Initializer {
            self.emit_pair(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let constant = self.chunk_mut().add_constant(value);
        if constant > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        constant as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_pair(OpCode::Constant, constant);
    }

    fn identifier_constant(&mut self, name: Token<'_>) -> u8 {
        let handle = self.heap.intern(name.lexeme, Roots::EMPTY);
        self.make_constant(Value::object(handle))
    }

    // =========================================================================
    // FUNCTION FRAMES
    // =========================================================================

    fn begin_function(&mut self, kind: FunctionKind) {
        let function = self.heap.alloc(Object::Function(ObjFunction::new()), Roots::EMPTY);
        self.heap.protect(function);
        if kind != FunctionKind::Script {
            let name = self.heap.intern(self.previous.lexeme, Roots::EMPTY);
            self.heap.function_mut(function).name = Some(name);
        }

        let enclosing = std::mem::replace(&mut self.frame, FunctionFrame::new(function, kind));
        self.frame.enclosing = Some(Box::new(enclosing));
    }

    /// Emit the implicit return, publish the upvalue count, and optionally
    /// disassemble the finished function.
    fn seal_current(&mut self) {
        self.emit_return();
        let function = self.frame.function;
        self.heap.function_mut(function).upvalue_count = self.frame.upvalues.len();

        if self.dump_bytecode && !self.had_error {
            let function = self.heap.function(function);
            let name = match function.name {
                Some(name) => self.heap.string(name).text.to_string(),
                None => "<script>".to_string(),
            };
            print!("{}", crate::debug::disassemble_chunk(self.heap, &function.chunk, &name));
        }
    }

    /// Finish a nested function and pop back to its enclosing frame.
    fn end_function(&mut self) -> FunctionFrame<'src> {
        self.seal_current();
        self.heap.unprotect();
        let parent = match self.frame.enclosing.take() {
            Some(parent) => *parent,
            None => unreachable!("end_function called on the script frame"),
        };
        std::mem::replace(&mut self.frame, parent)
    }

    /// Finish the top-level script frame and hand back its function.
    fn finish(mut self) -> ObjHandle {
        self.seal_current();
        self.heap.unprotect();
        self.frame.function
    }

    // =========================================================================
    // SCOPES AND VARIABLES
    // =========================================================================

    fn begin_scope(&mut self) {
        self.frame.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame.scope_depth -= 1;

        while let Some(local) = self.frame.locals.last() {
            if local.depth <= self.frame.scope_depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.frame.locals.pop();
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.frame.locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.frame.locals.push(Local {
            name: name.lexeme,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.frame.scope_depth == 0 {
            return;
        }
        let name = self.previous;

        let mut duplicate = false;
        for local in self.frame.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.frame.scope_depth {
                break;
            }
            if local.name == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);

        self.declare_variable();
        if self.frame.scope_depth > 0 {
            return 0;
        }

        let name = self.previous;
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        if self.frame.scope_depth == 0 {
            return;
        }
        let depth = self.frame.scope_depth;
        if let Some(local) = self.frame.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.frame.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_pair(OpCode::DefineGlobal, global);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let (get_op, set_op, arg) = match self.frame.resolve_local(name.lexeme) {
            Err(message) => {
                self.error(message);
                (OpCode::GetLocal, OpCode::SetLocal, 0)
            }
            Ok(Some(slot)) => (OpCode::GetLocal, OpCode::SetLocal, slot),
            Ok(None) => match self.frame.resolve_upvalue(name.lexeme) {
                Err(message) => {
                    self.error(message);
                    (OpCode::GetUpvalue, OpCode::SetUpvalue, 0)
                }
                Ok(Some(slot)) => (OpCode::GetUpvalue, OpCode::SetUpvalue, slot),
                Ok(None) => {
                    let constant = self.identifier_constant(name);
                    (OpCode::GetGlobal, OpCode::SetGlobal, constant)
                }
            },
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_pair(set_op, arg);
        } else {
            self.emit_pair(get_op, arg);
        }
    }

    // =========================================================================
    // EXPRESSIONS
    // =========================================================================

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or_default();
        self.emit_constant(Value::number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let handle = self.heap.intern(text, Roots::EMPTY);
        self.emit_constant(Value::object(handle));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;

        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let next = rule(operator).precedence.next();
        self.parse_precedence(next);

        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_pair(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let token = self.previous;
        let name = self.identifier_constant(token);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_pair(OpCode::SetProperty, name);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_pair(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_pair(OpCode::GetProperty, name);
        }
    }

    fn this(&mut self, _can_assign: bool) {
        if self.class.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.class.as_deref() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            Some(_) => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let token = self.previous;
        let name = self.identifier_constant(token);

        self.named_variable(Token::synthetic("this"), false);

        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_pair(OpCode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_pair(OpCode::GetSuper, name);
        }
    }

    /// Module loading is not implemented; `import x` logs the request and
    /// evaluates to nil so the surrounding statement stays stack-balanced.
    fn import(&mut self, _can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect module name after 'import'.");
        let token = self.previous;
        self.identifier_constant(token);
        tracing::debug!(module = token.lexeme, "ignoring import; module loading is not available");
        self.emit_op(OpCode::Nil);
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count.min(255) as u8
    }

    // =========================================================================
    // DECLARATIONS
    // =========================================================================

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_pair(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        let enclosing = self.class.take();
        self.class = Some(Box::new(ClassFrame {
            enclosing,
            has_superclass: false,
        }));

        if self.matches(TokenKind::Colon) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);

            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local(Token::synthetic("super"));
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.class.as_deref_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);

        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let has_superclass = self.class.as_deref().is_some_and(|c| c.has_superclass);
        if has_superclass {
            self.end_scope();
        }

        self.class = match self.class.take() {
            Some(class) => class.enclosing,
            None => None,
        };
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let token = self.previous;
        let constant = self.identifier_constant(token);

        let kind = if token.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);

        self.emit_pair(OpCode::Method, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.begin_function(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.heap.function(self.frame.function).arity;
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.heap.function_mut(self.frame.function).arity = arity + 1;
                }

                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);

                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let finished = self.end_function();
        let constant = self.make_constant(Value::object(finished.function));
        self.emit_pair(OpCode::Closure, constant);

        for upvalue in &finished.upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global);
    }

    // =========================================================================
    // STATEMENTS
    // =========================================================================

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn return_statement(&mut self) {
        if self.frame.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.frame.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }

            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            // Jump out of the loop if the condition is false.
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop); // Condition.
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop); // Condition.
        }
        self.end_scope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (Heap, ObjHandle) {
        let mut heap = Heap::new();
        let handler = Handler::new();
        let function =
            compile(source, &mut heap, &handler, false).expect("expected source to compile");
        assert!(!handler.has_errors());
        (heap, function)
    }

    fn compile_err(source: &str) -> Vec<String> {
        let mut heap = Heap::new();
        let handler = Handler::new();
        let result = compile(source, &mut heap, &handler, false);
        assert!(result.is_none(), "expected a compile error");
        handler.take().into_iter().map(|d| d.message).collect()
    }

    fn ops(heap: &Heap, function: ObjHandle) -> Vec<OpCode> {
        let chunk = &heap.function(function).chunk;
        let mut ops = Vec::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = OpCode::from_byte(chunk.code[offset]).expect("valid opcode");
            ops.push(op);
            offset += 1 + operand_width(heap, chunk, op, offset);
        }
        ops
    }

    fn operand_width(heap: &Heap, chunk: &Chunk, op: OpCode, offset: usize) -> usize {
        use OpCode::*;
        match op {
            Constant | GetLocal | SetLocal | GetGlobal | DefineGlobal | SetGlobal | GetUpvalue
            | SetUpvalue | GetProperty | SetProperty | GetSuper | Call | Class | Method => 1,
            Jump | JumpIfFalse | Loop | Invoke | SuperInvoke => 2,
            Closure => {
                let function = chunk.constants[chunk.code[offset + 1] as usize].as_object();
                1 + heap.function(function).upvalue_count * 2
            }
            _ => 0,
        }
    }

    // ========================================================================
    // CODE SHAPE
    // ========================================================================

    #[test]
    fn arithmetic_respects_precedence() {
        let (heap, function) = compile_ok("print 1 + 2 * 3;");
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![Constant, Constant, Constant, Multiply, Add, Print, Nil, Return]
        );
        let constants = &heap.function(function).chunk.constants;
        assert_eq!(constants[0], Value::number(1.0));
        assert_eq!(constants[1], Value::number(2.0));
        assert_eq!(constants[2], Value::number(3.0));
    }

    #[test]
    fn grouping_overrides_precedence() {
        let (heap, function) = compile_ok("print (1 + 2) * 3;");
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![Constant, Constant, Add, Constant, Multiply, Print, Nil, Return]
        );
    }

    #[test]
    fn comparison_operators_desugar_to_negations() {
        let (heap, function) = compile_ok("1 <= 2;");
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![Constant, Constant, Greater, Not, Pop, Nil, Return]
        );
    }

    #[test]
    fn var_without_initializer_defaults_to_nil() {
        let (heap, function) = compile_ok("var x;");
        use OpCode::*;
        assert_eq!(ops(&heap, function), vec![Nil, DefineGlobal, Nil, Return]);
    }

    #[test]
    fn if_else_emits_two_jumps() {
        let (heap, function) = compile_ok("if (true) print 1; else print 2;");
        let emitted = ops(&heap, function);
        use OpCode::*;
        assert_eq!(
            emitted,
            vec![True, JumpIfFalse, Pop, Constant, Print, Jump, Pop, Constant, Print, Nil, Return]
        );
    }

    #[test]
    fn while_loops_jump_backward() {
        let (heap, function) = compile_ok("while (false) print 1;");
        let emitted = ops(&heap, function);
        assert!(emitted.contains(&OpCode::Loop));
        assert!(emitted.contains(&OpCode::JumpIfFalse));
    }

    #[test]
    fn function_declarations_emit_closures() {
        let (heap, function) = compile_ok("fun f(a, b) { return a + b; }");
        let emitted = ops(&heap, function);
        use OpCode::*;
        assert_eq!(emitted, vec![Closure, DefineGlobal, Nil, Return]);

        let inner = heap.function(function).chunk.constants[1].as_object();
        let inner = heap.function(inner);
        assert_eq!(inner.arity, 2);
        assert_eq!(inner.upvalue_count, 0);
    }

    #[test]
    fn closures_record_captured_upvalues() {
        let (heap, function) =
            compile_ok("fun outer() { var x = 1; fun inner() { return x; } return inner; }");
        let outer = heap.function(function).chunk.constants[1].as_object();
        let mut inner = None;
        for &constant in &heap.function(outer).chunk.constants {
            if constant.is_object() && heap.value_is(constant, ember_core::ObjKind::Function) {
                inner = Some(constant.as_object());
            }
        }
        let inner = heap.function(inner.expect("inner function constant"));
        assert_eq!(inner.upvalue_count, 1);
    }

    #[test]
    fn class_with_methods_compiles() {
        let (heap, function) = compile_ok("class A { init(n) { this.n = n; } get() { return this.n; } }");
        let emitted = ops(&heap, function);
        use OpCode::*;
        assert_eq!(emitted.iter().filter(|&&op| op == Method).count(), 2);
        assert!(emitted.contains(&Class));
    }

    #[test]
    fn import_compiles_to_nil_placeholder() {
        let (heap, function) = compile_ok("import physics;");
        use OpCode::*;
        assert_eq!(ops(&heap, function), vec![Nil, Pop, Nil, Return]);
    }

    // ========================================================================
    // DIAGNOSTICS
    // ========================================================================

    #[test]
    fn top_level_return_is_rejected() {
        let messages = compile_err("return 1;");
        assert_eq!(messages, vec!["Can't return from top-level code."]);
    }

    #[test]
    fn initializer_cannot_return_a_value() {
        let messages = compile_err("class A { init() { return 1; } }");
        assert_eq!(messages, vec!["Can't return a value from an initializer."]);
    }

    #[test]
    fn this_outside_class_is_rejected() {
        let messages = compile_err("print this;");
        assert_eq!(messages, vec!["Can't use 'this' outside of a class."]);
    }

    #[test]
    fn super_outside_class_is_rejected() {
        let messages = compile_err("print super.x;");
        assert_eq!(messages, vec!["Can't use 'super' outside of a class."]);
    }

    #[test]
    fn super_without_superclass_is_rejected() {
        let messages = compile_err("class A { m() { return super.m(); } }");
        assert_eq!(messages, vec!["Can't use 'super' in a class with no superclass."]);
    }

    #[test]
    fn self_inheritance_is_rejected() {
        let messages = compile_err("class A : A {}");
        assert_eq!(messages, vec!["A class can't inherit from itself."]);
    }

    #[test]
    fn invalid_assignment_target_is_rejected() {
        let messages = compile_err("var a; var b; a + b = 1;");
        assert_eq!(messages, vec!["Invalid assignment target."]);
    }

    #[test]
    fn reading_local_in_its_own_initializer_is_rejected() {
        let messages = compile_err("{ var a = a; }");
        assert_eq!(
            messages,
            vec!["Can't read local variable in its own initializer."]
        );
    }

    #[test]
    fn duplicate_local_in_same_scope_is_rejected() {
        let messages = compile_err("{ var a; var a; }");
        assert_eq!(messages, vec!["Already a variable with this name in this scope."]);
    }

    #[test]
    fn panic_mode_recovers_at_statement_boundaries() {
        let messages = compile_err("var = 1; print 2;");
        // One diagnostic for the bad declaration; the following statement
        // parses cleanly after synchronization.
        assert_eq!(messages.len(), 1);
    }

    // ========================================================================
    // LIMITS
    // ========================================================================

    fn constant_heavy_source(count: usize) -> String {
        let mut source = String::new();
        for i in 0..count {
            source.push_str(&format!("print {i}.5;\n"));
        }
        source
    }

    #[test]
    fn chunk_accepts_256_constants() {
        let mut heap = Heap::new();
        let handler = Handler::new();
        assert!(compile(&constant_heavy_source(256), &mut heap, &handler, false).is_some());
    }

    #[test]
    fn chunk_rejects_257_constants() {
        let messages = compile_err(&constant_heavy_source(257));
        assert!(messages.contains(&"Too many constants in one chunk.".to_string()));
    }

    fn local_heavy_source(count: usize) -> String {
        let mut source = String::from("fun f() {\n");
        for i in 0..count {
            source.push_str(&format!("var l{i};\n"));
        }
        source.push('}');
        source
    }

    #[test]
    fn function_accepts_255_locals_beside_the_callee_slot() {
        let mut heap = Heap::new();
        let handler = Handler::new();
        assert!(compile(&local_heavy_source(255), &mut heap, &handler, false).is_some());
    }

    #[test]
    fn function_rejects_a_256th_local() {
        let messages = compile_err(&local_heavy_source(256));
        assert!(messages.contains(&"Too many local variables in function.".to_string()));
    }

    // The call lives in its own function so the argument literals don't
    // share a constant pool with the declaration of `f`.
    fn call_with_args(count: usize) -> String {
        let args: Vec<String> = (0..count).map(|_| "1".to_string()).collect();
        format!("fun f() {{}} fun g() {{ f({}); }}", args.join(", "))
    }

    #[test]
    fn calls_accept_255_arguments() {
        let mut heap = Heap::new();
        let handler = Handler::new();
        assert!(compile(&call_with_args(255), &mut heap, &handler, false).is_some());
    }

    #[test]
    fn calls_reject_256_arguments() {
        let messages = compile_err(&call_with_args(256));
        assert!(messages.contains(&"Can't have more than 255 arguments.".to_string()));
    }

    #[test]
    fn functions_reject_a_256th_parameter() {
        let params: Vec<String> = (0..256).map(|i| format!("p{i}")).collect();
        let source = format!("fun f({}) {{}}", params.join(", "));
        let messages = compile_err(&source);
        assert!(messages.contains(&"Can't have more than 255 parameters.".to_string()));
    }
}
