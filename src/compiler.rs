//! Contains the Lox parser and single-pass bytecode compiler.
//!
//! Parsing and code generation happen in the same left-to-right pass: the
//! Pratt-style expression parser calls straight into the emitter, names are
//! resolved to locals, upvalues, or globals as they are read, and forward
//! jumps are backpatched into bytes that were reserved when the jump was
//! emitted.

use std::rc::Rc;

use enum_map::{enum_map, EnumMap};

use crate::chunk::WrittenOpcode;
use crate::error::{CompileError, Diagnostic, ErrorLocation};
use crate::gc::ActiveGC;
use crate::prelude::*;
use crate::value::Value;

/////////////////////////////////////////// Public API ////////////////////////////////////////////

/// Compiles the given Lox source code and, if successful, returns the
/// [Function] wrapping the top-level script.
///
/// An [ActiveGC] is required because identifiers, string literals, and
/// function names are interned for the lifetime of the GC.
pub fn compile(source: &str, gc: &'_ ActiveGC) -> crate::Result<Function> {
    Compiler::new(source, gc).compile()
}

///////////////////////////////////// Implementation details //////////////////////////////////////

/// One more than the largest index addressable by a one-byte operand.
const U8_COUNT: usize = u8::MAX as usize + 1;

/// Parameter and argument lists are capped so an argument count always fits
/// in one operand byte alongside the callee.
const MAX_ARITY: usize = 255;

/// Contains the whole state of a compilation in flight: the parser, the
/// dispatch table, and one [FunctionCompiler] per function currently being
/// built (innermost last).
pub struct Compiler<'a> {
    parser: Parser<'a>,
    rules: EnumMap<Token, ParserRule>,
    /// Never empty while compiling: index 0 is the top-level script.
    functions: Vec<FunctionCompiler<'a>>,
    /// One entry per `class` declaration currently being parsed.
    classes: Vec<ClassCompiler>,
}

/// Contains the parser state, including error status.
///
/// The reference to [ActiveGC] is required, but never accessed directly:
/// holding it guarantees that the static (global) garbage collector stays
/// installed while lexemes are interned.
#[derive(Debug)]
struct Parser<'a> {
    scanner: Scanner<'a>,
    current: Lexeme<'a>,
    previous: Lexeme<'a>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    // We keep a reference to the active GC to make sure it exists, but we don't explicitly use it.
    _active_gc: &'a ActiveGC,
}

/// Per-function compilation state. The compiler pushes one of these when it
/// enters a function body and pops it when the body ends, yielding the
/// finished [Function].
struct FunctionCompiler<'a> {
    /// The function object being built. Owns the chunk all emission targets.
    function: Function,
    kind: FunctionKind,
    /// Mirrors the layout of the runtime stack frame, slot for slot.
    locals: Vec<Local<'a>>,
    /// Captured variables, in the order the closure trailer will list them.
    upvalues: Vec<Upvalue>,
    scope_depth: isize,
}

/// What flavour of function body is being compiled. Affects slot 0, the
/// implicit return, and which statements are legal.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FunctionKind {
    /// The implicit function wrapped around top-level code.
    Script,
    Function,
    Method,
    /// An `init` method: returns `this`, and must not return a value.
    Initializer,
}

/// A local variable bound to a stack slot of the current frame.
#[derive(Clone)]
struct Local<'a> {
    name: Lexeme<'a>,
    /// `None` while the variable is declared but its initializer has not
    /// finished; reading it in that window is an error.
    depth: Option<isize>,
    /// Set when an inner function closes over this local, so scope exit
    /// lifts it to the heap instead of dropping it.
    is_captured: bool,
}

/// A compile-time description of one captured variable.
///
/// `is_local` means `index` is a local slot of the *immediately* enclosing
/// function; otherwise it is an upvalue index there, forming a chain up to
/// the frame that really owns the variable.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

/// Per-`class` state; only needed to validate `this` and `super`.
struct ClassCompiler {
    has_superclass: bool,
}

/// A rule in the Pratt parser table. See [Compiler::parse_precedence] for usage.
#[derive(Copy, Clone)]
struct ParserRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

/// Any possible action taken from the parsing table. Actions take the entire
/// compiler state, and convert it, usually emitting bytecode. The `bool` is
/// whether an `=` may be consumed ("can assign").
type ParserFn = fn(&mut Compiler, bool) -> ();

/// Precedence rules for [Token]s in Lox.
///
/// Precedence has a well-defined ordering, which is what the Pratt parsing
/// algorithm climbs.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq)]
enum Precedence {
    None,
    /// `=`
    Assignment,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// `+` `-`
    Term,
    /// `*` `/`
    Factor,
    /// `!` `-`
    Unary,
    /// `.` `()`
    Call,
    /// Literals and groupings
    Primary,
}

///////////////////////////////////////// Implementations /////////////////////////////////////////

impl Precedence {
    /// Returns the next higher level of precedence.
    ///
    /// # Panics
    ///
    /// Panics if trying to obtain a higher level of precedence than the
    /// maximum, [Precedence::Primary].
    #[inline]
    fn higher_precedence(self) -> Precedence {
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
            Primary => panic!("Tried to get higher precedence than primary"),
        }
    }
}

impl ParserRule {
    /// Returns one level of precedence higher than the rule's precedence.
    #[inline(always)]
    fn higher_precedence(&self) -> Precedence {
        self.precedence.higher_precedence()
    }
}

impl<'a> Parser<'a> {
    /// Creates a new parser for the given source code.
    fn new(source: &'a str, active_gc: &'a ActiveGC) -> Parser<'a> {
        let mut scanner = Scanner::new(source);
        let first_token = scanner.scan_token();
        let sentinel = scanner.make_sentinel("<before first token>");

        Parser {
            scanner,
            previous: sentinel,
            current: first_token,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            _active_gc: active_gc,
        }
    }

    /// Update self.previous and self.current such that they move one token
    /// further in the token stream. Error tokens are reported here and
    /// skipped, so the rest of the compiler only ever sees real tokens.
    fn advance(&mut self) {
        self.previous = self.current;

        loop {
            self.current = self.scanner.scan_token();
            if self.current.token() != Token::Error {
                break;
            }

            self.error_at_current(self.current.text());
        }
    }

    /// Consume the current token if it is of the desired kind; otherwise
    /// report `message`.
    fn consume(&mut self, desired_token: Token, message: &str) {
        if self.current.token() == desired_token {
            return self.advance();
        }

        self.error_at_current(message);
    }

    /// Return true if the current token is of the given kind.
    fn check(&self, token: Token) -> bool {
        self.current.token() == token
    }

    /// Advances if the current token matches `desired_token`. Returns whether
    /// it was matched.
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        if self.check(desired_token) {
            self.advance();
            return true;
        }
        false
    }

    /// Report a compiler error at the previous [Lexeme]. In Pratt parsing
    /// this is usually the right location: the previous lexeme decided which
    /// [ParserRule] was taken.
    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message)
    }

    /// Report a compiler error at the current [Lexeme].
    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message)
    }

    /// Report a compiler error at the given [Lexeme]. The diagnostic goes to
    /// stderr immediately and is kept for the final [CompileError].
    fn error_at(&mut self, lexeme: Lexeme<'a>, message: &str) {
        // Suppress the deluge of spurious diagnostics that follows a syntax
        // error; synchronize() will clear this.
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        self.had_error = true;

        let location = match lexeme.token() {
            Token::Eof => ErrorLocation::EndOfFile,
            Token::Error => ErrorLocation::Scanner,
            _ => ErrorLocation::Lexeme(lexeme.text().to_owned()),
        };
        let diagnostic = Diagnostic {
            line: lexeme.line(),
            location,
            message: message.to_owned(),
        };
        eprintln!("{diagnostic}");
        self.diagnostics.push(diagnostic);
    }

    /// Recover from panic mode by discarding tokens until something that
    /// looks like a statement boundary: either just past a semicolon, or just
    /// before a keyword that starts a statement.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.token() != Token::Eof {
            if self.previous.token() == Token::Semicolon {
                return;
            }

            match self.current.token() {
                Token::Class
                | Token::Fun
                | Token::Var
                | Token::For
                | Token::If
                | Token::While
                | Token::Print
                | Token::Return => return,
                _ => self.advance(),
            }
        }
    }
}

impl<'a> FunctionCompiler<'a> {
    /// Start compiling one function. Slot 0 of the frame is reserved: methods
    /// and initializers find `this` there; plain functions and scripts leave
    /// it unnamed so no user identifier can ever resolve to it.
    fn new(kind: FunctionKind, name: Option<&'static str>) -> FunctionCompiler<'a> {
        let reserved = match kind {
            FunctionKind::Method | FunctionKind::Initializer => Lexeme::synthetic("this"),
            FunctionKind::Function | FunctionKind::Script => Lexeme::synthetic(""),
        };

        let mut locals = Vec::with_capacity(U8_COUNT);
        locals.push(Local {
            name: reserved,
            depth: Some(0),
            is_captured: false,
        });

        FunctionCompiler {
            function: Function::new(name),
            kind,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

impl<'a> Compiler<'a> {
    /// Creates a new compiler for the given source, starting in the implicit
    /// top-level script function.
    pub fn new(source: &'a str, active_gc: &'a ActiveGC) -> Compiler<'a> {
        Compiler {
            parser: Parser::new(source, active_gc),
            rules: parser_rules(),
            functions: vec![FunctionCompiler::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    /// Takes ownership of the compiler and compiles the whole script.
    pub fn compile(mut self) -> crate::Result<Function> {
        while !self.match_and_advance(Token::Eof) {
            self.declaration();
        }

        let (script, _) = self.end_compiler();

        if self.parser.had_error {
            return Err(CompileError {
                diagnostics: self.parser.diagnostics,
            });
        }

        Ok(script)
    }

    /// Every function object still being built, outermost first. While a
    /// compilation is in progress these are live GC roots; the embedding
    /// collector walks this during its mark phase.
    pub fn roots(&self) -> impl Iterator<Item = &Function> + '_ {
        self.functions.iter().map(|compiler| &compiler.function)
    }

    ///////////////////////////////////// Functions & scopes //////////////////////////////////////

    /// Push a [FunctionCompiler] for a function or method body. The name is
    /// the identifier just consumed.
    fn begin_function(&mut self, kind: FunctionKind) {
        debug_assert!(kind != FunctionKind::Script);
        let name = ActiveGC::intern(self.parser.previous.text());
        self.functions.push(FunctionCompiler::new(kind, Some(name)));
    }

    /// Finish the innermost function: emit the implicit return and pop its
    /// [FunctionCompiler], yielding the function object and the upvalues its
    /// closure trailer must describe.
    fn end_compiler(&mut self) -> (Function, Vec<Upvalue>) {
        self.emit_return();

        let finished = self
            .functions
            .pop()
            .expect("the compiler stack is never empty while compiling");

        // Print a listing of the bytecode to manually inspect compiled output.
        if cfg!(feature = "print_code") && !self.parser.had_error {
            crate::debug::disassemble_chunk(&finished.function.chunk, &finished.function.debug_name());
        }

        (finished.function, finished.upvalues)
    }

    /// Create a new block scope. Make sure to end it later.
    fn begin_scope(&mut self) {
        self.current_fn_mut().scope_depth += 1;
    }

    /// Pop one block scope, discarding its locals. Ordinary locals are simply
    /// popped off the runtime stack; captured ones are closed over so the
    /// closures that reference them outlive the scope.
    fn end_scope(&mut self) {
        let compiler = self.current_fn_mut();
        assert!(compiler.scope_depth > 0);
        compiler.scope_depth -= 1;

        while self.has_locals_beyond_current_scope() {
            // The compile-time vector of locals parallels the runtime stack,
            // so popping the compiler's stack pops the runtime stack too.
            let local = self
                .current_fn_mut()
                .locals
                .pop()
                .expect("checked that a local exists");
            if local.is_captured {
                self.emit_instruction(OpCode::CloseUpvalue);
            } else {
                self.emit_instruction(OpCode::Pop);
            }
        }
    }

    /// Returns true if there is a local variable at a scope that is no longer
    /// accessible.
    fn has_locals_beyond_current_scope(&self) -> bool {
        let compiler = self.current_fn();
        compiler
            .locals
            .last()
            .and_then(|local| local.depth)
            .map(|depth| depth > compiler.scope_depth)
            .unwrap_or(false)
    }

    ////////////////////////////////////////// Expressions ////////////////////////////////////////

    /// The core of the Pratt parsing algorithm.
    ///
    /// See: <https://en.wikipedia.org/wiki/Operator-precedence_parser#Pratt_parsing>
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        // Only the lowest precedence levels may treat a trailing `=` as an
        // assignment; everything higher would happily mis-parse `a + b = c`.
        let can_assign = precedence <= Precedence::Assignment;

        // First, figure out how to parse the prefix.
        if let Some(prefix_rule) = self.rule_from_previous().prefix {
            prefix_rule(self, can_assign);
        } else {
            self.parser.error("Expect expression.");
            return;
        }

        while precedence <= self.rule_from_current().precedence {
            // current is now previous:
            self.advance();
            let infix_rule = self
                .rule_from_previous()
                .infix
                .expect("a rule with a defined precedence must always have an infix rule");

            infix_rule(self, can_assign);
        }

        // If nothing consumed the `=`, no valid assignment target preceded it.
        if can_assign && self.match_and_advance(Token::Equal) {
            self.parser.error("Invalid assignment target.");
        }
    }

    /// Parse an expression.
    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Parse a comma-separated argument list, leaving each argument on the
    /// stack. Assumes `(` was consumed; consumes the closing `)`.
    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;
        if !self.parser.check(Token::RightParen) {
            loop {
                self.expression();
                if arg_count == MAX_ARITY {
                    self.parser.error("Can't have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(Token::RightParen, "Expect ')' after arguments.");
        arg_count.min(MAX_ARITY) as u8
    }

    ////////////////////////////////////// Name resolution ////////////////////////////////////////

    /// Add the identifier text to the current chunk's constant pool, interned.
    fn identifier_constant(&mut self, lexeme: Lexeme) -> u8 {
        self.make_constant(lexeme.text().into())
    }

    /// Finds the stack slot for a local of the function at `fn_index`, or
    /// `None` if no such local exists (a global, an upvalue, or a mistake).
    fn resolve_local(&mut self, fn_index: usize, name: Lexeme) -> Option<u8> {
        for (slot, local) in self.functions[fn_index].locals.iter().enumerate().rev() {
            if local.name.text() == name.text() {
                if local.depth.is_none() {
                    self.parser
                        .error("Can't read local variable in its own initializer.");
                }
                return Some(slot as u8);
            }
        }
        None
    }

    /// Resolve `name` as a captured variable of the function at `fn_index`,
    /// building the upvalue chain through every enclosing function on the
    /// way down. Returns the upvalue index, or `None` if no enclosing
    /// function owns a matching local.
    fn resolve_upvalue(&mut self, fn_index: usize, name: Lexeme) -> Option<u8> {
        if fn_index == 0 {
            return None;
        }
        let parent = fn_index - 1;

        if let Some(slot) = self.resolve_local(parent, name) {
            self.functions[parent].locals[slot as usize].is_captured = true;
            return Some(self.add_upvalue(fn_index, slot, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(parent, name) {
            return Some(self.add_upvalue(fn_index, upvalue, false));
        }

        None
    }

    /// Record that the function at `fn_index` captures either a parent local
    /// (`is_local`) or a parent upvalue. Capturing the same variable twice
    /// reuses the existing entry.
    fn add_upvalue(&mut self, fn_index: usize, index: u8, is_local: bool) -> u8 {
        let existing = self.functions[fn_index]
            .upvalues
            .iter()
            .position(|upvalue| upvalue.index == index && upvalue.is_local == is_local);
        if let Some(existing) = existing {
            return existing as u8;
        }

        if self.functions[fn_index].upvalues.len() >= U8_COUNT {
            self.parser.error("Too many closure variables in function.");
            return 0;
        }

        let compiler = &mut self.functions[fn_index];
        compiler.upvalues.push(Upvalue { index, is_local });
        compiler.function.upvalue_count = compiler.upvalues.len();
        (compiler.upvalues.len() - 1) as u8
    }

    /// Indicate that we need a slot for another local variable.
    fn declare_variable(&mut self) {
        if self.current_fn().scope_depth == 0 {
            // Globals are late bound; they don't live in the locals table.
            return;
        }

        let name = self.parser.previous;

        // Shadowing a variable from an *outer* scope is fine; redeclaring one
        // in the same scope is not.
        let mut duplicate = false;
        let compiler = self.current_fn();
        for local in compiler.locals.iter().rev() {
            if matches!(local.depth, Some(depth) if depth < compiler.scope_depth) {
                break;
            }
            if name.text() == local.name.text() {
                duplicate = true;
            }
        }
        if duplicate {
            self.parser
                .error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    /// Reserve the next stack slot for the named local. The local starts out
    /// uninitialized ([Local::depth] is `None`) until defined.
    fn add_local(&mut self, name: Lexeme<'a>) {
        if self.current_fn().locals.len() >= U8_COUNT {
            self.parser.error("Too many local variables in function.");
            return;
        }

        self.current_fn_mut().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    /// Consume the next identifier and declare it as a variable. Returns the
    /// constant index of the name for globals, or 0 for locals (which are
    /// addressed by slot, not by name).
    fn parse_variable(&mut self, error_message: &str) -> u8 {
        self.parser.consume(Token::Identifier, error_message);

        self.declare_variable();
        if self.current_fn().scope_depth > 0 {
            return 0;
        }

        self.identifier_constant(self.parser.previous)
    }

    /// Mark the most recent local as initialized, making it resolvable.
    fn mark_initialized(&mut self) {
        let compiler = self.current_fn_mut();
        if compiler.scope_depth == 0 {
            return;
        }
        let depth = compiler.scope_depth;
        compiler
            .locals
            .last_mut()
            .expect("a local was just declared")
            .depth = Some(depth);
    }

    /// Emit instructions (if any) to create a variable binding.
    fn define_variable(&mut self, global: u8) {
        if self.current_fn().scope_depth > 0 {
            // A local's value is already sitting in its slot; it just becomes
            // usable now.
            self.mark_initialized();
            return;
        }

        self.emit_instruction(OpCode::DefineGlobal)
            .with_operand(global);
    }

    /// Compile a variable load or store, whichever the syntax calls for.
    /// Resolution order: local slot, then upvalue, then global by name.
    fn named_variable(&mut self, name: Lexeme, can_assign: bool) {
        let innermost = self.functions.len() - 1;
        let (get_op, set_op, arg) = {
            if let Some(slot) = self.resolve_local(innermost, name) {
                (OpCode::GetLocal, OpCode::SetLocal, slot)
            } else if let Some(upvalue) = self.resolve_upvalue(innermost, name) {
                (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
            } else {
                let arg = self.identifier_constant(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, arg)
            }
        };

        // Peek ahead and look if we're assigning.
        // This only works if we're parsing at a precedence at or below assignment.
        if can_assign && self.match_and_advance(Token::Equal) {
            self.expression();
            self.emit_instruction(set_op).with_operand(arg);
        } else {
            self.emit_instruction(get_op).with_operand(arg);
        }
    }

    ////////////////////////////////// Declarations & statements //////////////////////////////////

    /// Parse a declaration: a class, function, or variable declaration, or
    /// any other statement.
    fn declaration(&mut self) {
        if self.match_and_advance(Token::Class) {
            self.class_declaration();
        } else if self.match_and_advance(Token::Fun) {
            self.fun_declaration();
        } else if self.match_and_advance(Token::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    /// Parse a statement.
    fn statement(&mut self) {
        if self.match_and_advance(Token::Print) {
            self.print_statement();
        } else if self.match_and_advance(Token::If) {
            self.if_statement();
        } else if self.match_and_advance(Token::Return) {
            self.return_statement();
        } else if self.match_and_advance(Token::While) {
            self.while_statement();
        } else if self.match_and_advance(Token::For) {
            self.for_statement();
        } else if self.match_and_advance(Token::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    /// Parse a block. Assumes a new scope has already been created and `{`
    /// consumed.
    fn block(&mut self) {
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            self.declaration();
        }

        self.parser
            .consume(Token::RightBrace, "Expect '}' after block.");
    }

    /// Parse a variable declaration. Assumes `var` has already been consumed.
    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_and_advance(Token::Equal) {
            self.expression();
        } else {
            self.emit_instruction(OpCode::Nil);
        }

        self.parser
            .consume(Token::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global);
    }

    /// Parse a function declaration. Assumes `fun` has already been consumed.
    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Unlike variables, a function may refer to itself: it is defined as
        // soon as it is named, which is what makes recursion work.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compile a function body (parameters, braces, and all) into its own
    /// [Function], then emit the closure that captures its upvalues into the
    /// enclosing chunk.
    fn function(&mut self, kind: FunctionKind) {
        self.begin_function(kind);
        // No matching end_scope(): the locals die with the frame at runtime.
        self.begin_scope();

        self.parser
            .consume(Token::LeftParen, "Expect '(' after function name.");
        if !self.parser.check(Token::RightParen) {
            loop {
                let arity = {
                    let function = &mut self.current_fn_mut().function;
                    function.arity += 1;
                    function.arity
                };
                if arity > MAX_ARITY {
                    self.parser
                        .error_at_current("Can't have more than 255 parameters.");
                }

                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);

                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(Token::RightParen, "Expect ')' after parameters.");
        self.parser
            .consume(Token::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::Function(Rc::new(function)));

        // The closure trailer: one (is_local, index) byte pair per upvalue,
        // which is exactly what the runtime reads to wire up the closure.
        let mut written = self.emit_instruction(OpCode::Closure).with_operand(constant);
        for upvalue in upvalues {
            written = written
                .with_operand(upvalue.is_local as u8)
                .with_operand(upvalue.index);
        }
    }

    /// Parse a method definition inside a class body and bind it to the class
    /// object sitting on the stack.
    fn method(&mut self) {
        self.parser
            .consume(Token::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.parser.previous);

        let kind = if self.parser.previous.text() == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);

        self.emit_instruction(OpCode::Method).with_operand(constant);
    }

    /// Parse a class declaration. Assumes `class` has been consumed.
    fn class_declaration(&mut self) {
        self.parser.consume(Token::Identifier, "Expect class name.");
        let class_name = self.parser.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_instruction(OpCode::Class).with_operand(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_and_advance(Token::Less) {
            self.parser
                .consume(Token::Identifier, "Expect superclass name.");
            // Load the superclass by name...
            variable(self, false);

            if class_name.text() == self.parser.previous.text() {
                self.parser.error("A class can't inherit from itself.");
            }

            // ...and keep it in a scope of its own, bound to a synthetic
            // `super` local that methods can close over.
            self.begin_scope();
            self.add_local(Lexeme::synthetic("super"));
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_instruction(OpCode::Inherit);

            self.classes
                .last_mut()
                .expect("just pushed a class compiler")
                .has_superclass = true;
        }

        // Keep the class on the stack while methods bind to it.
        self.named_variable(class_name, false);
        self.parser
            .consume(Token::LeftBrace, "Expect '{' before class body.");
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            self.method();
        }
        self.parser
            .consume(Token::RightBrace, "Expect '}' after class body.");
        self.emit_instruction(OpCode::Pop);

        if self
            .classes
            .last()
            .expect("class compiler still pushed")
            .has_superclass
        {
            self.end_scope();
        }

        self.classes.pop();
    }

    /// Parse an expression statement: evaluate, then discard the value.
    fn expression_statement(&mut self) {
        self.expression();
        self.parser
            .consume(Token::Semicolon, "Expect ';' after expression.");
        self.emit_instruction(OpCode::Pop);
    }

    /// Parse an if statement. Assumes `if` was consumed.
    ///
    /// Both arms drop the condition value: the then-branch pops it on the way
    /// in, the else-branch pops it at its jump target.
    fn if_statement(&mut self) {
        self.parser.consume(Token::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.parser
            .consume(Token::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_instruction(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_instruction(OpCode::Pop);

        if self.match_and_advance(Token::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    /// Parse a while statement. Assumes `while` was consumed.
    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.parser
            .consume(Token::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.parser
            .consume(Token::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_instruction(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_instruction(OpCode::Pop);
    }

    /// Parse a for statement. Assumes `for` was consumed.
    ///
    /// The increment clause is syntactically before the body but runs after
    /// it, so the emitted code jumps over the increment into the body, and
    /// the body loops back to the increment.
    fn for_statement(&mut self) {
        // Any variable declared in the initializer is scoped to the loop.
        self.begin_scope();
        self.parser.consume(Token::LeftParen, "Expect '(' after 'for'.");
        if self.match_and_advance(Token::Semicolon) {
            // No initializer.
        } else if self.match_and_advance(Token::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.match_and_advance(Token::Semicolon) {
            self.expression();
            self.parser
                .consume(Token::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_instruction(OpCode::Pop);
        }

        if !self.match_and_advance(Token::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_instruction(OpCode::Pop);
            self.parser
                .consume(Token::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_instruction(OpCode::Pop);
        }

        self.end_scope();
    }

    /// Parse a print statement. Assumes `print` has already been consumed.
    fn print_statement(&mut self) {
        self.expression();
        self.parser
            .consume(Token::Semicolon, "Expect ';' after value.");
        self.emit_instruction(OpCode::Print);
    }

    /// Parse a return statement. Assumes `return` was consumed.
    fn return_statement(&mut self) {
        if self.current_fn().kind == FunctionKind::Script {
            self.parser.error("Can't return from top-level code.");
        }

        if self.match_and_advance(Token::Semicolon) {
            self.emit_return();
        } else {
            if self.current_fn().kind == FunctionKind::Initializer {
                self.parser.error("Can't return a value from an initializer.");
            }

            self.expression();
            self.parser
                .consume(Token::Semicolon, "Expect ';' after return value.");
            self.emit_instruction(OpCode::Return);
        }
    }

    //////////////////////////////////////////// Emission /////////////////////////////////////////

    /// Emit the implicit return at the end of a body: an initializer returns
    /// the instance in slot 0; everything else returns `nil`.
    fn emit_return(&mut self) {
        if self.current_fn().kind == FunctionKind::Initializer {
            self.emit_instruction(OpCode::GetLocal).with_operand(0);
        } else {
            self.emit_instruction(OpCode::Nil);
        }
        self.emit_instruction(OpCode::Return);
    }

    /// Appends [OpCode::Constant] to the current [Chunk], pushing the value.
    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_instruction(OpCode::Constant).with_operand(index);
    }

    /// Appends a new constant to the current [Chunk]'s pool.
    ///
    /// # Errors
    ///
    /// When the pool is full, this reports a compiler error and returns
    /// `0u8`. The chunk can still be appended to, but it is invalid and will
    /// be discarded with the rest of the failed compilation.
    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().add_constant(value) {
            index
        } else {
            self.parser.error("Too many constants in one chunk.");
            0
        }
    }

    /// Emit a forward jump with a two-byte placeholder distance, and return
    /// the offset of the placeholder for [Compiler::patch_jump].
    fn emit_jump(&mut self, instruction: OpCode) -> usize {
        self.emit_instruction(instruction)
            .with_operand(0xff)
            .with_operand(0xff);
        self.current_chunk().len() - 2
    }

    /// Backpatch the placeholder at `offset` so the jump lands on the next
    /// instruction to be emitted.
    fn patch_jump(&mut self, offset: usize) {
        // -2 to account for the two distance bytes the runtime has already
        // consumed when it applies the jump.
        let distance = self.current_chunk().len() - offset - 2;

        if distance > u16::MAX as usize {
            self.parser.error("Cannot jump this far.");
            return;
        }

        self.current_chunk().patch16(offset, distance as u16);
    }

    /// Emit an unconditional backward jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) {
        // +3 because the distance is measured from after the operand bytes.
        let distance = self.current_chunk().len() + 3 - loop_start;
        if distance > u16::MAX as usize {
            self.parser.error("Loop body too large.");
        }

        let [high, low] = (distance as u16).to_be_bytes();
        self.emit_instruction(OpCode::Loop)
            .with_operand(high)
            .with_operand(low);
    }

    /// Writes an [OpCode] to the current [Chunk].
    /// Returns a [WrittenOpcode], with which operands can be appended.
    fn emit_instruction(&mut self, opcode: OpCode) -> WrittenOpcode {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(opcode, line)
    }

    /// Writes two [OpCode]s to the current [Chunk].
    fn emit_instructions(&mut self, op1: OpCode, op2: OpCode) -> WrittenOpcode {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(op1, line);
        self.current_chunk().write_opcode(op2, line)
    }

    ///////////////////////////////////////////// Aliases /////////////////////////////////////////

    /// The innermost function being compiled.
    #[inline(always)]
    fn current_fn(&self) -> &FunctionCompiler<'a> {
        self.functions
            .last()
            .expect("the compiler stack is never empty while compiling")
    }

    #[inline(always)]
    fn current_fn_mut(&mut self) -> &mut FunctionCompiler<'a> {
        self.functions
            .last_mut()
            .expect("the compiler stack is never empty while compiling")
    }

    /// The [Chunk] all emission currently targets.
    #[inline(always)]
    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_fn_mut().function.chunk
    }

    /// Advance one token in the scanner, such that:
    /// ```text
    /// (previous, current) = (current, scanner.next_token())
    /// ```
    #[inline(always)]
    fn advance(&mut self) {
        self.parser.advance()
    }

    /// Returns the line number of the prefix token, a.k.a., `self.parser.previous`.
    #[inline(always)]
    fn line_number_of_prefix(&self) -> usize {
        self.parser.previous.line()
    }

    /// Delegates to [Parser::match_and_advance]. Returns true if the token was matched.
    #[inline(always)]
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        self.parser.match_and_advance(desired_token)
    }

    /// Returns the rule for the token of the prefix being parsed.
    #[inline(always)]
    fn rule_from_previous(&self) -> ParserRule {
        self.rules[self.previous_token()]
    }

    /// Returns the rule for the token about to be parsed.
    #[inline(always)]
    fn rule_from_current(&self) -> ParserRule {
        self.rules[self.parser.current.token()]
    }

    /// Return the token (type) of the previous lexeme. This is useful in
    /// prefix parser functions.
    #[inline(always)]
    fn previous_token(&self) -> Token {
        self.parser.previous.token()
    }
}

////////////////////////////////////////// Parser rules ///////////////////////////////////////////

/// Makes defining [ParserRule]s a bit cleaner looking.
macro_rules! rule {
    ($prefix:expr, $infix:expr, $precedence:expr) => {
        ParserRule {
            prefix: $prefix,
            infix: $infix,
            precedence: $precedence,
        }
    };
}

/// The dispatch table at the heart of the Pratt parser: for every token, how
/// to parse it in prefix position, how to parse it in infix position, and how
/// tightly it binds.
#[rustfmt::skip]
fn parser_rules() -> EnumMap<Token, ParserRule> {
    use Token::*;
    enum_map! {
        //                     Prefix           Infix          Precedence
        LeftParen    => rule!{ Some(grouping),  Some(call),    Precedence::Call },
        RightParen   => rule!{ None,            None,          Precedence::None },
        LeftBrace    => rule!{ None,            None,          Precedence::None },
        RightBrace   => rule!{ None,            None,          Precedence::None },
        Comma        => rule!{ None,            None,          Precedence::None },
        Dot          => rule!{ None,            Some(dot),     Precedence::Call },
        Minus        => rule!{ Some(unary),     Some(binary),  Precedence::Term },
        Plus         => rule!{ None,            Some(binary),  Precedence::Term },
        Semicolon    => rule!{ None,            None,          Precedence::None },
        Slash        => rule!{ None,            Some(binary),  Precedence::Factor },
        Star         => rule!{ None,            Some(binary),  Precedence::Factor },
        Bang         => rule!{ Some(unary),     None,          Precedence::None },
        BangEqual    => rule!{ None,            Some(binary),  Precedence::Equality },
        Equal        => rule!{ None,            None,          Precedence::None },
        EqualEqual   => rule!{ None,            Some(binary),  Precedence::Equality },
        Greater      => rule!{ None,            Some(binary),  Precedence::Comparison },
        GreaterEqual => rule!{ None,            Some(binary),  Precedence::Comparison },
        Less         => rule!{ None,            Some(binary),  Precedence::Comparison },
        LessEqual    => rule!{ None,            Some(binary),  Precedence::Comparison },
        Identifier   => rule!{ Some(variable),  None,          Precedence::None },
        StrLiteral   => rule!{ Some(string),    None,          Precedence::None },
        Number       => rule!{ Some(number),    None,          Precedence::None },
        And          => rule!{ None,            Some(and_),    Precedence::And },
        Class        => rule!{ None,            None,          Precedence::None },
        Else         => rule!{ None,            None,          Precedence::None },
        False        => rule!{ Some(literal),   None,          Precedence::None },
        For          => rule!{ None,            None,          Precedence::None },
        Fun          => rule!{ None,            None,          Precedence::None },
        If           => rule!{ None,            None,          Precedence::None },
        Nil          => rule!{ Some(literal),   None,          Precedence::None },
        Or           => rule!{ None,            Some(or_),     Precedence::Or },
        Print        => rule!{ None,            None,          Precedence::None },
        Return       => rule!{ None,            None,          Precedence::None },
        Super        => rule!{ Some(super_),    None,          Precedence::None },
        This         => rule!{ Some(this_),     None,          Precedence::None },
        True         => rule!{ Some(literal),   None,          Precedence::None },
        Var          => rule!{ None,            None,          Precedence::None },
        While        => rule!{ None,            None,          Precedence::None },
        Error        => rule!{ None,            None,          Precedence::None },
        Eof          => rule!{ None,            None,          Precedence::None },
    }
}

/// Parse `(` as a prefix: a parenthesized grouping. Assumes `(` was consumed.
fn grouping(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::LeftParen, compiler.previous_token());
    compiler.expression();
    compiler
        .parser
        .consume(Token::RightParen, "Expect ')' after expression.");
}

/// Parse a number literal as a prefix. Assumes the number was consumed.
fn number(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::Number, compiler.previous_token());
    let value = compiler
        .parser
        .previous
        .text()
        .parse::<f64>()
        .expect("Token::Number MUST parse as a float");
    compiler.emit_constant(value.into());
}

/// Parse a string literal. Interns it (sans quotes) into the constant pool.
fn string(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::StrLiteral, compiler.previous_token());

    // Access the string contents, without the quotes:
    let literal = compiler.parser.previous.text();
    debug_assert!(literal.len() >= 2);
    debug_assert!(literal.starts_with('"'));
    debug_assert!(literal.ends_with('"'));
    let contents = &literal[1..literal.len() - 1];

    compiler.emit_constant(contents.into());
}

/// Parse a keyword literal as a prefix. Assumes the keyword was consumed.
fn literal(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.previous_token() {
        Token::False => compiler.emit_instruction(OpCode::False),
        Token::Nil => compiler.emit_instruction(OpCode::Nil),
        Token::True => compiler.emit_instruction(OpCode::True),
        _ => unreachable!(),
    };
}

/// Parse a unary operator as a prefix. Assumes the operator was consumed.
fn unary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();

    // Compile the operand, so that it's placed on the stack.
    compiler.parse_precedence(Precedence::Unary);

    match operator {
        Token::Bang => compiler.emit_instruction(OpCode::Not),
        Token::Minus => compiler.emit_instruction(OpCode::Negate),
        _ => unreachable!(),
    };
}

/// Parse a binary operator as an infix. Assumes the left operand was already
/// compiled and the operator consumed.
fn binary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();
    let rule = compiler.rules[operator];

    // Binary operators are left-associative, so the right operand binds one
    // level tighter.
    compiler.parse_precedence(rule.higher_precedence());

    match operator {
        // The VM has no dedicated opcodes for `!=`, `>=`, `<=`; each is the
        // complement of an operator it does have.
        Token::BangEqual => compiler.emit_instructions(OpCode::Equal, OpCode::Not),
        Token::EqualEqual => compiler.emit_instruction(OpCode::Equal),
        Token::Greater => compiler.emit_instruction(OpCode::Greater),
        Token::GreaterEqual => compiler.emit_instructions(OpCode::Less, OpCode::Not),
        Token::Less => compiler.emit_instruction(OpCode::Less),
        Token::LessEqual => compiler.emit_instructions(OpCode::Greater, OpCode::Not),
        Token::Plus => compiler.emit_instruction(OpCode::Add),
        Token::Minus => compiler.emit_instruction(OpCode::Subtract),
        Token::Star => compiler.emit_instruction(OpCode::Multiply),
        Token::Slash => compiler.emit_instruction(OpCode::Divide),
        _ => unreachable!(),
    };
}

/// Parse `and` as an infix. Short-circuits: if the left operand is falsy it
/// stays on the stack as the result and the right operand is skipped.
fn and_(compiler: &mut Compiler, _can_assign: bool) {
    let end_jump = compiler.emit_jump(OpCode::JumpIfFalse);

    compiler.emit_instruction(OpCode::Pop);
    compiler.parse_precedence(Precedence::And);

    compiler.patch_jump(end_jump);
}

/// Parse `or` as an infix. Short-circuits: a truthy left operand skips the
/// right one. Emulates a jump-if-true with the two jumps the VM does have.
fn or_(compiler: &mut Compiler, _can_assign: bool) {
    let else_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    let end_jump = compiler.emit_jump(OpCode::Jump);

    compiler.patch_jump(else_jump);
    compiler.emit_instruction(OpCode::Pop);

    compiler.parse_precedence(Precedence::Or);
    compiler.patch_jump(end_jump);
}

/// Parse a variable. It can be either a variable access or assignment, which
/// is why `can_assign` is threaded through all the callbacks!
fn variable(compiler: &mut Compiler, can_assign: bool) {
    compiler.named_variable(compiler.parser.previous, can_assign);
}

/// Parse a call as an infix: the callee was already compiled, `(` consumed.
fn call(compiler: &mut Compiler, _can_assign: bool) {
    let arg_count = compiler.argument_list();
    compiler
        .emit_instruction(OpCode::Call)
        .with_operand(arg_count);
}

/// Parse a property access as an infix. A `.name =` becomes a store, a
/// `.name(` becomes a fused method invocation, anything else is a load.
fn dot(compiler: &mut Compiler, can_assign: bool) {
    compiler
        .parser
        .consume(Token::Identifier, "Expect property name after '.'.");
    let name = compiler.identifier_constant(compiler.parser.previous);

    if can_assign && compiler.match_and_advance(Token::Equal) {
        compiler.expression();
        compiler
            .emit_instruction(OpCode::SetProperty)
            .with_operand(name);
    } else if compiler.match_and_advance(Token::LeftParen) {
        let arg_count = compiler.argument_list();
        compiler
            .emit_instruction(OpCode::Invoke)
            .with_operand(name)
            .with_operand(arg_count);
    } else {
        compiler
            .emit_instruction(OpCode::GetProperty)
            .with_operand(name);
    }
}

/// Parse `this` as a prefix: a read of the reserved slot 0. Never an
/// assignment target, hence `variable(compiler, false)`.
fn this_(compiler: &mut Compiler, _can_assign: bool) {
    if compiler.classes.is_empty() {
        compiler.parser.error("Can't use 'this' outside of a class.");
        return;
    }

    variable(compiler, false);
}

/// Parse `super.name` or `super.name(args)` as a prefix.
///
/// The emitted stack order (`this` below the superclass) is a contract
/// with the runtime's `GET_SUPER`/`SUPER_INVOKE` handlers.
fn super_(compiler: &mut Compiler, _can_assign: bool) {
    if compiler.classes.is_empty() {
        compiler.parser.error("Can't use 'super' outside of a class.");
    } else if !compiler
        .classes
        .last()
        .expect("checked non-empty above")
        .has_superclass
    {
        compiler
            .parser
            .error("Can't use 'super' in a class with no superclass.");
    }

    compiler
        .parser
        .consume(Token::Dot, "Expect '.' after 'super'.");
    compiler
        .parser
        .consume(Token::Identifier, "Expect superclass method name.");
    let name = compiler.identifier_constant(compiler.parser.previous);

    compiler.named_variable(Lexeme::synthetic("this"), false);
    if compiler.match_and_advance(Token::LeftParen) {
        let arg_count = compiler.argument_list();
        compiler.named_variable(Lexeme::synthetic("super"), false);
        compiler
            .emit_instruction(OpCode::SuperInvoke)
            .with_operand(name)
            .with_operand(arg_count);
    } else {
        compiler.named_variable(Lexeme::synthetic("super"), false);
        compiler
            .emit_instruction(OpCode::GetSuper)
            .with_operand(name);
    }
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////
