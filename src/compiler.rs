use super::{
    chunk::{
        Chunk,
        Instruction::{self, *},
    },
    heap::{GcRef, Heap},
    lexer::Lexer,
    reporter::{Phase, Report, Reporter},
    token::{Token, TokenType, BOUNDARIES},
    value::Value,
};
use std::{cell::RefCell, mem, rc::Rc};

const MAX_LOCALS: usize = 256;

/// Binding powers, weakest first. An operator pulls a right operand as long
/// as its power exceeds the minimum the caller is parsing at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Bp {
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
}

/// What the last prefix/infix handler produced. Identifiers and property
/// accesses defer their load so `=` can reinterpret them as stores; `Value`
/// means the result already sits on the stack.
#[derive(Debug, Clone)]
enum Context {
    Value,
    Variable(Rc<Token>),
    Property(Rc<Token>),
}

type NudFn = fn(&mut Compiler, Rc<Token>) -> Result<Context, ()>;
type LedFn = fn(&mut Compiler, Rc<Token>, Context) -> Result<Context, ()>;

#[derive(Clone, Copy)]
struct Rule {
    nud: Option<NudFn>,
    led: Option<LedFn>,
    bp: Bp,
}

impl Rule {
    const NONE: Rule = Rule {
        nud: None,
        led: None,
        bp: Bp::None,
    };

    const fn nud(nud: NudFn) -> Rule {
        Rule {
            nud: Some(nud),
            led: None,
            bp: Bp::None,
        }
    }

    const fn led(led: LedFn, bp: Bp) -> Rule {
        Rule {
            nud: None,
            led: Some(led),
            bp,
        }
    }

    const fn both(nud: NudFn, led: LedFn, bp: Bp) -> Rule {
        Rule {
            nud: Some(nud),
            led: Some(led),
            bp,
        }
    }
}

/// One entry per token type, in declaration order.
const RULES: [Rule; TokenType::VARIANT_COUNT] = [
    Rule::both(nud_group, led_call, Bp::Call), // OParen
    Rule::NONE,                                // CParen
    Rule::NONE,                                // OBrace
    Rule::NONE,                                // CBrace
    Rule::NONE,                                // Comma
    Rule::led(led_dot, Bp::Call),              // Dot
    Rule::both(nud_unary, led_binary, Bp::Term), // Minus
    Rule::led(led_binary, Bp::Term),           // Plus
    Rule::NONE,                                // Semicolon
    Rule::led(led_binary, Bp::Factor),         // Slash
    Rule::led(led_binary, Bp::Factor),         // Star
    Rule::nud(nud_unary),                      // Bang
    Rule::led(led_binary, Bp::Equality),       // BangEqual
    Rule::led(led_assign, Bp::Assignment),     // Equal
    Rule::led(led_binary, Bp::Equality),       // DEqual
    Rule::led(led_binary, Bp::Comparison),     // Greater
    Rule::led(led_binary, Bp::Comparison),     // GreaterEqual
    Rule::led(led_binary, Bp::Comparison),     // Less
    Rule::led(led_binary, Bp::Comparison),     // LessEqual
    Rule::nud(nud_variable),                   // Identifier
    Rule::nud(nud_string),                     // String
    Rule::nud(nud_number),                     // Number
    Rule::led(led_and, Bp::And),               // And
    Rule::NONE,                                // Class
    Rule::NONE,                                // Else
    Rule::nud(nud_literal),                    // False
    Rule::NONE,                                // For
    Rule::NONE,                                // Fun
    Rule::NONE,                                // If
    Rule::nud(nud_literal),                    // Nil
    Rule::led(led_or, Bp::Or),                 // Or
    Rule::NONE,                                // Print
    Rule::NONE,                                // Return
    Rule::nud(nud_super),                      // Super
    Rule::nud(nud_this),                       // This
    Rule::nud(nud_literal),                    // True
    Rule::NONE,                                // Var
    Rule::NONE,                                // While
    Rule::NONE,                                // UnTermedString
    Rule::NONE,                                // InvalidNumber
    Rule::NONE,                                // Unknown
    Rule::NONE,                                // EOF
];

fn rule(typ: TokenType) -> Rule {
    RULES[typ as usize]
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone)]
struct Local {
    name: Rc<Token>,
    /// `None` until the initializer has run, so reading a local inside its
    /// own initializer can be rejected.
    depth: Option<usize>,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FnUpValue {
    is_local: bool,
    idx: usize,
}

/// Per-function scope state. Nested function compilations chain through
/// `enclosing` so name resolution can walk outward and capture upvalues.
struct FnState {
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<FnUpValue>,
    scope_depth: usize,
    enclosing: Option<Rc<RefCell<FnState>>>,
}

impl FnState {
    fn new(kind: FunctionKind, slot_zero: Rc<Token>, enclosing: Option<Rc<RefCell<FnState>>>) -> Self {
        // slot 0 belongs to the callee: `this` inside methods, the function
        // itself otherwise
        Self {
            kind,
            locals: vec![Local {
                name: slot_zero,
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            enclosing,
        }
    }

    fn resolve_local(&self, token: &Token) -> Option<(usize, bool)> {
        for (idx, local) in self.locals.iter().enumerate().rev() {
            if *local.name == *token {
                return Some((idx, local.depth.is_some()));
            }
        }
        None
    }

    fn add_upvalue(&mut self, is_local: bool, idx: usize) -> usize {
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.is_local == is_local && upvalue.idx == idx {
                return i;
            }
        }
        self.upvalues.push(FnUpValue { is_local, idx });
        self.upvalues.len() - 1
    }

    fn resolve_upvalue(&mut self, token: &Token) -> Option<usize> {
        let enclosing = Rc::clone(self.enclosing.as_ref()?);
        let local = enclosing.borrow().resolve_local(token);
        if let Some((idx, _)) = local {
            enclosing.borrow_mut().locals[idx].is_captured = true;
            return Some(self.add_upvalue(true, idx));
        }
        let upvalue = enclosing.borrow_mut().resolve_upvalue(token);
        let idx = upvalue?;
        Some(self.add_upvalue(false, idx))
    }
}

struct ClassState {
    has_superclass: bool,
}

/// Compiles source text straight to bytecode in one pass: the Pratt walk
/// over the token stream emits instructions as it goes, resolving scopes
/// and capturing upvalues on the way.
pub struct Compiler<'a> {
    lexer: Lexer,
    current: Rc<Token>,
    previous: Rc<Token>,
    had_error: bool,
    panic_mode: bool,
    state: Rc<RefCell<FnState>>,
    chunk: Chunk,
    classes: Vec<ClassState>,
    heap: &'a mut Heap,
    constants: &'a mut Vec<Value>,
    reporter: &'a mut dyn Reporter,
}

impl<'a> Compiler<'a> {
    pub fn compile(
        source: &str,
        heap: &'a mut Heap,
        constants: &'a mut Vec<Value>,
        reporter: &'a mut dyn Reporter,
    ) -> Result<GcRef, ()> {
        let placeholder = Rc::new(Token::synthetic(""));
        let mut compiler = Compiler {
            lexer: Lexer::new(source),
            current: Rc::clone(&placeholder),
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            state: Rc::new(RefCell::new(FnState::new(
                FunctionKind::Script,
                Rc::new(Token::synthetic("")),
                None,
            ))),
            chunk: Chunk::new(),
            classes: Vec::new(),
            heap,
            constants,
            reporter,
        };
        compiler.advance();
        while !compiler.check(TokenType::EOF) {
            compiler.declaration();
        }
        compiler.finish()
    }

    fn finish(mut self) -> Result<GcRef, ()> {
        self.emit_return();
        if self.had_error {
            return Err(());
        }
        let name = self.heap.intern("");
        Ok(self.heap.alloc_fun(name, 0, 0, self.chunk))
    }

    //>> Token plumbing

    fn advance(&mut self) {
        self.previous = mem::replace(&mut self.current, Rc::new(Token::synthetic("")));
        loop {
            match self.lexer.next_token() {
                Ok(token) => {
                    self.current = Rc::new(token);
                    break;
                }
                Err(err) => {
                    let token = Rc::new(err.token().clone());
                    let msg = err.message();
                    self.report(Phase::Lexical, token, msg);
                }
            }
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ == typ
    }

    fn matches(&mut self, typ: TokenType) -> bool {
        if self.check(typ) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, typ: TokenType, msg: &str) -> Result<(), ()> {
        if self.check(typ) {
            self.advance();
            Ok(())
        } else {
            self.error_at_current(msg);
            Err(())
        }
    }

    //>> Error reporting

    fn report(&mut self, phase: Phase, token: Rc<Token>, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.reporter
            .error(Report::new(phase, msg.to_string(), (*token).clone()));
    }

    fn error_at(&mut self, token: Rc<Token>, msg: &str) {
        self.report(Phase::Compilation, token, msg);
    }

    fn error_at_current(&mut self, msg: &str) {
        self.error_at(Rc::clone(&self.current), msg);
    }

    fn error_at_prev(&mut self, msg: &str) {
        self.error_at(Rc::clone(&self.previous), msg);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenType::EOF) {
            if self.previous.typ == TokenType::Semicolon {
                return;
            }
            if BOUNDARIES.contains(&self.current.typ) {
                return;
            }
            self.advance();
        }
    }

    //>> Emission helpers

    fn make_constant(&mut self, value: Value) -> Result<u8, ()> {
        // numbers and interned strings reuse their slot, which keeps
        // recompiles byte-identical and the pool small
        for (idx, existing) in self.constants.iter().enumerate() {
            if *existing == value {
                return Ok(idx as u8);
            }
        }
        if self.constants.len() > u8::MAX as usize {
            self.error_at_prev("Too many constants in one chunk.");
            return Err(());
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u8)
    }

    fn identifier_constant(&mut self, token: &Rc<Token>) -> Result<u8, ()> {
        let value = self.heap.intern_value(&token.lexeme);
        self.make_constant(value)
    }

    fn emit_const(&mut self, value: Value, token: Rc<Token>) -> Result<(), ()> {
        let idx = self.make_constant(value)?;
        self.chunk.emit_instr(CONSTANT, Some(token));
        self.chunk.emit_byte(idx);
        Ok(())
    }

    fn emit_with_byte(&mut self, instr: Instruction, operand: u8, token: Rc<Token>) {
        self.chunk.emit_instr(instr, Some(token));
        self.chunk.emit_byte(operand);
    }

    fn patch_jump(&mut self, at: usize, token: Rc<Token>) -> Result<(), ()> {
        if self.chunk.patch_jump(at).is_err() {
            self.error_at(token, "Too much code to jump over.");
            return Err(());
        }
        Ok(())
    }

    fn emit_loop(&mut self, start: usize, token: Rc<Token>) -> Result<(), ()> {
        if self.chunk.emit_loop(start, Some(Rc::clone(&token))).is_err() {
            self.error_at(token, "Loop body too large.");
            return Err(());
        }
        Ok(())
    }

    fn emit_return(&mut self) {
        if self.state.borrow().kind == FunctionKind::Initializer {
            // an initializer's implicit return hands `this` back
            self.chunk.emit_instr(GET_LOCAL, None);
            self.chunk.emit_byte(0);
        } else {
            self.chunk.emit_instr(NIL, None);
        }
        self.chunk.emit_instr(RETURN, None);
    }

    //>> Expressions

    fn parse_bp(&mut self, bp: Bp) -> Result<Context, ()> {
        self.advance();
        let token = Rc::clone(&self.previous);
        let nud = match rule(token.typ).nud {
            Some(nud) => nud,
            None => {
                self.error_at(token, "Expect expression.");
                return Err(());
            }
        };
        let mut ctx = nud(self, token)?;
        while bp < rule(self.current.typ).bp {
            self.advance();
            let token = Rc::clone(&self.previous);
            let led = rule(token.typ).led.unwrap();
            ctx = led(self, token, ctx)?;
        }
        Ok(ctx)
    }

    /// Emits the load a deferred context stands for.
    fn evaluate(&mut self, ctx: Context) -> Result<(), ()> {
        match ctx {
            Context::Value => Ok(()),
            Context::Variable(token) => self.get_variable(token),
            Context::Property(token) => {
                let idx = self.identifier_constant(&token)?;
                self.emit_with_byte(GET_FIELD, idx, token);
                Ok(())
            }
        }
    }

    fn expression(&mut self) -> Result<(), ()> {
        let ctx = self.parse_bp(Bp::None)?;
        self.evaluate(ctx)
    }

    fn argument_list(&mut self) -> Result<u8, ()> {
        let mut argc: usize = 0;
        if !self.check(TokenType::CParen) {
            loop {
                if argc == 255 {
                    self.error_at_current("Can't have more than 255 arguments.");
                    return Err(());
                }
                self.expression()?;
                argc += 1;
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::CParen, "Expect ')' after arguments.")?;
        Ok(argc as u8)
    }

    //>> Variables and scope

    fn resolve_upvalue(&mut self, token: &Rc<Token>) -> Result<Option<usize>, ()> {
        let resolved = self.state.borrow_mut().resolve_upvalue(token);
        match resolved {
            Some(idx) if idx > u8::MAX as usize => {
                self.error_at(Rc::clone(token), "Too many closure variables in function.");
                Err(())
            }
            other => Ok(other),
        }
    }

    fn get_variable(&mut self, token: Rc<Token>) -> Result<(), ()> {
        let resolved = self.state.borrow().resolve_local(&token);
        if let Some((idx, initialized)) = resolved {
            if !initialized {
                self.error_at(token, "Can't read local variable in its own initializer.");
                return Err(());
            }
            self.emit_with_byte(GET_LOCAL, idx as u8, token);
            return Ok(());
        }
        if let Some(idx) = self.resolve_upvalue(&token)? {
            self.emit_with_byte(GET_UPVALUE, idx as u8, token);
            return Ok(());
        }
        let idx = self.identifier_constant(&token)?;
        self.emit_with_byte(GET_GLOBAL, idx, token);
        Ok(())
    }

    fn set_variable(&mut self, token: Rc<Token>) -> Result<(), ()> {
        let resolved = self.state.borrow().resolve_local(&token);
        if let Some((idx, initialized)) = resolved {
            if !initialized {
                self.error_at(token, "Can't read local variable in its own initializer.");
                return Err(());
            }
            self.emit_with_byte(SET_LOCAL, idx as u8, token);
            return Ok(());
        }
        if let Some(idx) = self.resolve_upvalue(&token)? {
            self.emit_with_byte(SET_UPVALUE, idx as u8, token);
            return Ok(());
        }
        let idx = self.identifier_constant(&token)?;
        self.emit_with_byte(SET_GLOBAL, idx, token);
        Ok(())
    }

    fn add_local(&mut self, token: Rc<Token>) -> Result<(), ()> {
        if self.state.borrow().locals.len() == MAX_LOCALS {
            self.error_at(token, "Too many local variables in function.");
            return Err(());
        }
        self.state.borrow_mut().locals.push(Local {
            name: token,
            depth: None,
            is_captured: false,
        });
        Ok(())
    }

    /// `previous` must be the name token.
    fn declare_variable(&mut self) -> Result<(), ()> {
        let token = Rc::clone(&self.previous);
        if self.state.borrow().scope_depth == 0 {
            return Ok(());
        }
        let mut clash = false;
        {
            let state = self.state.borrow();
            for local in state.locals.iter().rev() {
                if matches!(local.depth, Some(depth) if depth < state.scope_depth) {
                    break;
                }
                if *local.name == *token {
                    clash = true;
                    break;
                }
            }
        }
        if clash {
            self.error_at(token, "Already a variable with this name in this scope.");
            return Err(());
        }
        self.add_local(token)
    }

    fn mark_initialized(&mut self) {
        let mut state = self.state.borrow_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        state.locals.last_mut().unwrap().depth = Some(depth);
    }

    fn define_variable(&mut self, name: Rc<Token>) -> Result<(), ()> {
        if self.state.borrow().scope_depth > 0 {
            self.mark_initialized();
            return Ok(());
        }
        let idx = self.identifier_constant(&name)?;
        self.emit_with_byte(GLOBAL, idx, name);
        Ok(())
    }

    fn begin_scope(&mut self) {
        self.state.borrow_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = self.state.borrow().scope_depth;
        loop {
            let popped = {
                let state = self.state.borrow();
                match state.locals.last() {
                    Some(local) if local.depth == Some(depth) => Some(local.is_captured),
                    _ => None,
                }
            };
            match popped {
                Some(is_captured) => {
                    self.state.borrow_mut().locals.pop();
                    if is_captured {
                        self.chunk.emit_instr(CLOSE, None);
                    } else {
                        self.chunk.emit_instr(POP, None);
                    }
                }
                None => break,
            }
        }
        self.state.borrow_mut().scope_depth -= 1;
    }

    //>> Declarations

    fn declaration(&mut self) {
        let result = if self.matches(TokenType::Class) {
            self.class_declaration()
        } else if self.matches(TokenType::Fun) {
            self.fun_declaration()
        } else if self.matches(TokenType::Var) {
            self.var_declaration()
        } else {
            self.statement()
        };
        if result.is_err() || self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) -> Result<(), ()> {
        self.consume(TokenType::Identifier, "Expect variable name.")?;
        let name = Rc::clone(&self.previous);
        self.declare_variable()?;
        if self.matches(TokenType::Equal) {
            self.expression()?;
        } else {
            self.chunk.emit_instr(NIL, Some(Rc::clone(&name)));
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.")?;
        self.define_variable(name)
    }

    fn fun_declaration(&mut self) -> Result<(), ()> {
        self.consume(TokenType::Identifier, "Expect function name.")?;
        let name = Rc::clone(&self.previous);
        self.declare_variable()?;
        // initialized before the body so the function can call itself
        self.mark_initialized();
        self.function(FunctionKind::Function, Rc::clone(&name))?;
        self.define_variable(name)
    }

    fn function(&mut self, kind: FunctionKind, name: Rc<Token>) -> Result<(), ()> {
        let enclosing_state = Rc::clone(&self.state);
        let enclosing_chunk = mem::replace(&mut self.chunk, Chunk::new());
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => Rc::new(Token::synthetic("this")),
            _ => Rc::clone(&name),
        };
        self.state = Rc::new(RefCell::new(FnState::new(
            kind,
            slot_zero,
            Some(Rc::clone(&enclosing_state)),
        )));
        self.begin_scope();

        let body = self.function_body();

        let state = mem::replace(&mut self.state, enclosing_state);
        let chunk = mem::replace(&mut self.chunk, enclosing_chunk);
        let arity = body?;

        let upvalues = state.borrow().upvalues.clone();
        let fun_name = self.heap.intern(&name.lexeme);
        let fun = self.heap.alloc_fun(fun_name, arity, upvalues.len(), chunk);
        let idx = self.make_constant(Value::Object(fun))?;
        self.emit_with_byte(CLOSURE, idx, name);
        for upvalue in upvalues {
            self.chunk.emit_byte(upvalue.idx as u8);
            self.chunk.emit_byte(upvalue.is_local as u8);
        }
        Ok(())
    }

    fn function_body(&mut self) -> Result<u8, ()> {
        self.consume(TokenType::OParen, "Expect '(' after function name.")?;
        let mut arity: usize = 0;
        if !self.check(TokenType::CParen) {
            loop {
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                    return Err(());
                }
                self.consume(TokenType::Identifier, "Expect parameter name.")?;
                self.declare_variable()?;
                self.mark_initialized();
                arity += 1;
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::CParen, "Expect ')' after parameters.")?;
        self.consume(TokenType::OBrace, "Expect '{' before function body.")?;
        self.block()?;
        self.emit_return();
        Ok(arity as u8)
    }

    fn class_declaration(&mut self) -> Result<(), ()> {
        self.consume(TokenType::Identifier, "Expect class name.")?;
        let name = Rc::clone(&self.previous);
        let idx = self.identifier_constant(&name)?;
        self.declare_variable()?;
        self.emit_with_byte(CLASS, idx, Rc::clone(&name));
        self.define_variable(Rc::clone(&name))?;

        self.classes.push(ClassState {
            has_superclass: false,
        });
        let result = self.class_body(name);
        let class = self.classes.pop().unwrap();
        if class.has_superclass {
            self.end_scope();
        }
        result
    }

    fn class_body(&mut self, name: Rc<Token>) -> Result<(), ()> {
        if self.matches(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.")?;
            let superclass = Rc::clone(&self.previous);
            if superclass.lexeme == name.lexeme {
                self.error_at(superclass, "A class can't inherit from itself.");
                return Err(());
            }
            self.get_variable(Rc::clone(&superclass))?;
            self.begin_scope();
            self.add_local(Rc::new(Token::synthetic("super")))?;
            self.mark_initialized();
            self.get_variable(Rc::clone(&name))?;
            self.chunk.emit_instr(DERIVE, Some(superclass));
            self.classes.last_mut().unwrap().has_superclass = true;
        }
        self.get_variable(Rc::clone(&name))?;
        self.consume(TokenType::OBrace, "Expect '{' before class body.")?;
        while !self.check(TokenType::CBrace) && !self.check(TokenType::EOF) {
            self.method()?;
        }
        self.consume(TokenType::CBrace, "Expect '}' after class body.")?;
        self.chunk.emit_instr(POP, None);
        Ok(())
    }

    fn method(&mut self) -> Result<(), ()> {
        self.consume(TokenType::Identifier, "Expect method name.")?;
        let name = Rc::clone(&self.previous);
        let idx = self.identifier_constant(&name)?;
        let kind = if name.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind, Rc::clone(&name))?;
        self.emit_with_byte(METHOD, idx, name);
        Ok(())
    }

    //>> Statements

    fn statement(&mut self) -> Result<(), ()> {
        if self.matches(TokenType::Print) {
            self.print_statement()
        } else if self.matches(TokenType::If) {
            self.if_statement()
        } else if self.matches(TokenType::While) {
            self.while_statement()
        } else if self.matches(TokenType::For) {
            self.for_statement()
        } else if self.matches(TokenType::Return) {
            self.return_statement()
        } else if self.matches(TokenType::OBrace) {
            self.begin_scope();
            let result = self.block();
            self.end_scope();
            result
        } else {
            self.expression_statement()
        }
    }

    fn block(&mut self) -> Result<(), ()> {
        while !self.check(TokenType::CBrace) && !self.check(TokenType::EOF) {
            self.declaration();
        }
        self.consume(TokenType::CBrace, "Expect '}' after block.")
    }

    fn print_statement(&mut self) -> Result<(), ()> {
        let token = Rc::clone(&self.previous);
        self.expression()?;
        self.consume(TokenType::Semicolon, "Expect ';' after value.")?;
        self.chunk.emit_instr(PRINT, Some(token));
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<(), ()> {
        self.expression()?;
        self.consume(TokenType::Semicolon, "Expect ';' after expression.")?;
        self.chunk.emit_instr(POP, None);
        Ok(())
    }

    fn if_statement(&mut self) -> Result<(), ()> {
        let token = Rc::clone(&self.previous);
        self.consume(TokenType::OParen, "Expect '(' after 'if'.")?;
        self.expression()?;
        self.consume(TokenType::CParen, "Expect ')' after condition.")?;

        let else_jump = self.chunk.emit_jump(JMP_ON_FALSE, Some(Rc::clone(&token)));
        self.chunk.emit_instr(POP, None);
        self.statement()?;
        let end_jump = self.chunk.emit_jump(JMP, None);
        self.patch_jump(else_jump, Rc::clone(&token))?;
        self.chunk.emit_instr(POP, None);
        if self.matches(TokenType::Else) {
            self.statement()?;
        }
        self.patch_jump(end_jump, token)
    }

    fn while_statement(&mut self) -> Result<(), ()> {
        let token = Rc::clone(&self.previous);
        let start = self.chunk.len();
        self.consume(TokenType::OParen, "Expect '(' after 'while'.")?;
        self.expression()?;
        self.consume(TokenType::CParen, "Expect ')' after condition.")?;

        let exit_jump = self.chunk.emit_jump(JMP_ON_FALSE, Some(Rc::clone(&token)));
        self.chunk.emit_instr(POP, None);
        self.statement()?;
        self.emit_loop(start, Rc::clone(&token))?;
        self.patch_jump(exit_jump, token)?;
        self.chunk.emit_instr(POP, None);
        Ok(())
    }

    fn for_statement(&mut self) -> Result<(), ()> {
        let token = Rc::clone(&self.previous);
        self.begin_scope();
        let result = self.for_clauses_and_body(token);
        self.end_scope();
        result
    }

    fn for_clauses_and_body(&mut self, token: Rc<Token>) -> Result<(), ()> {
        self.consume(TokenType::OParen, "Expect '(' after 'for'.")?;
        if self.matches(TokenType::Semicolon) {
            // no initializer
        } else if self.matches(TokenType::Var) {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.chunk.len();
        if !self.matches(TokenType::Semicolon) {
            self.expression()?;
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.")?;
        } else {
            self.chunk.emit_instr(TRUE, Some(Rc::clone(&token)));
        }
        let exit_jump = self.chunk.emit_jump(JMP_ON_FALSE, Some(Rc::clone(&token)));
        self.chunk.emit_instr(POP, None);

        if !self.check(TokenType::CParen) {
            let body_jump = self.chunk.emit_jump(JMP, None);
            let inc_start = self.chunk.len();
            self.expression()?;
            self.chunk.emit_instr(POP, None);
            self.consume(TokenType::CParen, "Expect ')' after for clauses.")?;
            self.emit_loop(loop_start, Rc::clone(&token))?;
            loop_start = inc_start;
            self.patch_jump(body_jump, Rc::clone(&token))?;
        } else {
            self.consume(TokenType::CParen, "Expect ')' after for clauses.")?;
        }

        self.statement()?;
        self.emit_loop(loop_start, Rc::clone(&token))?;
        self.patch_jump(exit_jump, token)?;
        self.chunk.emit_instr(POP, None);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), ()> {
        let token = Rc::clone(&self.previous);
        if self.state.borrow().kind == FunctionKind::Script {
            self.error_at(token, "Can't return from top-level code.");
            return Err(());
        }
        if self.matches(TokenType::Semicolon) {
            self.emit_return();
            return Ok(());
        }
        if self.state.borrow().kind == FunctionKind::Initializer {
            self.error_at(token, "Can't return a value from an initializer.");
            return Err(());
        }
        self.expression()?;
        self.consume(TokenType::Semicolon, "Expect ';' after return value.")?;
        self.chunk.emit_instr(RETURN, Some(token));
        Ok(())
    }
}

//>> Prefix handlers

fn nud_number(c: &mut Compiler, token: Rc<Token>) -> Result<Context, ()> {
    let n: f64 = token.lexeme.parse().unwrap();
    c.emit_const(Value::Number(n), token)?;
    Ok(Context::Value)
}

fn nud_string(c: &mut Compiler, token: Rc<Token>) -> Result<Context, ()> {
    let content = token.lexeme[1..token.lexeme.len() - 1].to_string();
    let value = c.heap.intern_value(&content);
    c.emit_const(value, token)?;
    Ok(Context::Value)
}

fn nud_literal(c: &mut Compiler, token: Rc<Token>) -> Result<Context, ()> {
    let instr = match token.typ {
        TokenType::Nil => NIL,
        TokenType::True => TRUE,
        TokenType::False => FALSE,
        _ => unreachable!(),
    };
    c.chunk.emit_instr(instr, Some(token));
    Ok(Context::Value)
}

fn nud_group(c: &mut Compiler, _token: Rc<Token>) -> Result<Context, ()> {
    let ctx = c.parse_bp(Bp::None)?;
    c.evaluate(ctx)?;
    c.consume(TokenType::CParen, "Expect ')' after expression.")?;
    Ok(Context::Value)
}

fn nud_unary(c: &mut Compiler, token: Rc<Token>) -> Result<Context, ()> {
    let ctx = c.parse_bp(Bp::Unary)?;
    c.evaluate(ctx)?;
    let instr = match token.typ {
        TokenType::Minus => NEGATIVE,
        TokenType::Bang => NOT,
        _ => unreachable!(),
    };
    c.chunk.emit_instr(instr, Some(token));
    Ok(Context::Value)
}

fn nud_variable(_c: &mut Compiler, token: Rc<Token>) -> Result<Context, ()> {
    Ok(Context::Variable(token))
}

fn nud_this(c: &mut Compiler, token: Rc<Token>) -> Result<Context, ()> {
    if c.classes.is_empty() {
        c.error_at(token, "Can't use 'this' outside of a class.");
        return Err(());
    }
    c.get_variable(token)?;
    Ok(Context::Value)
}

fn nud_super(c: &mut Compiler, token: Rc<Token>) -> Result<Context, ()> {
    match c.classes.last() {
        None => {
            c.error_at(token, "Can't use 'super' outside of a class.");
            return Err(());
        }
        Some(class) if !class.has_superclass => {
            c.error_at(token, "Can't use 'super' in a class with no superclass.");
            return Err(());
        }
        _ => {}
    }
    c.consume(TokenType::Dot, "Expect '.' after 'super'.")?;
    c.consume(TokenType::Identifier, "Expect superclass method name.")?;
    let method = Rc::clone(&c.previous);
    let idx = c.identifier_constant(&method)?;
    c.get_variable(Rc::new(Token::synthetic("this")))?;
    c.get_variable(Rc::new(Token::synthetic("super")))?;
    c.emit_with_byte(GET_SUPER, idx, method);
    Ok(Context::Value)
}

//>> Infix handlers

fn led_binary(c: &mut Compiler, token: Rc<Token>, ctx: Context) -> Result<Context, ()> {
    c.evaluate(ctx)?;
    let rhs = c.parse_bp(rule(token.typ).bp)?;
    c.evaluate(rhs)?;
    let instr = match token.typ {
        TokenType::Plus => ADD,
        TokenType::Minus => MINUS,
        TokenType::Star => MUL,
        TokenType::Slash => DIV,
        TokenType::DEqual => EQUAL_EQUAL,
        TokenType::BangEqual => BANG_EQUAL,
        TokenType::Greater => GREATER,
        TokenType::GreaterEqual => GREATER_EQUAL,
        TokenType::Less => LESS,
        TokenType::LessEqual => LESS_EQUAL,
        _ => unreachable!(),
    };
    c.chunk.emit_instr(instr, Some(token));
    Ok(Context::Value)
}

fn led_and(c: &mut Compiler, token: Rc<Token>, ctx: Context) -> Result<Context, ()> {
    c.evaluate(ctx)?;
    // the jump leaves the tested value in place as the expression result
    let end_jump = c.chunk.emit_jump(JMP_ON_FALSE, Some(Rc::clone(&token)));
    c.chunk.emit_instr(POP, Some(Rc::clone(&token)));
    let rhs = c.parse_bp(Bp::And)?;
    c.evaluate(rhs)?;
    c.patch_jump(end_jump, token)?;
    Ok(Context::Value)
}

fn led_or(c: &mut Compiler, token: Rc<Token>, ctx: Context) -> Result<Context, ()> {
    c.evaluate(ctx)?;
    let rhs_jump = c.chunk.emit_jump(JMP_ON_FALSE, Some(Rc::clone(&token)));
    let end_jump = c.chunk.emit_jump(JMP, Some(Rc::clone(&token)));
    c.patch_jump(rhs_jump, Rc::clone(&token))?;
    c.chunk.emit_instr(POP, Some(Rc::clone(&token)));
    let rhs = c.parse_bp(Bp::Or)?;
    c.evaluate(rhs)?;
    c.patch_jump(end_jump, token)?;
    Ok(Context::Value)
}

fn led_call(c: &mut Compiler, token: Rc<Token>, ctx: Context) -> Result<Context, ()> {
    c.evaluate(ctx)?;
    let argc = c.argument_list()?;
    c.emit_with_byte(CALL, argc, token);
    Ok(Context::Value)
}

fn led_dot(c: &mut Compiler, _token: Rc<Token>, ctx: Context) -> Result<Context, ()> {
    c.evaluate(ctx)?;
    c.consume(TokenType::Identifier, "Expect property name after '.'.")?;
    let name = Rc::clone(&c.previous);
    if c.matches(TokenType::OParen) {
        // property access followed directly by a call fuses into INVOKE
        let idx = c.identifier_constant(&name)?;
        let argc = c.argument_list()?;
        c.chunk.emit_instr(INVOKE, Some(name));
        c.chunk.emit_byte(argc);
        c.chunk.emit_byte(idx);
        Ok(Context::Value)
    } else {
        Ok(Context::Property(name))
    }
}

fn led_assign(c: &mut Compiler, token: Rc<Token>, ctx: Context) -> Result<Context, ()> {
    match ctx {
        Context::Variable(name) => {
            // right-associative: the right side parses at one power below
            let rhs = c.parse_bp(Bp::None)?;
            c.evaluate(rhs)?;
            c.set_variable(name)?;
        }
        Context::Property(name) => {
            let idx = c.identifier_constant(&name)?;
            let rhs = c.parse_bp(Bp::None)?;
            c.evaluate(rhs)?;
            c.emit_with_byte(SET_FIELD, idx, name);
        }
        Context::Value => {
            c.error_at(token, "Invalid assignment target.");
            return Err(());
        }
    }
    Ok(Context::Value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::Report;

    struct TestReporter {
        errors: Vec<Report>,
    }

    impl TestReporter {
        fn new() -> Self {
            Self { errors: Vec::new() }
        }
    }

    impl Reporter for TestReporter {
        fn warning(&mut self, _report: Report) {}

        fn error(&mut self, report: Report) {
            self.errors.push(report);
        }
    }

    fn compile(source: &str) -> Result<(Heap, Vec<Value>, GcRef), Vec<String>> {
        let mut heap = Heap::new();
        let mut constants = Vec::new();
        let mut reporter = TestReporter::new();
        match Compiler::compile(source, &mut heap, &mut constants, &mut reporter) {
            Ok(fun) => Ok((heap, constants, fun)),
            Err(()) => Err(reporter
                .errors
                .iter()
                .map(|report| report.to_string())
                .collect()),
        }
    }

    fn chunk_bytes(source: &str) -> Vec<u8> {
        let (heap, _, fun) = compile(source).unwrap();
        let chunk = &heap.fun(fun).chunk;
        (0..chunk.len()).map(|i| chunk.byte(i)).collect()
    }

    fn first_error(source: &str) -> String {
        compile(source).unwrap_err().remove(0)
    }

    #[test]
    fn arithmetic_respects_precedence() {
        assert_eq!(
            chunk_bytes("print 1 + 2 * 3;"),
            vec![
                CONSTANT as u8,
                0,
                CONSTANT as u8,
                1,
                CONSTANT as u8,
                2,
                MUL as u8,
                ADD as u8,
                PRINT as u8,
                NIL as u8,
                RETURN as u8,
            ]
        );
    }

    #[test]
    fn equal_compiles_to_a_store() {
        assert_eq!(
            chunk_bytes("var x; x = 1;"),
            vec![
                NIL as u8,
                GLOBAL as u8,
                0,
                CONSTANT as u8,
                1,
                SET_GLOBAL as u8,
                0,
                POP as u8,
                NIL as u8,
                RETURN as u8,
            ]
        );
    }

    #[test]
    fn and_short_circuits_without_popping_the_test() {
        assert_eq!(
            chunk_bytes("false and true;"),
            vec![
                FALSE as u8,
                JMP_ON_FALSE as u8,
                0,
                2,
                POP as u8,
                TRUE as u8,
                POP as u8,
                NIL as u8,
                RETURN as u8,
            ]
        );
    }

    #[test]
    fn identical_literals_share_a_constant_slot() {
        let (_, constants, _) = compile("print 1; print 1; print \"a\"; print \"a\";").unwrap();
        assert_eq!(constants.len(), 2);
    }

    #[test]
    fn recompiling_is_deterministic() {
        let source = "fun f(a) { return a + 1; } print f(2) == 3 or f(2) < 0;";
        assert_eq!(chunk_bytes(source), chunk_bytes(source));
    }

    #[test]
    fn closures_record_their_upvalues() {
        let (heap, constants, _) = compile(
            "fun outer() { var a = 1; fun inner() { return a; } return inner; }",
        )
        .unwrap();
        let inner = constants
            .iter()
            .find_map(|value| match value {
                Value::Object(r) => match &heap.get(*r).kind {
                    crate::heap::ObjKind::Fun(fun) if heap.string(fun.name) == "inner" => {
                        Some(fun)
                    }
                    _ => None,
                },
                _ => None,
            })
            .unwrap();
        assert_eq!(inner.upvalue_count, 1);
    }

    #[test]
    fn locals_close_or_pop_at_scope_end() {
        let bytes = chunk_bytes("{ var a = 1; var b = 2; fun f() { return a; } }");
        let closes = bytes.iter().filter(|b| **b == CLOSE as u8).count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn own_initializer_read_is_an_error() {
        assert_eq!(
            first_error("{ var a = 1; { var a = a; } }"),
            "[line 1] Error at 'a': Can't read local variable in its own initializer."
        );
    }

    #[test]
    fn redeclaring_a_local_is_an_error() {
        assert_eq!(
            first_error("{ var a = 1; var a = 2; }"),
            "[line 1] Error at 'a': Already a variable with this name in this scope."
        );
    }

    #[test]
    fn top_level_return_is_an_error() {
        assert_eq!(
            first_error("return 1;"),
            "[line 1] Error at 'return': Can't return from top-level code."
        );
    }

    #[test]
    fn returning_a_value_from_init_is_an_error() {
        assert_eq!(
            first_error("class A { init() { return 1; } }"),
            "[line 1] Error at 'return': Can't return a value from an initializer."
        );
    }

    #[test]
    fn this_outside_a_class_is_an_error() {
        assert_eq!(
            first_error("print this;"),
            "[line 1] Error at 'this': Can't use 'this' outside of a class."
        );
    }

    #[test]
    fn super_without_a_superclass_is_an_error() {
        assert_eq!(
            first_error("class A { f() { super.f(); } }"),
            "[line 1] Error at 'super': Can't use 'super' in a class with no superclass."
        );
    }

    #[test]
    fn inheriting_from_itself_is_an_error() {
        assert_eq!(
            first_error("class A < A {}"),
            "[line 1] Error at 'A': A class can't inherit from itself."
        );
    }

    #[test]
    fn invalid_assignment_target() {
        assert_eq!(
            first_error("var a; var b; a + b = 1;"),
            "[line 1] Error at '=': Invalid assignment target."
        );
    }

    #[test]
    fn missing_semicolon_is_reported_once_per_statement() {
        let errors = compile("var a = 1\nvar b = 2\n").unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors[0],
            "[line 2] Error at 'var': Expect ';' after variable declaration."
        );
    }

    #[test]
    fn the_257th_local_in_a_function_is_an_error() {
        // slot 0 is the callee, so 255 declarations fit and the 256th fails
        let mut source = String::from("fun f() {\n");
        for i in 0..256 {
            source += &format!("var l{};\n", i);
        }
        source += "}\n";
        let errors = compile(&source).unwrap_err();
        assert!(errors[0].ends_with("Too many local variables in function."));
    }

    #[test]
    fn constant_pool_overflows_at_256_entries() {
        let mut source = String::new();
        for i in 0..257 {
            source += &format!("print {};\n", i);
        }
        let errors = compile(&source).unwrap_err();
        assert!(errors[0].ends_with("Too many constants in one chunk."));
    }

    #[test]
    fn lexical_errors_are_reported_with_lines() {
        assert_eq!(
            first_error("print\n\"abc"),
            "[line 2] Error: Unterminated string."
        );
    }
}
