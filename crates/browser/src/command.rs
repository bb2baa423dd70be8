//! Browser command parsing.
//!
//! Generated instructions look like Playwright calls
//! (`page.get_by_role('button', name='Sign in').click()`). They are never
//! evaluated: a small tokenizer and recursive-descent parser turn them into
//! the closed `Command` enum, and anything outside that grammar is rejected
//! as a security failure.

use std::collections::HashMap;
use stepwise_core::{Error, Result};

use crate::driver::LoadState;
use crate::locator::{ElementAction, Locator, LocatorStep, WaitState};

#[derive(Debug, Clone, PartialEq)]
pub enum Assertion {
    Visible,
    Text(String),
    ContainsText(String),
    Value(String),
}

impl Assertion {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Visible => "to_be_visible",
            Self::Text(_) => "to_have_text",
            Self::ContainsText(_) => "to_contain_text",
            Self::Value(_) => "to_have_value",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Goto {
        url: String,
        wait_until: Option<LoadState>,
        timeout_ms: Option<u64>,
    },
    Url,
    WaitForLoadState {
        state: LoadState,
        timeout_ms: Option<u64>,
    },
    KeyboardPress(String),
    KeyboardType(String),
    Element {
        locator: Locator,
        action: ElementAction,
        timeout_ms: Option<u64>,
    },
    Expect {
        locator: Locator,
        assertion: Assertion,
        timeout_ms: Option<u64>,
    },
}

impl Command {
    /// Commands after which the page may still be fetching.
    pub fn is_mutating(&self) -> bool {
        match self {
            Self::KeyboardPress(_) | Self::KeyboardType(_) => true,
            Self::Element { action, .. } => action.is_mutating(),
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Goto { .. } => "goto",
            Self::Url => "url",
            Self::WaitForLoadState { .. } => "wait_for_load_state",
            Self::KeyboardPress(_) => "keyboard.press",
            Self::KeyboardType(_) => "keyboard.type",
            Self::Element { action, .. } => action.name(),
            Self::Expect { assertion, .. } => assertion.name(),
        }
    }
}

/// Strips a leading `await `, a leading `page.` and a trailing `;`.
pub fn normalize(input: &str) -> &str {
    let mut s = input.trim();
    if let Some(rest) = s.strip_prefix("await ") {
        s = rest.trim_start();
    }
    if let Some(rest) = s.strip_prefix("page.") {
        s = rest;
    }
    s.trim_end_matches(';').trim_end()
}

pub fn parse(input: &str) -> Result<Command> {
    let cleaned = normalize(input);
    parse_inner(cleaned).map_err(|reason| Error::Security(format!("{} ({})", cleaned, reason)))
}

fn parse_inner(cleaned: &str) -> std::result::Result<Command, String> {
    if cleaned.is_empty() {
        return Err("empty instruction".to_string());
    }
    let tokens = tokenize(cleaned)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err("unexpected trailing input".to_string());
    }
    match expr {
        Expr::Chain(members) => interpret(&members),
        _ => Err("instruction is not a call".to_string()),
    }
}

// ─── Tokenizer ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Punct(char),
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if matches!(c, '\'' | '"' | '`') {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                let ch = *chars.get(i).ok_or("unterminated string")?;
                i += 1;
                if ch == quote {
                    break;
                }
                if ch == '\\' {
                    let esc = *chars.get(i).ok_or("unterminated escape")?;
                    i += 1;
                    value.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                } else {
                    if quote == '`' && ch == '$' && chars.get(i) == Some(&'{') {
                        return Err("template interpolation is not supported".to_string());
                    }
                    value.push(ch);
                }
            }
            tokens.push(Token::Str(value));
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let num = text.parse::<f64>().map_err(|_| format!("bad number '{}'", text))?;
            tokens.push(Token::Num(num));
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if ".(),=[]{}:".contains(c) {
            tokens.push(Token::Punct(c));
            i += 1;
        } else {
            return Err(format!("unexpected character '{}'", c));
        }
    }
    Ok(tokens)
}

// ─── Parser ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    List(Vec<Expr>),
    Dict(Vec<(String, Expr)>),
    Chain(Vec<Member>),
}

#[derive(Debug, Clone, PartialEq)]
struct Member {
    name: String,
    /// `None` for property access, `Some` for a call.
    args: Option<Vec<Arg>>,
}

#[derive(Debug, Clone, PartialEq)]
struct Arg {
    name: Option<String>,
    value: Expr,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(&Token::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> std::result::Result<(), String> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(format!("expected '{}'", c))
        }
    }

    fn expr(&mut self) -> std::result::Result<Expr, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Punct('[')) => {
                let mut items = Vec::new();
                while !self.eat(']') {
                    items.push(self.expr()?);
                    if !self.eat(',') {
                        self.expect(']')?;
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            Some(Token::Punct('{')) => {
                let mut entries = Vec::new();
                while !self.eat('}') {
                    let key = match self.next() {
                        Some(Token::Ident(k)) | Some(Token::Str(k)) => k,
                        _ => return Err("expected object key".to_string()),
                    };
                    self.expect(':')?;
                    entries.push((key, self.expr()?));
                    if !self.eat(',') {
                        self.expect('}')?;
                        break;
                    }
                }
                Ok(Expr::Dict(entries))
            }
            Some(Token::Ident(name)) => {
                match name.as_str() {
                    "True" | "true" => return Ok(Expr::Bool(true)),
                    "False" | "false" => return Ok(Expr::Bool(false)),
                    "None" | "null" | "undefined" => return Ok(Expr::Null),
                    _ => {}
                }
                self.pos -= 1;
                self.chain()
            }
            Some(tok) => Err(format!("unexpected token {:?}", tok)),
            None => Err("unexpected end of input".to_string()),
        }
    }

    fn chain(&mut self) -> std::result::Result<Expr, String> {
        let mut members = vec![self.member()?];
        while self.eat('.') {
            members.push(self.member()?);
        }
        Ok(Expr::Chain(members))
    }

    fn member(&mut self) -> std::result::Result<Member, String> {
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            _ => return Err("expected identifier".to_string()),
        };
        if !self.eat('(') {
            return Ok(Member { name, args: None });
        }
        let mut args = Vec::new();
        while !self.eat(')') {
            args.push(self.arg()?);
            if !self.eat(',') {
                self.expect(')')?;
                break;
            }
        }
        Ok(Member { name, args: Some(args) })
    }

    fn arg(&mut self) -> std::result::Result<Arg, String> {
        if let (Some(Token::Ident(name)), Some(Token::Punct('='))) = (self.peek(), self.peek_at(1)) {
            let name = name.clone();
            self.pos += 2;
            return Ok(Arg { name: Some(name), value: self.expr()? });
        }
        Ok(Arg { name: None, value: self.expr()? })
    }
}

// ─── Interpretation ─────────────────────────────────────────────────

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Call arguments split into positional and keyword form. A JS options
/// object (`{ waitUntil: 'load' }`) is folded into the keywords.
struct Args {
    positional: Vec<Expr>,
    named: HashMap<String, Expr>,
}

impl Args {
    fn of(member: &Member) -> Self {
        let mut positional = Vec::new();
        let mut named = HashMap::new();
        for arg in member.args.iter().flatten() {
            match (&arg.name, &arg.value) {
                (Some(name), value) => {
                    named.insert(name.clone(), value.clone());
                }
                (None, Expr::Dict(entries)) => {
                    for (k, v) in entries {
                        named.insert(to_snake_case(k), v.clone());
                    }
                }
                (None, value) => positional.push(value.clone()),
            }
        }
        Self { positional, named }
    }

    fn get(&self, index: usize, name: &str) -> Option<&Expr> {
        self.named.get(name).or_else(|| self.positional.get(index))
    }

    fn string(&self, index: usize, name: &str) -> std::result::Result<String, String> {
        match self.get(index, name) {
            Some(Expr::Str(s)) => Ok(s.clone()),
            Some(_) => Err(format!("argument '{}' must be a string", name)),
            None => Err(format!("missing argument '{}'", name)),
        }
    }

    fn opt_string(&self, index: Option<usize>, name: &str) -> std::result::Result<Option<String>, String> {
        let value = match index {
            Some(i) => self.get(i, name),
            None => self.named.get(name),
        };
        match value {
            None | Some(Expr::Null) => Ok(None),
            Some(Expr::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(format!("argument '{}' must be a string", name)),
        }
    }

    fn opt_u64(&self, name: &str) -> std::result::Result<Option<u64>, String> {
        match self.named.get(name) {
            None | Some(Expr::Null) => Ok(None),
            Some(Expr::Num(n)) if *n >= 0.0 => Ok(Some(*n as u64)),
            Some(_) => Err(format!("argument '{}' must be a non-negative number", name)),
        }
    }

    fn flag(&self, name: &str) -> std::result::Result<bool, String> {
        match self.named.get(name) {
            None | Some(Expr::Null) => Ok(false),
            Some(Expr::Bool(b)) => Ok(*b),
            Some(_) => Err(format!("argument '{}' must be a boolean", name)),
        }
    }

    fn strings(&self, index: usize, name: &str) -> std::result::Result<Vec<String>, String> {
        match self.get(index, name) {
            Some(Expr::Str(s)) => Ok(vec![s.clone()]),
            Some(Expr::List(items)) => items
                .iter()
                .map(|i| match i {
                    Expr::Str(s) => Ok(s.clone()),
                    _ => Err(format!("argument '{}' must contain strings", name)),
                })
                .collect(),
            Some(_) => Err(format!("argument '{}' must be a string or list", name)),
            None => Err(format!("missing argument '{}'", name)),
        }
    }
}

fn is_call(member: &Member) -> bool {
    member.args.is_some()
}

fn no_more(rest: &[Member]) -> std::result::Result<(), String> {
    match rest.first() {
        None => Ok(()),
        Some(m) => Err(format!("unexpected '.{}'", m.name)),
    }
}

fn load_state(value: Option<String>) -> std::result::Result<Option<LoadState>, String> {
    value
        .map(|s| LoadState::parse(&s).ok_or_else(|| format!("unknown load state '{}'", s)))
        .transpose()
}

fn interpret(members: &[Member]) -> std::result::Result<Command, String> {
    let members = skip_page(members);
    let (head, rest) = members.split_first().ok_or("empty instruction")?;
    let args = Args::of(head);

    match head.name.as_str() {
        "goto" => {
            no_more(rest)?;
            Ok(Command::Goto {
                url: args.string(0, "url")?,
                wait_until: load_state(args.opt_string(None, "wait_until")?)?,
                timeout_ms: args.opt_u64("timeout")?,
            })
        }
        "url" => {
            no_more(rest)?;
            if !args.positional.is_empty() {
                return Err("url() takes no arguments".to_string());
            }
            Ok(Command::Url)
        }
        "wait_for_load_state" => {
            no_more(rest)?;
            let state = load_state(args.opt_string(Some(0), "state")?)?.unwrap_or(LoadState::Load);
            Ok(Command::WaitForLoadState { state, timeout_ms: args.opt_u64("timeout")? })
        }
        "keyboard" if !is_call(head) => {
            let (call, rest) = rest.split_first().ok_or("keyboard needs a method")?;
            no_more(rest)?;
            let args = Args::of(call);
            match call.name.as_str() {
                "press" => Ok(Command::KeyboardPress(args.string(0, "key")?)),
                "type" | "insert_text" => Ok(Command::KeyboardType(args.string(0, "text")?)),
                other => Err(format!("unsupported keyboard method '{}'", other)),
            }
        }
        "expect" => interpret_expect(&args, rest),
        "wait_for_selector" => {
            no_more(rest)?;
            let state = args
                .opt_string(None, "state")?
                .map(|s| WaitState::parse(&s).ok_or_else(|| format!("unknown state '{}'", s)))
                .transpose()?
                .unwrap_or(WaitState::Visible);
            Ok(Command::Element {
                locator: Locator::css(args.string(0, "selector")?),
                action: ElementAction::WaitFor(state),
                timeout_ms: args.opt_u64("timeout")?,
            })
        }
        name if is_action(name) && is_call(head) && rest.is_empty() => Ok(Command::Element {
            locator: Locator::css(args.string(0, "selector")?),
            action: element_action(name, &args, 1)?,
            timeout_ms: args.opt_u64("timeout")?,
        }),
        _ => {
            let (last, chain) = members.split_last().ok_or("empty instruction")?;
            let locator = build_locator(chain)?;
            if locator.is_empty() {
                return Err(format!("unsupported call '{}'", head.name));
            }
            if !is_call(last) {
                return Err(format!("'{}' is not an element action", last.name));
            }
            let last_args = Args::of(last);
            Ok(Command::Element {
                locator,
                action: element_action(&last.name, &last_args, 0)?,
                timeout_ms: last_args.opt_u64("timeout")?,
            })
        }
    }
}

fn skip_page(members: &[Member]) -> &[Member] {
    match members.first() {
        Some(m) if m.name == "page" && !is_call(m) => &members[1..],
        _ => members,
    }
}

fn interpret_expect(args: &Args, rest: &[Member]) -> std::result::Result<Command, String> {
    let target = match args.positional.first() {
        Some(Expr::Chain(members)) => members,
        _ => return Err("expect() needs a locator".to_string()),
    };
    let locator = build_locator(skip_page(target))?;
    if locator.is_empty() {
        return Err("expect() needs a locator".to_string());
    }

    let (call, tail) = rest.split_first().ok_or("expect() needs an assertion")?;
    no_more(tail)?;
    if !is_call(call) {
        return Err(format!("'{}' is not an assertion", call.name));
    }
    let call_args = Args::of(call);
    let assertion = match call.name.as_str() {
        "to_be_visible" => Assertion::Visible,
        "to_have_text" => Assertion::Text(call_args.string(0, "expected")?),
        "to_contain_text" => Assertion::ContainsText(call_args.string(0, "expected")?),
        "to_have_value" => Assertion::Value(call_args.string(0, "value")?),
        other => return Err(format!("unsupported assertion '{}'", other)),
    };
    Ok(Command::Expect {
        locator,
        assertion,
        timeout_ms: call_args.opt_u64("timeout")?,
    })
}

fn build_locator(members: &[Member]) -> std::result::Result<Locator, String> {
    let mut locator = Locator::new();
    for member in members {
        for step in locator_steps(member)? {
            locator = locator.then(step);
        }
    }
    Ok(locator)
}

fn locator_steps(member: &Member) -> std::result::Result<Vec<LocatorStep>, String> {
    let args = Args::of(member);
    let name = member.name.as_str();

    if !is_call(member) {
        return match name {
            "first" => Ok(vec![LocatorStep::First]),
            "last" => Ok(vec![LocatorStep::Last]),
            _ => Err(format!("unsupported property '{}'", name)),
        };
    }

    let exact = || args.flag("exact");
    let step = match name {
        "locator" => {
            let mut steps = vec![LocatorStep::Css { selector: args.string(0, "selector")? }];
            let has_text = args.opt_string(None, "has_text")?;
            let has_not_text = args.opt_string(None, "has_not_text")?;
            if has_text.is_some() || has_not_text.is_some() {
                steps.push(LocatorStep::Filter { has_text, has_not_text });
            }
            return Ok(steps);
        }
        "get_by_text" => LocatorStep::Text { text: args.string(0, "text")?, exact: exact()? },
        "get_by_role" => LocatorStep::Role {
            role: args.string(0, "role")?,
            name: args.opt_string(None, "name")?,
            exact: exact()?,
        },
        "get_by_placeholder" => LocatorStep::Placeholder { text: args.string(0, "text")?, exact: exact()? },
        "get_by_label" => LocatorStep::Label { text: args.string(0, "text")?, exact: exact()? },
        "get_by_test_id" => LocatorStep::TestId { id: args.string(0, "test_id")? },
        "get_by_alt_text" => LocatorStep::AltText { text: args.string(0, "text")?, exact: exact()? },
        "get_by_title" => LocatorStep::Title { text: args.string(0, "text")?, exact: exact()? },
        "filter" => LocatorStep::Filter {
            has_text: args.opt_string(None, "has_text")?,
            has_not_text: args.opt_string(None, "has_not_text")?,
        },
        "first" => LocatorStep::First,
        "last" => LocatorStep::Last,
        "nth" => match args.get(0, "index") {
            Some(Expr::Num(n)) if n.fract() == 0.0 => LocatorStep::Nth { index: *n as i64 },
            _ => return Err("nth() needs an integer index".to_string()),
        },
        other => return Err(format!("unsupported call '{}'", other)),
    };
    Ok(vec![step])
}

const ACTIONS: &[&str] = &[
    "click",
    "dblclick",
    "fill",
    "type",
    "press",
    "check",
    "uncheck",
    "select_option",
    "hover",
    "focus",
    "wait_for",
    "is_visible",
    "text_content",
    "inner_text",
    "input_value",
];

fn is_action(name: &str) -> bool {
    ACTIONS.contains(&name) && name != "wait_for"
}

/// `offset` skips the selector argument of page-level shortcuts.
fn element_action(name: &str, args: &Args, offset: usize) -> std::result::Result<ElementAction, String> {
    Ok(match name {
        "click" => ElementAction::Click,
        "dblclick" => ElementAction::DoubleClick,
        "fill" => ElementAction::Fill(args.string(offset, "value")?),
        "type" => ElementAction::Type(args.string(offset, "text")?),
        "press" => ElementAction::Press(args.string(offset, "key")?),
        "check" => ElementAction::Check,
        "uncheck" => ElementAction::Uncheck,
        "select_option" => ElementAction::SelectOption(args.strings(offset, "value")?),
        "hover" => ElementAction::Hover,
        "focus" => ElementAction::Focus,
        "wait_for" => {
            let state = args.opt_string(Some(offset), "state")?;
            ElementAction::WaitFor(match state {
                Some(s) => WaitState::parse(&s).ok_or_else(|| format!("unknown state '{}'", s))?,
                None => WaitState::Visible,
            })
        }
        "is_visible" => ElementAction::IsVisible,
        "text_content" | "inner_text" => ElementAction::TextContent,
        "input_value" => ElementAction::InputValue,
        other => return Err(format!("unsupported action '{}'", other)),
    })
}
