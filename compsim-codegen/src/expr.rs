//! Symbolic expressions over decoded instruction fields
//!
//! Control-flow descriptors carry small C-like expressions (`ac_pc + (imm << 2)`,
//! `RB[rs] == RB[rt]`, `RB[31] = ac_pc + 8`). They are parsed once into an [`Expr`]
//! when the ISA metadata is loaded and then used per instruction in two ways:
//!
//! - [`Expr::evaluate`] folds the expression to a concrete integer when every
//!   identifier it touches is bound. Anything that needs runtime state (register
//!   reads, calls, assignments) yields `None`, which only means the value cannot be
//!   known at generation time.
//! - [`Expr::substitute`] replaces bound identifiers with literals and keeps the
//!   rest, producing the expression that is embedded in generated code.
//!
//! Substitution works on identifier tokens, so a field `imm` never touches
//! `imm_hi`, and member names after `.` are never rewritten.

use crate::error::ExprError;
use proc_macro2::{Span, TokenStream};
use quote::quote;
use std::fmt;

/// Name of the pseudo-variable bound to the address of the current instruction.
pub const PC_VARIABLE: &str = "ac_pc";

/// An integer value together with how it should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scalar {
    pub value: i64,
    pub signed: bool,
}

impl Scalar {
    pub const fn signed(value: i64) -> Self {
        Self {
            value,
            signed: true,
        }
    }

    pub const fn unsigned(value: u64) -> Self {
        Self {
            value: value as i64,
            signed: false,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.signed {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{}", self.value as u64)
        }
    }
}

/// Source of identifier values for evaluation and substitution.
pub trait Bindings {
    fn lookup(&self, name: &str) -> Option<Scalar>;
}

impl<F> Bindings for F
where
    F: Fn(&str) -> Option<Scalar>,
{
    fn lookup(&self, name: &str) -> Option<Scalar> {
        self(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,
}

impl BinaryOp {
    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::BitOr => 3,
            BinaryOp::BitXor => 4,
            BinaryOp::BitAnd => 5,
            BinaryOp::Eq | BinaryOp::Ne => 6,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 7,
            BinaryOp::Shl | BinaryOp::Shr => 8,
            BinaryOp::Add | BinaryOp::Sub => 9,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 10,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitXor => "^",
            BinaryOp::BitOr => "|",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Rem,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "<<" => BinaryOp::Shl,
            ">>" => BinaryOp::Shr,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "&" => BinaryOp::BitAnd,
            "^" => BinaryOp::BitXor,
            "|" => BinaryOp::BitOr,
            "&&" => BinaryOp::And,
            "||" => BinaryOp::Or,
            _ => return None,
        })
    }

    fn is_boolean(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::And
                | BinaryOp::Or
        )
    }

    fn apply(self, lhs: i64, rhs: i64) -> Option<i64> {
        let value = match self {
            BinaryOp::Mul => lhs.wrapping_mul(rhs),
            BinaryOp::Div => lhs.checked_div(rhs)?,
            BinaryOp::Rem => lhs.checked_rem(rhs)?,
            BinaryOp::Add => lhs.wrapping_add(rhs),
            BinaryOp::Sub => lhs.wrapping_sub(rhs),
            BinaryOp::Shl => lhs.checked_shl(u32::try_from(rhs).ok()?)?,
            BinaryOp::Shr => lhs.checked_shr(u32::try_from(rhs).ok()?)?,
            BinaryOp::Lt => (lhs < rhs) as i64,
            BinaryOp::Le => (lhs <= rhs) as i64,
            BinaryOp::Gt => (lhs > rhs) as i64,
            BinaryOp::Ge => (lhs >= rhs) as i64,
            BinaryOp::Eq => (lhs == rhs) as i64,
            BinaryOp::Ne => (lhs != rhs) as i64,
            BinaryOp::BitAnd => lhs & rhs,
            BinaryOp::BitXor => lhs ^ rhs,
            BinaryOp::BitOr => lhs | rhs,
            BinaryOp::And => (lhs != 0 && rhs != 0) as i64,
            BinaryOp::Or => (lhs != 0 || rhs != 0) as i64,
        };
        Some(value)
    }

    fn to_tokens(self) -> TokenStream {
        match self {
            BinaryOp::Mul => quote!(*),
            BinaryOp::Div => quote!(/),
            BinaryOp::Rem => quote!(%),
            BinaryOp::Add => quote!(+),
            BinaryOp::Sub => quote!(-),
            BinaryOp::Shl => quote!(<<),
            BinaryOp::Shr => quote!(>>),
            BinaryOp::Lt => quote!(<),
            BinaryOp::Le => quote!(<=),
            BinaryOp::Gt => quote!(>),
            BinaryOp::Ge => quote!(>=),
            BinaryOp::Eq => quote!(==),
            BinaryOp::Ne => quote!(!=),
            BinaryOp::BitAnd => quote!(&),
            BinaryOp::BitXor => quote!(^),
            BinaryOp::BitOr => quote!(|),
            BinaryOp::And => quote!(&&),
            BinaryOp::Or => quote!(||),
        }
    }
}

/// Assignment operators; only meaningful inside post-branch actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Compound(BinaryOp),
}

impl AssignOp {
    fn from_symbol(symbol: &str) -> Option<Self> {
        if symbol == "=" {
            return Some(AssignOp::Assign);
        }
        let op = symbol.strip_suffix('=')?;
        match BinaryOp::from_symbol(op)? {
            op @ (BinaryOp::Mul
            | BinaryOp::Div
            | BinaryOp::Rem
            | BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Shl
            | BinaryOp::Shr
            | BinaryOp::BitAnd
            | BinaryOp::BitXor
            | BinaryOp::BitOr) => Some(AssignOp::Compound(op)),
            _ => None,
        }
    }

    fn symbol(self) -> String {
        match self {
            AssignOp::Assign => "=".to_string(),
            AssignOp::Compound(op) => format!("{}=", op.symbol()),
        }
    }

    fn to_tokens(self) -> TokenStream {
        match self {
            AssignOp::Assign => quote!(=),
            AssignOp::Compound(BinaryOp::Mul) => quote!(*=),
            AssignOp::Compound(BinaryOp::Div) => quote!(/=),
            AssignOp::Compound(BinaryOp::Rem) => quote!(%=),
            AssignOp::Compound(BinaryOp::Add) => quote!(+=),
            AssignOp::Compound(BinaryOp::Sub) => quote!(-=),
            AssignOp::Compound(BinaryOp::Shl) => quote!(<<=),
            AssignOp::Compound(BinaryOp::Shr) => quote!(>>=),
            AssignOp::Compound(BinaryOp::BitAnd) => quote!(&=),
            AssignOp::Compound(BinaryOp::BitXor) => quote!(^=),
            AssignOp::Compound(_) => quote!(|=),
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Lit(Scalar),
    Ident(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Assign(AssignOp, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Member(Box<Expr>, String),
}

impl Expr {
    /// Parses a single expression.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let mut parser = Parser::new(source)?;
        let expr = parser.expression()?;
        parser.expect_end()?;
        Ok(expr)
    }

    /// Parses a `;`-separated statement list. Empty statements are skipped.
    pub fn parse_statements(source: &str) -> Result<Vec<Self>, ExprError> {
        let mut parser = Parser::new(source)?;
        let mut statements = Vec::new();
        loop {
            while parser.eat(";") {}
            if parser.at_end() {
                break;
            }
            statements.push(parser.expression()?);
            if !parser.at_end() && !parser.eat(";") {
                return Err(parser.error("expected `;`"));
            }
        }
        Ok(statements)
    }

    /// Folds the expression to a constant.
    ///
    /// Returns `None` when the value depends on anything unknown at generation time.
    pub fn evaluate(&self, bindings: &impl Bindings) -> Option<i64> {
        match self {
            Expr::Lit(scalar) => Some(scalar.value),
            Expr::Ident(name) => bindings.lookup(name).map(|scalar| scalar.value),
            Expr::Unary(op, operand) => {
                let value = operand.evaluate(bindings)?;
                Some(match op {
                    UnaryOp::Neg => value.wrapping_neg(),
                    UnaryOp::Plus => value,
                    UnaryOp::Not => (value == 0) as i64,
                    UnaryOp::BitNot => !value,
                })
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => match lhs.evaluate(bindings)? {
                0 => Some(0),
                _ => Some((rhs.evaluate(bindings)? != 0) as i64),
            },
            Expr::Binary(BinaryOp::Or, lhs, rhs) => match lhs.evaluate(bindings)? {
                0 => Some((rhs.evaluate(bindings)? != 0) as i64),
                _ => Some(1),
            },
            Expr::Binary(op, lhs, rhs) => {
                op.apply(lhs.evaluate(bindings)?, rhs.evaluate(bindings)?)
            }
            Expr::Ternary(cond, then, otherwise) => {
                if cond.evaluate(bindings)? != 0 {
                    then.evaluate(bindings)
                } else {
                    otherwise.evaluate(bindings)
                }
            }
            Expr::Assign(..) | Expr::Index(..) | Expr::Call(..) | Expr::Member(..) => None,
        }
    }

    /// Returns a copy with every bound identifier replaced by its literal value.
    pub fn substitute(&self, bindings: &impl Bindings) -> Expr {
        let sub = |expr: &Expr| Box::new(expr.substitute(bindings));
        match self {
            Expr::Lit(_) => self.clone(),
            Expr::Ident(name) => match bindings.lookup(name) {
                Some(scalar) => Expr::Lit(scalar),
                None => self.clone(),
            },
            Expr::Unary(op, operand) => Expr::Unary(*op, sub(operand)),
            Expr::Binary(op, lhs, rhs) => Expr::Binary(*op, sub(lhs), sub(rhs)),
            Expr::Ternary(cond, then, otherwise) => {
                Expr::Ternary(sub(cond), sub(then), sub(otherwise))
            }
            Expr::Assign(op, target, value) => Expr::Assign(*op, sub(target), sub(value)),
            Expr::Index(base, index) => Expr::Index(sub(base), sub(index)),
            Expr::Call(callee, args) => {
                // A bare callee names a function, not a value.
                let callee = match callee.as_ref() {
                    Expr::Ident(_) => callee.clone(),
                    other => Box::new(other.substitute(bindings)),
                };
                Expr::Call(callee, args.iter().map(|arg| arg.substitute(bindings)).collect())
            }
            Expr::Member(base, name) => Expr::Member(sub(base), name.clone()),
        }
    }

    /// Returns true when the rendered Rust expression is a `bool`.
    pub fn is_boolean(&self) -> bool {
        match self {
            Expr::Binary(op, ..) => op.is_boolean(),
            Expr::Unary(UnaryOp::Not, _) => true,
            _ => false,
        }
    }

    /// Renders the expression as Rust tokens.
    ///
    /// Free identifiers become fields of the simulator bound to `sim`, calls on
    /// them become method calls.
    pub fn to_tokens(&self, sim: &syn::Ident) -> TokenStream {
        match self {
            Expr::Lit(scalar) => scalar_tokens(*scalar),
            Expr::Ident(name) => {
                let ident = rust_ident(name);
                quote! { #sim.#ident }
            }
            Expr::Unary(op, operand) => {
                let inner = operand.to_tokens(sim);
                match op {
                    UnaryOp::Neg => quote! { (-#inner) },
                    UnaryOp::Plus => inner,
                    UnaryOp::BitNot => quote! { (!#inner) },
                    UnaryOp::Not if operand.is_boolean() => quote! { (!#inner) },
                    UnaryOp::Not => quote! { ((#inner) == 0) },
                }
            }
            Expr::Binary(op @ (BinaryOp::And | BinaryOp::Or), lhs, rhs) => {
                let lhs = lhs.condition_tokens(sim);
                let rhs = rhs.condition_tokens(sim);
                let op = op.to_tokens();
                quote! { (#lhs #op #rhs) }
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = lhs.to_tokens(sim);
                let rhs = rhs.to_tokens(sim);
                let op = op.to_tokens();
                quote! { (#lhs #op #rhs) }
            }
            Expr::Ternary(cond, then, otherwise) => {
                let cond = cond.condition_tokens(sim);
                let then = then.to_tokens(sim);
                let otherwise = otherwise.to_tokens(sim);
                quote! { (if #cond { #then } else { #otherwise }) }
            }
            Expr::Assign(op, target, value) => {
                let target = target.to_tokens(sim);
                let value = value.to_tokens(sim);
                let op = op.to_tokens();
                quote! { #target #op #value }
            }
            Expr::Index(base, index) => {
                let base = base.to_tokens(sim);
                let index = index.to_tokens(sim);
                quote! { #base[(#index) as usize] }
            }
            Expr::Call(callee, args) => {
                let callee = callee.to_tokens(sim);
                let args = args.iter().map(|arg| arg.to_tokens(sim));
                quote! { #callee(#(#args),*) }
            }
            Expr::Member(base, name) => {
                let base = base.to_tokens(sim);
                let name = rust_ident(name);
                quote! { #base.#name }
            }
        }
    }

    /// Renders the expression for use as an `if` condition.
    pub fn condition_tokens(&self, sim: &syn::Ident) -> TokenStream {
        let tokens = self.to_tokens(sim);
        if self.is_boolean() {
            tokens
        } else {
            quote! { ((#tokens) != 0) }
        }
    }

    /// Renders the expression as an `i64` value.
    ///
    /// Literals carry an `i64` suffix and reads of simulator state are cast, so
    /// integer inference never falls back to `i32`.
    pub fn wide_tokens(&self, sim: &syn::Ident) -> TokenStream {
        let tokens = self.wide(sim);
        if self.is_boolean() {
            quote! { ((#tokens) as i64) }
        } else {
            tokens
        }
    }

    /// Like [`Expr::condition_tokens`], with operands evaluated as `i64`.
    pub fn wide_condition_tokens(&self, sim: &syn::Ident) -> TokenStream {
        let tokens = self.wide(sim);
        if self.is_boolean() {
            tokens
        } else {
            quote! { ((#tokens) != 0i64) }
        }
    }

    fn wide(&self, sim: &syn::Ident) -> TokenStream {
        match self {
            Expr::Lit(scalar) => wide_scalar_tokens(*scalar),
            Expr::Ident(_) | Expr::Index(..) | Expr::Call(..) | Expr::Member(..) => {
                let read = self.to_tokens(sim);
                quote! { (#read as i64) }
            }
            Expr::Unary(op, operand) => match op {
                UnaryOp::Neg => {
                    let inner = operand.wide_tokens(sim);
                    quote! { (-#inner) }
                }
                UnaryOp::Plus => operand.wide_tokens(sim),
                UnaryOp::BitNot => {
                    let inner = operand.wide_tokens(sim);
                    quote! { (!#inner) }
                }
                UnaryOp::Not => {
                    let inner = operand.wide_condition_tokens(sim);
                    quote! { (!#inner) }
                }
            },
            Expr::Binary(op @ (BinaryOp::And | BinaryOp::Or), lhs, rhs) => {
                let lhs = lhs.wide_condition_tokens(sim);
                let rhs = rhs.wide_condition_tokens(sim);
                let op = op.to_tokens();
                quote! { (#lhs #op #rhs) }
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = lhs.wide_tokens(sim);
                let rhs = rhs.wide_tokens(sim);
                let op = op.to_tokens();
                quote! { (#lhs #op #rhs) }
            }
            Expr::Ternary(cond, then, otherwise) => {
                let cond = cond.wide_condition_tokens(sim);
                let then = then.wide_tokens(sim);
                let otherwise = otherwise.wide_tokens(sim);
                quote! { (if #cond { #then } else { #otherwise }) }
            }
            Expr::Assign(..) => self.to_tokens(sim),
        }
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>, parent: u8) -> fmt::Result {
        match self {
            Expr::Binary(op, lhs, rhs) => {
                let prec = op.precedence();
                let wrap = prec <= parent;
                if wrap {
                    f.write_str("(")?;
                }
                lhs.fmt_nested(f, prec - 1)?;
                write!(f, " {} ", op.symbol())?;
                rhs.fmt_nested(f, prec)?;
                if wrap {
                    f.write_str(")")?;
                }
                Ok(())
            }
            Expr::Ternary(..) | Expr::Assign(..) if parent > 0 => write!(f, "({})", self),
            _ => write!(f, "{}", self),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Lit(scalar) => write!(f, "{}", scalar),
            Expr::Ident(name) => f.write_str(name),
            Expr::Unary(op, operand) => {
                let symbol = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Plus => "+",
                    UnaryOp::Not => "!",
                    UnaryOp::BitNot => "~",
                };
                f.write_str(symbol)?;
                operand.fmt_nested(f, u8::MAX)
            }
            Expr::Binary(..) => self.fmt_nested(f, 0),
            Expr::Ternary(cond, then, otherwise) => {
                cond.fmt_nested(f, 1)?;
                f.write_str(" ? ")?;
                then.fmt_nested(f, 1)?;
                f.write_str(" : ")?;
                otherwise.fmt_nested(f, 1)
            }
            Expr::Assign(op, target, value) => {
                write!(f, "{} {} ", target, op.symbol())?;
                value.fmt_nested(f, 0)
            }
            Expr::Index(base, index) => {
                base.fmt_nested(f, u8::MAX)?;
                write!(f, "[{}]", index)
            }
            Expr::Call(callee, args) => {
                callee.fmt_nested(f, u8::MAX)?;
                f.write_str("(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expr::Member(base, name) => {
                base.fmt_nested(f, u8::MAX)?;
                write!(f, ".{}", name)
            }
        }
    }
}

fn scalar_tokens(scalar: Scalar) -> TokenStream {
    if scalar.signed && scalar.value < 0 {
        let magnitude = proc_macro2::Literal::u64_unsuffixed(scalar.value.unsigned_abs());
        quote! { (-#magnitude) }
    } else {
        let literal = proc_macro2::Literal::u64_unsuffixed(scalar.value as u64);
        quote! { #literal }
    }
}

fn wide_scalar_tokens(scalar: Scalar) -> TokenStream {
    match scalar.value {
        value if value >= 0 => {
            let literal = proc_macro2::Literal::i64_suffixed(value);
            quote! { #literal }
        }
        value if scalar.signed && value != i64::MIN => {
            let magnitude = proc_macro2::Literal::i64_suffixed(-value);
            quote! { (-#magnitude) }
        }
        value => {
            let bits = proc_macro2::Literal::u64_suffixed(value as u64);
            quote! { (#bits as i64) }
        }
    }
}

const RUST_KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "dyn", "else", "enum", "extern", "false",
    "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move", "mut", "pub", "ref",
    "return", "static", "struct", "trait", "true", "type", "unsafe", "use", "where", "while",
    "yield", "box", "do", "final", "macro", "override", "priv", "typeof", "unsized", "virtual",
    "abstract", "become", "try",
];

/// Turns a description-language name into a Rust identifier, escaping keywords.
pub(crate) fn rust_ident(name: &str) -> syn::Ident {
    if RUST_KEYWORDS.contains(&name) {
        syn::Ident::new_raw(name, Span::call_site())
    } else {
        syn::Ident::new(name, Span::call_site())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Int(u64),
    Ident(String),
    Punct(&'static str),
}

const PUNCTS: &[&str] = &[
    "<<=", ">>=", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "+=", "-=", "*=", "/=", "%=",
    "&=", "|=", "^=", "+", "-", "*", "/", "%", "<", ">", "=", "!", "~", "&", "|", "^", "?", ":",
    "(", ")", "[", "]", ",", ".", ";",
];

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = source.as_bytes();
    let error = |offset: usize, message: &str| ExprError {
        source_text: source.to_string(),
        offset,
        message: message.to_string(),
    };
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
        } else if c.is_ascii_digit() {
            let start = pos;
            while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                pos += 1;
            }
            let text = source[start..pos].replace('_', "");
            let text = text.trim_end_matches(['u', 'U', 'l', 'L']);
            let parsed = if let Some(hex) = text.strip_prefix("0x").or(text.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16)
            } else if let Some(bin) = text.strip_prefix("0b").or(text.strip_prefix("0B")) {
                u64::from_str_radix(bin, 2)
            } else if let Some(oct) = text.strip_prefix("0o") {
                u64::from_str_radix(oct, 8)
            } else if text.len() > 1 && text.starts_with('0') {
                u64::from_str_radix(&text[1..], 8)
            } else {
                text.parse::<u64>()
            };
            let value = parsed.map_err(|_| error(start, "malformed integer literal"))?;
            tokens.push((start, Token::Int(value)));
        } else if c.is_ascii_alphabetic() || c == b'_' {
            let start = pos;
            while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                pos += 1;
            }
            tokens.push((start, Token::Ident(source[start..pos].to_string())));
        } else {
            let punct = PUNCTS
                .iter()
                .find(|p| source[pos..].starts_with(**p))
                .ok_or_else(|| error(pos, "unexpected character"))?;
            tokens.push((pos, Token::Punct(punct)));
            pos += punct.len();
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Result<Self, ExprError> {
        Ok(Self {
            source,
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    fn error(&self, message: &str) -> ExprError {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.source.len());
        ExprError {
            source_text: self.source.to_string(),
            offset,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn peek_punct(&self) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Punct(p)) => Some(p),
            _ => None,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat(&mut self, punct: &str) -> bool {
        if self.peek_punct() == Some(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> Result<(), ExprError> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(self.error(&format!("expected `{}`", punct)))
        }
    }

    fn expect_end(&mut self) -> Result<(), ExprError> {
        self.eat(";");
        if self.at_end() {
            Ok(())
        } else {
            Err(self.error("unexpected trailing input"))
        }
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        let target = self.ternary()?;
        if let Some(op) = self.peek_punct().and_then(AssignOp::from_symbol) {
            self.pos += 1;
            let value = self.expression()?;
            return Ok(Expr::Assign(op, Box::new(target), Box::new(value)));
        }
        Ok(target)
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        let cond = self.binary(1)?;
        if !self.eat("?") {
            return Ok(cond);
        }
        let then = self.expression()?;
        self.expect(":")?;
        let otherwise = self.ternary()?;
        Ok(Expr::Ternary(
            Box::new(cond),
            Box::new(then),
            Box::new(otherwise),
        ))
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.peek_punct().and_then(BinaryOp::from_symbol) {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(prec + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.peek_punct() {
            Some("-") => UnaryOp::Neg,
            Some("+") => UnaryOp::Plus,
            Some("!") => UnaryOp::Not,
            Some("~") => UnaryOp::BitNot,
            _ => return self.postfix(),
        };
        self.pos += 1;
        Ok(Expr::Unary(op, Box::new(self.unary()?)))
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat("[") {
                let index = self.expression()?;
                self.expect("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat("(") {
                let mut args = Vec::new();
                if !self.eat(")") {
                    loop {
                        args.push(self.expression()?);
                        if self.eat(")") {
                            break;
                        }
                        self.expect(",")?;
                    }
                }
                expr = Expr::Call(Box::new(expr), args);
            } else if self.eat(".") {
                match self.peek().cloned() {
                    Some(Token::Ident(name)) => {
                        self.pos += 1;
                        expr = Expr::Member(Box::new(expr), name);
                    }
                    _ => return Err(self.error("expected member name")),
                }
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.peek().cloned() {
            Some(Token::Int(value)) => {
                self.pos += 1;
                Ok(Expr::Lit(Scalar::unsigned(value)))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(Expr::Ident(name))
            }
            Some(Token::Punct("(")) => {
                self.pos += 1;
                let inner = self.expression()?;
                self.expect(")")?;
                Ok(inner)
            }
            _ => Err(self.error("expected an expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, Scalar)]) -> HashMap<String, Scalar> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    impl Bindings for HashMap<String, Scalar> {
        fn lookup(&self, name: &str) -> Option<Scalar> {
            self.get(name).copied()
        }
    }

    fn sim() -> syn::Ident {
        syn::Ident::new("sim", Span::call_site())
    }

    #[test]
    fn precedence_follows_c() {
        let expr = Expr::parse("1 + 2 * 3 << 1").unwrap();
        assert_eq!(expr.evaluate(&env(&[])), Some(14));
        let expr = Expr::parse("1 | 2 ^ 3 & 1").unwrap();
        assert_eq!(expr.evaluate(&env(&[])), Some(1 | (2 ^ (3 & 1))));
        let expr = Expr::parse("a == 1 && b < 2 || 0").unwrap();
        let bound = env(&[("a", Scalar::unsigned(1)), ("b", Scalar::unsigned(1))]);
        assert_eq!(expr.evaluate(&bound), Some(1));
    }

    #[test]
    fn evaluates_branch_target() {
        let expr = Expr::parse("ac_pc + (imm << 2) + 4").unwrap();
        let bound = env(&[
            (PC_VARIABLE, Scalar::unsigned(0x100)),
            ("imm", Scalar::signed(-3)),
        ]);
        assert_eq!(expr.evaluate(&bound), Some(0x100 - 12 + 4));
    }

    #[test]
    fn literals_in_several_bases() {
        for (src, value) in [("0x1F", 31), ("0b101", 5), ("017", 15), ("0o17", 15), ("42u", 42)] {
            assert_eq!(Expr::parse(src).unwrap().evaluate(&env(&[])), Some(value));
        }
    }

    #[test]
    fn runtime_state_is_unresolved() {
        let bound = env(&[("rs", Scalar::unsigned(4))]);
        for src in ["RB[rs]", "rs + unknown", "read(rs)", "regs.pc", "x = 1", "rs / 0", "rs << 99"] {
            assert_eq!(Expr::parse(src).unwrap().evaluate(&bound), None, "{src}");
        }
    }

    #[test]
    fn short_circuit_ignores_unresolved_side() {
        let expr = Expr::parse("0 && RB[1]").unwrap();
        assert_eq!(expr.evaluate(&env(&[])), Some(0));
        let expr = Expr::parse("1 ? 8 : RB[2]").unwrap();
        assert_eq!(expr.evaluate(&env(&[])), Some(8));
    }

    #[test]
    fn substitution_is_token_based() {
        let expr = Expr::parse("imm + imm_hi + regs.imm").unwrap();
        let bound = env(&[("imm", Scalar::signed(-8))]);
        assert_eq!(expr.substitute(&bound).to_string(), "-8 + imm_hi + regs.imm");
    }

    #[test]
    fn substitution_respects_signedness() {
        let expr = Expr::parse("a + b").unwrap();
        let bound = env(&[
            ("a", Scalar::signed(-1)),
            ("b", Scalar::unsigned(u32::MAX as u64)),
        ]);
        assert_eq!(expr.substitute(&bound).to_string(), "-1 + 4294967295");
    }

    #[test]
    fn display_keeps_needed_parentheses() {
        let expr = Expr::parse("(a + b) * c - (d - e)").unwrap();
        assert_eq!(expr.to_string(), "(a + b) * c - (d - e)");
        let expr = Expr::parse("RB[rt] == 0 ? x : -y").unwrap();
        assert_eq!(expr.to_string(), "RB[rt] == 0 ? x : -y");
    }

    #[test]
    fn statement_lists() {
        let stmts = Expr::parse_statements("RB[31] = ac_pc + 8; npc += 4;").unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[0], Expr::Assign(AssignOp::Assign, ..)));
        assert!(matches!(
            stmts[1],
            Expr::Assign(AssignOp::Compound(BinaryOp::Add), ..)
        ));
        assert!(Expr::parse_statements("").unwrap().is_empty());
    }

    #[test]
    fn parse_errors_report_offset() {
        let err = Expr::parse("a + ").unwrap_err();
        assert_eq!(err.offset, 4);
        let err = Expr::parse("a $ b").unwrap_err();
        assert_eq!(err.offset, 2);
        assert!(Expr::parse("(a + b").is_err());
        assert!(Expr::parse("a b").is_err());
    }

    #[test]
    fn renders_valid_rust() {
        let expr = Expr::parse("RB[rs] != RB[rt] && !flag ? ac_pc + imm : regs.read(type)")
            .unwrap()
            .substitute(&env(&[
                ("rs", Scalar::unsigned(3)),
                ("rt", Scalar::unsigned(4)),
                ("imm", Scalar::signed(-16)),
                (PC_VARIABLE, Scalar::unsigned(0x40)),
            ]));
        let tokens = expr.to_tokens(&sim());
        let parsed: syn::Expr = syn::parse2(tokens).expect("rendered expression parses");
        let text = quote!(#parsed).to_string();
        assert!(text.contains("sim . RB"));
        assert!(text.contains("r#type"));

        let cond = Expr::parse("RB[rs]").unwrap().condition_tokens(&sim());
        assert!(cond.to_string().contains("!= 0"));
    }

    #[test]
    fn wide_rendering_is_typed_as_i64() {
        let sim = sim();
        let expr = Expr::parse("RB[rs] + (imm << 2)").unwrap().substitute(&env(&[
            ("rs", Scalar::unsigned(3)),
            ("imm", Scalar::signed(-1)),
        ]));
        assert_eq!(
            expr.wide_tokens(&sim).to_string(),
            quote!(((sim.RB[(3) as usize] as i64) + ((-1i64) << 2i64))).to_string()
        );

        let jump = Expr::parse("(ac_pc & 0xF0000000) | (addr << 2)").unwrap();
        let text = jump.wide_tokens(&sim).to_string();
        assert!(text.contains("4026531840i64"));
        assert!(text.contains("(sim . ac_pc as i64)"));
        syn::parse2::<syn::Expr>(jump.wide_tokens(&sim)).unwrap();

        let cond = Expr::parse("RB[rs] == RB[rt]").unwrap().wide_condition_tokens(&sim);
        assert!(!cond.to_string().contains("!= 0i64"));
        let cond = Expr::parse("RB[1]").unwrap().wide_condition_tokens(&sim);
        assert!(cond.to_string().contains("!= 0i64"));

        let big = Expr::Lit(Scalar::unsigned(u64::MAX)).wide_tokens(&sim);
        assert_eq!(big.to_string(), quote!((18446744073709551615u64 as i64)).to_string());
    }
}
