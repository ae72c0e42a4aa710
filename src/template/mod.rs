#![forbid(unsafe_code)]

//! SQL template compilation.
//!
//! A raw SQL string is tokenized once into literal text, `:name.path`
//! parameters and `{name -> default}` template variables. Compiled templates
//! are immutable and shared through [`TemplateCache`].

/// Thread-safe memoization of compiled templates.
pub mod cache;

mod parser;

use std::fmt;

use smallvec::SmallVec;

pub use cache::{TemplateCache, TemplateCacheStats};
pub use parser::compile;

/// `:name` or `:name.path.to.property` placeholder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedParam {
    /// Base parameter name looked up in the binding context.
    pub name: String,
    /// Property path walked on the bound value; empty for plain parameters.
    pub path: SmallVec<[String; 2]>,
}

impl NamedParam {
    /// Dotted property path, empty when the parameter has none.
    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }
}

/// `{name}` or `{name -> default}` placeholder substituted with raw SQL text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateVar {
    /// Variable name.
    pub name: String,
    /// Fragment used when the caller supplies nothing.
    pub default: Option<String>,
    /// Source text including the braces.
    pub source: String,
}

/// One element of a compiled template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    /// Literal SQL text copied to the output unchanged.
    Literal(String),
    /// A `\:`, `\{` or `\}` escape; renders as the bare character.
    Escaped(char),
    /// Named parameter.
    NamedParam(NamedParam),
    /// Template variable.
    TemplateVar(TemplateVar),
}

impl Token {
    /// Writes the token exactly as it appeared in the template source.
    pub fn write_source(&self, out: &mut String) {
        match self {
            Token::Literal(text) => out.push_str(text),
            Token::Escaped(ch) => {
                out.push('\\');
                out.push(*ch);
            }
            Token::NamedParam(param) => {
                out.push(':');
                out.push_str(&param.name);
                for segment in &param.path {
                    out.push('.');
                    out.push_str(segment);
                }
            }
            Token::TemplateVar(var) => out.push_str(&var.source),
        }
    }
}

/// Immutable token sequence for one raw SQL string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledTemplate {
    source: String,
    tokens: Vec<Token>,
}

impl CompiledTemplate {
    pub(crate) fn new(source: String, tokens: Vec<Token>) -> Self {
        Self { source, tokens }
    }

    /// Raw SQL this template was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Ordered tokens.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Re-serializes the tokens; always equal to [`Self::source`].
    pub fn to_source(&self) -> String {
        let mut out = String::with_capacity(self.source.len());
        for token in &self.tokens {
            token.write_source(&mut out);
        }
        out
    }

    /// True when at least one `{var}` must be substituted before binding.
    pub fn has_template_vars(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| matches!(t, Token::TemplateVar(_)))
    }

    /// Named parameters in declaration order (duplicates kept).
    pub fn named_params(&self) -> impl Iterator<Item = &NamedParam> {
        self.tokens.iter().filter_map(|t| match t {
            Token::NamedParam(p) => Some(p),
            _ => None,
        })
    }

    /// Template variables in declaration order.
    pub fn template_vars(&self) -> impl Iterator<Item = &TemplateVar> {
        self.tokens.iter().filter_map(|t| match t {
            Token::TemplateVar(v) => Some(v),
            _ => None,
        })
    }
}

impl fmt::Display for CompiledTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, token) in self.tokens.iter().enumerate() {
            match token {
                Token::Literal(text) => writeln!(f, "{idx:>3} literal  {text:?}")?,
                Token::Escaped(ch) => writeln!(f, "{idx:>3} escaped  {ch:?}")?,
                Token::NamedParam(p) if p.path.is_empty() => {
                    writeln!(f, "{idx:>3} param    {}", p.name)?
                }
                Token::NamedParam(p) => {
                    writeln!(f, "{idx:>3} param    {} -> {}", p.name, p.dotted_path())?
                }
                Token::TemplateVar(v) => match &v.default {
                    Some(default) => {
                        writeln!(f, "{idx:>3} define   {} (default {default:?})", v.name)?
                    }
                    None => writeln!(f, "{idx:>3} define   {}", v.name)?,
                },
            }
        }
        Ok(())
    }
}
