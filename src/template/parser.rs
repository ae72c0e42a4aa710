use smallvec::SmallVec;
use tracing::trace;

use super::{CompiledTemplate, NamedParam, TemplateVar, Token};
use crate::error::{DaoError, Result};

/// Tokenizes a raw SQL template in a single left-to-right pass.
///
/// Text inside quoted strings, quoted identifiers and comments is literal, as
/// is a `::` cast. Everything else follows the placeholder grammar:
/// `:ident(.segment)*`, `{ident}`, `{ident -> default fragment}` and the
/// escapes `\:`, `\{`, `\}`. A bare `?` outside quotes and comments is
/// rejected, since only named parameters produce positional values.
pub fn compile(raw: &str) -> Result<CompiledTemplate> {
    let tokens = Parser::new(raw).run()?;
    trace!(len = raw.len(), tokens = tokens.len(), "template compiled");
    Ok(CompiledTemplate::new(raw.to_owned(), tokens))
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    literal_start: usize,
    tokens: Vec<Token>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            literal_start: 0,
            tokens: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>> {
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            match b {
                b'\'' | b'"' | b'`' => self.skip_quoted(b)?,
                b'-' if self.peek(1) == Some(b'-') => self.skip_line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment()?,
                b'\\' if matches!(self.peek(1), Some(b':' | b'{' | b'}')) => {
                    self.flush_literal();
                    self.tokens.push(Token::Escaped(self.bytes[self.pos + 1] as char));
                    self.pos += 2;
                    self.literal_start = self.pos;
                }
                b':' if self.peek(1) == Some(b':') => self.pos += 2,
                b':' => {
                    self.flush_literal();
                    let param = self.named_param()?;
                    self.tokens.push(Token::NamedParam(param));
                    self.literal_start = self.pos;
                }
                b'{' => {
                    self.flush_literal();
                    let var = self.template_var()?;
                    self.tokens.push(Token::TemplateVar(var));
                    self.literal_start = self.pos;
                }
                b'}' => return Err(DaoError::syntax(self.pos, "unbalanced '}'")),
                // Every mark in the bound SQL must own a positional value.
                b'?' => {
                    return Err(DaoError::syntax(
                        self.pos,
                        "positional '?' is not allowed; bind a :name parameter instead",
                    ))
                }
                _ => self.pos += 1,
            }
        }
        self.flush_literal();
        Ok(self.tokens)
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn flush_literal(&mut self) {
        if self.literal_start < self.pos {
            self.tokens
                .push(Token::Literal(self.src[self.literal_start..self.pos].to_owned()));
        }
        self.literal_start = self.pos;
    }

    fn skip_quoted(&mut self, quote: u8) -> Result<()> {
        let start = self.pos;
        self.pos += 1;
        while self.pos < self.bytes.len() {
            if self.bytes[self.pos] == quote {
                self.pos += 1;
                return Ok(());
            }
            self.pos += 1;
        }
        Err(DaoError::syntax(
            start,
            format!("unterminated quoted text starting with {}", quote as char),
        ))
    }

    fn skip_line_comment(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) -> Result<()> {
        let start = self.pos;
        self.pos += 2;
        while self.pos + 1 < self.bytes.len() {
            if self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/' {
                self.pos += 2;
                return Ok(());
            }
            self.pos += 1;
        }
        Err(DaoError::syntax(start, "unterminated block comment"))
    }

    fn read_word(&mut self) -> &'a str {
        let src = self.src;
        let start = self.pos;
        while self.pos < self.bytes.len() && is_ident_continue(self.bytes[self.pos]) {
            self.pos += 1;
        }
        &src[start..self.pos]
    }

    fn named_param(&mut self) -> Result<NamedParam> {
        let colon = self.pos;
        self.pos += 1;
        if !self.peek(0).is_some_and(is_ident_start) {
            return Err(DaoError::syntax(colon, "expected parameter name after ':'"));
        }
        let name = self.read_word().to_owned();
        let mut path = SmallVec::new();
        while self.peek(0) == Some(b'.') {
            self.pos += 1;
            let segment = self.read_word();
            if segment.is_empty() {
                return Err(DaoError::syntax(
                    self.pos,
                    format!("empty property path segment in ':{name}'"),
                ));
            }
            path.push(segment.to_owned());
        }
        Ok(NamedParam { name, path })
    }

    fn template_var(&mut self) -> Result<TemplateVar> {
        let open = self.pos;
        self.pos += 1;
        let mut depth = 1usize;
        let mut arrow: Option<usize> = None;
        loop {
            let Some(b) = self.peek(0) else {
                return Err(DaoError::syntax(open, "unbalanced '{'"));
            };
            match b {
                b'\'' | b'"' | b'`' if arrow.is_some() => {
                    self.skip_quoted(b)?;
                    continue;
                }
                b'{' if arrow.is_none() => {
                    return Err(DaoError::syntax(
                        self.pos,
                        "nested '{' inside template variable; use '{name -> default}'",
                    ));
                }
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                b'-' if arrow.is_none() && self.peek(1) == Some(b'>') => {
                    arrow = Some(self.pos);
                    self.pos += 1;
                }
                _ => {}
            }
            self.pos += 1;
        }
        let close = self.pos;
        self.pos += 1;

        let (name, default) = match arrow {
            Some(at) => (
                self.src[open + 1..at].trim(),
                Some(self.src[at + 2..close].trim().to_owned()),
            ),
            None => (self.src[open + 1..close].trim(), None),
        };
        if !is_identifier(name) {
            return Err(DaoError::syntax(
                open + 1,
                format!("invalid template variable name '{name}'"),
            ));
        }
        Ok(TemplateVar {
            name: name.to_owned(),
            default,
            source: self.src[open..self.pos].to_owned(),
        })
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_identifier(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && is_ident_start(bytes[0])
        && bytes[1..].iter().all(|b| is_ident_continue(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(sql: &str) -> Vec<(String, String)> {
        compile(sql)
            .unwrap()
            .named_params()
            .map(|p| (p.name.clone(), p.dotted_path()))
            .collect()
    }

    #[test]
    fn splits_literals_and_params() {
        let tpl = compile("SELECT * FROM users WHERE id = :id AND org = :user.org.id").unwrap();
        assert_eq!(tpl.tokens().len(), 4);
        assert_eq!(
            params(tpl.source()),
            vec![("id".into(), "".into()), ("user".into(), "org.id".into())]
        );
        assert_eq!(tpl.to_source(), tpl.source());
    }

    #[test]
    fn template_vars_with_and_without_default() {
        let tpl = compile("SELECT * FROM {table} ORDER BY {order -> id DESC}").unwrap();
        let vars: Vec<_> = tpl.template_vars().collect();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].name, "table");
        assert_eq!(vars[0].default, None);
        assert_eq!(vars[1].name, "order");
        assert_eq!(vars[1].default.as_deref(), Some("id DESC"));
        assert_eq!(tpl.to_source(), tpl.source());
    }

    #[test]
    fn default_fragment_may_nest_braces() {
        let tpl = compile("SELECT {cols -> json_build_object('a', {inner})} FROM t").unwrap();
        let var = tpl.template_vars().next().unwrap();
        assert_eq!(var.default.as_deref(), Some("json_build_object('a', {inner})"));
    }

    #[test]
    fn quoted_text_casts_and_comments_are_literal() {
        let sql = "SELECT '12:30', \"a.b\", x::int -- :skip\nFROM t /* {no} */ WHERE y = :y";
        let tpl = compile(sql).unwrap();
        assert_eq!(params(sql), vec![("y".into(), "".into())]);
        assert!(!tpl.has_template_vars());
        assert_eq!(tpl.to_source(), sql);
    }

    #[test]
    fn escapes_round_trip() {
        let sql = r"SELECT '\:' , \:literal, \{x\}";
        let tpl = compile(sql).unwrap();
        assert!(tpl.tokens().contains(&Token::Escaped(':')));
        assert!(tpl.tokens().contains(&Token::Escaped('{')));
        assert_eq!(tpl.named_params().count(), 0);
        assert_eq!(tpl.to_source(), sql);
    }

    #[test]
    fn rejects_malformed_templates() {
        let cases = [
            ("WHERE a = : b", 10),
            ("WHERE a = :1", 10),
            ("WHERE a = :a..b", 13),
            ("WHERE a = :a.", 13),
            ("SELECT {table", 7),
            ("SELECT table}", 12),
            ("SELECT {outer {inner}}", 14),
            ("SELECT {}", 8),
            ("SELECT 'open", 7),
        ];
        for (sql, offset) in cases {
            match compile(sql) {
                Err(DaoError::TemplateSyntax { offset: found, .. }) => {
                    assert_eq!(found, offset, "offset for {sql:?}")
                }
                other => panic!("expected syntax error for {sql:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn bare_question_mark_is_rejected_outside_quotes() {
        match compile("SELECT * FROM t WHERE a = ? AND b = :b") {
            Err(DaoError::TemplateSyntax { offset, .. }) => assert_eq!(offset, 26),
            other => panic!("expected syntax error, got {other:?}"),
        }
        let sql = "SELECT '?' AS q -- why?\n/* ? */ FROM t WHERE b = :b";
        assert_eq!(compile(sql).unwrap().named_params().count(), 1);
    }

    #[test]
    fn quoted_braces_inside_default_fragment() {
        let tpl = compile("SELECT {sep -> '}'} AS s, {x -> \"a{\"} FROM t").unwrap();
        let defaults: Vec<_> = tpl
            .template_vars()
            .map(|v| v.default.clone().unwrap())
            .collect();
        assert_eq!(defaults, vec!["'}'".to_owned(), "\"a{\"".to_owned()]);
        assert_eq!(tpl.to_source(), tpl.source());
    }

    #[test]
    fn multibyte_literals_survive() {
        let sql = "SELECT 'é' AS naïve, :ü";
        assert!(compile(sql).is_err());
        let sql = "SELECT 'é' AS naïve WHERE x = :x";
        assert_eq!(compile(sql).unwrap().to_source(), sql);
    }
}
