//! The line-oriented command grammar spoken by the scripting surface.
//!
//! A command is a single line: the first whitespace-delimited token is the
//! operation, every following token is either `key=value` or a bare flag
//! (recorded as `key=true`). Values may be single- or double-quoted to carry
//! whitespace; a `=` inside quotes is literal.

use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
/// Parsed form of one command line.
pub struct Command {
    /// Operation token, exactly as written (dispatch lowercases for lookup).
    pub operation: String,

    /// Parameters in deterministic order. Bare flags carry the value "true".
    pub params: BTreeMap<String, String>,
}

impl Command {
    /// Fetch a parameter by name.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// A parameter that is present with the value "true" (a bare flag or an
    /// explicit `key=true`).
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true"))
    }
}

/// One raw token with the position of the first `=` seen outside quotes.
struct RawToken {
    text: String,
    eq: Option<usize>,
}

fn tokenize(line: &str) -> Vec<RawToken> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut eq: Option<usize> = None;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(RawToken {
                            text: std::mem::take(&mut current),
                            eq: eq.take(),
                        });
                    } else {
                        eq = None;
                    }
                }
                '=' => {
                    if eq.is_none() {
                        eq = Some(current.len());
                    }
                    current.push(c);
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(RawToken { text: current, eq });
    }
    tokens
}

/// Parse one command line. An empty or whitespace-only line yields an empty
/// operation, which dispatch rejects.
pub fn parse(line: &str) -> Command {
    let mut tokens = tokenize(line).into_iter();

    let operation = match tokens.next() {
        Some(token) => token.text,
        None => return Command::default(),
    };

    let mut params = BTreeMap::new();
    for token in tokens {
        match token.eq {
            Some(at) => {
                let key = token.text[..at].to_string();
                let value = token.text[at + 1..].to_string();
                if !key.is_empty() {
                    params.insert(key, value);
                }
            }
            None => {
                params.insert(token.text, "true".to_string());
            }
        }
    }

    Command { operation, params }
}

fn quote_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '=' || c == '\'' || c == '"');
    if !needs_quotes {
        return value.to_string();
    }
    if value.contains('"') {
        format!("'{}'", value)
    } else {
        format!("\"{}\"", value)
    }
}

/// Render a command back into a single line that parses to the same value.
pub fn unparse(command: &Command) -> String {
    let mut out = command.operation.clone();
    for (key, value) in &command.params {
        out.push(' ');
        out.push_str(key);
        out.push('=');
        out.push_str(&quote_value(value));
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Variable reference style recognized during interpolation.
pub enum DelimiterStyle {
    /// `{{name}}` (default).
    Mustache,
    /// `${name}`.
    Dollar,
    /// `%name%`.
    Percent,
}

impl Default for DelimiterStyle {
    fn default() -> Self {
        DelimiterStyle::Mustache
    }
}

impl DelimiterStyle {
    fn markers(self) -> (&'static str, &'static str) {
        match self {
            DelimiterStyle::Mustache => ("{{", "}}"),
            DelimiterStyle::Dollar => ("${", "}"),
            DelimiterStyle::Percent => ("%", "%"),
        }
    }
}

/// Expand variable references in `template` against the supplied pool.
///
/// Single pass, left to right. Undefined variables are left literal, and
/// substituted text is never re-scanned, so nested occurrences do not expand
/// recursively.
pub fn interpolate(
    template: &str,
    variables: &HashMap<String, String>,
    style: DelimiterStyle,
) -> String {
    let (open, close) = style.markers();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(open) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + open.len()..];
        match after_open.find(close) {
            Some(end) => {
                let name = &after_open[..end];
                match variables.get(name) {
                    Some(value) if is_identifier(name) => {
                        out.push_str(value);
                    }
                    _ => {
                        out.push_str(open);
                        out.push_str(name);
                        out.push_str(close);
                    }
                }
                rest = &after_open[end + close.len()..];
            }
            None => {
                out.push_str(open);
                rest = after_open;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Parse a memory size of the form `<int><unit?>` with units k/m/g/t
/// (case-insensitive) into bytes. Malformed input yields 0, which callers
/// treat as "unspecified".
pub fn parse_memory(input: &str) -> u64 {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return 0;
    }

    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return 0;
    }
    let rest = &trimmed[digits.len()..];

    let multiplier: u64 = match rest.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        "t" => 1024u64.pow(4),
        _ => return 0,
    };

    digits
        .parse::<u64>()
        .map(|n| n.saturating_mul(multiplier))
        .unwrap_or(0)
}

/// Render a byte count the way callers typed it, for error messages.
pub fn format_memory(bytes: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (1024u64 * 1024 * 1024 * 1024, "t"),
        (1024 * 1024 * 1024, "g"),
        (1024 * 1024, "m"),
        (1024, "k"),
    ];
    for (size, suffix) in UNITS {
        if bytes >= size && bytes % size == 0 {
            return format!("{}{}", bytes / size, suffix);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_basic() {
        let cmd = parse("create image=debian:stable name=web-1");
        assert_eq!(cmd.operation, "create");
        assert_eq!(cmd.get("image"), Some("debian:stable"));
        assert_eq!(cmd.get("name"), Some("web-1"));
    }

    #[test]
    fn parse_bare_flag() {
        let cmd = parse("remove name=web-1 force");
        assert!(cmd.flag("force"));
        assert!(!cmd.flag("missing"));
    }

    #[test]
    fn parse_quoted_values() {
        let cmd = parse(r#"exec name=web-1 command="echo hello world""#);
        assert_eq!(cmd.get("command"), Some("echo hello world"));

        let cmd = parse("exec name=web-1 command='ls -la /tmp'");
        assert_eq!(cmd.get("command"), Some("ls -la /tmp"));
    }

    #[test]
    fn parse_equals_inside_quotes() {
        let cmd = parse(r#"create env="A=1 B=2" name=x"#);
        assert_eq!(cmd.get("env"), Some("A=1 B=2"));
        assert_eq!(cmd.get("name"), Some("x"));
    }

    #[test]
    fn parse_empty_line() {
        assert_eq!(parse("").operation, "");
        assert_eq!(parse("   \t ").operation, "");
    }

    #[test]
    fn parse_value_with_embedded_quotes() {
        let cmd = parse(r#"execute_rexx script="SAY 'hi'""#);
        assert_eq!(cmd.get("script"), Some("SAY 'hi'"));
    }

    #[test]
    fn unparse_round_trip() {
        for line in [
            "create image=debian:stable name=web-1",
            r#"exec name=web-1 command="echo hello world""#,
            "remove name=web-1 force",
            r#"create env="A=1 B=2" name=x memory=2g"#,
            "start name=web-1 timeout=5000",
        ] {
            let first = parse(line);
            let second = parse(&unparse(&first));
            assert_eq!(first, second, "round trip failed for {:?}", line);
        }
    }

    #[test]
    fn interpolate_mustache() {
        let pool = vars(&[("name", "web-1"), ("image", "debian")]);
        assert_eq!(
            interpolate("create image={{image}} name={{name}}", &pool, DelimiterStyle::Mustache),
            "create image=debian name=web-1"
        );
    }

    #[test]
    fn interpolate_undefined_left_literal() {
        let pool = vars(&[("name", "web-1")]);
        assert_eq!(
            interpolate("start name={{name}} extra={{missing}}", &pool, DelimiterStyle::Mustache),
            "start name=web-1 extra={{missing}}"
        );
    }

    #[test]
    fn interpolate_no_recursive_expansion() {
        let pool = vars(&[("a", "{{b}}"), ("b", "evil")]);
        assert_eq!(
            interpolate("x={{a}}", &pool, DelimiterStyle::Mustache),
            "x={{b}}"
        );
    }

    #[test]
    fn interpolate_alternate_styles() {
        let pool = vars(&[("host", "10.0.0.2")]);
        assert_eq!(
            interpolate("connect host=${host}", &pool, DelimiterStyle::Dollar),
            "connect host=10.0.0.2"
        );
        assert_eq!(
            interpolate("connect host=%host%", &pool, DelimiterStyle::Percent),
            "connect host=10.0.0.2"
        );
    }

    #[test]
    fn interpolate_unterminated_reference() {
        let pool = vars(&[("a", "1")]);
        assert_eq!(
            interpolate("x={{a", &pool, DelimiterStyle::Mustache),
            "x={{a"
        );
    }

    #[test]
    fn memory_boundaries() {
        assert_eq!(parse_memory("0"), 0);
        assert_eq!(parse_memory("2g"), 1 << 31);
        assert_eq!(parse_memory("1024k"), 1 << 20);
        assert_eq!(parse_memory("abc"), 0);
        assert_eq!(parse_memory(""), 0);
        assert_eq!(parse_memory("512M"), 512 * 1024 * 1024);
        assert_eq!(parse_memory("1t"), 1024u64.pow(4));
        assert_eq!(parse_memory("3x"), 0);
    }

    #[test]
    fn memory_formatting() {
        assert_eq!(format_memory(1 << 31), "2g");
        assert_eq!(format_memory(1 << 20), "1m");
        assert_eq!(format_memory(1500), "1500");
    }
}
