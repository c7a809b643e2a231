//! Numeric coercion shared by the LLM extractor and the verifier.
//!
//! CSR reports and model output spell numbers in many ways: `≈ 1,234`,
//! `about 32,400`, `1.2e3`, or small arithmetic like `1,200 + 300`.
//! `num_from_str` handles the first family, `safe_eval` the second.

use std::sync::OnceLock;

use regex::Regex;

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-+]?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?").unwrap())
}

/// Words and symbols that qualify a number without changing it.
const APPROX_MARKERS: &[&str] = &["approximately", "about", ">=", "<=", "≈", "~", ">", "<"];

/// Parse a free-form numeric string.
///
/// Strips approximation markers and thousand separators, then takes the
/// first signed decimal (scientific notation accepted). Returns `None`
/// when nothing numeric remains, or when the number is the left operand
/// of an arithmetic expression (`"1200+300"`), which belongs to
/// `safe_eval` instead.
pub fn num_from_str(s: &str) -> Option<f64> {
    let mut cleaned = s.trim().to_lowercase();
    for marker in APPROX_MARKERS {
        cleaned = cleaned.replace(marker, " ");
    }
    cleaned = cleaned.replace(',', "");

    let m = number_re().find(&cleaned)?;
    if is_expression_tail(&cleaned[m.end()..]) {
        return None;
    }
    let value: f64 = m.as_str().parse().ok()?;
    value.is_finite().then_some(value)
}

/// True when the text following a number continues an arithmetic
/// expression, e.g. `" + 300"` but not `"-tCO2e"` or `": 45,000"`.
fn is_expression_tail(rest: &str) -> bool {
    let rest = rest.trim_start();
    let Some(op) = rest.chars().next() else {
        return false;
    };
    if !"+-*/".contains(op) {
        return false;
    }
    rest[op.len_utf8()..]
        .trim_start()
        .starts_with(|c: char| c.is_ascii_digit() || c == '(')
}

/// Format a number for round-tripping through `num_from_str`.
///
/// Integral values print without a fraction; everything else keeps up to
/// six significant digits with the trailing zeros trimmed.
pub fn format_number(x: f64) -> String {
    if x == x.trunc() && x.abs() < 1e15 {
        return format!("{}", x as i64);
    }
    let formatted = format!("{:.*}", sig_decimals(x), x);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

fn sig_decimals(x: f64) -> usize {
    let magnitude = x.abs().log10().floor() as i64;
    // 6 significant digits total
    (5 - magnitude).max(0) as usize
}

/// Evaluate `+ - * /` arithmetic over literal numbers only.
///
/// Any character outside `[0-9+\-*/.() \t]` rejects the whole input.
/// No names, no attributes, no exponentiation. Returns `None` on any
/// parse failure or a non-finite result.
pub fn safe_eval(expr: &str) -> Option<f64> {
    if expr.is_empty()
        || !expr
            .chars()
            .all(|c| c.is_ascii_digit() || "+-*/.() \t".contains(c))
    {
        return None;
    }

    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return None;
    }
    value.is_finite().then_some(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = expr.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len() && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let num: f64 = expr[start..i].parse().ok()?;
                tokens.push(Token::Num(num));
            }
            _ => return None,
        }
    }
    Some(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.peek()?;
        self.pos += 1;
        Some(tok)
    }

    fn expr(&mut self) -> Option<f64> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.advance();
                    value += self.term()?;
                }
                Token::Minus => {
                    self.advance();
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn term(&mut self) -> Option<f64> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.advance();
                    value *= self.factor()?;
                }
                Token::Slash => {
                    self.advance();
                    value /= self.factor()?;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn factor(&mut self) -> Option<f64> {
        match self.advance()? {
            Token::Num(n) => Some(n),
            Token::Minus => Some(-self.factor()?),
            Token::Plus => self.factor(),
            Token::LParen => {
                let value = self.expr()?;
                match self.advance()? {
                    Token::RParen => Some(value),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_decorated_numbers() {
        assert_eq!(num_from_str("1234"), Some(1234.0));
        assert_eq!(num_from_str("≈ 1,234"), Some(1234.0));
        assert_eq!(num_from_str("about 32,400"), Some(32400.0));
        assert_eq!(num_from_str("approximately 12.5"), Some(12.5));
        assert_eq!(num_from_str(">= 90"), Some(90.0));
        assert_eq!(num_from_str("-3.2"), Some(-3.2));
        assert_eq!(num_from_str("1.2e3"), Some(1200.0));
        assert_eq!(num_from_str("2023: 45,000 tCO2e"), Some(2023.0));
    }

    #[test]
    fn defers_arithmetic_to_safe_eval() {
        assert_eq!(num_from_str("1200+300"), None);
        assert_eq!(num_from_str("1,200 + 300"), None);
        // a trailing sign without an operand is not arithmetic
        assert_eq!(num_from_str("32,400-tCO2e"), Some(32400.0));
    }

    #[test]
    fn rejects_non_numeric() {
        assert_eq!(num_from_str("–"), None);
        assert_eq!(num_from_str(""), None);
        assert_eq!(num_from_str("not reported"), None);
    }

    #[test]
    fn safe_eval_arithmetic() {
        assert_eq!(safe_eval("1200+300"), Some(1500.0));
        assert_eq!(safe_eval("2 * (3 + 4)"), Some(14.0));
        assert_eq!(safe_eval("10 / 4"), Some(2.5));
        assert_eq!(safe_eval("-5 + 2"), Some(-3.0));
    }

    #[test]
    fn safe_eval_rejects_disallowed_tokens() {
        // every char outside [0-9+\-*/.() \t] rejects the input
        assert_eq!(safe_eval("2 ** 3"), None); // ** parses as *, * with no operand
        assert_eq!(safe_eval("1e3"), None);
        assert_eq!(safe_eval("os.system"), None);
        assert_eq!(safe_eval("1 + x"), None);
        assert_eq!(safe_eval("__import__"), None);
        assert_eq!(safe_eval("1,200"), None);
        assert_eq!(safe_eval(""), None);
    }

    #[test]
    fn safe_eval_rejects_division_blowups() {
        assert_eq!(safe_eval("1/0"), None);
    }

    #[test]
    fn format_round_trips_at_six_significant_digits() {
        for &x in &[
            0.5_f64, 1.0, -1.0, 32400.0, 12500.0, 123456.0, -98765.0, 0.00125, 1.0e12, -1.0e12,
            3.14159,
        ] {
            let shown = format_number(x);
            let back = num_from_str(&shown).unwrap();
            let tolerance = (x.abs() * 1e-6).max(1e-12);
            assert!(
                (back - x).abs() <= tolerance,
                "{x} -> {shown} -> {back}"
            );
        }
    }
}
