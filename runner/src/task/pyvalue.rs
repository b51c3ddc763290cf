use std::{fmt, iter::Peekable, str::Chars};

/// The literals a task configuration is made of
#[derive(Debug, Clone, PartialEq)]
pub enum PyValue {
    Str(String),
    Bool(bool),
    Int(i64),
    List(Vec<PyValue>),
}

impl From<&str> for PyValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<&String> for PyValue {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl fmt::Display for PyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(value) => {
                f.write_str("'")?;
                for c in value.chars() {
                    match c {
                        '\\' => f.write_str("\\\\")?,
                        '\'' => f.write_str("\\'")?,
                        '\n' => f.write_str("\\n")?,
                        c => write!(f, "{c}")?,
                    }
                }
                f.write_str("'")
            }
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(value) => write!(f, "{value}"),
            Self::List(values) => {
                f.write_str("[")?;
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl PyValue {
    /// Parse a single literal, the whole input has to be consumed
    pub fn parse(input: &str) -> Result<Self, String> {
        let mut chars = input.chars().peekable();
        let value = parse_value(&mut chars)?;

        skip_whitespace(&mut chars);
        match chars.next() {
            None => Ok(value),
            Some(c) => Err(format!("unexpected trailing character {c:?}")),
        }
    }
}

fn skip_whitespace(chars: &mut Peekable<Chars>) {
    while chars.next_if(|c| c.is_whitespace()).is_some() {}
}

fn parse_value(chars: &mut Peekable<Chars>) -> Result<PyValue, String> {
    skip_whitespace(chars);

    match chars.peek().copied() {
        Some(quote @ ('\'' | '"')) => {
            chars.next();
            parse_string(chars, quote).map(PyValue::Str)
        }
        Some('[') => {
            chars.next();
            parse_list(chars).map(PyValue::List)
        }
        Some(c) if c == '-' || c.is_ascii_digit() => {
            let mut literal = String::new();
            while let Some(c) = chars.next_if(|c| *c == '-' || c.is_ascii_digit()) {
                literal.push(c);
            }
            literal
                .parse()
                .map(PyValue::Int)
                .map_err(|e| format!("invalid integer {literal:?}: {e}"))
        }
        Some(c) if c.is_ascii_alphabetic() => {
            let mut word = String::new();
            while let Some(c) = chars.next_if(|c| c.is_ascii_alphanumeric() || *c == '_') {
                word.push(c);
            }
            match word.as_str() {
                "True" => Ok(PyValue::Bool(true)),
                "False" => Ok(PyValue::Bool(false)),
                _ => Err(format!("unsupported expression {word:?}")),
            }
        }
        Some(c) => Err(format!("unexpected character {c:?}")),
        None => Err("missing value".to_owned()),
    }
}

fn parse_string(chars: &mut Peekable<Chars>, quote: char) -> Result<String, String> {
    let mut value = String::new();

    loop {
        match chars.next() {
            None => return Err("unterminated string".to_owned()),
            Some(c) if c == quote => return Ok(value),
            Some('\\') => match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(c @ ('\\' | '\'' | '"')) => value.push(c),
                Some(c) => {
                    value.push('\\');
                    value.push(c);
                }
                None => return Err("unterminated string".to_owned()),
            },
            Some(c) => value.push(c),
        }
    }
}

fn parse_list(chars: &mut Peekable<Chars>) -> Result<Vec<PyValue>, String> {
    let mut values = Vec::new();

    loop {
        skip_whitespace(chars);
        if chars.next_if_eq(&']').is_some() {
            return Ok(values);
        }

        values.push(parse_value(chars)?);

        skip_whitespace(chars);
        match chars.next() {
            Some(',') => continue,
            Some(']') => return Ok(values),
            Some(c) => return Err(format!("expected ',' or ']' in list, found {c:?}")),
            None => return Err("unterminated list".to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_python_literals() {
        assert_eq!(PyValue::from("it's").to_string(), r"'it\'s'");
        assert_eq!(PyValue::Bool(true).to_string(), "True");
        assert_eq!(PyValue::Int(-3).to_string(), "-3");
        assert_eq!(
            PyValue::List(vec![PyValue::from("era=25ns"), PyValue::from("process=RECO")]).to_string(),
            "['era=25ns', 'process=RECO']"
        );
        assert_eq!(PyValue::List(vec![]).to_string(), "[]");
    }

    #[test]
    fn parses_what_it_renders() {
        for value in [
            PyValue::from(r"back\slash and 'quotes'"),
            PyValue::Bool(false),
            PyValue::Int(250),
            PyValue::List(vec![PyValue::from("a"), PyValue::Int(1), PyValue::List(vec![])]),
        ] {
            assert_eq!(PyValue::parse(&value.to_string()), Ok(value));
        }
    }

    #[test]
    fn accepts_double_quotes_and_trailing_commas() {
        assert_eq!(
            PyValue::parse(r#"["output_mc.root", ]"#),
            Ok(PyValue::List(vec![PyValue::from("output_mc.root")]))
        );
    }

    #[test]
    fn rejects_expressions() {
        assert!(PyValue::parse("getUsernameFromSiteDB()").is_err());
        assert!(PyValue::parse("'unterminated").is_err());
        assert!(PyValue::parse("'a' + 'b'").is_err());
    }
}
