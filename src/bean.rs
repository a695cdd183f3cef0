//! Bean names
//!
//! A bean is addressed by `domain:key1=value1,key2=value2`. Parameter order is
//! kept as declared; the canonical string form is the match key used by
//! `bean`/`bean_regex` filters.

use std::fmt;
use std::str::FromStr;

use crate::error::ConnectionError;

/// An addressable management object exposed by a monitored target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bean {
    domain: String,
    parameters: Vec<(String, String)>,
    string_form: String,
}

impl Bean {
    /// Parse a bean name string
    ///
    /// Quoted values (`name="a,b=c"`) may contain `,`, `=` and `:`; the quotes
    /// are kept in the value, as JMX does.
    ///
    /// # Errors
    /// Returns `ConnectionError::InvalidBeanName` when the domain or a
    /// `key=value` pair is missing, or for pattern names (`*`).
    pub fn parse(s: &str) -> Result<Self, ConnectionError> {
        let invalid = || ConnectionError::InvalidBeanName(s.to_string());

        let (domain, props) = s.split_once(':').ok_or_else(invalid)?;
        if domain.is_empty() || props.is_empty() {
            return Err(invalid());
        }

        let mut parameters = Vec::new();
        for prop in split_unquoted(props, ',') {
            let (key, value) = split_once_unquoted(prop, '=').ok_or_else(invalid)?;
            let key = key.trim();
            if key.is_empty() || value.is_empty() || key.contains('*') {
                return Err(invalid());
            }
            parameters.push((key.to_string(), value.to_string()));
        }

        Ok(Self {
            domain: domain.to_string(),
            parameters,
            string_form: s.to_string(),
        })
    }

    /// Domain part (e.g. `java.lang`)
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Parameters in declaration order
    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    /// Look up one parameter value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Canonical string form
    pub fn string_form(&self) -> &str {
        &self.string_form
    }
}

impl fmt::Display for Bean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string_form)
    }
}

impl FromStr for Bean {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bean::parse(s)
    }
}

fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            c if c == sep && !quoted => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn split_once_unquoted(s: &str, sep: char) -> Option<(&str, &str)> {
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c == sep && !quoted => return Some((&s[..i], &s[i + c.len_utf8()..])),
            _ => {}
        }
    }
    None
}
