//! Query-parameter access with validation.
//!
//! Validation messages are safe to return to the client verbatim.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidArgument(pub String);

pub struct Params<'a> {
    params: &'a HashMap<String, String>,
}

impl<'a> Params<'a> {
    pub fn new(params: &'a HashMap<String, String>) -> Self {
        Self { params }
    }

    /// A non-negative integer; `default` applies when the parameter is
    /// absent or empty.
    pub fn get_positive_int(&self, name: &str, default: Option<u32>) -> Result<u32, InvalidArgument> {
        let raw = match self.params.get(name).map(|v| v.trim()) {
            Some(v) if !v.is_empty() => v,
            _ => {
                return default.ok_or_else(|| {
                    InvalidArgument(format!("parameter '{name}' is required"))
                });
            }
        };
        let value: i64 = raw.parse().map_err(|_| {
            InvalidArgument(format!("invalid '{name}' parameter: expected an integer"))
        })?;
        u32::try_from(value).map_err(|_| {
            InvalidArgument(format!(
                "invalid '{name}' parameter: expected a positive integer or zero"
            ))
        })
    }

    pub fn get_bool(&self, name: &str, default: bool) -> Result<bool, InvalidArgument> {
        match self.params.get(name).map(String::as_str) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(_) => Err(InvalidArgument(format!(
                "invalid '{name}' parameter: expected either 'true' or 'false'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn positive_int() {
        let q = query(&[("a", "3"), ("b", "0"), ("c", "-1"), ("d", "x"), ("e", "")]);
        let p = Params::new(&q);
        assert_eq!(p.get_positive_int("a", None), Ok(3));
        assert_eq!(p.get_positive_int("b", Some(7)), Ok(0));
        assert_eq!(p.get_positive_int("e", Some(7)), Ok(7));
        assert_eq!(p.get_positive_int("missing", Some(2)), Ok(2));
        assert_eq!(
            p.get_positive_int("missing", None).unwrap_err().to_string(),
            "parameter 'missing' is required"
        );
        assert_eq!(
            p.get_positive_int("c", None).unwrap_err().to_string(),
            "invalid 'c' parameter: expected a positive integer or zero"
        );
        assert_eq!(
            p.get_positive_int("d", None).unwrap_err().to_string(),
            "invalid 'd' parameter: expected an integer"
        );
    }

    #[test]
    fn boolean() {
        let q = query(&[("t", "true"), ("f", "false"), ("x", "yes")]);
        let p = Params::new(&q);
        assert_eq!(p.get_bool("t", false), Ok(true));
        assert_eq!(p.get_bool("f", true), Ok(false));
        assert_eq!(p.get_bool("missing", true), Ok(true));
        assert_eq!(
            p.get_bool("x", false).unwrap_err().to_string(),
            "invalid 'x' parameter: expected either 'true' or 'false'"
        );
    }
}
