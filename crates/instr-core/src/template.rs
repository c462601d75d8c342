//! Command template mini-language.
//!
//! Two pure functions cover both directions of the wire protocol:
//!
//! - [`render`] substitutes named slots into a command template. `{ch_id}` is
//!   the reserved channel-address slot and `{value}` the encoded value slot;
//!   a slot may carry one formatting mode: `{value:E}` (scientific),
//!   `{value:d}` (integer) or `{value:.3}` (fixed precision).
//! - [`extract`] pulls fields out of a response using a pattern with `{}`
//!   capture slots and `{_}` ignore slots around literal text, e.g. `{},{_}`
//!   keeps the first comma-separated field. Patterns are compiled to anchored
//!   regexes.
//!
//! Both functions are independent of any container state so drivers can be
//! unit-tested against them directly.

use regex::Regex;

use crate::error::{InstrError, Result};
use crate::value::Value;

/// Substitute `vars` into `template`.
///
/// Unknown slots, unclosed braces and malformed format specs are
/// configuration errors. `{{` and `}}` escape literal braces.
pub fn render(template: &str, vars: &[(&str, &Value)]) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 8);
    let mut rest = template;

    while !rest.is_empty() {
        match (rest.find('{'), rest.find('}')) {
            (Some(open), close) if close.map_or(true, |c| open < c) => {
                out.push_str(&rest[..open]);
                let after = &rest[open + 1..];
                if let Some(tail) = after.strip_prefix('{') {
                    out.push('{');
                    rest = tail;
                    continue;
                }
                let end = after.find('}').ok_or_else(|| {
                    InstrError::config(format!("unclosed '{{' in template {:?}", template))
                })?;
                out.push_str(&render_slot(template, &after[..end], vars)?);
                rest = &after[end + 1..];
            }
            (_, Some(close)) => {
                out.push_str(&rest[..close]);
                let after = &rest[close + 1..];
                if let Some(tail) = after.strip_prefix('}') {
                    out.push('}');
                    rest = tail;
                } else {
                    return Err(InstrError::config(format!(
                        "stray '}}' in template {:?}",
                        template
                    )));
                }
            }
            (_, None) => {
                out.push_str(rest);
                break;
            }
        }
    }
    Ok(out)
}

fn render_slot(template: &str, slot: &str, vars: &[(&str, &Value)]) -> Result<String> {
    let (name, spec) = match slot.split_once(':') {
        Some((name, spec)) => (name, Some(spec)),
        None => (slot, None),
    };
    let value = vars
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| *v)
        .ok_or_else(|| {
            InstrError::config(format!(
                "template {:?} references unknown slot '{{{}}}'",
                template, name
            ))
        })?;

    match spec {
        None => Ok(value.to_string()),
        Some("E") => {
            let f = value.as_f64().ok_or_else(|| {
                InstrError::config(format!("slot '{{{}:E}}' needs a numeric value", name))
            })?;
            Ok(format!("{:E}", f))
        }
        Some("d") => {
            let i = value.as_i64().ok_or_else(|| {
                InstrError::config(format!("slot '{{{}:d}}' needs an integral value", name))
            })?;
            Ok(format!("{}", i))
        }
        Some(fixed) if fixed.starts_with('.') => {
            let digits: usize = fixed[1..].parse().map_err(|_| {
                InstrError::config(format!("bad format spec '{{{}:{}}}'", name, fixed))
            })?;
            let f = value.as_f64().ok_or_else(|| {
                InstrError::config(format!("slot '{{{}:{}}}' needs a numeric value", name, fixed))
            })?;
            Ok(format!("{:.*}", digits, f))
        }
        Some(other) => Err(InstrError::config(format!(
            "unsupported format spec '{{{}:{}}}'",
            name, other
        ))),
    }
}

/// Match `text` against an extraction pattern.
///
/// Returns the captured `{}` fields in order, `None` when the text does not
/// match, or a configuration error for a malformed pattern.
pub fn extract(pattern: &str, text: &str) -> Result<Option<Vec<String>>> {
    let regex = Regex::new(&pattern_to_regex(pattern)?)
        .map_err(|e| InstrError::config(format!("bad extraction pattern {:?}: {}", pattern, e)))?;

    let Some(captures) = regex.captures(text) else {
        return Ok(None);
    };
    Ok(Some(
        captures
            .iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect(),
    ))
}

/// Translate an extraction pattern into an anchored regex, escaping every
/// literal character (the same marker strategy the response parsers of
/// message-based drivers use).
fn pattern_to_regex(pattern: &str) -> Result<String> {
    let mut regex = String::from("^");
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        regex.push_str(&regex::escape(&rest[..open]));
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            InstrError::config(format!("unclosed '{{' in extraction pattern {:?}", pattern))
        })?;
        match &after[..close] {
            "" => regex.push_str("(.*?)"),
            "_" => regex.push_str("(?:.*?)"),
            other => {
                return Err(InstrError::config(format!(
                    "extraction pattern {:?} only accepts '{{}}' and '{{_}}' slots, got '{{{}}}'",
                    pattern, other
                )))
            }
        }
        rest = &after[close + 1..];
    }
    regex.push_str(&regex::escape(rest));
    regex.push('$');
    Ok(regex)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_val(s: &str) -> Value {
        Value::Str(s.to_string())
    }

    #[test]
    fn renders_ch_id_and_value() {
        let id = str_val("1");
        let v = str_val("stp");
        let cmd = render("setm {ch_id} {value}", &[("ch_id", &id), ("value", &v)]).unwrap();
        assert_eq!(cmd, "setm 1 stp");
    }

    #[test]
    fn scientific_format() {
        let v = Value::Float(0.02);
        let cmd = render(":SOUR:LEV {value:E}", &[("value", &v)]).unwrap();
        assert_eq!(cmd, ":SOUR:LEV 2E-2");
    }

    #[test]
    fn fixed_and_integer_formats() {
        let f = Value::Float(1.23456);
        assert_eq!(render("{value:.2}", &[("value", &f)]).unwrap(), "1.23");
        let i = Value::Int(7);
        assert_eq!(render("SLOT {value:d}", &[("value", &i)]).unwrap(), "SLOT 7");
        assert!(render("{value:d}", &[("value", &Value::Float(1.5))]).is_err());
    }

    #[test]
    fn unknown_slot_is_a_config_error() {
        let v = str_val("x");
        let err = render("get {ch_id}", &[("value", &v)]).unwrap_err();
        assert!(err.to_string().contains("ch_id"));
    }

    #[test]
    fn unclosed_brace_is_rejected() {
        assert!(render("get {ch_id", &[]).is_err());
        assert!(extract("{", "x").is_err());
    }

    #[test]
    fn escaped_braces_pass_through() {
        assert_eq!(render("lit {{x}}", &[]).unwrap(), "lit {x}");
    }

    #[test]
    fn extract_first_field() {
        let fields = extract("{},{_}", "1.2,0").unwrap().unwrap();
        assert_eq!(fields, vec!["1.2".to_string()]);
    }

    #[test]
    fn extract_with_literal_prefix() {
        let fields = extract("NDCV{}", "NDCV+1.00000E+00").unwrap().unwrap();
        assert_eq!(fields, vec!["+1.00000E+00".to_string()]);
    }

    #[test]
    fn extract_non_matching_text() {
        assert_eq!(extract("NDCV{}", "NACI+1.0").unwrap(), None);
    }

    #[test]
    fn extract_escapes_regex_metacharacters() {
        let fields = extract("{}.{_}", "a.b").unwrap().unwrap();
        assert_eq!(fields, vec!["a".to_string()]);
        assert_eq!(extract("{}.{_}", "aXb").unwrap(), None);
    }
}
