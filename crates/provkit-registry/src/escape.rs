use anyhow::{anyhow, Result};

const RESERVED: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|', '%'];

/// Maps a profile id to a filesystem-safe directory name. Reserved path
/// characters and ASCII controls become `%<decimal-codepoint>;`.
/// `unescape_profile_id` reverses this exactly.
pub fn escape_profile_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for ch in id.chars() {
        if RESERVED.contains(&ch) || ch.is_ascii_control() {
            out.push('%');
            out.push_str(&(ch as u32).to_string());
            out.push(';');
        } else {
            out.push(ch);
        }
    }
    out
}

pub fn unescape_profile_id(escaped: &str) -> Result<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();

    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }

        let mut digits = String::new();
        loop {
            match chars.next() {
                Some(';') => break,
                Some(digit) if digit.is_ascii_digit() => digits.push(digit),
                Some(other) => {
                    return Err(anyhow!(
                        "invalid escape sequence in profile directory name '{escaped}': unexpected '{other}'"
                    ));
                }
                None => {
                    return Err(anyhow!(
                        "unterminated escape sequence in profile directory name '{escaped}'"
                    ));
                }
            }
        }

        let codepoint: u32 = digits.parse().map_err(|_| {
            anyhow!("invalid escape codepoint in profile directory name '{escaped}'")
        })?;
        let ch = char::from_u32(codepoint).ok_or_else(|| {
            anyhow!("escape codepoint {codepoint} in '{escaped}' is not a character")
        })?;
        out.push(ch);
    }

    Ok(out)
}
