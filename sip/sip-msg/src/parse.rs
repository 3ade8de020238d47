//! Small string-slicing helpers shared by the header and URI parsers.
//!
//! SIP header values may contain quoted strings and angle-bracket enclosed
//! URIs, both of which hide separator characters. All splitting here is
//! aware of those constructs.

/// Split `i` at every top-level occurrence of `sep`, ignoring separators
/// inside double quotes and angle brackets.
pub(crate) fn split_outside_quotes(i: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (idx, c) in i.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }

        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            c if c == sep && !in_quotes && depth == 0 => {
                parts.push(&i[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }

    parts.push(&i[start..]);
    parts
}

/// Find the first top-level occurrence of `sep` and split there
pub(crate) fn split_once_outside_quotes(i: &str, sep: char) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;

    for (idx, c) in i.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }

        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            c if c == sep && !in_quotes && depth == 0 => {
                return Some((&i[..idx], &i[idx + c.len_utf8()..]));
            }
            _ => {}
        }
    }

    None
}

/// Strip surrounding double quotes and resolve backslash escapes
pub(crate) fn unquote(i: &str) -> String {
    let i = i.trim();

    let Some(inner) = i.strip_prefix('"').and_then(|i| i.strip_suffix('"')) else {
        return i.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;

    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }

    out
}

/// Quote a string, escaping `"` and `\`
pub(crate) fn quote(i: &str) -> String {
    let mut out = String::with_capacity(i.len() + 2);
    out.push('"');

    for c in i.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }

    out.push('"');
    out
}
