//! Best-effort repair of truncated JSON.
//!
//! Generators frequently stop mid-document. [`repair`] closes what was left
//! open so a strict parser gets another chance:
//!
//! 1. an unterminated string gets its closing quote,
//! 2. unmatched `{` / `[` get their closers in nesting order,
//! 3. commas left dangling before a closer or at the end are dropped.
//!
//! Repair never rewrites anything a strict parser would already accept, and
//! applying it twice gives the same text as applying it once.

/// Repair a candidate JSON span. See the module docs for the rules.
pub fn repair(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut open: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' | '[' => {
                open.push(c);
                out.push(c);
            }
            '}' | ']' => {
                strip_trailing_comma(&mut out);
                if open.last() == Some(&opener_for(c)) {
                    open.pop();
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    if in_string {
        // A lone trailing backslash would escape the quote we add.
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    while let Some(c) = open.pop() {
        strip_trailing_comma(&mut out);
        out.push(closer_for(c));
    }

    strip_trailing_comma(&mut out);
    out
}

fn opener_for(closer: char) -> char {
    if closer == '}' { '{' } else { '[' }
}

fn closer_for(opener: char) -> char {
    if opener == '{' { '}' } else { ']' }
}

/// Remove commas that are followed only by whitespace at the end of `out`.
/// Whitespace is kept so valid input stays byte-identical.
fn strip_trailing_comma(out: &mut String) {
    loop {
        let trimmed_len = out.trim_end().len();
        if !out[..trimmed_len].ends_with(',') {
            return;
        }
        out.remove(trimmed_len - 1);
    }
}
