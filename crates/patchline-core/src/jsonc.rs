//! Relaxed JSON ("JSONC") cleaning.
//!
//! OpenCode config files may carry `//` and `/* */` comments and trailing
//! commas. Cleaning turns such input into strict JSON in two passes:
//! comments are blanked first (newlines kept so line numbers in parse errors
//! still point at the original file), then commas followed only by whitespace
//! and a closing `}` or `]` are dropped.

/// Strip comments and trailing commas.
pub fn sanitize(input: &[u8]) -> Vec<u8> {
    remove_trailing_commas(&strip_comments(input))
}

/// Remove `//` and `/* */` comments outside of string literals.
pub fn strip_comments(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    let mut i = 0;
    while i < input.len() {
        let ch = input[i];

        if in_line_comment {
            if ch == b'\n' {
                in_line_comment = false;
                out.push(ch);
            }
            i += 1;
            continue;
        }

        if in_block_comment {
            if ch == b'\n' {
                out.push(ch);
            }
            if ch == b'*' && input.get(i + 1) == Some(&b'/') {
                in_block_comment = false;
                i += 1;
            }
            i += 1;
            continue;
        }

        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == b'\\' {
                escaped = true;
            } else if ch == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match (ch, input.get(i + 1)) {
            (b'"', _) => {
                in_string = true;
                out.push(ch);
            }
            (b'/', Some(b'/')) => {
                in_line_comment = true;
                i += 1;
            }
            (b'/', Some(b'*')) => {
                in_block_comment = true;
                i += 1;
            }
            _ => out.push(ch),
        }
        i += 1;
    }

    out
}

/// Drop commas that are followed only by whitespace and a closing bracket.
pub fn remove_trailing_commas(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in input.iter().enumerate() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == b'\\' {
                escaped = true;
            } else if ch == b'"' {
                in_string = false;
            }
            continue;
        }

        if ch == b'"' {
            in_string = true;
            out.push(ch);
            continue;
        }

        if ch == b',' {
            let next = input[i + 1..]
                .iter()
                .find(|b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'));
            if matches!(next, Some(b'}') | Some(b']')) {
                continue;
            }
        }

        out.push(ch);
    }

    out
}
