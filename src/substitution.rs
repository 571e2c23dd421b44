// File: src/substitution.rs
//
// Placeholder expansion for line text.
// A line may contain `{k}` placeholders; the VM delivers the values for
// them popped off the stack most-recent-first, so placeholder `{k}`
// resolves to the k-th value counted from the end of the list.

use crate::value::Value;

/// Expand `{k}` placeholders in `text` against the substitution list.
/// Braces that do not form a well-formed, in-range placeholder are kept
/// verbatim; line presentation never fails on malformed text.
pub fn expand(text: &str, substitutions: &[Value]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let closed = after.as_bytes().get(digits) == Some(&b'}');

        if digits > 0 && closed {
            if let Some(value) = after[..digits]
                .parse::<usize>()
                .ok()
                .filter(|k| *k < substitutions.len())
                .map(|k| &substitutions[substitutions.len() - 1 - k])
            {
                out.push_str(&value.to_string());
                rest = &after[digits + 1..];
                continue;
            }
        }

        out.push('{');
        rest = after;
    }

    out.push_str(rest);
    out
}
