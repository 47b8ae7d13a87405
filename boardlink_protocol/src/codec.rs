// Delimiter-separated text codec for protocol messages.
//
// A message is one line of text: fields joined by `FIELD_SEPARATOR`. Field 0
// is the category, field 1 (when present) the subtype, the rest payload. The
// codec is pure string manipulation and knows nothing about the vocabulary;
// see `message.rs` for that.
//
// Every field is escaped on encode, so payload text may contain any of the
// reserved characters (including newlines, which would otherwise break the
// line framing). Two more separators nest structured data inside a single
// field: `LIST_SEPARATOR` between repeated entries and `PAIR_SEPARATOR`
// between key and value. Nesting works because each level escapes after
// joining and unescapes after splitting.

/// Separates top-level message fields.
pub const FIELD_SEPARATOR: char = ';';

/// Separates repeated entries inside one payload field.
pub const LIST_SEPARATOR: char = ',';

/// Separates key and value inside one list entry.
pub const PAIR_SEPARATOR: char = '=';

/// Escape prefix for reserved characters.
pub const ESCAPE: char = '\\';

/// Escape `text` so that it contains no unescaped reserved character and no
/// raw line break.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ESCAPE | FIELD_SEPARATOR | LIST_SEPARATOR | PAIR_SEPARATOR => {
                out.push(ESCAPE);
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Reverse of `escape`. A dangling escape at the end of input is kept as a
/// literal backslash.
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push(ESCAPE),
        }
    }
    out
}

/// Split `text` on every unescaped `separator` and unescape each piece.
fn split_escaped(text: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == separator {
            parts.push(unescape(&current));
            current.clear();
        } else {
            current.push(c);
        }
    }
    parts.push(unescape(&current));
    parts
}

fn join_escaped<I, S>(items: I, separator: char) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(separator);
        }
        out.push_str(&escape(item.as_ref()));
    }
    out
}

/// Join raw fields into one wire line (without the trailing newline).
pub fn encode<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    join_escaped(fields, FIELD_SEPARATOR)
}

/// Encode a message from its category, optional subtype and payload fields.
pub fn encode_message<S: AsRef<str>>(category: &str, subtype: Option<&str>, fields: &[S]) -> String {
    let head = std::iter::once(category).chain(subtype);
    encode(head.chain(fields.iter().map(|f| f.as_ref())))
}

/// Split a wire line into its unescaped fields.
pub fn split(message: &str) -> Vec<String> {
    split_escaped(message, FIELD_SEPARATOR)
}

/// Return field `index` of `message`, or `None` when the message is missing
/// or has too few fields.
pub fn decode_part(index: usize, message: Option<&str>) -> Option<String> {
    let message = message?;
    split(message).into_iter().nth(index)
}

/// Number of fields in `message`; zero for a missing message.
pub fn part_count(message: Option<&str>) -> usize {
    message.map_or(0, |m| split(m).len())
}

/// Encode an ordered list into a single payload field.
pub fn encode_list<I, S>(entries: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    join_escaped(entries, LIST_SEPARATOR)
}

/// Decode a list field. An empty field is an empty list.
pub fn decode_list(field: &str) -> Vec<String> {
    if field.is_empty() {
        return Vec::new();
    }
    split_escaped(field, LIST_SEPARATOR)
}

/// Encode key/value pairs into a single payload field.
pub fn encode_pairs<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    encode_list(pairs.into_iter().map(|(k, v)| join_escaped([k, v], PAIR_SEPARATOR)))
}

/// Decode a pairs field. Entries without a pair separator are returned with
/// an empty value.
pub fn decode_pairs(field: &str) -> Vec<(String, String)> {
    decode_list(field)
        .into_iter()
        .map(|entry| {
            let mut kv = split_escaped(&entry, PAIR_SEPARATOR).into_iter();
            let key = kv.next().unwrap_or_default();
            let value = kv.next().unwrap_or_default();
            (key, value)
        })
        .collect()
}
