use super::DomError;

/// A parsed selector group list, e.g. `video, div.reel [data-role="media"]`.
///
/// Supported syntax is the subset the page scripts rely on: type, `#id`,
/// `.class`, `[attr]`, `[attr="value"]`, `[attr^="prefix"]`, `[attr*="part"]`
/// compounds joined by the descendant combinator, and `,` groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    groups: Vec<Vec<Compound>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Compound {
    pub(crate) tag: Option<String>,
    pub(crate) id: Option<String>,
    pub(crate) classes: Vec<String>,
    pub(crate) attrs: Vec<AttrCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AttrCondition {
    pub(crate) name: String,
    pub(crate) op: AttrOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AttrOp {
    Exists,
    Equals(String),
    Prefix(String),
    Contains(String),
}

impl AttrCondition {
    pub(crate) fn matches(&self, value: Option<&str>) -> bool {
        match (&self.op, value) {
            (_, None) => false,
            (AttrOp::Exists, Some(_)) => true,
            (AttrOp::Equals(expected), Some(v)) => v == expected,
            (AttrOp::Prefix(prefix), Some(v)) => v.starts_with(prefix.as_str()),
            (AttrOp::Contains(part), Some(v)) => v.contains(part.as_str()),
        }
    }
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, DomError> {
        let mut groups = Vec::new();
        for group in split_groups(source)? {
            let mut chain = Vec::new();
            for part in group.split_whitespace() {
                chain.push(parse_compound(part, source)?);
            }
            if chain.is_empty() {
                return Err(DomError::UnsupportedSelector(source.to_string()));
            }
            groups.push(chain);
        }
        if groups.is_empty() {
            return Err(DomError::UnsupportedSelector(source.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            groups,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub(crate) fn groups(&self) -> &[Vec<Compound>] {
        &self.groups
    }
}

/// Splits on top-level commas, ignoring commas inside quoted attribute values.
fn split_groups(source: &str) -> Result<Vec<String>, DomError> {
    let mut groups = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;

    for c in source.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '[') => {
                depth += 1;
                current.push(c);
            }
            (None, ']') => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| DomError::UnsupportedSelector(source.to_string()))?;
                current.push(c);
            }
            (None, ',') if depth == 0 => {
                groups.push(current.trim().to_string());
                current.clear();
            }
            (None, c) => current.push(c),
        }
    }

    if quote.is_some() || depth != 0 {
        return Err(DomError::UnsupportedSelector(source.to_string()));
    }
    groups.push(current.trim().to_string());

    if groups.iter().any(|g| g.is_empty()) {
        return Err(DomError::UnsupportedSelector(source.to_string()));
    }
    Ok(groups)
}

fn parse_compound(part: &str, source: &str) -> Result<Compound, DomError> {
    let unsupported = || DomError::UnsupportedSelector(source.to_string());
    let bytes = part.as_bytes();
    let mut compound = Compound::default();
    let mut i = 0;

    let ident_end = |start: usize| {
        let mut end = start;
        while end < bytes.len() && is_ident_byte(bytes[end]) {
            end += 1;
        }
        end
    };

    if i < bytes.len() && bytes[i] == b'*' {
        i += 1;
    } else if i < bytes.len() && is_ident_byte(bytes[i]) {
        let end = ident_end(i);
        compound.tag = Some(part[i..end].to_ascii_lowercase());
        i = end;
    }

    while i < bytes.len() {
        match bytes[i] {
            b'#' => {
                let end = ident_end(i + 1);
                if end == i + 1 {
                    return Err(unsupported());
                }
                compound.id = Some(part[i + 1..end].to_string());
                i = end;
            }
            b'.' => {
                let end = ident_end(i + 1);
                if end == i + 1 {
                    return Err(unsupported());
                }
                compound.classes.push(part[i + 1..end].to_string());
                i = end;
            }
            b'[' => {
                let close = part[i..].find(']').map(|p| p + i).ok_or_else(unsupported)?;
                compound.attrs.push(parse_attr(&part[i + 1..close]).ok_or_else(unsupported)?);
                i = close + 1;
            }
            _ => return Err(unsupported()),
        }
    }

    Ok(compound)
}

fn parse_attr(inner: &str) -> Option<AttrCondition> {
    let inner = inner.trim();
    let (name, op) = if let Some(pos) = inner.find("^=") {
        (&inner[..pos], AttrOp::Prefix(unquote(&inner[pos + 2..])?))
    } else if let Some(pos) = inner.find("*=") {
        (&inner[..pos], AttrOp::Contains(unquote(&inner[pos + 2..])?))
    } else if let Some(pos) = inner.find('=') {
        (&inner[..pos], AttrOp::Equals(unquote(&inner[pos + 1..])?))
    } else {
        (inner, AttrOp::Exists)
    };

    let name = name.trim();
    if name.is_empty() || !name.bytes().all(is_ident_byte) {
        return None;
    }
    Some(AttrCondition {
        name: name.to_ascii_lowercase(),
        op,
    })
}

fn unquote(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let quoted = raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')));
    if quoted {
        Some(raw[1..raw.len() - 1].to_string())
    } else if !raw.is_empty() && raw.bytes().all(is_ident_byte) {
        Some(raw.to_string())
    } else {
        None
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}
