//! Fully-qualified host name: `<name>@<url-encoded location>[-<nodeId>]`.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fqn {
    pub name: String,
    pub location: String,
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FqnError {
    #[error("fqn is missing the '@' separator")]
    MissingSeparator,
    #[error("fqn has an empty name component")]
    EmptyName,
    #[error("fqn location is not validly url-encoded: {0}")]
    BadEncoding(String),
}

impl Fqn {
    pub fn parse(raw: &str) -> Result<Self, FqnError> {
        let (name, rest) = raw.split_once('@').ok_or(FqnError::MissingSeparator)?;
        if name.is_empty() {
            return Err(FqnError::EmptyName);
        }

        // '-' is reserved as the node-suffix separator and always
        // percent-escaped by `url_encode`, so a literal '-' in `rest` can
        // only be the marker `build` added. Split on the first one and
        // decode each side independently.
        let (location_part, node_id) = match rest.split_once('-') {
            Some((location_part, id)) => {
                let decoded_id = url_decode(id).map_err(FqnError::BadEncoding)?;
                (location_part, Some(decoded_id))
            }
            None => (rest, None),
        };
        let decoded = url_decode(location_part).map_err(FqnError::BadEncoding)?;

        Ok(Fqn { name: name.to_string(), location: decoded, node_id })
    }

    /// Build a fqn from parts, url-encoding both the location and (if
    /// present) the node id so the reserved '-' separator stays unambiguous
    /// even if either part contains a literal '-'.
    pub fn build(name: &str, location: &str, node_id: Option<&str>) -> String {
        let encoded_location = url_encode(location);
        match node_id {
            Some(id) => format!("{name}@{encoded_location}-{}", url_encode(id)),
            None => format!("{name}@{encoded_location}"),
        }
    }
}

impl fmt::Display for Fqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(id) => write!(f, "{}@{}-{}", self.name, url_encode(&self.location), url_encode(id)),
            None => write!(f, "{}@{}", self.name, url_encode(&self.location)),
        }
    }
}

fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn url_decode(s: &str) -> Result<String, String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = s
                    .get(i + 1..i + 3)
                    .ok_or_else(|| format!("truncated percent escape at byte {i}"))?;
                let value = u8::from_str_radix(hex, 16)
                    .map_err(|_| format!("invalid percent escape '%{hex}'"))?;
                out.push(value);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_fqn() {
        let built = Fqn::build("desktop", "lab", None);
        assert_eq!(built, "desktop@lab");
        let parsed = Fqn::parse(&built).unwrap();
        assert_eq!(parsed.name, "desktop");
        assert_eq!(parsed.location, "lab");
    }

    #[test]
    fn encodes_special_characters_in_location() {
        let built = Fqn::build("desktop", "main office/east wing", None);
        assert!(built.contains("%2F"));
        let parsed = Fqn::parse(&built).unwrap();
        assert_eq!(parsed.location, "main office/east wing");
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(Fqn::parse("desktop-lab"), Err(FqnError::MissingSeparator));
    }

    #[test]
    fn rejects_empty_name() {
        assert_eq!(Fqn::parse("@lab"), Err(FqnError::EmptyName));
    }

    #[test]
    fn round_trips_node_suffix() {
        let built = Fqn::build("desktop", "lab", Some("node-7"));
        assert_eq!(built, "desktop@lab-node%2D7");
        let parsed = Fqn::parse(&built).unwrap();
        assert_eq!(parsed.name, "desktop");
        assert_eq!(parsed.location, "lab");
        assert_eq!(parsed.node_id.as_deref(), Some("node-7"));
    }

    #[test]
    fn node_suffix_disambiguates_location_with_literal_dash() {
        let built = Fqn::build("desktop", "east-wing", Some("n1"));
        let parsed = Fqn::parse(&built).unwrap();
        assert_eq!(parsed.location, "east-wing");
        assert_eq!(parsed.node_id.as_deref(), Some("n1"));
    }

    #[test]
    fn fqn_without_node_suffix_still_parses() {
        let parsed = Fqn::parse("desktop@lab").unwrap();
        assert_eq!(parsed.location, "lab");
        assert_eq!(parsed.node_id, None);
    }
}
