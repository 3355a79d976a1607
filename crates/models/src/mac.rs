//! MAC address canonicalization.
//!
//! Accepts colon, dash, or bare hex forms in any case and normalizes to
//! `AA:BB:CC:DD:EE:FF`. Centralized here because the dedup map, the
//! MAC-vendor cache, and host reconciliation all assume this exact form.

/// Canonicalize a MAC address string to upper-case, colon-separated form.
///
/// Returns `None` if the input does not contain exactly 12 hex digits.
pub fn canonicalize(raw: &str) -> Option<String> {
    let hex: String = raw
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if hex.len() != 12 {
        return None;
    }

    let mut out = String::with_capacity(17);
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push(chunk[0] as char);
        out.push(chunk[1] as char);
    }
    Some(out)
}

/// Canonical form with no delimiters at all, used as the MAC-vendor cache key.
pub fn vendor_cache_key(raw: &str) -> Option<String> {
    canonicalize(raw).map(|c| c.replace(':', ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_colon_dash_and_bare_forms() {
        let expected = "AA:BB:CC:DD:EE:FF";
        assert_eq!(canonicalize("aa:bb:cc:dd:ee:ff").as_deref(), Some(expected));
        assert_eq!(canonicalize("AA-BB-CC-DD-EE-FF").as_deref(), Some(expected));
        assert_eq!(canonicalize("aabbccddeeff").as_deref(), Some(expected));
        assert_eq!(canonicalize("Aa:bB-cc:DD-ee:ff").as_deref(), Some(expected));
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(canonicalize("AA:BB:CC:DD:EE"), None);
        assert_eq!(canonicalize(""), None);
    }

    #[test]
    fn vendor_key_strips_delimiters() {
        assert_eq!(vendor_cache_key("aa:bb:cc:dd:ee:ff").as_deref(), Some("AABBCCDDEEFF"));
    }

    #[test]
    fn any_form_maps_to_same_cache_entry() {
        let forms = ["AA:BB:CC:DD:EE:FF", "aa-bb-cc-dd-ee-ff", "AaBbCcDdEeFf"];
        let keys: Vec<_> = forms.iter().map(|f| vendor_cache_key(f).unwrap()).collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }
}
