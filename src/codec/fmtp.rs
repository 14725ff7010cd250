// SPDX-License-Identifier: MIT OR Apache-2.0

//! Format-specific parameters from a SDP `a=fmtp` media attribute.

/// `key=value` pairs, in order, with case-insensitive lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormatParams(Vec<(String, String)>);

impl FormatParams {
    /// Parses the part of the attribute after the payload type.
    ///
    /// Empty items are skipped (Reolink cameras leave a trailing `;`). An item
    /// without `=` is kept with an empty value.
    pub fn parse(raw: &str) -> Self {
        FormatParams(
            raw.split(';')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| match p.split_once('=') {
                    Some((k, v)) => (k.trim().to_owned(), v.trim().to_owned()),
                    None => (p.to_owned(), String::new()),
                })
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Gets a decimal integer value.
    pub fn get_u32(&self, key: &str) -> Result<Option<u32>, String> {
        self.get(key)
            .map(|v| u32::from_str_radix(v, 10).map_err(|_| format!("bad {key}={v:?}")))
            .transpose()
    }

    /// Gets a boolean flag spelled as `1` or `true`.
    pub fn get_flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some(v) if v == "1" || v.eq_ignore_ascii_case("true"))
    }

    /// Gets a value encoded as MSB-first hexadecimal, such as RFC 3640 `config`.
    pub fn get_hex(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        self.get(key)
            .map(|v| hex::decode(v).map_err(|_| format!("{key} has invalid hex encoding")))
            .transpose()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::FormatParams;

    #[test]
    fn parse() {
        let p = FormatParams::parse(
            "streamtype=5; profile-level-id=15; mode=AAC-hbr; config=1190;\
             SizeLength=13; IndexLength=3;IndexDeltaLength=3; ",
        );
        assert_eq!(p.get("mode"), Some("AAC-hbr"));
        assert_eq!(p.get_u32("sizelength").unwrap(), Some(13));
        assert_eq!(p.get_u32("CTSDeltaLength").unwrap(), None);
        assert_eq!(p.get_hex("config").unwrap(), Some(vec![0x11, 0x90]));
        assert_eq!(p.iter().count(), 7);
    }

    #[test]
    fn bad_values() {
        let p = FormatParams::parse("SizeLength=x;config=1g;octet-align");
        p.get_u32("sizelength").unwrap_err();
        p.get_hex("config").unwrap_err();
        assert_eq!(p.get("octet-align"), Some(""));
        assert!(!p.get_flag("octet-align"));
    }
}
