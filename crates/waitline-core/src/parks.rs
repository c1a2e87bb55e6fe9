//! Park code and timezone derivations.
//!
//! Each entity belongs to exactly one park, identified by the leading
//! alphabetic prefix of its entity code (`MK101` → `mk`). Each source
//! property maps to one IANA timezone; timestamps are stamped with that
//! zone's offset at parse time.

use chrono_tz::Tz;

/// Entity-code prefix → lowercase park code.
///
/// Prefixes not listed here fall back to the lowercased prefix itself.
pub const PARK_PREFIXES: &[(&str, &str)] = &[
    ("MK", "mk"),
    ("EP", "ep"),
    ("HS", "hs"),
    ("AK", "ak"),
    ("BB", "bb"),
    ("TL", "tl"),
    ("DL", "dl"),
    ("CA", "ca"),
    ("TDL", "tdl"),
    ("TDS", "tds"),
    ("IA", "ia"),
    ("UF", "uf"),
    ("EU", "eu"),
    ("USH", "uh"),
];

/// Source properties the ingest lists by default.
pub const DEFAULT_PROPERTIES: &[&str] = &["wdw", "dlr", "uor", "ush", "tdr"];

/// Derives the lowercase park code from an entity code.
///
/// The prefix is every character before the first ASCII digit. Longer
/// prefixes win (`TDL` before `TL` cannot collide because the match is on
/// the full prefix, not a prefix-of-prefix).
#[must_use]
pub fn park_code_for_entity(entity_code: &str) -> String {
    let upper = entity_code.trim().to_ascii_uppercase();
    let prefix: String = upper.chars().take_while(|c| !c.is_ascii_digit()).collect();
    PARK_PREFIXES
        .iter()
        .find(|(p, _)| *p == prefix)
        .map_or_else(|| prefix.to_ascii_lowercase(), |(_, code)| (*code).to_string())
}

/// Returns the entity-code prefix for a park code, if it is a known park.
#[must_use]
pub fn prefix_for_park(park_code: &str) -> Option<&'static str> {
    PARK_PREFIXES
        .iter()
        .find(|(_, code)| *code == park_code)
        .map(|(prefix, _)| *prefix)
}

/// Timezone of a source property.
///
/// `dlr` is Pacific, `tdr` is Tokyo, everything else is Eastern.
#[must_use]
pub fn property_timezone(property: &str) -> Tz {
    match property {
        "dlr" => chrono_tz::America::Los_Angeles,
        "tdr" => chrono_tz::Asia::Tokyo,
        _ => chrono_tz::America::New_York,
    }
}

/// Extracts the property segment from a source key.
///
/// Keys look like `export/wait_times/{prop}/…` or
/// `export/fastpass_times/{prop}/…`; the segment after the marker is the
/// property.
#[must_use]
pub fn property_from_key(key: &str) -> Option<&str> {
    let parts: Vec<&str> = key.split('/').collect();
    for marker in ["wait_times", "fastpass_times"] {
        if let Some(i) = parts.iter().position(|p| *p == marker) {
            if let Some(prop) = parts.get(i + 1) {
                if !prop.is_empty() {
                    return Some(prop);
                }
            }
        }
    }
    None
}

/// Timezone for the property implied by a source key, defaulting to Eastern.
#[must_use]
pub fn timezone_from_key(key: &str) -> Tz {
    property_from_key(key).map_or(chrono_tz::America::New_York, property_timezone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_mapping() {
        assert_eq!(park_code_for_entity("MK101"), "mk");
        assert_eq!(park_code_for_entity("ep09"), "ep");
        assert_eq!(park_code_for_entity("TDS36"), "tds");
        assert_eq!(park_code_for_entity("USH12"), "uh");
        // Unmapped prefixes lowercase themselves.
        assert_eq!(park_code_for_entity("ZZ7"), "zz");
    }

    #[test]
    fn park_to_prefix_round_trip() {
        assert_eq!(prefix_for_park("mk"), Some("MK"));
        assert_eq!(prefix_for_park("uh"), Some("USH"));
        assert_eq!(prefix_for_park("nope"), None);
    }

    #[test]
    fn property_zones() {
        assert_eq!(property_timezone("dlr"), chrono_tz::America::Los_Angeles);
        assert_eq!(property_timezone("tdr"), chrono_tz::Asia::Tokyo);
        assert_eq!(property_timezone("wdw"), chrono_tz::America::New_York);
    }

    #[test]
    fn property_extraction_from_keys() {
        assert_eq!(
            property_from_key("export/wait_times/wdw/2024_wait.csv"),
            Some("wdw")
        );
        assert_eq!(
            property_from_key("export/fastpass_times/tdr/fp_2016.csv"),
            Some("tdr")
        );
        assert_eq!(property_from_key("export/other/wdw/x.csv"), None);
        assert_eq!(timezone_from_key("export/wait_times/dlr/a.csv"), chrono_tz::America::Los_Angeles);
    }
}
