//! # iso
//!
//! Free-text place names → ISO 3166 codes. Resolvers (gazetteer rows, online
//! reverse geocoding) return names; downstream wants lowercase ISO 3166-1
//! alpha-2 and ISO 3166-2 subdivision codes (without the country prefix).
//!
//! Both tables are living artefacts: one line per mapping, extended whenever
//! a new locality shows up unresolved in the logs. Lookups are
//! case-insensitive. A name missing from its table yields `None`; callers
//! log it and fall back to `unknown`.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Country display name → alpha-2.
const COUNTRIES: &[(&str, &str)] = &[
    ("argentina", "ar"),
    ("australia", "au"),
    ("austria", "at"),
    ("belgium", "be"),
    ("brazil", "br"),
    ("bulgaria", "bg"),
    ("canada", "ca"),
    ("chile", "cl"),
    ("china", "cn"),
    ("croatia", "hr"),
    ("czechia", "cz"),
    ("czech republic", "cz"),
    ("denmark", "dk"),
    ("estonia", "ee"),
    ("finland", "fi"),
    ("france", "fr"),
    ("germany", "de"),
    ("greece", "gr"),
    ("hungary", "hu"),
    ("iceland", "is"),
    ("india", "in"),
    ("indonesia", "id"),
    ("ireland", "ie"),
    ("israel", "il"),
    ("italy", "it"),
    ("japan", "jp"),
    ("latvia", "lv"),
    ("lithuania", "lt"),
    ("luxembourg", "lu"),
    ("malaysia", "my"),
    ("mexico", "mx"),
    ("netherlands", "nl"),
    ("the netherlands", "nl"),
    ("new zealand", "nz"),
    ("norway", "no"),
    ("philippines", "ph"),
    ("poland", "pl"),
    ("portugal", "pt"),
    ("romania", "ro"),
    ("singapore", "sg"),
    ("slovakia", "sk"),
    ("slovenia", "si"),
    ("south africa", "za"),
    ("south korea", "kr"),
    ("republic of korea", "kr"),
    ("spain", "es"),
    ("sweden", "se"),
    ("switzerland", "ch"),
    ("taiwan", "tw"),
    ("thailand", "th"),
    ("turkey", "tr"),
    ("türkiye", "tr"),
    ("ukraine", "ua"),
    ("united kingdom", "gb"),
    ("uk", "gb"),
    ("united states", "us"),
    ("united states of america", "us"),
    ("usa", "us"),
    ("uruguay", "uy"),
    ("vietnam", "vn"),
];

/// (alpha-2, admin1 display name) → ISO 3166-2 suffix.
const SUBDIVISIONS: &[(&str, &str, &str)] = &[
    // New Zealand
    ("nz", "auckland", "auk"),
    ("nz", "bay of plenty", "bop"),
    ("nz", "canterbury", "can"),
    ("nz", "gisborne", "gis"),
    ("nz", "hawke's bay", "hkb"),
    ("nz", "manawatu-wanganui", "mwt"),
    ("nz", "manawatū-whanganui", "mwt"),
    ("nz", "marlborough", "mbh"),
    ("nz", "nelson", "nsn"),
    ("nz", "northland", "ntl"),
    ("nz", "otago", "ota"),
    ("nz", "southland", "stl"),
    ("nz", "taranaki", "tki"),
    ("nz", "tasman", "tas"),
    ("nz", "waikato", "wko"),
    ("nz", "wellington", "wgn"),
    ("nz", "west coast", "wtc"),
    // United Kingdom
    ("gb", "england", "eng"),
    ("gb", "northern ireland", "nir"),
    ("gb", "scotland", "sct"),
    ("gb", "wales", "wls"),
    // Australia
    ("au", "australian capital territory", "act"),
    ("au", "new south wales", "nsw"),
    ("au", "northern territory", "nt"),
    ("au", "queensland", "qld"),
    ("au", "south australia", "sa"),
    ("au", "tasmania", "tas"),
    ("au", "victoria", "vic"),
    ("au", "western australia", "wa"),
    // United States
    ("us", "alabama", "al"),
    ("us", "alaska", "ak"),
    ("us", "arizona", "az"),
    ("us", "arkansas", "ar"),
    ("us", "california", "ca"),
    ("us", "colorado", "co"),
    ("us", "connecticut", "ct"),
    ("us", "delaware", "de"),
    ("us", "florida", "fl"),
    ("us", "georgia", "ga"),
    ("us", "hawaii", "hi"),
    ("us", "idaho", "id"),
    ("us", "illinois", "il"),
    ("us", "indiana", "in"),
    ("us", "iowa", "ia"),
    ("us", "kansas", "ks"),
    ("us", "kentucky", "ky"),
    ("us", "louisiana", "la"),
    ("us", "maine", "me"),
    ("us", "maryland", "md"),
    ("us", "massachusetts", "ma"),
    ("us", "michigan", "mi"),
    ("us", "minnesota", "mn"),
    ("us", "mississippi", "ms"),
    ("us", "missouri", "mo"),
    ("us", "montana", "mt"),
    ("us", "nebraska", "ne"),
    ("us", "nevada", "nv"),
    ("us", "new hampshire", "nh"),
    ("us", "new jersey", "nj"),
    ("us", "new mexico", "nm"),
    ("us", "new york", "ny"),
    ("us", "north carolina", "nc"),
    ("us", "north dakota", "nd"),
    ("us", "ohio", "oh"),
    ("us", "oklahoma", "ok"),
    ("us", "oregon", "or"),
    ("us", "pennsylvania", "pa"),
    ("us", "rhode island", "ri"),
    ("us", "south carolina", "sc"),
    ("us", "south dakota", "sd"),
    ("us", "tennessee", "tn"),
    ("us", "texas", "tx"),
    ("us", "utah", "ut"),
    ("us", "vermont", "vt"),
    ("us", "virginia", "va"),
    ("us", "washington", "wa"),
    ("us", "west virginia", "wv"),
    ("us", "wisconsin", "wi"),
    ("us", "wyoming", "wy"),
    ("us", "district of columbia", "dc"),
    // Canada
    ("ca", "alberta", "ab"),
    ("ca", "british columbia", "bc"),
    ("ca", "manitoba", "mb"),
    ("ca", "new brunswick", "nb"),
    ("ca", "newfoundland and labrador", "nl"),
    ("ca", "northwest territories", "nt"),
    ("ca", "nova scotia", "ns"),
    ("ca", "nunavut", "nu"),
    ("ca", "ontario", "on"),
    ("ca", "prince edward island", "pe"),
    ("ca", "quebec", "qc"),
    ("ca", "québec", "qc"),
    ("ca", "saskatchewan", "sk"),
    ("ca", "yukon", "yt"),
    // Germany
    ("de", "baden-württemberg", "bw"),
    ("de", "bavaria", "by"),
    ("de", "bayern", "by"),
    ("de", "berlin", "be"),
    ("de", "brandenburg", "bb"),
    ("de", "bremen", "hb"),
    ("de", "hamburg", "hh"),
    ("de", "hesse", "he"),
    ("de", "hessen", "he"),
    ("de", "lower saxony", "ni"),
    ("de", "niedersachsen", "ni"),
    ("de", "mecklenburg-vorpommern", "mv"),
    ("de", "north rhine-westphalia", "nw"),
    ("de", "nordrhein-westfalen", "nw"),
    ("de", "rhineland-palatinate", "rp"),
    ("de", "rheinland-pfalz", "rp"),
    ("de", "saarland", "sl"),
    ("de", "saxony", "sn"),
    ("de", "sachsen", "sn"),
    ("de", "saxony-anhalt", "st"),
    ("de", "schleswig-holstein", "sh"),
    ("de", "thuringia", "th"),
    ("de", "thüringen", "th"),
];

fn country_table() -> &'static HashMap<&'static str, &'static str> {
    static TABLE: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| COUNTRIES.iter().copied().collect())
}

fn subdivision_table() -> &'static HashMap<(&'static str, &'static str), &'static str> {
    static TABLE: OnceLock<HashMap<(&'static str, &'static str), &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        SUBDIVISIONS
            .iter()
            .map(|&(cc, name, code)| ((cc, name), code))
            .collect()
    })
}

/// Country name → lowercase alpha-2 code.
pub fn country_code(name: &str) -> Option<&'static str> {
    country_table()
        .get(name.trim().to_lowercase().as_str())
        .copied()
}

/// (alpha-2, admin1 name) → lowercase ISO 3166-2 suffix.
pub fn subdivision_code(country: &str, admin1: &str) -> Option<&'static str> {
    subdivision_table()
        .get(&(country, admin1.trim().to_lowercase().as_str()))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn country_lookup_is_case_insensitive() {
        assert_eq!(country_code("New Zealand"), Some("nz"));
        assert_eq!(country_code("NEW ZEALAND"), Some("nz"));
        assert_eq!(country_code("united kingdom"), Some("gb"));
        assert_eq!(country_code(" United States "), Some("us"));
    }

    #[test]
    fn unknown_country_is_none() {
        assert_eq!(country_code("Atlantis"), None);
        assert_eq!(country_code(""), None);
    }

    #[test]
    fn subdivision_lookup() {
        assert_eq!(subdivision_code("nz", "Auckland"), Some("auk"));
        assert_eq!(subdivision_code("gb", "England"), Some("eng"));
        assert_eq!(subdivision_code("us", "Washington"), Some("wa"));
        assert_eq!(subdivision_code("au", "New South Wales"), Some("nsw"));
        assert_eq!(subdivision_code("de", "Bayern"), Some("by"));
    }

    #[test]
    fn subdivision_requires_matching_country() {
        // "Washington" is a US state, not an NZ region
        assert_eq!(subdivision_code("nz", "Washington"), None);
        assert_eq!(subdivision_code("zz", "Auckland"), None);
    }
}
