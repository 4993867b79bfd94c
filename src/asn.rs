//! AS numbers and extracting them from configuration text.
//!
//! BGP configuration text mentions autonomous system numbers in a small
//! number of shapes: `AS13335`, `AS-13335`, `peer-as 13335`, and bare
//! integers in a few known Junos contexts. [`extract_as_numbers`] pulls
//! them all out of a text in one pass, validates each candidate, and
//! reports anything suspicious as a diagnostic rather than an error.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use regex::Regex;


//------------ Asn -----------------------------------------------------------

/// An autonomous system number.
///
/// A 32-bit number identifying a BGP routing domain. The full range is
/// representable; reserved ranges are flagged through [`classify`][Self::classify]
/// but never rejected here.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd,
    serde::Deserialize, serde::Serialize
)]
#[serde(transparent)]
pub struct Asn(u32);

impl Asn {
    /// Creates an AS number from its integer value.
    pub fn from_u32(value: u32) -> Self {
        Asn(value)
    }

    /// Returns the integer value of the AS number.
    pub fn into_u32(self) -> u32 {
        self.0
    }

    /// Classifies the AS number against the reserved ranges.
    ///
    /// Returns `None` for a plain, globally routable AS number.
    pub fn classify(self) -> Option<AsnClass> {
        match self.0 {
            0 | 23456 | 65535 | 4294967295 => Some(AsnClass::Reserved),
            64496..=64511 | 65536..=65551 => Some(AsnClass::Documentation),
            64512..=65534 | 4200000000..=4294967294 => {
                Some(AsnClass::Private)
            }
            _ => None
        }
    }

    /// Returns whether the value looks like an IP address octet.
    ///
    /// Values up to 255 regularly turn up in free-form text as pieces of
    /// dotted-quad addresses. The extractor drops them in strict mode.
    pub fn is_suspect_octet(self) -> bool {
        self.0 <= 255
    }
}

impl From<u32> for Asn {
    fn from(value: u32) -> Self {
        Asn(value)
    }
}

impl From<Asn> for u32 {
    fn from(value: Asn) -> Self {
        value.0
    }
}

impl FromStr for Asn {
    type Err = ParseAsnError;

    /// Parses an AS number from decimal digits or the `AS{n}` form.
    fn from_str(value: &str) -> Result<Self, ParseAsnError> {
        let digits = if value.len() > 2
            && value[..2].eq_ignore_ascii_case("as")
        {
            &value[2..]
        }
        else {
            value
        };
        u32::from_str(digits).map(Asn).map_err(|_| ParseAsnError)
    }
}

impl fmt::Display for Asn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AS{}", self.0)
    }
}


//------------ ParseAsnError -------------------------------------------------

/// A string did not contain a valid AS number.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParseAsnError;

impl fmt::Display for ParseAsnError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("invalid AS number")
    }
}


//------------ AsnClass ------------------------------------------------------

/// The reserved-range class of an AS number.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AsnClass {
    /// One of the individually reserved values.
    Reserved,

    /// Reserved for documentation.
    Documentation,

    /// Reserved for private use.
    Private,
}

impl fmt::Display for AsnClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            AsnClass::Reserved => "reserved",
            AsnClass::Documentation => "documentation",
            AsnClass::Private => "private-use",
        })
    }
}


//------------ Extracted -----------------------------------------------------

/// The result of extracting AS numbers from a text.
#[derive(Clone, Debug, Default)]
pub struct Extracted {
    /// The extracted AS numbers in ascending order.
    pub as_numbers: BTreeSet<Asn>,

    /// Diagnostics produced along the way.
    ///
    /// Diagnostics never fail an extraction. Malformed candidates are
    /// skipped, reserved-range numbers are admitted with a warning.
    pub diagnostics: Vec<String>,
}


//------------ extract_as_numbers --------------------------------------------

/// The pattern set for AS number candidates.
///
/// One compiled expression with alternatives for each shape. The capture
/// groups deliver the digits; which group matched tells the shape for
/// diagnostics.
fn candidate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?ix)
            \b as -? (\d{1,10}) \b          # AS13335, AS-13335
            | \b peer-as \s+ (\d{1,10}) \b  # peer-as 13335
            | \b local-as \s+ (\d{1,10}) \b
            | \b autonomous-system \s+ (\d{1,10}) \b
            "
        ).expect("AS candidate pattern failed to compile")
    })
}

/// Extracts AS numbers from free-form text.
///
/// Matching happens once over the whole text. Per-line scanning is used
/// only to count matching lines for the diagnostics.
///
/// In strict mode, values up to 255 are dropped as suspect IP octets.
pub fn extract_as_numbers(text: &str, strict: bool) -> Extracted {
    let mut res = Extracted::default();

    for captures in candidate_pattern().captures_iter(text) {
        let digits = captures.iter().skip(1).flatten().next()
            .map(|m| m.as_str());
        let digits = match digits {
            Some(digits) => digits,
            None => continue,
        };
        let asn = match u32::from_str(digits) {
            Ok(value) => Asn::from_u32(value),
            Err(_) => {
                res.diagnostics.push(format!(
                    "skipped malformed AS number candidate '{}'", digits
                ));
                continue
            }
        };
        if strict && asn.is_suspect_octet() {
            res.diagnostics.push(format!(
                "dropped suspect IP-octet value {}", asn.into_u32()
            ));
            continue
        }
        if let Some(class) = asn.classify() {
            res.diagnostics.push(format!(
                "{} is in a {} range", asn, class
            ));
        }
        res.as_numbers.insert(asn);
    }

    let matching_lines = text.lines()
        .filter(|line| candidate_pattern().is_match(line))
        .count();
    if matching_lines > 0 {
        res.diagnostics.push(format!(
            "matched AS candidates on {} lines", matching_lines
        ));
    }

    res
}


//------------ clean_text ----------------------------------------------------

/// Noise the Junos CLI mixes into captured output.
///
/// Pager markers, the routing-engine prompt tag, carriage returns, and
/// the inverse-video escape the pager wraps its marker in.
pub const DEFAULT_NOISE: &[&str] = &[
    "{master}",
    "{backup}",
    "---(more)---",
    "\u{1b}[7m",
    "\u{1b}[m",
    "\r",
];

/// The input size above which batch replacement switches strategy.
const CLEAN_COMPILE_THRESHOLD: usize = 10 * 1024;

/// Removes a list of noise substrings from a text.
///
/// For small jobs, successive replacement is cheaper than compiling a
/// pattern; for larger ones a single compiled alternation pass wins. Both
/// strategies produce byte-identical output for non-overlapping noise
/// substrings, which the noise lists used by the pre-pass are.
pub fn clean_text(text: &str, noise: &[&str]) -> String {
    let noise: Vec<&str> = noise.iter()
        .copied().filter(|s| !s.is_empty()).collect();
    if noise.is_empty() {
        return text.into()
    }
    if noise.len() <= 3 || text.len() < CLEAN_COMPILE_THRESHOLD {
        clean_text_naive(text, &noise)
    }
    else {
        clean_text_compiled(text, &noise)
    }
}

/// Successive replacement of each noise substring.
fn clean_text_naive(text: &str, noise: &[&str]) -> String {
    let mut res = text.to_string();
    for item in noise {
        res = res.replace(item, "");
    }
    res
}

/// A single pass with a compiled alternation.
///
/// Alternatives are ordered longest first so that overlapping substrings
/// behave like the successive strategy.
fn clean_text_compiled(text: &str, noise: &[&str]) -> String {
    let mut ordered: Vec<&str> = noise.into();
    ordered.sort_by_key(|item| std::cmp::Reverse(item.len()));
    let pattern = ordered.iter()
        .map(|item| regex::escape(item))
        .collect::<Vec<_>>()
        .join("|");
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, "").into_owned(),
        Err(_) => clean_text_naive(text, noise),
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_plain_and_prefixed() {
        assert_eq!(Asn::from_str("13335"), Ok(Asn::from_u32(13335)));
        assert_eq!(Asn::from_str("AS13335"), Ok(Asn::from_u32(13335)));
        assert_eq!(Asn::from_str("as13335"), Ok(Asn::from_u32(13335)));
        assert_eq!(Asn::from_str("4294967295"), Ok(Asn::from_u32(u32::MAX)));
        assert!(Asn::from_str("4294967296").is_err());
        assert!(Asn::from_str("-1").is_err());
        assert!(Asn::from_str("13335.5").is_err());
    }

    #[test]
    fn classifies_reserved_ranges() {
        assert_eq!(Asn::from_u32(0).classify(), Some(AsnClass::Reserved));
        assert_eq!(
            Asn::from_u32(23456).classify(), Some(AsnClass::Reserved)
        );
        assert_eq!(
            Asn::from_u32(64496).classify(), Some(AsnClass::Documentation)
        );
        assert_eq!(
            Asn::from_u32(64512).classify(), Some(AsnClass::Private)
        );
        assert_eq!(
            Asn::from_u32(4200000000).classify(), Some(AsnClass::Private)
        );
        assert_eq!(Asn::from_u32(13335).classify(), None);
        assert_eq!(Asn::from_u32(65552).classify(), None);
    }

    #[test]
    fn extracts_known_shapes() {
        let text = "\
            group transit {\n\
                neighbor 192.0.2.1 {\n\
                    peer-as 13335;\n\
                }\n\
            }\n\
            # managed by AS-15169 tooling\n\
            local-as 65550;\n\
        ";
        let res = extract_as_numbers(text, true);
        let numbers: Vec<u32> = res.as_numbers.iter()
            .map(|asn| asn.into_u32()).collect();
        assert_eq!(numbers, [13335, 15169, 65550]);
    }

    #[test]
    fn strict_mode_drops_octets() {
        let res = extract_as_numbers("peer-as 64 and peer-as 13335", true);
        let numbers: Vec<u32> = res.as_numbers.iter()
            .map(|asn| asn.into_u32()).collect();
        assert_eq!(numbers, [13335]);
        assert!(res.diagnostics.iter().any(|d| d.contains("suspect")));

        let res = extract_as_numbers("peer-as 64", false);
        assert!(res.as_numbers.contains(&Asn::from_u32(64)));
    }

    #[test]
    fn reserved_numbers_warn_but_pass() {
        let res = extract_as_numbers("peer-as 64512", true);
        assert!(res.as_numbers.contains(&Asn::from_u32(64512)));
        assert!(res.diagnostics.iter().any(|d| d.contains("private-use")));
    }

    #[test]
    fn no_duplicates_in_result() {
        let res = extract_as_numbers(
            "peer-as 13335; peer-as 13335; AS13335", true
        );
        assert_eq!(res.as_numbers.len(), 1);
    }

    #[test]
    fn overlong_digits_are_skipped() {
        let res = extract_as_numbers("peer-as 4294967296", true);
        assert!(res.as_numbers.is_empty());
        assert!(res.diagnostics.iter().any(|d| d.contains("malformed")));
    }

    #[test]
    fn clean_strategies_agree() {
        let noise = ["{master}", "---(more)---", "\u{1b}[7m"];
        let small = "line one {master}\nline ---(more)--- two\n";
        assert_eq!(
            clean_text_naive(small, &noise),
            clean_text_compiled(small, &noise),
        );

        let mut large = String::new();
        for i in 0..2000 {
            large.push_str("payload ");
            large.push_str(if i % 2 == 0 { "{master}" } else { "x" });
            large.push('\n');
        }
        let many_noise = [
            "{master}", "---(more)---", "\u{1b}[7m", "\r",
        ];
        assert_eq!(
            clean_text_naive(&large, &many_noise),
            clean_text_compiled(&large, &many_noise),
        );
        assert_eq!(
            clean_text(&large, &many_noise),
            clean_text_naive(&large, &many_noise),
        );
    }

    #[test]
    fn clean_with_empty_noise_is_identity() {
        assert_eq!(clean_text("abc", &[]), "abc");
        assert_eq!(clean_text("abc", &[""]), "abc");
    }
}
