//! Deriving BGP group structure from Junos configuration.
//!
//! The collector hands us the raw text of `protocols bgp`. This module
//! turns it into the ordered group-to-peer-AS mapping the rest of the
//! pipeline works with. Parsing is line-based with brace tracking, which
//! is all the curly format needs.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use crate::asn::Asn;


//------------ PeerRole ------------------------------------------------------

/// The role of a peering relationship.
///
/// Derived from the group’s `type` statement and its name. The role never
/// affects policy generation; it is carried into the discovery artifacts
/// for operators.
#[derive(Clone, Copy, Debug, Eq, PartialEq,
    serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Transit,
    Peer,
    Customer,
    Ibgp,
    Unknown,
}

impl PeerRole {
    /// Derives the role from a group name and optional session type.
    fn derive(name: &str, session_type: Option<&str>) -> Self {
        if let Some("internal") = session_type {
            return PeerRole::Ibgp
        }
        let lower = name.to_ascii_lowercase();
        if lower.contains("transit") || lower.contains("upstream") {
            PeerRole::Transit
        }
        else if lower.contains("customer") || lower.contains("cust") {
            PeerRole::Customer
        }
        else if lower.contains("peer") || lower.contains("ix") {
            PeerRole::Peer
        }
        else {
            PeerRole::Unknown
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            PeerRole::Transit => "transit",
            PeerRole::Peer => "peer",
            PeerRole::Customer => "customer",
            PeerRole::Ibgp => "ibgp",
            PeerRole::Unknown => "unknown",
        })
    }
}


//------------ BgpGroup ------------------------------------------------------

/// A single BGP group and its peer AS numbers.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct BgpGroup {
    /// The name of the group.
    pub name: String,

    /// The derived peering role.
    pub role: PeerRole,

    /// The peer AS numbers in source-document order.
    ///
    /// Each AS appears at most once per group; the first occurrence
    /// determines its position.
    pub peers: Vec<Asn>,
}


//------------ BgpGroups -----------------------------------------------------

/// The groups found in a router’s BGP configuration.
#[derive(Clone, Debug, Default)]
pub struct BgpGroups {
    /// The groups in source-document order.
    groups: Vec<BgpGroup>,

    /// Diagnostics produced while parsing.
    diagnostics: Vec<String>,
}

impl BgpGroups {
    /// Returns the groups in source-document order.
    pub fn groups(&self) -> &[BgpGroup] {
        &self.groups
    }

    /// Returns the diagnostics produced while parsing.
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    /// Returns the union of all peer AS numbers over all groups.
    pub fn as_numbers(&self) -> BTreeSet<Asn> {
        self.groups.iter()
            .flat_map(|group| group.peers.iter().copied())
            .collect()
    }

    /// Returns the inverse mapping from peer AS to role.
    ///
    /// If an AS appears in several groups, the first group wins.
    pub fn peer_role_of_as(&self) -> HashMap<Asn, PeerRole> {
        let mut res = HashMap::new();
        for group in &self.groups {
            for asn in &group.peers {
                res.entry(*asn).or_insert(group.role);
            }
        }
        res
    }

    /// Returns whether no groups were found.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}


//------------ inspect -------------------------------------------------------

/// Parses Junos BGP configuration text into its group structure.
///
/// Groups appear in source-document order. A group without any `peer-as`
/// statement is retained with an empty AS list. An anonymous group is
/// rejected with a diagnostic; its content is skipped.
pub fn inspect(text: &str) -> BgpGroups {
    let mut res = BgpGroups::default();
    let mut depth = 0usize;

    // Set while inside a group stanza: the group under construction, its
    // session type, the per-group dedup set, and the depth at which the
    // group’s closing brace brings us back.
    let mut current: Option<GroupInProgress> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        let opens = trimmed.matches('{').count();
        let closes = trimmed.matches('}').count();

        if let Some(name) = group_header(trimmed) {
            if current.is_none() {
                match name {
                    Some(name) => {
                        current = Some(GroupInProgress {
                            name: name.into(),
                            session_type: None,
                            peers: Vec::new(),
                            seen: BTreeSet::new(),
                            close_depth: depth,
                            anonymous: false,
                        });
                    }
                    None => {
                        res.diagnostics.push(
                            "rejected anonymous BGP group".into()
                        );
                        current = Some(GroupInProgress {
                            name: String::new(),
                            session_type: None,
                            peers: Vec::new(),
                            seen: BTreeSet::new(),
                            close_depth: depth,
                            anonymous: true,
                        });
                    }
                }
            }
        }
        else if let Some(group) = current.as_mut() {
            // Statements may share a line with braces, so look at each
            // segment between braces and semicolons separately.
            for segment in trimmed.split(
                |c| c == '{' || c == '}' || c == ';'
            ) {
                let segment = segment.trim();
                if let Some(value) = statement_value(segment, "peer-as") {
                    match Asn::from_str(value) {
                        Ok(asn) => {
                            if group.seen.insert(asn) {
                                group.peers.push(asn);
                            }
                        }
                        Err(_) => {
                            res.diagnostics.push(format!(
                                "skipped malformed peer-as '{}' \
                                 in group '{}'",
                                value, group.name
                            ));
                        }
                    }
                }
                else if let Some(value) = statement_value(
                    segment, "type"
                ) {
                    if group.session_type.is_none() {
                        group.session_type = Some(value.into());
                    }
                }
            }
        }

        depth += opens;
        depth = depth.saturating_sub(closes);

        if let Some(group) = current.as_ref() {
            if depth <= group.close_depth {
                let group = current.take().expect("group in progress");
                if !group.anonymous {
                    res.groups.push(BgpGroup {
                        role: PeerRole::derive(
                            &group.name,
                            group.session_type.as_deref()
                        ),
                        name: group.name,
                        peers: group.peers,
                    });
                }
            }
        }
    }

    res
}

/// A group stanza being assembled.
struct GroupInProgress {
    name: String,
    session_type: Option<String>,
    peers: Vec<Asn>,
    seen: BTreeSet<Asn>,
    close_depth: usize,
    anonymous: bool,
}

/// Recognizes a `group <name> {` header line.
///
/// Returns `Some(None)` for an anonymous `group {`.
fn group_header(line: &str) -> Option<Option<&str>> {
    let rest = line.strip_prefix("group")?;
    if !rest.starts_with(char::is_whitespace) {
        return None
    }
    let rest = rest.trim();
    let rest = rest.strip_suffix('{')?.trim();
    if rest.is_empty() {
        Some(None)
    }
    else if rest.split_whitespace().count() == 1 {
        Some(Some(rest))
    }
    else {
        None
    }
}

/// Extracts the value of a simple `keyword value;` statement.
fn statement_value<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(keyword)?;
    if !rest.starts_with(char::is_whitespace) {
        return None
    }
    Some(rest.trim().trim_end_matches(';').trim())
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "\
        group transit-upstream {\n\
            type external;\n\
            neighbor 192.0.2.1 {\n\
                description \"upstream a\";\n\
                peer-as 13335;\n\
            }\n\
            neighbor 192.0.2.2 {\n\
                peer-as 15169;\n\
            }\n\
        }\n\
        group ix-peers {\n\
            type external;\n\
            neighbor 198.51.100.1 {\n\
                peer-as 15169;\n\
            }\n\
        }\n\
        group ibgp-mesh {\n\
            type internal;\n\
        }\n\
    ";

    #[test]
    fn groups_in_source_order() {
        let res = inspect(SAMPLE);
        let names: Vec<&str> = res.groups().iter()
            .map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["transit-upstream", "ix-peers", "ibgp-mesh"]);
    }

    #[test]
    fn peers_ordered_and_deduped_per_group() {
        let res = inspect(SAMPLE);
        assert_eq!(
            res.groups()[0].peers,
            [Asn::from_u32(13335), Asn::from_u32(15169)]
        );
        assert_eq!(res.groups()[1].peers, [Asn::from_u32(15169)]);
    }

    #[test]
    fn duplicate_within_group_kept_once() {
        let text = "\
            group transit {\n\
                neighbor 192.0.2.1 { peer-as 13335; }\n\
                neighbor 192.0.2.2 { peer-as 13335; }\n\
            }\n\
        ";
        let res = inspect(text);
        assert_eq!(res.groups()[0].peers, [Asn::from_u32(13335)]);
    }

    #[test]
    fn empty_group_is_retained() {
        let res = inspect(SAMPLE);
        let ibgp = &res.groups()[2];
        assert!(ibgp.peers.is_empty());
        assert_eq!(ibgp.role, PeerRole::Ibgp);
    }

    #[test]
    fn anonymous_group_is_rejected() {
        let text = "\
            group {\n\
                neighbor 192.0.2.1 { peer-as 13335; }\n\
            }\n\
            group transit {\n\
                neighbor 192.0.2.2 { peer-as 15169; }\n\
            }\n\
        ";
        let res = inspect(text);
        assert_eq!(res.groups().len(), 1);
        assert_eq!(res.groups()[0].name, "transit");
        assert!(res.diagnostics().iter().any(|d| d.contains("anonymous")));
    }

    #[test]
    fn union_and_roles() {
        let res = inspect(SAMPLE);
        let union: Vec<u32> = res.as_numbers().iter()
            .map(|asn| asn.into_u32()).collect();
        assert_eq!(union, [13335, 15169]);

        let roles = res.peer_role_of_as();
        assert_eq!(roles[&Asn::from_u32(13335)], PeerRole::Transit);
        // 15169 first appears in the transit group.
        assert_eq!(roles[&Asn::from_u32(15169)], PeerRole::Transit);
    }

    #[test]
    fn malformed_peer_as_is_skipped() {
        let text = "\
            group transit {\n\
                neighbor 192.0.2.1 { peer-as 4294967296; }\n\
                neighbor 192.0.2.2 { peer-as 13335; }\n\
            }\n\
        ";
        let res = inspect(text);
        assert_eq!(res.groups()[0].peers, [Asn::from_u32(13335)]);
        assert!(res.diagnostics().iter().any(|d| d.contains("malformed")));
    }
}
