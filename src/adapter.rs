//! Composing router-scoped Junos configuration payloads.
//!
//! The adapter takes the per-AS policies generated for one router and
//! folds them into a single `policy-options` payload. Each prefix-list is
//! wrapped in a `replace:` scope so applying the same payload twice is
//! idempotent, and duplicate prefixes within a list are dropped keeping
//! the first occurrence. Nothing outside `policy-options` is ever
//! emitted.

use std::collections::HashSet;
use std::fmt::Write;
use crate::generator::PrefixListPolicy;


//------------ PrefixList ----------------------------------------------------

/// One named prefix-list parsed out of generated policy text.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrefixList {
    /// The name of the list.
    pub name: String,

    /// The prefixes in first-occurrence order, duplicates removed.
    pub prefixes: Vec<String>,
}


//------------ parse_prefix_lists --------------------------------------------

/// Parses the prefix-lists out of bgpq4 output.
///
/// bgpq4’s Juniper format nests each list inside a `policy-options`
/// block; a policy may carry several lists when both address families
/// are generated. Prefixes keep their textual form verbatim.
pub fn parse_prefix_lists(content: &str) -> Vec<PrefixList> {
    let mut res: Vec<PrefixList> = Vec::new();
    let mut current: Option<(String, Vec<String>, HashSet<String>)> = None;

    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("prefix-list ") {
            let name = rest.trim_end_matches('{').trim();
            if !name.is_empty() {
                current = Some((
                    name.to_string(), Vec::new(), HashSet::new()
                ));
            }
            continue
        }
        match current.as_mut() {
            Some((_, prefixes, seen)) => {
                if trimmed.starts_with('}') {
                    let (name, prefixes, _) =
                        current.take().expect("list in progress");
                    res.push(PrefixList { name, prefixes });
                }
                else {
                    let candidate = trimmed.trim_end_matches(';').trim();
                    if candidate.contains('/')
                        && seen.insert(candidate.to_string())
                    {
                        prefixes.push(candidate.to_string());
                    }
                }
            }
            None => { }
        }
    }

    res
}


//------------ render_router_payload -----------------------------------------

/// Renders the configuration payload for one router.
///
/// The payload contains one `replace:`-scoped prefix-list per list found
/// in the policies and, when enabled, an import-policy chain stub per
/// list. It never touches BGP sessions, interfaces, or unrelated policy.
pub fn render_router_payload(
    policies: &[PrefixListPolicy],
    include_import_chains: bool,
) -> String {
    let lists: Vec<PrefixList> = policies.iter()
        .flat_map(|policy| parse_prefix_lists(&policy.content))
        .collect();

    let mut res = String::new();
    res.push_str("policy-options {\n");
    for list in &lists {
        let _ = writeln!(res, "    replace: prefix-list {} {{", list.name);
        for prefix in &list.prefixes {
            let _ = writeln!(res, "        {};", prefix);
        }
        res.push_str("    }\n");
    }
    if include_import_chains {
        for list in &lists {
            let _ = writeln!(
                res,
                "    replace: policy-statement import-{} {{",
                list.name
            );
            res.push_str("        term prefixes {\n");
            res.push_str("            from {\n");
            let _ = writeln!(
                res,
                "                prefix-list-filter {} orlonger;",
                list.name
            );
            res.push_str("            }\n");
            res.push_str("            then next policy;\n");
            res.push_str("        }\n");
            res.push_str("    }\n");
        }
    }
    res.push_str("}\n");
    res
}


//------------ Artifact files ------------------------------------------------

/// Returns the artifact file name for a policy.
pub fn policy_file_name(policy: &PrefixListPolicy) -> String {
    format!("AS{}_policy.txt", policy.as_number.into_u32())
}

/// Renders the combined per-router policy file.
///
/// The combined file is the verbatim concatenation of the per-AS
/// artifacts in batch order, separated by a comment header per AS.
pub fn render_combined(policies: &[PrefixListPolicy]) -> String {
    let mut res = String::new();
    for policy in policies {
        let _ = writeln!(res, "# {} ({})", policy.policy_name,
            policy.as_number
        );
        res.push_str(&policy.content);
        if !policy.content.ends_with('\n') {
            res.push('\n');
        }
        res.push('\n');
    }
    res
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use crate::asn::Asn;

    const BGPQ4_OUTPUT: &str = "\
policy-options {\n\
replace:\n\
 prefix-list AS64496 {\n\
    203.0.112.0/22;\n\
    41.78.188.0/22;\n\
    203.0.112.0/22;\n\
 }\n\
}\n";

    fn policy(asn: u32, content: &str) -> PrefixListPolicy {
        PrefixListPolicy {
            as_number: Asn::from_u32(asn),
            policy_name: format!("AS{}", asn),
            content: content.into(),
            generated_at: Utc::now(),
            cache_key: String::new(),
        }
    }

    #[test]
    fn parses_lists_and_dedupes() {
        let lists = parse_prefix_lists(BGPQ4_OUTPUT);
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].name, "AS64496");
        // The duplicate 203.0.112.0/22 is dropped, first stays first.
        assert_eq!(
            lists[0].prefixes,
            ["203.0.112.0/22", "41.78.188.0/22"]
        );
    }

    #[test]
    fn parses_multiple_lists() {
        let content = "\
policy-options {\n\
replace:\n\
 prefix-list AS64496 {\n\
    203.0.112.0/22;\n\
 }\n\
}\n\
policy-options {\n\
replace:\n\
 prefix-list AS64496-v6 {\n\
    2620:fe::/48;\n\
 }\n\
}\n";
        let lists = parse_prefix_lists(content);
        assert_eq!(lists.len(), 2);
        assert_eq!(lists[0].name, "AS64496");
        assert_eq!(lists[1].name, "AS64496-v6");
        assert_eq!(lists[1].prefixes, ["2620:fe::/48"]);
    }

    #[test]
    fn payload_is_scoped_to_policy_options() {
        let policies = [
            policy(64496, BGPQ4_OUTPUT),
        ];
        let payload = render_router_payload(&policies, false);
        assert!(payload.starts_with("policy-options {\n"));
        assert!(payload.ends_with("}\n"));
        assert!(payload.contains("replace: prefix-list AS64496 {"));
        assert!(payload.contains("        203.0.112.0/22;\n"));
        // Nothing but policy-options.
        assert!(!payload.contains("protocols"));
        assert!(!payload.contains("interfaces"));
        assert!(!payload.contains("policy-statement"));
    }

    #[test]
    fn import_chains_are_optional() {
        let policies = [
            policy(64496, BGPQ4_OUTPUT),
        ];
        let payload = render_router_payload(&policies, true);
        assert!(payload.contains(
            "replace: policy-statement import-AS64496 {"
        ));
        assert!(payload.contains(
            "prefix-list-filter AS64496 orlonger;"
        ));
    }

    #[test]
    fn empty_policy_yields_empty_body() {
        // bgpq4 returning empty stdout is a success; the payload then
        // carries no lists at all.
        let policies = [policy(64496, "")];
        let payload = render_router_payload(&policies, false);
        assert_eq!(payload, "policy-options {\n}\n");
    }

    #[test]
    fn artifact_naming() {
        let policy = policy(13335, BGPQ4_OUTPUT);
        assert_eq!(policy_file_name(&policy), "AS13335_policy.txt");
    }

    #[test]
    fn combined_file_concatenates_verbatim() {
        let policies = [
            policy(64496, BGPQ4_OUTPUT),
            policy(64497, "no prefixes here\n"),
        ];
        let combined = render_combined(&policies);
        assert!(combined.contains("# AS64496 (AS64496)"));
        assert!(combined.contains(BGPQ4_OUTPUT));
        assert!(combined.contains("# AS64497 (AS64497)"));
    }
}
