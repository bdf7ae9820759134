// Returned-variable markers and `{{KEY}}` placeholders.
//
// A line of script output of the form `@@fleetwatch:set KEY value` assigns `value`
// (rest of line, trailing whitespace trimmed) to `KEY` and is removed from the output.
// Any output line that happens to start with the marker is read as an assignment.

use std::collections::BTreeMap;

pub const MARKER: &str = "@@fleetwatch:set";

/// Split captured output into plain text and returned variables. Later assignments win.
pub fn extract_variables(output: &str) -> (String, BTreeMap<String, String>) {
    let mut plain = String::with_capacity(output.len());
    let mut vars = BTreeMap::new();
    for line in output.split_inclusive('\n') {
        match parse_marker_line(line) {
            Some((key, value)) => {
                vars.insert(key.to_string(), value.to_string());
            }
            None => plain.push_str(line),
        }
    }
    (plain, vars)
}

fn parse_marker_line(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix(MARKER)?;
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    let rest = rest.trim_start_matches([' ', '\t']);
    let (key, value) = match rest.find([' ', '\t']) {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest.trim_end(), ""),
    };
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim_end()))
}

/// Replace `{{KEY}}` for every key present in `env`. Unknown placeholders are left alone.
pub fn substitute_placeholders(body: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = &after[..end];
                match env.get(key.trim()) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("{{");
                        out.push_str(key);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_lines_become_variables() {
        let out = "starting\n@@fleetwatch:set VERSION 1.2.3   \n@@fleetwatch:set NOTE hello world\ndone\n";
        let (plain, vars) = extract_variables(out);
        assert_eq!(plain, "starting\ndone\n");
        assert_eq!(vars["VERSION"], "1.2.3");
        assert_eq!(vars["NOTE"], "hello world");
    }

    #[test]
    fn key_without_value_is_empty() {
        let (_, vars) = extract_variables("@@fleetwatch:set FLAG\n");
        assert_eq!(vars["FLAG"], "");
    }

    #[test]
    fn marker_must_be_followed_by_whitespace() {
        let (plain, vars) = extract_variables("@@fleetwatch:setX 1\n @@fleetwatch:set Y 2\n");
        assert!(vars.is_empty());
        assert_eq!(plain, "@@fleetwatch:setX 1\n @@fleetwatch:set Y 2\n");
    }

    #[test]
    fn placeholders_replaced_only_for_known_keys() {
        let env = BTreeMap::from([("HOST".to_string(), "db1".to_string())]);
        assert_eq!(
            substitute_placeholders("ping {{HOST}} {{ HOST }} {{OTHER}} {{open", &env),
            "ping db1 db1 {{OTHER}} {{open"
        );
    }
}
