use std::collections::HashMap;

/// Substitutes `{key}` tokens from `data`.
///
/// Unresolved placeholders, and braces that never close, are left verbatim so a
/// missing value shows up in the rendered text instead of silently vanishing.
pub fn render(template: &str, data: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];

        match after_open.find(['{', '}']) {
            Some(close) if after_open.as_bytes()[close] == b'}' => {
                let key = &after_open[..close];
                match data.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            // Nested `{` or no closing brace: keep this brace literally and rescan after it.
            _ => {
                out.push('{');
                rest = after_open;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitutes_known_keys() {
        let rendered = render(
            "{vehicleName} is {remainingKm} km from {nextMileage} km",
            &data(&[
                ("vehicleName", "Golf"),
                ("remainingKm", "800"),
                ("nextMileage", "10000"),
            ]),
        );
        assert_eq!(rendered, "Golf is 800 km from 10000 km");
    }

    #[test]
    fn test_unresolved_placeholders_stay_verbatim() {
        let rendered = render("Service {vehicleName} at {nextMileage}", &data(&[("nextMileage", "20000")]));
        assert_eq!(rendered, "Service {vehicleName} at 20000");
    }

    #[test]
    fn test_unbalanced_braces() {
        let values = data(&[("a", "1")]);
        assert_eq!(render("open { never closes", &values), "open { never closes");
        assert_eq!(render("{{a}", &values), "{1");
        assert_eq!(render("close } alone {a}", &values), "close } alone 1");
        assert_eq!(render("", &values), "");
    }
}
