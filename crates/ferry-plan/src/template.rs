//! OpenShift template parameter processing
//!
//! Binds the `NAME` parameter to the VM's name, fills every other parameter
//! with a generated value (from its generator expression when it has one)
//! and substitutes `${PARAM}` / `${{PARAM}}` references in the template's
//! objects.

use std::collections::BTreeMap;

use rand::Rng;
use serde_json::Value;

use ferry_common::kubevirt::Template;
use ferry_common::{Error, Result};

/// Parameter bound to the VM name
pub const NAME_PARAMETER: &str = "NAME";

const GENERATE_EXPRESSION: &str = "expression";
const DEFAULT_VALUE_LEN: usize = 8;
const LOWER_ALNUM: &str = "abcdefghijklmnopqrstuvwxyz0123456789";
const DIGITS: &str = "0123456789";
const ALPHA: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SYMBOLS: &str = "~!@#$%^&*()-_+={}[]\\|<,>.?/\"';:`";

/// Resolve every parameter of `template` and substitute the values into its
/// objects in place. Returns the resolved values.
pub fn process(template: &mut Template, vm_name: &str) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    let mut rng = rand::thread_rng();
    for param in &template.parameters {
        let value = if param.name == NAME_PARAMETER {
            vm_name.to_string()
        } else {
            match (param.generate.as_deref(), param.from.as_deref()) {
                (Some(GENERATE_EXPRESSION), Some(expr)) => generate(expr, &mut rng)?,
                _ => random_value(&mut rng, DEFAULT_VALUE_LEN),
            }
        };
        values.insert(param.name.clone(), value);
    }
    for object in &mut template.objects {
        substitute(object, &values);
    }
    Ok(values)
}

fn random_value(rng: &mut impl Rng, len: usize) -> String {
    let alphabet: Vec<char> = LOWER_ALNUM.chars().collect();
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
        .collect()
}

/// Expand a generator expression such as `[a-z0-9]{8}` or `admin\d{4}`.
///
/// Supported: literal characters, bracket ranges, the classes `\w`, `\d`,
/// `\a` (letters) and `\A` (symbols), and a `{n}` repeat after any of them.
pub fn generate(expr: &str, rng: &mut impl Rng) -> Result<String> {
    let malformed = |msg: &str| Error::validation(format!("generator {:?}: {}", expr, msg));
    let chars: Vec<char> = expr.chars().collect();
    let mut out = String::new();
    let mut i = 0;

    while i < chars.len() {
        let alphabet: Vec<char> = match chars[i] {
            '[' => {
                let end = chars[i..]
                    .iter()
                    .position(|&c| c == ']')
                    .map(|p| i + p)
                    .ok_or_else(|| malformed("unterminated range"))?;
                let set = bracket_set(&chars[i + 1..end]).ok_or_else(|| malformed("bad range"))?;
                i = end + 1;
                set
            }
            '\\' => {
                let class = chars.get(i + 1).ok_or_else(|| malformed("dangling escape"))?;
                i += 2;
                match class {
                    'w' => format!("{}{}_", ALPHA, DIGITS).chars().collect(),
                    'd' => DIGITS.chars().collect(),
                    'a' => ALPHA.chars().collect(),
                    'A' => SYMBOLS.chars().collect(),
                    other => vec![*other],
                }
            }
            literal => {
                i += 1;
                vec![literal]
            }
        };

        let mut count = 1;
        if chars.get(i) == Some(&'{') {
            let end = chars[i..]
                .iter()
                .position(|&c| c == '}')
                .map(|p| i + p)
                .ok_or_else(|| malformed("unterminated repeat"))?;
            let digits: String = chars[i + 1..end].iter().collect();
            count = digits.parse().map_err(|_| malformed("bad repeat count"))?;
            i = end + 1;
        }
        if alphabet.is_empty() {
            return Err(malformed("empty range"));
        }
        for _ in 0..count {
            out.push(alphabet[rng.gen_range(0..alphabet.len())]);
        }
    }
    Ok(out)
}

fn bracket_set(body: &[char]) -> Option<Vec<char>> {
    let mut set = Vec::new();
    let mut i = 0;
    while i < body.len() {
        if i + 2 < body.len() && body[i + 1] == '-' {
            let (lo, hi) = (body[i], body[i + 2]);
            if lo > hi {
                return None;
            }
            set.extend(lo..=hi);
            i += 3;
        } else if body[i] == '\\' && i + 1 < body.len() {
            match body[i + 1] {
                'w' => set.extend(format!("{}{}_", ALPHA, DIGITS).chars()),
                'd' => set.extend(DIGITS.chars()),
                'a' => set.extend(ALPHA.chars()),
                'A' => set.extend(SYMBOLS.chars()),
                other => set.push(other),
            }
            i += 2;
        } else {
            set.push(body[i]);
            i += 1;
        }
    }
    Some(set)
}

/// Replace parameter references in every string of `value`.
///
/// A string that is exactly `${{P}}` is replaced by the value of `P` parsed
/// as JSON (so numbers and booleans keep their type); `${P}` anywhere in a
/// string is replaced textually. Unknown parameters are left as written.
pub fn substitute(value: &mut Value, params: &BTreeMap<String, String>) {
    match value {
        Value::String(s) => {
            if let Some(name) = s.strip_prefix("${{").and_then(|r| r.strip_suffix("}}")) {
                if let Some(v) = params.get(name) {
                    *value = serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.clone()));
                    return;
                }
            }
            for (name, v) in params {
                let token = format!("${{{}}}", name);
                if s.contains(&token) {
                    *s = s.replace(&token, v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, params)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute(v, params)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_common::kubevirt::TemplateParameter;
    use rstest::rstest;
    use serde_json::json;

    fn param(name: &str, generate: Option<&str>, from: Option<&str>) -> TemplateParameter {
        TemplateParameter {
            name: name.to_string(),
            generate: generate.map(str::to_string),
            from: from.map(str::to_string),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("[a-z0-9]{8}", 8)]
    #[case("admin\\d{4}", 9)]
    #[case("\\w{12}", 12)]
    #[case("x", 1)]
    fn test_generated_values_have_the_expected_length(#[case] expr: &str, #[case] len: usize) {
        let value = generate(expr, &mut rand::thread_rng()).unwrap();
        assert_eq!(value.chars().count(), len, "{value}");
    }

    #[test]
    fn test_ranges_constrain_the_alphabet() {
        let value = generate("[a-c]{64}", &mut rand::thread_rng()).unwrap();
        assert!(value.chars().all(|c| ('a'..='c').contains(&c)));
        let value = generate("admin\\d{4}", &mut rand::thread_rng()).unwrap();
        assert!(value.starts_with("admin"));
        assert!(value[5..].chars().all(|c| c.is_ascii_digit()));
    }

    #[rstest]
    #[case("[a-z")]
    #[case("[z-a]{2}")]
    #[case("a{x}")]
    #[case("\\")]
    fn test_malformed_expressions_are_rejected(#[case] expr: &str) {
        assert!(generate(expr, &mut rand::thread_rng()).is_err());
    }

    #[test]
    fn test_name_is_bound_and_others_are_generated() {
        let mut template = Template {
            parameters: vec![
                param(NAME_PARAMETER, None, None),
                param("CLOUD_USER_PASSWORD", Some("expression"), Some("[a-z0-9]{4}-[a-z0-9]{4}")),
                param("DATA_SOURCE_NAME", None, None),
            ],
            objects: vec![json!({
                "metadata": { "name": "${NAME}", "labels": { "app": "${NAME}" } },
                "spec": { "password": "${CLOUD_USER_PASSWORD}" }
            })],
            ..Default::default()
        };
        let values = process(&mut template, "web").unwrap();
        assert_eq!(values[NAME_PARAMETER], "web");
        assert_eq!(values["DATA_SOURCE_NAME"].len(), DEFAULT_VALUE_LEN);

        let obj = &template.objects[0];
        assert_eq!(obj["metadata"]["name"], "web");
        assert_eq!(obj["metadata"]["labels"]["app"], "web");
        let password = obj["spec"]["password"].as_str().unwrap();
        assert_eq!(password.len(), 9);
        assert_eq!(&password[4..5], "-");
    }

    #[test]
    fn test_typed_references_keep_their_json_type() {
        let params = BTreeMap::from([
            ("CPUS".to_string(), "4".to_string()),
            ("NAME".to_string(), "web".to_string()),
        ]);
        let mut value = json!({ "cores": "${{CPUS}}", "name": "${{NAME}}", "other": "${MISSING}" });
        substitute(&mut value, &params);
        assert_eq!(value["cores"], 4);
        assert_eq!(value["name"], "web");
        assert_eq!(value["other"], "${MISSING}");
    }
}
