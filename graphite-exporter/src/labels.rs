//! Label templating from dot-delimited series names.
//!
//! A label template is an arbitrary string in which `${N}` is replaced by the `N`th (zero-based)
//! segment of the series name split on `.`. With a series named `example.app1.US_East.dau`, the
//! template `${1}` yields `app1` and `${2}-${3}` yields `US_East-dau`.
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::error;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{(\d+)\}").expect("placeholder regex is valid"));

/// Applies a set of label templates to a series target.
///
/// Templates that do not contain `${` are copied verbatim. A template that contains `${` but no
/// well-formed placeholder, or that refers to a segment past the end of the target, is logged and
/// left out of the result; the remaining labels are still returned.
pub fn apply_label_templates(
    target: &str,
    templates: &IndexMap<String, String>,
) -> IndexMap<String, String> {
    let segments = target.split('.').collect::<Vec<_>>();
    let mut labels = IndexMap::with_capacity(templates.len());

    for (key, template) in templates {
        if !template.contains("${") {
            labels.insert(key.clone(), template.clone());
            continue;
        }

        match render_template(template, &segments) {
            Ok(value) => {
                labels.insert(key.clone(), value);
            }
            Err(reason) => {
                error!(series = target, label = %key, template = %template, "{}", reason);
            }
        }
    }

    labels
}

fn render_template(template: &str, segments: &[&str]) -> Result<String, String> {
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    let mut matched = false;

    for captures in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(digits)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        matched = true;

        let segment = digits
            .as_str()
            .parse::<usize>()
            .ok()
            .and_then(|index| segments.get(index))
            .ok_or_else(|| {
                format!(
                    "placeholder {} is out of range for a target with {} segments",
                    whole.as_str(),
                    segments.len()
                )
            })?;

        rendered.push_str(&template[last..whole.start()]);
        rendered.push_str(segment);
        last = whole.end();
    }

    if !matched {
        return Err("label template contains `${` but no `${N}` placeholder".to_owned());
    }

    rendered.push_str(&template[last..]);
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use proptest::prelude::*;

    use super::apply_label_templates;

    fn templates(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[test]
    fn test_substitutes_segments() {
        let labels = apply_label_templates(
            "example.app1.US_East.dau",
            &templates(&[("service", "${1}"), ("region", "${2}"), ("column", "${3}")]),
        );

        assert_eq!(labels["service"], "app1");
        assert_eq!(labels["region"], "US_East");
        assert_eq!(labels["column"], "dau");
        assert_eq!(labels.keys().collect::<Vec<_>>(), vec!["service", "region", "column"]);
    }

    #[test]
    fn test_multiple_placeholders_and_literal_text() {
        let labels = apply_label_templates(
            "example.app1.US_East.dau",
            &templates(&[("id", "${1}@${2}"), ("repeat", "${0}-${0}")]),
        );

        assert_eq!(labels["id"], "app1@US_East");
        assert_eq!(labels["repeat"], "example-example");
    }

    #[test]
    fn test_static_templates_pass_through() {
        let labels = apply_label_templates(
            "example.app1",
            &templates(&[("env", "production"), ("cost", "$5")]),
        );

        assert_eq!(labels["env"], "production");
        assert_eq!(labels["cost"], "$5");
    }

    #[test]
    fn test_malformed_template_is_omitted() {
        let labels = apply_label_templates(
            "example.app1",
            &templates(&[("bad", "${name}"), ("empty", "${}"), ("good", "${1}")]),
        );

        assert!(!labels.contains_key("bad"));
        assert!(!labels.contains_key("empty"));
        assert_eq!(labels["good"], "app1");
    }

    #[test]
    fn test_out_of_range_placeholder_is_omitted() {
        let labels =
            apply_label_templates("example.app1", &templates(&[("far", "${7}"), ("ok", "${0}")]));

        assert!(!labels.contains_key("far"));
        assert_eq!(labels["ok"], "example");
    }

    proptest! {
        #[test]
        fn test_placeholder_yields_segment(
            segments in proptest::collection::vec("[a-zA-Z0-9_-]{1,8}", 1..8),
            index in 0usize..10,
        ) {
            let target = segments.join(".");
            let template = format!("${{{index}}}");
            let labels = apply_label_templates(&target, &templates(&[("label", template.as_str())]));

            match segments.get(index) {
                Some(segment) => prop_assert_eq!(&labels["label"], segment),
                None => prop_assert!(labels.is_empty()),
            }
        }
    }
}
