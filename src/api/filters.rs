//! Translation of search filters into the API's `$filter` expression.
//!
//! Values of the same filter are OR'd inside parentheses, different filters
//! are AND'd. Integer values go out bare, everything else single-quoted.

use crate::searches::SearchFilter;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;

const DATE_FILTER: &str = "Date";
const ENUM_PREFIX: &str = "LexisNexis.ServicesApi.";

/// Filters whose values the API expects base64 encoded.
const ENCODED_FILTERS: &[&str] = &[
    "publicationtype",
    "location",
    "company",
    "people",
    "geography",
    "industry",
    "subject",
    "section",
];

pub fn build_filter_expression(filters: &[SearchFilter]) -> String {
    let mut groups: Vec<(&str, Vec<&str>)> = Vec::new();
    for filter in filters {
        match groups.iter_mut().find(|(name, _)| *name == filter.name) {
            Some((_, values)) => values.push(&filter.value),
            None => groups.push((&filter.name, vec![&filter.value])),
        }
    }

    groups
        .iter()
        .map(|(name, values)| field_clause(name, values))
        .collect::<Vec<_>>()
        .join(" and ")
}

fn field_clause(name: &str, values: &[&str]) -> String {
    let field = name.replace('_', "/");

    // each date value is an operator and a date, e.g. "ge 2020-01-01"
    if name == DATE_FILTER {
        let terms: Vec<String> = values
            .iter()
            .map(|v| {
                let condition = v.split_whitespace().collect::<Vec<_>>().join(" ");
                format!("{} {}", field, condition)
            })
            .collect();
        return format!("({})", terms.join(" and "));
    }

    let namespace = enum_namespace(name);
    let terms: Vec<String> = values
        .iter()
        .map(|v| format!("{} eq {}{}", field, namespace, literal(&encode_value(name, v))))
        .collect();
    if terms.len() == 1 {
        terms[0].clone()
    } else {
        format!("({})", terms.join(" or "))
    }
}

fn enum_namespace(name: &str) -> String {
    match name {
        "NegativeNews" | "NegativeNewsType" => format!("{}NegativeNewsType", ENUM_PREFIX),
        "Language" | "GroupDuplicates" | "SearchType" => format!("{}{}", ENUM_PREFIX, name),
        _ => String::new(),
    }
}

fn encode_value(name: &str, value: &str) -> String {
    if ENCODED_FILTERS.contains(&name.to_lowercase().as_str()) {
        STANDARD_NO_PAD.encode(value.as_bytes())
    } else {
        value.to_string()
    }
}

fn literal(value: &str) -> String {
    if value.parse::<i64>().is_ok() {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}
