use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static BATCH_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-D])\s*[=:]?\s*(\d+)").expect("batch entry regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// `"A= 10, B= 11   C= 11, D=  10"` -> `{A: 10, B: 11, C: 11, D: 10}`.
pub fn parse_batch_info(text: &str) -> BTreeMap<char, u32> {
    let flat = text.replace(',', " ");
    let flat = WHITESPACE.replace_all(flat.trim(), " ");

    let mut out = BTreeMap::new();
    for caps in BATCH_ENTRY.captures_iter(&flat) {
        let Some(letter) = caps.get(1) else {
            continue;
        };
        // "LAB10" is not batch B.
        let glued = flat[..letter.start()]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_alphabetic());
        if glued {
            continue;
        }
        let Some(n) = caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok()) else {
            continue;
        };
        if let Some(c) = letter.as_str().chars().next() {
            out.insert(c, n);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_irregular_spacing_and_commas() {
        let parsed = parse_batch_info("A= 10, B= 11            C= 11, D=  10");
        let expected: BTreeMap<char, u32> =
            [('A', 10), ('B', 11), ('C', 11), ('D', 10)].into_iter().collect();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn empty_and_unrelated_text_yield_empty_map() {
        assert!(parse_batch_info("").is_empty());
        assert!(parse_batch_info("Theory Subjects").is_empty());
        assert!(parse_batch_info("DBMS(LAB)").is_empty());
    }

    #[test]
    fn accepts_colon_and_missing_separator() {
        let parsed = parse_batch_info("DBMS (LAB) A:12 B 9");
        assert_eq!(parsed.get(&'A'), Some(&12));
        assert_eq!(parsed.get(&'B'), Some(&9));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn is_idempotent() {
        let s = "A=10, C=7";
        assert_eq!(parse_batch_info(s), parse_batch_info(s));
    }
}
