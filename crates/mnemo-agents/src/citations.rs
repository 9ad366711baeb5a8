use once_cell::sync::Lazy;
use regex::Regex;

static CITATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d+)\]").expect("citation pattern compiles"));

/// Check every `[n]` citation in a response against the retrieved source
/// list. Returns the invalid citation numbers (out of range or zero), empty
/// when all citations validate.
pub fn invalid_citations(text: &str, source_count: usize) -> Vec<usize> {
    let mut invalid = Vec::new();
    for caps in CITATION_RE.captures_iter(text) {
        let Ok(n) = caps[1].parse::<usize>() else {
            continue;
        };
        if n == 0 || n > source_count {
            invalid.push(n);
        }
    }
    invalid.sort_unstable();
    invalid.dedup();
    invalid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_citations_pass() {
        assert!(invalid_citations("Rust is fast [1] and safe [2].", 2).is_empty());
    }

    #[test]
    fn out_of_range_citations_are_reported() {
        assert_eq!(invalid_citations("claim [3]", 2), vec![3]);
        assert_eq!(invalid_citations("claim [0]", 2), vec![0]);
    }

    #[test]
    fn duplicates_are_deduped() {
        assert_eq!(invalid_citations("x [5] y [5]", 2), vec![5]);
    }
}
