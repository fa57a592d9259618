//! Publication checks on the final article. The result is stored alongside
//! the article and never blocks the draft from reaching `SAVED`.

use crate::draft::{FinalArticle, Validation};

const MAX_TITLE_CHARS: usize = 120;
const MIN_BODY_WORDS: usize = 300;
const META_DESCRIPTION_CHARS: std::ops::RangeInclusive<usize> = 50..=160;

fn is_slug(slug: &str) -> bool {
    !slug.is_empty()
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--")
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

pub fn validate(article: &FinalArticle) -> Validation {
    let mut failures = Vec::new();
    let mut warnings = Vec::new();

    let title_chars = article.title.trim().chars().count();
    if title_chars == 0 {
        failures.push("title is empty".to_string());
    } else if title_chars > MAX_TITLE_CHARS {
        failures.push(format!(
            "title is {title_chars} characters (max {MAX_TITLE_CHARS})"
        ));
    }

    if !is_slug(&article.slug) {
        failures.push(format!("slug `{}` is not lowercase-hyphenated", article.slug));
    }

    let words = article.body.split_whitespace().count();
    if words < MIN_BODY_WORDS {
        failures.push(format!("body has {words} words (min {MIN_BODY_WORDS})"));
    }

    let meta_chars = article.meta_description.trim().chars().count();
    if !META_DESCRIPTION_CHARS.contains(&meta_chars) {
        warnings.push(format!(
            "meta description is {meta_chars} characters (expected {}-{})",
            META_DESCRIPTION_CHARS.start(),
            META_DESCRIPTION_CHARS.end()
        ));
    }

    if article.tags.iter().all(|t| t.trim().is_empty()) {
        warnings.push("no tags".to_string());
    }

    if !article.body.lines().any(|l| l.trim_start().starts_with("## ")) {
        warnings.push("body has no section headings".to_string());
    }

    Validation {
        passed: failures.is_empty(),
        failures,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article() -> FinalArticle {
        FinalArticle {
            title: "Rates stay put for now".into(),
            slug: "rates-stay-put-for-now".into(),
            meta_description: "The central bank kept its policy rate unchanged. What it means."
                .into(),
            body: format!("## Summary\n{}", "word ".repeat(300)),
            tags: vec!["rates".into()],
        }
    }

    #[test]
    fn clean_article_passes_without_warnings() {
        let v = validate(&article());
        assert!(v.passed, "{:?}", v.failures);
        assert!(v.warnings.is_empty(), "{:?}", v.warnings);
    }

    #[test]
    fn short_body_and_bad_slug_fail() {
        let mut a = article();
        a.body = "## Summary\ntoo short".into();
        a.slug = "Rates Stay Put".into();
        let v = validate(&a);
        assert!(!v.passed);
        assert_eq!(v.failures.len(), 2);
    }

    #[test]
    fn long_title_fails() {
        let mut a = article();
        a.title = "x".repeat(121);
        assert!(!validate(&a).passed);
    }

    #[test]
    fn cosmetic_problems_only_warn() {
        let mut a = article();
        a.meta_description = "short".into();
        a.tags.clear();
        a.body = "word ".repeat(300);
        let v = validate(&a);
        assert!(v.passed);
        assert_eq!(v.warnings.len(), 3);
    }

    #[test]
    fn slug_rules() {
        assert!(is_slug("a-b-2024"));
        assert!(!is_slug(""));
        assert!(!is_slug("-a"));
        assert!(!is_slug("a--b"));
        assert!(!is_slug("a_b"));
    }
}
