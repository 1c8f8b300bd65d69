/// Literal keyword matching for `keyword_catch` nodes and keyword triggers
///
/// Matching is case-insensitive. `Contains` looks for the keyword anywhere in
/// the text; `Token` requires it to line up with whole words.

use crate::flow::types::MatchMode;

/// First keyword (in configured order) that matches `text`
pub fn find_match<'a>(text: &str, keywords: &'a [String], mode: MatchMode) -> Option<&'a str> {
    keywords
        .iter()
        .map(String::as_str)
        .find(|keyword| matches_keyword(text, keyword, mode))
}

pub fn matches_keyword(text: &str, keyword: &str, mode: MatchMode) -> bool {
    let keyword = keyword.trim().to_lowercase();
    if keyword.is_empty() {
        return false;
    }

    match mode {
        MatchMode::Contains => text.to_lowercase().contains(&keyword),
        MatchMode::Token => {
            let words = tokenize(text);
            let wanted = tokenize(&keyword);
            !wanted.is_empty() && words.windows(wanted.len()).any(|window| window == wanted.as_slice())
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}
