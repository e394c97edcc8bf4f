use once_cell::sync::Lazy;
use regex::Regex;

static BOLD_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<(?:b|strong)>(.*?)</(?:b|strong)>").unwrap());
static ITALIC_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<(?:i|em)>(.*?)</(?:i|em)>").unwrap());
static CODE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<code>(.*?)</code>").unwrap());
static ANCHOR_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<a[^>]*href="([^"]*)"[^>]*>(.*?)</a>"#).unwrap());
static BREAK_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Converts a Matrix `m.text` body (which may carry light inline HTML) into
/// Gitter-flavored markdown for outbound `post_message` calls (spec.md §4.3,
/// §4.6.2 step 4).
///
/// This is a narrow regex pass, not a general HTML-to-Markdown engine: it
/// covers the emphasis tags a Matrix client actually sends for `**bold**`,
/// `*italic*` and `` `code` `` input, plus anchor unwrapping, and otherwise
/// strips unknown tags so stray markup never leaks into the Gitter room.
pub fn matrix_to_gitter(body: &str) -> String {
    let s = BOLD_TAG.replace_all(body, "**$1**");
    let s = ITALIC_TAG.replace_all(&s, "*$1*");
    let s = CODE_TAG.replace_all(&s, "`$1`");
    let s = ANCHOR_TAG.replace_all(&s, "[$2]($1)");
    let s = BREAK_TAG.replace_all(&s, "\n");
    let s = ANY_TAG.replace_all(&s, "");
    s.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_bold_and_italic() {
        assert_eq!(matrix_to_gitter("<b>hi</b> there"), "**hi** there");
        assert_eq!(matrix_to_gitter("<em>hi</em>"), "*hi*");
    }

    #[test]
    fn converts_code_and_links() {
        assert_eq!(matrix_to_gitter("<code>x = 1</code>"), "`x = 1`");
        assert_eq!(
            matrix_to_gitter(r#"<a href="https://example.org">site</a>"#),
            "[site](https://example.org)"
        );
    }

    #[test]
    fn plain_text_passes_through_unchanged() {
        assert_eq!(matrix_to_gitter("just text"), "just text");
    }

    #[test]
    fn unknown_tags_are_stripped() {
        assert_eq!(matrix_to_gitter("<div>hi</div>"), "hi");
    }
}
