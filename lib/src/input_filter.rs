//! The input filter applied to every user-supplied path component and image
//! tag before use (spec §6). Allowed characters are `A-Z a-z 0-9 _ : . + -`,
//! plus `/` when the caller permits; every other byte is stripped.

/// Filter a user-supplied string down to the allowed character set.
///
/// `allow_slash` should be true for path-like values (volume map
/// source/target) and for `docker`/`local` image tags, false for image
/// type names and other bare tokens.
pub fn filter_input(raw: &str, allow_slash: bool) -> String {
    raw.chars()
        .filter(|&c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '_' | ':' | '.' | '+' | '-')
                || (allow_slash && c == '/')
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_disallowed_bytes() {
        assert_eq!(filter_input("foo bar", false), "foobar");
        assert_eq!(filter_input("foo;rm -rf /", false), "foorm-rf");
        assert_eq!(filter_input("foo;rm -rf /", true), "foorm-rf/");
    }

    #[test]
    fn keeps_allowed_set() {
        let allowed = "AZaz09_:.+-";
        assert_eq!(filter_input(allowed, false), allowed);
    }

    #[test]
    fn slash_only_when_permitted() {
        assert_eq!(filter_input("a/b", false), "ab");
        assert_eq!(filter_input("a/b", true), "a/b");
    }

    #[test]
    fn empty_in_empty_out() {
        assert_eq!(filter_input("", true), "");
        assert_eq!(filter_input("!@#$%^&*()", false), "");
    }
}
