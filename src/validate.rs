use std::sync::LazyLock;

use regex::Regex;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[a-zа-яё0-9]+[a-zа-яё0-9 :_-]*[a-zа-яё0-9]+$").expect("valid name regex")
});

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(http://www\.|https://www\.|http://|https://)?[a-z0-9]+([\-\.][a-z0-9]+)*\.[a-z]{2,5}(:[0-9]{1,5})?(/.*)?$",
    )
    .expect("valid url regex")
});

/// Length check in characters, inclusive on both ends.
pub fn is_length_valid(s: &str, min: usize, max: usize) -> bool {
    let len = s.chars().count();
    len >= min && len <= max
}

/// Display names: 2..=100 characters, latin/cyrillic letters and digits,
/// with spaces, `:`, `_` and `-` allowed only between them.
pub fn is_name_valid(name: &str) -> bool {
    is_length_valid(name, 2, 100) && NAME_RE.is_match(name)
}

pub fn is_title_valid(title: &str) -> bool {
    is_length_valid(title, 2, 100)
}

pub fn is_url_valid(url: &str) -> bool {
    URL_RE.is_match(url)
}
