pub mod extractor;
pub mod llm;
pub mod media;
pub mod parser;
pub mod standardizer;
pub mod tuner;

/// Timestamp used for processing dates, edit records and exports.
pub(crate) fn now_iso() -> String {
    chrono::Local::now().to_rfc3339()
}

/// Make a string usable as a file name on common filesystems.
pub(crate) fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_filename_replaces_reserved_characters() {
        assert_eq!(safe_filename("a/b\\c:d"), "a_b_c_d");
        assert_eq!(safe_filename("龙腾四海"), "龙腾四海");
    }
}
