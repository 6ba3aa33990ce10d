use anyhow::Result;
use regex::Regex;

/// Punctuation that should not carry surrounding ASCII spaces.
const CJK_PUNCT: &str = "，。！？；：、“”‘’（）【】《》";

/// Punctuation collapsed when repeated.
const DEDUP_PUNCT: &str = "。！？；：，、";

/// Punctuation dropped when dangling at the end of a line.
const DANGLING_PUNCT: &str = "，；：、";

/// Cleans up irregular spacing and punctuation left behind by scraped or
/// OCR'd novel text. Applied to both titles and contents when the parser's
/// `clean_text` toggle is on.
#[derive(Debug)]
pub struct TextNormalizer {
    spaces: Regex,
    ascii_ellipsis: Regex,
    cjk_ellipsis: Regex,
}

impl TextNormalizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            spaces: Regex::new(" +")?,
            ascii_ellipsis: Regex::new(r"\.\.\.+")?,
            cjk_ellipsis: Regex::new("。。。+")?,
        })
    }

    pub fn normalize(&self, text: &str) -> String {
        let mut text = self.spaces.replace_all(text.trim(), " ").into_owned();

        for punct in CJK_PUNCT.chars() {
            text = text.replace(&format!(" {}", punct), &punct.to_string());
            text = text.replace(&format!("{} ", punct), &punct.to_string());
        }

        // Ellipses first: a 。。。 run must become an ellipsis before the
        // repeat collapse would reduce it to a single stop.
        text = self.ascii_ellipsis.replace_all(&text, "...").into_owned();
        text = self.cjk_ellipsis.replace_all(&text, "......").into_owned();

        text = collapse_repeats(&text);

        // Curly quotes to their ASCII forms.
        text = text
            .replace('“', "\"")
            .replace('”', "\"")
            .replace('‘', "'")
            .replace('’', "'");

        // Bracket variants to square brackets.
        text = text
            .replace('［', "[")
            .replace('］', "]")
            .replace('【', "[")
            .replace('】', "]");

        strip_dangling_punctuation(&text)
    }
}

fn collapse_repeats(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if prev == Some(c) && DEDUP_PUNCT.contains(c) {
            continue;
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

fn strip_dangling_punctuation(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            let line = line.trim_end();
            match line.chars().last() {
                Some(last) if DANGLING_PUNCT.contains(last) => {
                    let cut = line.len() - last.len_utf8();
                    &line[..cut]
                }
                _ => line,
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_ascii_spaces() {
        let n = TextNormalizer::new().unwrap();
        assert_eq!(n.normalize("你好   世界"), "你好 世界");
    }

    #[test]
    fn removes_spaces_around_cjk_punctuation() {
        let n = TextNormalizer::new().unwrap();
        assert_eq!(n.normalize("你好 ， 世界 。"), "你好，世界。");
    }

    #[test]
    fn collapses_repeated_punctuation() {
        let n = TextNormalizer::new().unwrap();
        assert_eq!(n.normalize("什么！！！真的？"), "什么！真的？");
        assert_eq!(n.normalize("好，，，吧"), "好，吧");
    }

    #[test]
    fn normalizes_quotes_and_brackets() {
        let n = TextNormalizer::new().unwrap();
        assert_eq!(n.normalize("“你好”"), "\"你好\"");
        assert_eq!(n.normalize("【注】［补］"), "[注][补]");
    }

    #[test]
    fn normalizes_ellipses() {
        let n = TextNormalizer::new().unwrap();
        assert_eq!(n.normalize("等等....."), "等等...");
        assert_eq!(n.normalize("等等。。。。"), "等等......");
    }

    #[test]
    fn strips_dangling_line_end_punctuation() {
        let n = TextNormalizer::new().unwrap();
        assert_eq!(n.normalize("第一行，\n第二行。"), "第一行\n第二行。");
    }
}
