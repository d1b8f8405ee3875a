//! Pulls the program body out of free-form model text.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A program lifted from one assistant response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateCode {
    pub language_tag: String,
    pub body: String,
}

/// Finds the first fenced block declaring a fixed language tag.
///
/// The tag match is exact and case-sensitive: a `python` extractor ignores
/// blocks fenced as `Python` or `python3`. Only the first matching block is
/// returned; later blocks are ignored.
#[derive(Debug, Clone)]
pub struct CodeExtractor {
    tag: String,
    fence: Regex,
}

impl CodeExtractor {
    pub fn new(tag: &str) -> Self {
        let pattern = format!(
            r"```{}[ \t]*\r?\n(?s:(.*?))(?:\r?\n)?[ \t]*```",
            regex::escape(tag)
        );
        Self {
            tag: tag.to_string(),
            // escaped literal inside a fixed template always compiles
            fence: Regex::new(&pattern).expect("fence pattern is valid"),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn extract(&self, model_text: &str) -> Option<CandidateCode> {
        let body = self.fence.captures(model_text)?.get(1)?.as_str();
        if body.trim().is_empty() {
            return None;
        }
        Some(CandidateCode {
            language_tag: self.tag.clone(),
            body: body.to_string(),
        })
    }
}

/// One-shot form of [`CodeExtractor::extract`].
pub fn extract(model_text: &str, expected_tag: &str) -> Option<CandidateCode> {
    CodeExtractor::new(expected_tag).extract(model_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_first_matching_block() {
        let text = "First:\n```python\nprint(1)\n```\nthen\n```python\nprint(2)\n```\n";
        let code = extract(text, "python").unwrap();
        assert_eq!(code.body, "print(1)");
        assert_eq!(code.language_tag, "python");

        let extractor = CodeExtractor::new("python");
        for _ in 0..3 {
            assert_eq!(extractor.extract(text), Some(code.clone()));
        }
    }

    #[test]
    fn test_no_block_is_none() {
        assert!(extract("The file has 3 rows.", "python").is_none());
        assert!(extract("```\nprint(1)\n```", "python").is_none());
    }

    #[test]
    fn test_tag_match_is_exact() {
        assert!(extract("```Python\nprint(1)\n```", "python").is_none());
        assert!(extract("```python3\nprint(1)\n```", "python").is_none());
        let text = "```sql\nselect 1\n```\n```python\nx = 1\n```";
        assert_eq!(extract(text, "python").unwrap().body, "x = 1");
    }

    #[test]
    fn test_multiline_body_preserved() {
        let text = "```python\nimport pandas as pd\n\ndf = pd.read_csv('/app/uploads/a.csv')\nprint(len(df))\n```";
        let code = extract(text, "python").unwrap();
        assert_eq!(
            code.body,
            "import pandas as pd\n\ndf = pd.read_csv('/app/uploads/a.csv')\nprint(len(df))"
        );
    }

    #[test]
    fn test_crlf_fences() {
        let text = "```python\r\nprint(3)\r\n```";
        assert_eq!(extract(text, "python").unwrap().body, "print(3)");
    }

    #[test]
    fn test_blank_block_is_none() {
        assert!(extract("```python\n\n```", "python").is_none());
    }

    #[test]
    fn test_unterminated_block_is_none() {
        assert!(extract("```python\nprint(1)\n", "python").is_none());
    }
}
