use std::borrow::Cow;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use rust_decimal::Decimal;

use crate::types::DocumentType;

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

re!(re_artifacts, "[\u{FFFD}\u{00A6}\u{00AC}\u{00B8}\u{200B}\u{200C}\u{200D}\u{2060}\u{FEFF}]");
re!(re_token, r"[^\s]+");
re!(re_currency_space, r"([$€£¥])[ \t]+(\d)");
re!(re_european_amount, r"\b(\d{1,3}(?:\.\d{3})+),(\d{2})\b");
re!(re_decimal_comma, r"(\d),(\d{2})\b");
re!(re_spaced_decimal, r"(\d) ?([.,]) (\d{2})\b|(\d) ([.,]) ?(\d{2})\b");
re!(re_space_before_punct, r"[ \t]+([,;:!?])");
re!(re_multi_space, r"[ \t]{2,}");
re!(re_trailing_space, r"(?m)[ \t]+$");
re!(re_blank_lines, r"\n{3,}");

re!(re_date_dmy, r"\b(\d{1,2})[.\-](\d{1,2})[.\-](\d{2,4})\b");
re!(re_date_iso_spaced, r"\b(\d{4}) ?- ?(\d{2}) ?- ?(\d{2})\b");
re!(re_dollar_amount, r"\$(\d{1,3}(?:,\d{3})+|\d+)(?:\.(\d{1,2}))?\b");

/// Upper bound on correction rounds; rewrites converge in one or two.
const MAX_ROUNDS: usize = 4;

/// Deterministic text clean-up for known recognizer mistakes. Financial
/// document types additionally get date and amount normalization.
/// Applying it to its own output changes nothing.
pub fn correct(text: &str, doc: DocumentType) -> String {
    let mut current = text.to_string();
    for _ in 0..MAX_ROUNDS {
        let next = correct_once(&current, doc);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn correct_once(text: &str, doc: DocumentType) -> String {
    let text = strip_artifacts(text);
    let text = fix_digit_confusions(&text);
    let text = normalize_currency_spacing(&text);
    let text = normalize_decimal_separators(&text);
    let text = if doc.is_financial() {
        let dates = normalize_dates(&text);
        normalize_amounts(&dates).into_owned()
    } else {
        text
    };
    collapse_whitespace(&text)
}

pub fn strip_artifacts(text: &str) -> Cow<'_, str> {
    re_artifacts().replace_all(text, "")
}

/// Inside tokens that are mostly digits, read `O`/`o` as 0 and `l`/`I`/`|` as 1.
pub fn fix_digit_confusions(text: &str) -> Cow<'_, str> {
    re_token().replace_all(text, |caps: &Captures| {
        let token = &caps[0];
        let digits = token.chars().filter(|c| c.is_ascii_digit()).count();
        let confusable = token.chars().filter(|c| matches!(c, 'O' | 'o' | 'l' | 'I' | '|')).count();
        let letters = token.chars().filter(|c| c.is_alphabetic()).count();
        // Every letter in the token must be confusable, and digits must dominate.
        if digits == 0 || confusable == 0 || letters > confusable || digits < confusable {
            return token.to_string();
        }
        token
            .chars()
            .map(|c| match c {
                'O' | 'o' => '0',
                'l' | 'I' | '|' => '1',
                other => other,
            })
            .collect()
    })
}

pub fn normalize_currency_spacing(text: &str) -> Cow<'_, str> {
    re_currency_space().replace_all(text, "$1$2")
}

/// `1.234,56` → `1234.56`, `12,50` → `12.50`, `12 . 50` → `12.50`.
pub fn normalize_decimal_separators(text: &str) -> String {
    let text = re_european_amount().replace_all(text, |caps: &Captures| {
        format!("{}.{}", caps[1].replace('.', ""), &caps[2])
    });
    let text = re_spaced_decimal().replace_all(&text, |caps: &Captures| {
        let (a, sep, b) = match caps.get(1) {
            Some(a) => (a.as_str(), &caps[2], &caps[3]),
            None => (&caps[4], &caps[5], &caps[6]),
        };
        format!("{a}{sep}{b}")
    });
    re_decimal_comma().replace_all(&text, "$1.$2").into_owned()
}

/// Financial dates: `15.01.2024` / `15-01-2024` → `15/01/2024`, `2024 - 01 - 15` → `2024-01-15`.
pub fn normalize_dates(text: &str) -> String {
    let text = re_date_iso_spaced().replace_all(text, "$1-$2-$3");
    re_date_dmy()
        .replace_all(&text, |caps: &Captures| {
            let day: u32 = caps[1].parse().unwrap_or(0);
            let month: u32 = caps[2].parse().unwrap_or(0);
            if (1..=31).contains(&day) && (1..=12).contains(&month) {
                format!("{}/{}/{}", &caps[1], &caps[2], &caps[3])
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// `$1,234.5` → `$1234.50`, `$12` stays `$12`.
pub fn normalize_amounts(text: &str) -> Cow<'_, str> {
    re_dollar_amount().replace_all(text, |caps: &Captures| {
        let Some(cents) = caps.get(2) else {
            return format!("${}", caps[1].replace(',', ""));
        };
        let raw = format!("{}.{}", caps[1].replace(',', ""), cents.as_str());
        match Decimal::from_str(&raw) {
            Ok(d) => format!("${:.2}", d.round_dp(2)),
            Err(_) => caps[0].to_string(),
        }
    })
}

pub fn collapse_whitespace(text: &str) -> String {
    let text = re_space_before_punct().replace_all(text, "$1");
    let text = re_multi_space().replace_all(&text, " ");
    let text = re_trailing_space().replace_all(&text, "");
    let text = re_blank_lines().replace_all(&text, "\n\n");
    text.trim_matches('\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_context_confusions() {
        assert_eq!(fix_digit_confusions("TOTAL 1O.5O"), "TOTAL 10.50");
        assert_eq!(fix_digit_confusions("2O24-0l-15"), "2024-01-15");
        assert_eq!(fix_digit_confusions("Item l2 pieces"), "Item 12 pieces");
        // Words stay words.
        assert_eq!(fix_digit_confusions("COOL Oil Inc"), "COOL Oil Inc");
        assert_eq!(fix_digit_confusions("Route 66"), "Route 66");
    }

    #[test]
    fn currency_spacing() {
        assert_eq!(normalize_currency_spacing("$ 5.50 and € 3"), "$5.50 and €3");
    }

    #[test]
    fn decimal_separators() {
        assert_eq!(normalize_decimal_separators("1.234,56"), "1234.56");
        assert_eq!(normalize_decimal_separators("Total 12,50"), "Total 12.50");
        assert_eq!(normalize_decimal_separators("Tax 0 . 99"), "Tax 0.99");
        assert_eq!(normalize_decimal_separators("4 ,20"), "4.20");
        // Thousands groups are left alone.
        assert_eq!(normalize_decimal_separators("1,234.56"), "1,234.56");
    }

    #[test]
    fn whitespace_and_artifacts() {
        assert_eq!(
            correct(
                "ACME\u{FFFD} STORE ,  Main St\u{200B} !  \n\n\n\nThanks   ",
                DocumentType::General
            ),
            "ACME STORE, Main St!\n\nThanks"
        );
    }

    #[test]
    fn financial_pass_normalizes_dates_and_amounts() {
        let text = "Date: 15.01.2024\nISO 2024 - 01 - 15\nSubtotal $1,234.5\nTip $ 3";
        assert_eq!(
            correct(text, DocumentType::Receipt),
            "Date: 15/01/2024\nISO 2024-01-15\nSubtotal $1234.50\nTip $3"
        );
    }

    #[test]
    fn financial_pass_only_for_financial_types() {
        let text = "Version 15.01.2024 costs $1,234.5";
        assert_eq!(correct(text, DocumentType::Document), text);
        assert_ne!(correct(text, DocumentType::Invoice), text);
    }

    #[test]
    fn non_dates_are_untouched() {
        assert_eq!(normalize_dates("Build 45.77.2024"), "Build 45.77.2024");
    }

    #[test]
    fn correction_is_idempotent() {
        let corpus = [
            "",
            "STARBUCKS\nTOTAL $ 1O,5O\nVISA ****1234",
            "1.234,56 EUR  ,  paid ; thanks !",
            "$ $ 12 , 5 0",
            "l l l 0 O o |",
            "2O24 - O1 - 15  \t \n\n\n\n\n end",
            "Date 31-12-99 total $0.5 tax $ 1,000",
            "\u{FEFF}\u{00AC}weird\u{00A6}glyphs\u{00B8}",
            "1,2,3,4,5,6,7,8,99",
            "12 . 34 . 56 , 78",
            "a ,b ,c ,  d",
        ];
        for doc in DocumentType::ALL {
            for text in corpus {
                let once = correct(text, doc);
                assert_eq!(correct(&once, doc), once, "{doc}: {text:?}");
            }
        }
    }
}
