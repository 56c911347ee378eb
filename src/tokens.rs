const HAN_CHARS_PER_TOKEN: f64 = 1.5;
const OTHER_CHARS_PER_TOKEN: f64 = 4.0;

fn is_han(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// Rough token count for text the provider did not report usage for.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let (han, other) = text.chars().fold((0u64, 0u64), |(han, other), c| {
        if is_han(c) {
            (han + 1, other)
        } else {
            (han, other + 1)
        }
    });
    let estimate = (han as f64 / HAN_CHARS_PER_TOKEN + other as f64 / OTHER_CHARS_PER_TOKEN).round();
    (estimate as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::estimate_tokens;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn short_text_floors_at_one() {
        assert_eq!(estimate_tokens("a"), 1);
        assert!(estimate_tokens("hello") >= 1);
    }

    #[test]
    fn han_counts_denser_than_latin() {
        assert_eq!(estimate_tokens("你好"), estimate_tokens("你好"));
        // 2 / 1.5 = 1.33 -> 1
        assert_eq!(estimate_tokens("你好"), 1);
        // 6 / 1.5 = 4
        assert_eq!(estimate_tokens("你好你好你好"), 4);
        // 16 / 4 = 4
        assert_eq!(estimate_tokens("abcdefghijklmnop"), 4);
    }

    #[test]
    fn mixed_text_sums_both_rates() {
        // 3 / 1.5 + 8 / 4 = 4
        assert_eq!(estimate_tokens("你好吗 hello!!"), 4);
    }
}
