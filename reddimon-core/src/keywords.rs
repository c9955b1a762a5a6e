use crate::types::RedditPost;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_KEYWORD_LIMIT: usize = 30;

const STOP_WORDS: &[&str] = &[
    "what", "when", "where", "which", "who", "why", "how", "this", "that", "with", "from", "your",
    "have", "will", "would", "could", "should", "them", "then", "than", "just", "like", "been",
    "were", "they", "want", "need", "some", "here", "there", "about", "into", "more", "their",
    "removed", "deleted", "edit", "updated", "reddit",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordFrequency {
    pub keyword: String,
    pub count: u32,
    pub engagement: i64,
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace().filter_map(|raw| {
        let word: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_')
            .flat_map(char::to_lowercase)
            .collect();
        if word.chars().count() > 3 && !STOP_WORDS.contains(&word.as_str()) {
            Some(word)
        } else {
            None
        }
    })
}

/// Count keyword occurrences across post titles and bodies.
///
/// Each occurrence also adds the post's `score + num_comments` to the word's
/// engagement. Results are ordered by count, ties broken by engagement.
pub fn keyword_frequencies(posts: &[RedditPost], limit: usize) -> Vec<KeywordFrequency> {
    let mut frequencies: HashMap<String, (u32, i64)> = HashMap::new();

    for post in posts {
        let engagement = post.engagement();
        let combined = format!("{} {}", post.title, post.selftext);
        for word in words(&combined) {
            let entry = frequencies.entry(word).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += engagement;
        }
    }

    let mut keywords: Vec<KeywordFrequency> = frequencies
        .into_iter()
        .map(|(keyword, (count, engagement))| KeywordFrequency {
            keyword,
            count,
            engagement,
        })
        .collect();

    keywords.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| b.engagement.cmp(&a.engagement))
            .then_with(|| a.keyword.cmp(&b.keyword))
    });
    keywords.truncate(limit);
    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(title: &str, selftext: &str, score: i64, num_comments: i64) -> RedditPost {
        RedditPost {
            id: title.to_string(),
            title: title.to_string(),
            selftext: selftext.to_string(),
            url: String::new(),
            score,
            num_comments,
            created_utc: 0,
        }
    }

    #[test]
    fn test_counts_and_orders_by_frequency() {
        let posts = vec![
            post("Async runtime benchmarks", "tokio runtime wins", 10, 2),
            post("Borrow checker woes", "", 5, 1),
            post("Runtime panics!", "", 1, 0),
        ];

        let keywords = keyword_frequencies(&posts, DEFAULT_KEYWORD_LIMIT);
        assert_eq!(keywords[0].keyword, "runtime");
        assert_eq!(keywords[0].count, 3);
        // 12 + 12 from the first post, 1 from the third
        assert_eq!(keywords[0].engagement, 25);
    }

    #[test]
    fn test_filters_short_words_stop_words_and_punctuation() {
        let posts = vec![post("What is this? The [deleted] crab", "", 1, 0)];
        let keywords = keyword_frequencies(&posts, DEFAULT_KEYWORD_LIMIT);
        let names: Vec<&str> = keywords.iter().map(|k| k.keyword.as_str()).collect();
        assert_eq!(names, vec!["crab"]);
    }

    #[test]
    fn test_engagement_breaks_ties_and_limit_applies() {
        let posts = vec![post("alpha", "", 1, 0), post("gamma", "", 50, 5)];
        let keywords = keyword_frequencies(&posts, 1);
        assert_eq!(keywords.len(), 1);
        assert_eq!(keywords[0].keyword, "gamma");
    }
}
