//! Review records as scraped and as persisted in `reviews.json`.

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

/// Persisted review, keyed by a stable string id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
    /// ISO-8601 timestamp as reported by the source
    #[serde(default, alias = "publishedAtDate")]
    pub published_at: Option<String>,
    #[serde(default, alias = "reviewUrl")]
    pub review_url: Option<String>,
    #[serde(default, alias = "reviewImageUrls")]
    pub image_urls: Vec<String>,
}

/// Raw review as returned by a review source, before ids are assigned.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedReview {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub published_at_date: Option<String>,
    #[serde(default)]
    pub review_url: Option<String>,
    #[serde(default)]
    pub review_image_urls: Option<Vec<String>>,
}

impl Review {
    /// Assigns ids by scrape order.
    pub fn from_scraped(scraped: Vec<ScrapedReview>) -> Vec<Review> {
        scraped
            .into_iter()
            .enumerate()
            .map(|(idx, raw)| Review {
                id: idx.to_string(),
                text: raw.text.filter(|t| !t.trim().is_empty()),
                published_at: raw.published_at_date,
                review_url: raw.review_url,
                image_urls: raw.review_image_urls.unwrap_or_default(),
            })
            .collect()
    }

    pub fn published_date(&self) -> Option<NaiveDate> {
        self.published_at.as_deref().and_then(parse_published_date)
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Accepts RFC 3339 timestamps and plain `YYYY-MM-DD` dates.
pub fn parse_published_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.date_naive());
    }
    value
        .get(..10)
        .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
}

/// First `limit` characters of `text`, on a char boundary.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_scraped_assigns_ids_in_order() {
        let scraped: Vec<ScrapedReview> = serde_json::from_str(
            r#"[
                {"text": "great pho", "publishedAtDate": "2024-05-01T10:00:00.000Z",
                 "reviewUrl": "https://r/1", "reviewImageUrls": ["https://img/a"]},
                {"text": "   ", "publishedAtDate": null, "reviewImageUrls": null}
            ]"#,
        )
        .unwrap();

        let reviews = Review::from_scraped(scraped);
        assert_eq!(reviews[0].id, "0");
        assert_eq!(reviews[1].id, "1");
        assert_eq!(reviews[0].image_urls, vec!["https://img/a".to_string()]);
        assert!(reviews[1].image_urls.is_empty());
        assert_eq!(reviews[1].text(), None);
        assert_eq!(
            reviews[0].published_date(),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
    }

    #[test]
    fn test_persisted_review_accepts_scraper_field_names() {
        let review: Review = serde_json::from_str(
            r#"{"id": "4", "text": "ok", "publishedAtDate": "2023-12-31", "reviewImageUrls": []}"#,
        )
        .unwrap();
        assert_eq!(review.published_date(), NaiveDate::from_ymd_opt(2023, 12, 31));
    }

    #[test]
    fn test_parse_published_date() {
        assert_eq!(
            parse_published_date("2024-02-29T23:59:59+00:00"),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
        assert_eq!(parse_published_date("2024-01-05"), NaiveDate::from_ymd_opt(2024, 1, 5));
        assert_eq!(parse_published_date("yesterday"), None);
        assert_eq!(parse_published_date(""), None);
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
