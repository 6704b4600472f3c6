//! Restaurant overview record and its HTML rendering.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::oracle::Extractable;

/// Overview as produced by the extractor. Menu items in `summary` are
/// markdown links whose target is a css class, e.g. `[Pho Tai](menu-3)`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct OverviewSummary {
    pub summary: String,
    #[serde(default)]
    pub glossary: BTreeMap<String, String>,
}

impl Extractable for OverviewSummary {
    const NAME: &'static str = "OverviewSummary";

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["summary"],
            "properties": {
                "summary": {"type": "string"},
                "glossary": {"type": "object", "additionalProperties": {"type": "string"}},
            }
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.summary.trim().is_empty() {
            return Err("summary is empty".to_string());
        }
        Ok(())
    }
}

/// `restaurant_overview.json`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestaurantOverview {
    /// Plain text, links reduced to their text
    pub summary: String,
    /// Links rendered as `<b class="target">text</b>`
    pub summary_html: String,
    pub glossary: BTreeMap<String, String>,
}

fn link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(.*?)\]\((.*?)\)").expect("static regex"))
}

impl From<OverviewSummary> for RestaurantOverview {
    fn from(raw: OverviewSummary) -> Self {
        let summary_html = link()
            .replace_all(&raw.summary, r#"<b class="$2">$1</b>"#)
            .to_string();
        let summary = link().replace_all(&raw.summary, "$1").to_string();

        Self {
            summary,
            summary_html,
            glossary: raw.glossary,
        }
    }
}

/// Restaurant name as used in prompts: non-ASCII characters dropped.
pub fn prompt_name(name: &str) -> String {
    name.chars().filter(|c| c.is_ascii()).collect::<String>().trim().to_string()
}
