//! Menu records: what the board says, what reviews say, and how the two are
//! reconciled into `menus.json`.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::oracle::Extractable;
use crate::semantic::calibrator::MatchEntity;

pub const DIETARY_OPTIONS: [&str; 8] = [
    "vegan",
    "gluten-free",
    "dairy-free",
    "nut-free",
    "egg-free",
    "vegetarian",
    "halal",
    "kosher",
];

/// Price used when the board shows none or it is illegible
pub const MISSING_PRICE: f64 = -1.0;

fn missing_price() -> f64 {
    MISSING_PRICE
}

// Extractors are told review ids are integers; accept both forms.
#[derive(Deserialize)]
#[serde(untagged)]
enum AnyId {
    Text(String),
    Number(u64),
}

impl From<AnyId> for String {
    fn from(id: AnyId) -> Self {
        match id {
            AnyId::Text(text) => text.trim().to_string(),
            AnyId::Number(n) => n.to_string(),
        }
    }
}

fn id_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    AnyId::deserialize(deserializer).map(String::from)
}

fn ids_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Vec::<AnyId>::deserialize(deserializer).map(|ids| ids.into_iter().map(String::from).collect())
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MenuOptions {
    pub size: Vec<String>,
    pub spiciness: Vec<String>,
    pub toppings: Vec<String>,
    pub proteins: Vec<String>,
    pub other_option: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngredientsByCategory {
    pub fish: Vec<String>,
    pub shellfish: Vec<String>,
    pub red_meat: Vec<String>,
    pub poultry: Vec<String>,
    pub allergen_ingredients: Vec<String>,
}

impl IngredientsByCategory {
    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.fish
            .iter()
            .chain(&self.shellfish)
            .chain(&self.red_meat)
            .chain(&self.poultry)
            .chain(&self.allergen_ingredients)
    }
}

/// A dish as read off a menu board.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub name: String,
    /// Alternative names customers are likely to use in reviews
    #[serde(default)]
    pub nicknames: Vec<String>,
    #[serde(default = "missing_price")]
    pub price: f64,
    #[serde(default)]
    pub options: MenuOptions,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ingredients_by_category: IngredientsByCategory,
    #[serde(default)]
    pub dietary_labels: Vec<String>,
}

impl MenuItem {
    /// Trims names, drops duplicate nicknames and keeps only known dietary
    /// labels (lower-cased).
    pub fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();

        let mut seen: HashSet<String> = HashSet::from([self.name.to_lowercase()]);
        self.nicknames = self
            .nicknames
            .into_iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty() && seen.insert(n.to_lowercase()))
            .collect();

        let mut labels = vec![];
        for label in self.dietary_labels {
            let label = label.trim().to_lowercase();
            if DIETARY_OPTIONS.contains(&label.as_str()) && !labels.contains(&label) {
                labels.push(label);
            }
        }
        self.dietary_labels = labels;

        if !self.price.is_finite() || (self.price < 0.0 && self.price != MISSING_PRICE) {
            self.price = MISSING_PRICE;
        }
        self
    }

    pub fn has_label(&self, option: &str) -> bool {
        self.dietary_labels.iter().any(|l| l == option)
    }
}

fn string_list() -> Value {
    json!({"type": "array", "items": {"type": "string"}})
}

fn ingredients_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "fish": string_list(),
            "shellfish": string_list(),
            "red_meat": string_list(),
            "poultry": string_list(),
            "allergen_ingredients": string_list(),
        }
    })
}

/// Board extraction record.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct MenuExtraction {
    pub items: Vec<MenuItem>,
}

impl Extractable for MenuExtraction {
    const NAME: &'static str = "MenuExtraction";

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["items"],
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name"],
                        "properties": {
                            "name": {"type": "string"},
                            "nicknames": string_list(),
                            "price": {"type": "number"},
                            "options": {
                                "type": "object",
                                "properties": {
                                    "size": string_list(),
                                    "spiciness": string_list(),
                                    "toppings": string_list(),
                                    "proteins": string_list(),
                                    "other_option": string_list(),
                                }
                            },
                            "description": {"type": "string"},
                            "ingredients_by_category": ingredients_schema(),
                            "dietary_labels": {
                                "type": "array",
                                "items": {"type": "string", "enum": DIETARY_OPTIONS},
                            },
                        }
                    }
                }
            }
        })
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(idx) = self.items.iter().position(|item| item.name.trim().is_empty()) {
            return Err(format!("item {idx} has an empty name"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(deserialize_with = "id_from_any")]
    pub review_id: String,
    /// Minimal verbatim quote
    pub quote: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DietaryClaim {
    pub is_adherent: bool,
    #[serde(default)]
    pub evidences: Vec<Evidence>,
}

/// Discrepancy between the board and what reviews describe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiffNote {
    pub note: String,
    #[serde(default, deserialize_with = "ids_from_any")]
    pub evidence_review_ids: Vec<String>,
}

/// Review extraction record for one menu item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MenuReviewSummary {
    #[serde(default, deserialize_with = "ids_from_any")]
    pub relevant_review_ids: Vec<String>,
    pub objective_summary: String,
    /// One-sentence visual description used to pick collage photos
    #[serde(default)]
    pub appearance: String,
    #[serde(default)]
    pub ingredients_by_category: IngredientsByCategory,
    #[serde(default)]
    pub dietary_claims: BTreeMap<String, Option<DietaryClaim>>,
    #[serde(default)]
    pub diff_notes: Vec<DiffNote>,
}

impl Extractable for MenuReviewSummary {
    const NAME: &'static str = "MenuReviewSummary";

    fn schema() -> Value {
        let evidence = json!({
            "type": "object",
            "required": ["review_id", "quote"],
            "properties": {
                "review_id": {"type": "integer"},
                "quote": {"type": "string"},
            }
        });
        let claim = json!({
            "type": ["object", "null"],
            "required": ["is_adherent", "evidences"],
            "properties": {
                "is_adherent": {"type": "boolean"},
                "evidences": {"type": "array", "items": evidence},
            }
        });
        let claims: serde_json::Map<String, Value> = DIETARY_OPTIONS
            .iter()
            .map(|option| (option.to_string(), claim.clone()))
            .collect();

        json!({
            "type": "object",
            "required": ["objective_summary"],
            "properties": {
                "relevant_review_ids": {"type": "array", "items": {"type": "integer"}},
                "objective_summary": {"type": "string"},
                "appearance": {"type": "string"},
                "ingredients_by_category": ingredients_schema(),
                "dietary_claims": {"type": "object", "properties": claims},
                "diff_notes": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["note"],
                        "properties": {
                            "note": {"type": "string"},
                            "evidence_review_ids": {"type": "array", "items": {"type": "integer"}},
                        }
                    }
                },
            }
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.objective_summary.trim().is_empty() {
            return Err("objective_summary is empty".to_string());
        }
        Ok(())
    }
}

/// Drops evidence that points outside `relevant_review_ids`.
///
/// Notes left without evidence are removed, claims left without evidence
/// become null. Dietary keys outside [`DIETARY_OPTIONS`] are dropped and
/// missing ones are filled with null.
pub fn leave_only_relevant_evidence(mut summary: MenuReviewSummary) -> MenuReviewSummary {
    let relevant: HashSet<String> = summary.relevant_review_ids.iter().cloned().collect();

    summary.diff_notes = summary
        .diff_notes
        .into_iter()
        .filter_map(|mut note| {
            note.evidence_review_ids.retain(|id| relevant.contains(id));
            (!note.evidence_review_ids.is_empty()).then_some(note)
        })
        .collect();

    let mut claims = std::mem::take(&mut summary.dietary_claims);
    summary.dietary_claims = DIETARY_OPTIONS
        .iter()
        .map(|option| {
            let claim = claims.remove(*option).flatten().and_then(|mut claim| {
                claim.evidences.retain(|e| relevant.contains(&e.review_id));
                (!claim.evidences.is_empty()).then_some(claim)
            });
            (option.to_string(), claim)
        })
        .collect();

    summary
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DietaryTag {
    /// Labelled on the board and confirmed by reviews
    Verified,
    /// Labelled on the board, contradicted by reviews
    Warning,
    /// Labelled on the board, reviews say nothing
    NotVerified,
    /// Not labelled, but reviews claim it
    Info,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DietaryOption {
    pub tag: DietaryTag,
    #[serde(default)]
    pub evidences: Vec<Evidence>,
}

pub type DietaryOptions = BTreeMap<String, Option<DietaryOption>>;

/// Combines board labels with review claims, per dietary option.
pub fn consolidate_dietary_info(item: &MenuItem, summary: &MenuReviewSummary) -> DietaryOptions {
    DIETARY_OPTIONS
        .iter()
        .map(|option| {
            let claim = summary.dietary_claims.get(*option).and_then(|c| c.as_ref());
            let adherence = claim.map(|c| c.is_adherent);
            let evidences = claim.map(|c| c.evidences.clone()).unwrap_or_default();

            let tag = if item.has_label(option) {
                Some(match adherence {
                    Some(true) => DietaryTag::Verified,
                    Some(false) => DietaryTag::Warning,
                    None => DietaryTag::NotVerified,
                })
            } else {
                adherence.filter(|a| *a).map(|_| DietaryTag::Info)
            };

            (
                option.to_string(),
                tag.map(|tag| DietaryOption { tag, evidences }),
            )
        })
        .collect()
}

/// Dietary options of an item no review talks about.
pub fn board_only_dietary_options(item: &MenuItem) -> DietaryOptions {
    DIETARY_OPTIONS
        .iter()
        .map(|option| {
            let tagged = item.has_label(option).then(|| DietaryOption {
                tag: DietaryTag::NotVerified,
                evidences: vec![],
            });
            (option.to_string(), tagged)
        })
        .collect()
}

/// Entry of `menus.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MenuEntry {
    pub from_menuboard: MenuItem,
    /// `None` until matched, and when no review discusses the item
    #[serde(default)]
    pub from_reviews: Option<MenuReviewSummary>,
    #[serde(default)]
    pub dietary_options: Option<DietaryOptions>,
}

impl MenuEntry {
    pub fn new(item: MenuItem) -> Self {
        Self {
            from_menuboard: item,
            from_reviews: None,
            dietary_options: None,
        }
    }

    pub fn mentions(&self) -> usize {
        self.from_reviews
            .as_ref()
            .map(|r| r.relevant_review_ids.len())
            .unwrap_or(0)
    }

    /// Records the review summary, or the lack of one.
    pub fn apply_reviews(&mut self, summary: Option<MenuReviewSummary>) {
        match summary {
            Some(summary) => {
                let summary = leave_only_relevant_evidence(summary);
                self.dietary_options =
                    Some(consolidate_dietary_info(&self.from_menuboard, &summary));
                self.from_reviews = Some(summary);
            }
            None => {
                self.dietary_options = Some(board_only_dietary_options(&self.from_menuboard));
                self.from_reviews = None;
            }
        }
    }
}

/// `menus.json`: menu id to entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MenuMetadata {
    pub entries: BTreeMap<String, MenuEntry>,
}

fn numeric_order(id: &str) -> (u64, &str) {
    (id.parse().unwrap_or(u64::MAX), id)
}

impl MenuMetadata {
    /// Ids are assigned by extraction order.
    pub fn from_items(items: Vec<MenuItem>) -> Self {
        let entries = items
            .into_iter()
            .map(|item| item.normalized())
            .enumerate()
            .map(|(idx, item)| (idx.to_string(), MenuEntry::new(item)))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MenuEntry> {
        self.entries.get(id)
    }

    /// Entries in id order (numeric ids sort numerically).
    pub fn ordered(&self) -> Vec<(&str, &MenuEntry)> {
        let mut entries: Vec<(&str, &MenuEntry)> =
            self.entries.iter().map(|(id, e)| (id.as_str(), e)).collect();
        entries.sort_by(|a, b| numeric_order(a.0).cmp(&numeric_order(b.0)));
        entries
    }

    /// Entries by review mentions, most mentioned first; ties keep id order.
    pub fn ranked_by_mentions(&self) -> Vec<(&str, &MenuEntry)> {
        let mut entries = self.ordered();
        entries.sort_by(|a, b| b.1.mentions().cmp(&a.1.mentions()));
        entries
    }

    /// Names of all other items, with their board description when present.
    pub fn sibling_names(&self, id: &str) -> Vec<String> {
        let Some(target) = self.get(id) else {
            return vec![];
        };
        self.ordered()
            .into_iter()
            .filter(|(_, e)| e.from_menuboard.name != target.from_menuboard.name)
            .map(|(_, e)| {
                let item = &e.from_menuboard;
                if item.description.is_empty() {
                    item.name.clone()
                } else {
                    format!("{} ({})", item.name, item.description)
                }
            })
            .collect()
    }

    pub fn match_entities(&self) -> Vec<MatchEntity> {
        self.ordered()
            .into_iter()
            .map(|(id, entry)| MatchEntity {
                id: id.to_string(),
                name: entry.from_menuboard.name.clone(),
                aliases: entry.from_menuboard.nicknames.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, labels: &[&str]) -> MenuItem {
        MenuItem {
            name: name.to_string(),
            nicknames: vec![],
            price: 12.5,
            options: MenuOptions::default(),
            description: String::new(),
            ingredients_by_category: IngredientsByCategory::default(),
            dietary_labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn evidence(review_id: &str) -> Evidence {
        Evidence {
            review_id: review_id.to_string(),
            quote: "q".to_string(),
        }
    }

    fn summary(claims: Vec<(&str, Option<DietaryClaim>)>) -> MenuReviewSummary {
        MenuReviewSummary {
            relevant_review_ids: vec!["1".into(), "2".into()],
            objective_summary: "Rice noodles in beef broth.".into(),
            appearance: String::new(),
            ingredients_by_category: IngredientsByCategory::default(),
            dietary_claims: claims
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            diff_notes: vec![],
        }
    }

    #[test]
    fn test_extraction_record_accepts_defaults_and_numeric_ids() {
        let record: MenuReviewSummary = serde_json::from_value(json!({
            "relevant_review_ids": [3, "7"],
            "objective_summary": "Crispy pork belly.",
            "dietary_claims": {"vegan": {"is_adherent": false, "evidences": [{"review_id": 3, "quote": "has pork"}]}},
            "diff_notes": [{"note": "often sold out", "evidence_review_ids": [7]}]
        }))
        .unwrap();

        assert_eq!(record.relevant_review_ids, vec!["3", "7"]);
        assert_eq!(record.diff_notes[0].evidence_review_ids, vec!["7"]);
        let vegan = record.dietary_claims["vegan"].as_ref().unwrap();
        assert_eq!(vegan.evidences[0].review_id, "3");

        let board: MenuExtraction =
            serde_json::from_value(json!({"items": [{"name": "Pho"}]})).unwrap();
        assert_eq!(board.items[0].price, MISSING_PRICE);
        assert!(board.validate().is_ok());
    }

    #[test]
    fn test_normalized_item() {
        let mut raw = item("  Pho Tai ", &["Vegan", "spicy", "vegan"]);
        raw.nicknames = vec!["pho tai".into(), "Beef Noodle Soup".into(), " ".into()];
        raw.price = -3.0;

        let item = raw.normalized();
        assert_eq!(item.name, "Pho Tai");
        assert_eq!(item.nicknames, vec!["Beef Noodle Soup"]);
        assert_eq!(item.dietary_labels, vec!["vegan"]);
        assert_eq!(item.price, MISSING_PRICE);
    }

    #[test]
    fn test_leave_only_relevant_evidence() {
        let mut s = summary(vec![
            (
                "vegan",
                Some(DietaryClaim {
                    is_adherent: true,
                    evidences: vec![evidence("1"), evidence("9")],
                }),
            ),
            (
                "halal",
                Some(DietaryClaim {
                    is_adherent: true,
                    evidences: vec![evidence("9")],
                }),
            ),
            ("spicy", None),
        ]);
        s.diff_notes = vec![
            DiffNote {
                note: "kept".into(),
                evidence_review_ids: vec!["2".into(), "8".into()],
            },
            DiffNote {
                note: "dropped".into(),
                evidence_review_ids: vec!["8".into()],
            },
            DiffNote {
                note: "no evidence".into(),
                evidence_review_ids: vec![],
            },
        ];

        let s = leave_only_relevant_evidence(s);

        assert_eq!(s.diff_notes.len(), 1);
        assert_eq!(s.diff_notes[0].evidence_review_ids, vec!["2"]);
        assert_eq!(s.dietary_claims.len(), DIETARY_OPTIONS.len());
        assert!(!s.dietary_claims.contains_key("spicy"));
        assert_eq!(
            s.dietary_claims["vegan"].as_ref().unwrap().evidences,
            vec![evidence("1")]
        );
        assert_eq!(s.dietary_claims["halal"], None);
        assert_eq!(s.dietary_claims["kosher"], None);
    }

    #[test]
    fn test_consolidate_dietary_info() {
        let board = item("Tofu Bowl", &["vegan", "gluten-free", "halal"]);
        let claim = |adherent| {
            Some(DietaryClaim {
                is_adherent: adherent,
                evidences: vec![evidence("1")],
            })
        };
        let s = summary(vec![
            ("vegan", claim(true)),
            ("gluten-free", claim(false)),
            ("vegetarian", claim(true)),
            ("nut-free", claim(false)),
        ]);

        let options = consolidate_dietary_info(&board, &s);
        let tag = |option: &str| options[option].as_ref().map(|o| o.tag);

        assert_eq!(tag("vegan"), Some(DietaryTag::Verified));
        assert_eq!(tag("gluten-free"), Some(DietaryTag::Warning));
        assert_eq!(tag("halal"), Some(DietaryTag::NotVerified));
        assert_eq!(tag("vegetarian"), Some(DietaryTag::Info));
        assert_eq!(tag("nut-free"), None);
        assert_eq!(tag("kosher"), None);
        assert_eq!(options["vegan"].as_ref().unwrap().evidences.len(), 1);
    }

    #[test]
    fn test_entry_without_reviews_gets_board_only_options() {
        let mut entry = MenuEntry::new(item("Salad", &["vegan"]));
        entry.apply_reviews(None);

        let options = entry.dietary_options.as_ref().unwrap();
        assert_eq!(options["vegan"].as_ref().unwrap().tag, DietaryTag::NotVerified);
        assert!(options["halal"].is_none());
        assert_eq!(entry.mentions(), 0);

        let json = serde_json::to_value(&entry).unwrap();
        assert!(json["from_reviews"].is_null());
    }

    #[test]
    fn test_ranking_and_siblings() {
        let items: Vec<MenuItem> = (0..12).map(|i| item(&format!("dish {i}"), &[])).collect();
        let mut menus = MenuMetadata::from_items(items);
        menus
            .entries
            .get_mut("10")
            .unwrap()
            .apply_reviews(Some(summary(vec![])));

        let ordered: Vec<_> = menus.ordered().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ordered[2], "2");
        assert_eq!(ordered[10], "10");

        let ranked: Vec<_> = menus.ranked_by_mentions().into_iter().map(|(id, _)| id).collect();
        assert_eq!(&ranked[..3], &["10", "0", "1"]);

        let siblings = menus.sibling_names("0");
        assert_eq!(siblings.len(), 11);
        assert!(!siblings.contains(&"dish 0".to_string()));
        assert_eq!(menus.match_entities().len(), 12);
    }
}
