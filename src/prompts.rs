//! Fixed prompt templates for the extraction and generation calls.

use crate::menu::{MenuItem, DIETARY_OPTIONS};

pub const MENU_READ_PROMPT: &str = "You are reading photos of a restaurant's menu boards. \
Each photo is preceded by the date it was taken; when boards disagree, prefer the most recent one. \
List every distinct dish exactly once. \
Use the English name as printed (romanize names printed only in another script) and read it carefully. \
Give two or three short alternative names customers would type in reviews, built around the ingredient that defines the dish. \
Report the price in USD for the standard size, or -1.0 when it is missing or illegible. \
Copy descriptions verbatim. \
List only options (size, spiciness, toppings, proteins, other) the customer can choose, including ones inherited from the section. \
Categorize ingredients only when they are written on the board. \
Report dietary labels only when printed or shown with a legend symbol, choosing from the allowed values.";

/// Caption placed before each board photo.
pub fn board_caption(idx: usize, published: Option<&str>) -> String {
    match published {
        Some(date) => format!("Image {} from {date}", idx + 1),
        None => format!("Image {} (date unknown)", idx + 1),
    }
}

/// Prompt for summarizing what reviews say about one menu item.
///
/// `reviews` are `(review_id, text)` pairs.
pub fn review_summary_prompt(item: &MenuItem, siblings: &[String], reviews: &[(&str, &str)]) -> String {
    let board = serde_json::json!({
        "nicknames": item.nicknames,
        "price": item.price,
        "options": item.options,
        "description": item.description,
        "ingredients_by_category": item.ingredients_by_category,
    });

    let sibling_block = siblings
        .iter()
        .map(|name| format!("-{name}"))
        .collect::<Vec<_>>()
        .join("\n");

    let review_block = reviews
        .iter()
        .map(|(id, text)| format!("Review ID - {id}: {text}"))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You analyze customer reviews of one menu item: {name}.\n\n\
MENU_BOARD_INFO:\n{board}\n\n\
SIBLING_MENU_ITEMS:\n{sibling_block}\n\n\
Some reviews below may talk about a sibling item instead; only use reviews that clearly discuss {name} \
and list their ids in relevant_review_ids.\n\
Write a neutral objective summary of the dish as served here, a one-sentence appearance description that \
sets it apart from the siblings (main dish only, with its container), ingredients mentioned by reviewers, \
dietary claims for {options}, and notes on discrepancies with the menu board. \
Every quote must be copied verbatim from the review it cites.\n\n\
REVIEWS:\n{review_block}\n",
        name = item.name,
        options = DIETARY_OPTIONS.join(", "),
    )
}

/// One menu item line of the overview prompt.
pub struct OverviewItem<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub price: f64,
    pub mentions: usize,
    pub description: &'a str,
    pub objective_summary: &'a str,
    /// Empty for items outside the top few
    pub sample_reviews: Vec<String>,
}

pub fn overview_prompt(restaurant_name: &str, items: &[OverviewItem]) -> String {
    let menu_context = items
        .iter()
        .map(|item| {
            let mut text = format!(
                "Menu item {}: {} ({} review mentioned)\nPrice: {}",
                item.id, item.name, item.mentions, item.price
            );
            if !item.sample_reviews.is_empty() {
                text.push_str(&format!("\nDescription: {}", item.description));
                text.push_str(&format!("\nReview Summary: {}", item.objective_summary));
                text.push_str("\nSample Reviews:");
                for review in &item.sample_reviews {
                    text.push_str(&format!("\n- {}", review.trim()));
                }
            }
            text
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Write a short overview of what people order at {restaurant_name}.\n\
Summarize the most popular items by review volume in one paragraph, grouped by how they are ordered \
(mains, shared plates, sides). Readers are unfamiliar with the cuisine and every item has its own page, \
so do not describe each dish in detail. Mark every menu item you mention as a markdown link whose target \
is its menu id, like [Pho Tai](menu-3).\n\
Add a glossary of romanized menu terms that appear repeatedly, each with a plain short meaning.\n\n\
MENU:\n{menu_context}\n"
    )
}

/// Prompt sent with a collage to the image generator.
pub fn dish_image_prompt(item: &MenuItem, appearance: &str, ingredients: &[String]) -> String {
    format!(
        "The attached collage shows customer photos of {name}. \
Generate one appetizing, realistic photo of a single serving of this dish, shot from a slight angle on a neutral table. \
Menu description: {description}. \
Appearance: {appearance}. \
Visible ingredients: {ingredients}. \
Do not add text, people or other dishes.",
        name = item.name,
        description = if item.description.is_empty() {
            "none"
        } else {
            &item.description
        },
        ingredients = ingredients.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::menu::MenuMetadata;

    #[test]
    fn test_review_summary_prompt_lists_reviews_and_siblings() {
        let menus: MenuMetadata = serde_json::from_value(serde_json::json!({
            "0": {"from_menuboard": {"name": "Pho Tai", "price": 14.0}},
            "1": {"from_menuboard": {"name": "Banh Mi", "description": "pork baguette"}},
        }))
        .unwrap();

        let item = &menus.get("0").unwrap().from_menuboard;
        let prompt = review_summary_prompt(
            item,
            &menus.sibling_names("0"),
            &[("4", "the pho was great"), ("9", "broth was rich")],
        );

        assert!(prompt.contains("Review ID - 4: the pho was great"));
        assert!(prompt.contains("-Banh Mi (pork baguette)"));
        assert!(prompt.contains("one menu item: Pho Tai"));
    }

    #[test]
    fn test_overview_prompt_only_details_sampled_items() {
        let items = vec![
            OverviewItem {
                id: "0",
                name: "Pho",
                price: 14.0,
                mentions: 40,
                description: "beef soup",
                objective_summary: "noodle soup",
                sample_reviews: vec!["loved it\n".to_string()],
            },
            OverviewItem {
                id: "1",
                name: "Tea",
                price: -1.0,
                mentions: 0,
                description: "jasmine",
                objective_summary: "",
                sample_reviews: vec![],
            },
        ];

        let prompt = overview_prompt("Pho House", &items);
        assert!(prompt.contains("Menu item 0: Pho (40 review mentioned)"));
        assert!(prompt.contains("- loved it"));
        assert!(!prompt.contains("jasmine"));
    }
}
