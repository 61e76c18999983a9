//! `sagaflow actions`: the action catalog.

use anyhow::Result;
use comfy_table::{Cell, ContentArrangement, Table, presets};
use console::style;

use crate::state::AppState;

pub fn list_actions(state: &AppState, json: bool) -> Result<()> {
    let registry = state.orchestrator.registry();
    let descriptors = registry.list();

    if json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }

    if descriptors.is_empty() {
        println!();
        println!("  No actions registered.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["KEY", "NAME", "CATEGORY", "PERMISSION", "COMPENSABLE"]);

    for d in &descriptors {
        let category = serde_json::to_value(d.category)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(&d.key),
            Cell::new(&d.name),
            Cell::new(category),
            Cell::new(&d.required_permission),
            Cell::new(if d.compensable { "yes" } else { "no" }),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!("  {} action(s)", style(descriptors.len()).bold());
    println!();
    Ok(())
}
