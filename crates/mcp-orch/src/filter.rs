//! Tool preference overlay.
//!
//! Projects can disable individual tools per server; the overlay is applied
//! to every catalog response, fresh or session-cached. Filtering is never
//! cached across requests: clients toggle preferences at runtime and the
//! next `tools/list` must reflect the change.

use std::collections::HashMap;

use crate::store::ToolPreference;
use crate::upstream::ToolDef;

/// Retain the tools whose preference is absent or `enabled = true`.
///
/// Tool identity is by original (un-namespaced) name. Idempotent: applying
/// the filter twice yields the same set as applying it once.
#[must_use]
pub fn filter_tools(preferences: &[ToolPreference], tools: Vec<ToolDef>) -> Vec<ToolDef> {
    if preferences.is_empty() {
        return tools;
    }

    let enabled_by_name: HashMap<&str, bool> =
        preferences.iter().map(|p| (p.tool_name.as_str(), p.enabled)).collect();

    tools
        .into_iter()
        .filter(|tool| enabled_by_name.get(tool.name.as_str()).copied().unwrap_or(true))
        .collect()
}
