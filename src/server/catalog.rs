//! Built-in catalog.
//!
//! The tools, resources and prompts every server advertises.

// ============================================================================
// Imports
// ============================================================================

use crate::identifiers::ResourceId;
use crate::protocol::{
    Prompt, PromptArgument, PromptDefinition, ProtocolEngine, ResourceDefinition,
    ResourceTemplate, ToolCall,
};

// ============================================================================
// Resource URIs
// ============================================================================

/// Pool occupancy and counters.
pub const POOL_STATS_URI: &str = "browser://pool/stats";

/// Response and session cache statistics.
pub const CACHE_STATS_URI: &str = "browser://cache/stats";

/// Most recent event records.
pub const RECENT_EVENTS_URI: &str = "browser://events/recent";

/// Prefix of the per-page resource.
pub const PAGE_URI_PREFIX: &str = "browser://pages/";

/// Records served by [`RECENT_EVENTS_URI`].
pub const RECENT_EVENTS_LIMIT: usize = 50;

const JSON_MIME: &str = "application/json";

/// URI of one page's resource.
#[must_use]
pub fn page_uri(id: &ResourceId) -> String {
    format!("{PAGE_URI_PREFIX}{id}")
}

/// Extracts the page id from a page resource URI.
#[must_use]
pub fn parse_page_uri(uri: &str) -> Option<ResourceId> {
    uri.strip_prefix(PAGE_URI_PREFIX)
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .map(ResourceId::from)
}

// ============================================================================
// Registration
// ============================================================================

/// Registers every built-in tool, resource and prompt on `engine`.
pub fn install(engine: &ProtocolEngine) {
    for tool in ToolCall::definitions() {
        engine.register_tool(tool);
    }

    for resource in resources() {
        engine.register_resource(resource);
    }
    engine.register_resource_template(ResourceTemplate {
        uri_template: format!("{PAGE_URI_PREFIX}{{id}}"),
        name: "page".to_string(),
        description: Some("Snapshot and lineage of one page".to_string()),
        mime_type: Some(JSON_MIME.to_string()),
    });

    for prompt in prompts() {
        engine.register_prompt(prompt);
    }
}

fn resources() -> Vec<ResourceDefinition> {
    let resource = |uri: &str, name: &str, description: &str| ResourceDefinition {
        uri: uri.to_string(),
        name: name.to_string(),
        description: Some(description.to_string()),
        mime_type: Some(JSON_MIME.to_string()),
    };

    vec![
        resource(POOL_STATS_URI, "pool-stats", "Resource pool occupancy and counters"),
        resource(CACHE_STATS_URI, "cache-stats", "Response and session cache statistics"),
        resource(RECENT_EVENTS_URI, "recent-events", "Most recent automation events"),
    ]
}

fn prompts() -> Vec<Prompt> {
    let arg = |name: &str, description: &str, required: bool| PromptArgument {
        name: name.to_string(),
        description: Some(description.to_string()),
        required,
    };

    vec![
        Prompt::new(
            PromptDefinition {
                name: "inspect-page".to_string(),
                description: Some("Summarize what is on a page".to_string()),
                arguments: vec![
                    arg("url", "Address to open", true),
                    arg("focus", "What to pay attention to", false),
                ],
            },
            "Open {{url}} with the navigate tool, then read it with current-title and \
             page-content. Summarize the page structure and its main content. \
             Focus: {{focus}}",
        ),
        Prompt::new(
            PromptDefinition {
                name: "automate-form".to_string(),
                description: Some("Fill and submit a form".to_string()),
                arguments: vec![
                    arg("url", "Page holding the form", true),
                    arg("fields", "Field selectors and values, as JSON", true),
                    arg("submit", "Selector of the submit control", false),
                ],
            },
            "Navigate to {{url}}. For each entry of {{fields}} use the fill tool with \
             its selector and value. Then click {{submit}} and report the resulting \
             current-url.",
        ),
    ]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_uri_parsing() {
        let id = ResourceId::new("page-7");
        assert_eq!(page_uri(&id), "browser://pages/page-7");
        assert_eq!(parse_page_uri("browser://pages/page-7"), Some(id));
        assert_eq!(parse_page_uri("browser://pages/"), None);
        assert_eq!(parse_page_uri("browser://pages/a/b"), None);
        assert_eq!(parse_page_uri(POOL_STATS_URI), None);
    }

    #[test]
    fn test_prompts_have_required_arguments() {
        let prompts = prompts();
        assert_eq!(prompts.len(), 2);
        for prompt in &prompts {
            assert!(prompt.definition.arguments.iter().any(|a| a.required));
        }
    }
}
