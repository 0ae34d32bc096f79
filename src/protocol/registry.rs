//! Tool, resource and prompt registries.
//!
//! Registries only hold what is advertised. Execution lives behind
//! [`RequestHandler`](super::RequestHandler).

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;

use crate::error::{Error, Result};

use super::types::{
    Content, GetPromptResult, PromptDefinition, PromptMessage, ResourceDefinition,
    ResourceTemplate, Role, ToolDefinition,
};

// ============================================================================
// ToolRegistry
// ============================================================================

/// Advertised tools, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDefinition>,
}

impl ToolRegistry {
    /// Creates a registry holding `tools`.
    #[must_use]
    pub fn with(tools: impl IntoIterator<Item = ToolDefinition>) -> Self {
        Self {
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// Adds or replaces a tool. Returns `true` if it replaced one.
    pub fn register(&mut self, tool: ToolDefinition) -> bool {
        self.tools.insert(tool.name.clone(), tool).is_some()
    }

    /// Removes a tool. Returns `false` if it was not registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Returns `true` if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tools, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools.values().cloned().collect()
    }

    /// Number of tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no tool is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ============================================================================
// ResourceRegistry
// ============================================================================

/// Advertised resources and resource templates.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    resources: BTreeMap<String, ResourceDefinition>,
    templates: BTreeMap<String, ResourceTemplate>,
}

impl ResourceRegistry {
    /// Adds or replaces a resource.
    pub fn register(&mut self, resource: ResourceDefinition) -> bool {
        self.resources.insert(resource.uri.clone(), resource).is_some()
    }

    /// Adds or replaces a template.
    pub fn register_template(&mut self, template: ResourceTemplate) -> bool {
        self.templates
            .insert(template.uri_template.clone(), template)
            .is_some()
    }

    /// Removes a resource by URI.
    pub fn unregister(&mut self, uri: &str) -> bool {
        self.resources.remove(uri).is_some()
    }

    /// Returns `true` if `uri` is a registered resource or matches a
    /// template prefix.
    #[must_use]
    pub fn knows(&self, uri: &str) -> bool {
        self.resources.contains_key(uri)
            || self.templates.keys().any(|t| {
                t.split_once('{')
                    .is_some_and(|(prefix, _)| uri.len() > prefix.len() && uri.starts_with(prefix))
            })
    }

    /// Concrete resources, sorted by URI.
    #[must_use]
    pub fn list(&self) -> Vec<ResourceDefinition> {
        self.resources.values().cloned().collect()
    }

    /// Templates, sorted by template.
    #[must_use]
    pub fn templates(&self) -> Vec<ResourceTemplate> {
        self.templates.values().cloned().collect()
    }
}

// ============================================================================
// PromptRegistry
// ============================================================================

/// A prompt definition plus its message template.
///
/// The template uses `{{argument}}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Advertised definition.
    pub definition: PromptDefinition,
    /// User message template.
    pub template: String,
}

impl Prompt {
    /// Creates a prompt.
    #[must_use]
    pub fn new(definition: PromptDefinition, template: impl Into<String>) -> Self {
        Self {
            definition,
            template: template.into(),
        }
    }

    /// Renders the template with `arguments`.
    ///
    /// Placeholders without a supplied value render as empty strings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParams`] if a required argument is missing.
    pub fn render(&self, arguments: &BTreeMap<String, String>) -> Result<GetPromptResult> {
        let mut text = self.template.clone();
        for arg in &self.definition.arguments {
            let value = match arguments.get(&arg.name) {
                Some(value) => value.as_str(),
                None if arg.required => {
                    return Err(Error::invalid_params(format!(
                        "prompt {} requires argument {}",
                        self.definition.name, arg.name
                    )));
                }
                None => "",
            };
            text = text.replace(&format!("{{{{{}}}}}", arg.name), value);
        }

        Ok(GetPromptResult {
            description: self.definition.description.clone(),
            messages: vec![PromptMessage {
                role: Role::User,
                content: Content::text(text),
            }],
        })
    }
}

/// Registered prompts, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, Prompt>,
}

impl PromptRegistry {
    /// Adds or replaces a prompt.
    pub fn register(&mut self, prompt: Prompt) -> bool {
        self.prompts
            .insert(prompt.definition.name.clone(), prompt)
            .is_some()
    }

    /// Removes a prompt.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.prompts.remove(name).is_some()
    }

    /// Looks up a prompt.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Prompt> {
        self.prompts.get(name)
    }

    /// Definitions, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<PromptDefinition> {
        self.prompts.values().map(|p| p.definition.clone()).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
